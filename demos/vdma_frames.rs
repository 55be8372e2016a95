//! Cycles three frame buffers through the ioctl interface on the software
//! loopback and reads them back on the receive channel.

use std::sync::Arc;

use xilinx_dma_bridge::ioctl::*;
use xilinx_dma_bridge::ChannelConfig;
use xilinx_dma_bridge::Config;
use xilinx_dma_bridge::DeviceContext;
use xilinx_dma_bridge::Direction;
use xilinx_dma_bridge::Error;
use xilinx_dma_bridge::HeapMemory;
use xilinx_dma_bridge::LoopbackEngine;
use xilinx_dma_bridge::Mode;
use xilinx_dma_bridge::StatusCode;

const FRAME: usize = 640 * 4;

fn check(rc: i32) -> Result<(), Error> {
    match StatusCode(rc) {
        s if s.is_ok() => Ok(()),
        s => Err(std::io::Error::from_raw_os_error(s.errno()).into()),
    }
}

fn main() -> Result<(), Error> {
    let mut config = Config::default()
        .with_channel(ChannelConfig::vdma(0, Direction::ToDevice))
        .with_channel(ChannelConfig::axi_dma(1, Direction::FromDevice));
    config.apply_params("CHARACTER_DEVICE_NAME=vdma_bridge TIMEOUT_MS=500")?;
    let dev = DeviceContext::init(Arc::new(LoopbackEngine::new()), Arc::new(HeapMemory::new()), config)?;

    {
        let session = dev.open();

        let mut args = XdmaArgs {
            channel: ANY_CHANNEL,
            direction: 0,
            mode: 1,
            ..Default::default()
        };
        check(session.ioctl(XDMA_ACQUIRE_CHANNEL, &mut args))?;
        let tx = args.channel;

        let mut frames = [0u32; MAX_FRAMES];
        for (i, f) in frames.iter_mut().take(3).enumerate() {
            let mut args = XdmaArgs {
                len: FRAME as u64,
                direction: 0,
                ..Default::default()
            };
            check(session.ioctl(XDMA_ALLOC_BUFFER, &mut args))?;
            let mut map = session.mmap(args.addr, FRAME)?;
            map.as_mut_slice().fill(i as u8 + 1);
            *f = args.buffer;
        }

        let mut args = XdmaArgs {
            channel: tx,
            nframes: 3,
            frame_buffers: frames,
            ..Default::default()
        };
        check(session.ioctl(XDMA_SUBMIT_CYCLIC_FRAMES, &mut args))?;
        let cyclic = args.transfer;

        // the receive side sees the frames in ring order
        let rx = session.acquire(Direction::FromDevice, Mode::OneShot)?;
        let readback = session.allocate(FRAME, Direction::FromDevice)?;
        for _ in 0..6 {
            let r = session.submit(rx, readback.id(), 0, FRAME)?;
            session.wait(r.id(), None)?.into_result()?;
            println!("received frame {}", readback.slice::<u8>()[0]);
        }

        let mut args = XdmaArgs {
            transfer: cyclic,
            timeout_ms: 100,
            ..Default::default()
        };
        check(session.ioctl(XDMA_WAIT_FRAME, &mut args))?;
        println!("{} frames sent", args.frames);

        check(session.ioctl(XDMA_ABORT, &mut args))?;
        check(session.ioctl(XDMA_WAIT, &mut args))?;
        println!("cyclic transfer ended with status {}", args.status);
    }

    dev.teardown();
    Ok(())
}
