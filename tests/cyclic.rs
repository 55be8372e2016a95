use std::sync::Arc;
use std::thread;
use std::time::Duration;

use xilinx_dma_bridge::ChannelConfig;
use xilinx_dma_bridge::Config;
use xilinx_dma_bridge::DeviceContext;
use xilinx_dma_bridge::Direction;
use xilinx_dma_bridge::Error;
use xilinx_dma_bridge::HeapMemory;
use xilinx_dma_bridge::LoopbackEngine;
use xilinx_dma_bridge::Mode;
use xilinx_dma_bridge::TransferStatus;

const WAIT: Duration = Duration::from_secs(5);

fn frame_device() -> DeviceContext {
    let config = Config::default()
        .with_channel(ChannelConfig::vdma(0, Direction::ToDevice))
        .with_channel(ChannelConfig::axi_dma(1, Direction::FromDevice));
    DeviceContext::init(Arc::new(LoopbackEngine::new()), Arc::new(HeapMemory::new()), config).unwrap()
}

#[test]
fn cyclic_needs_a_capable_channel() {
    let dev = frame_device();
    let s = dev.open();
    assert!(matches!(
        s.acquire(Direction::FromDevice, Mode::Cyclic),
        Err(Error::UnsupportedMode)
    ));
    let rx = s.acquire(Direction::FromDevice, Mode::OneShot).unwrap();
    let buf = s.allocate(64, Direction::FromDevice).unwrap();
    assert!(matches!(
        s.submit_frames(rx, &[(buf.id(), 0, 64)]),
        Err(Error::UnsupportedMode)
    ));
}

#[test]
fn frames_arrive_in_order() {
    let dev = frame_device();
    let s = dev.open();
    let tx = s.acquire(Direction::ToDevice, Mode::Cyclic).unwrap();
    let rx = s.acquire(Direction::FromDevice, Mode::OneShot).unwrap();

    let frames: Vec<_> = (0..3u8)
        .map(|i| {
            let b = s.allocate(1024, Direction::ToDevice).unwrap();
            b.slice::<u8>().fill(i + 1);
            b
        })
        .collect();
    let dst = s.allocate(3 * 1024, Direction::FromDevice).unwrap();

    let r = s.submit(rx, dst.id(), 0, 3 * 1024).unwrap();
    let ring: Vec<_> = frames.iter().map(|b| (b.id(), 0, 1024)).collect();
    let t = s.submit_frames(tx, &ring).unwrap();
    assert!(t.is_cyclic());

    assert_eq!(r.wait(WAIT).unwrap(), TransferStatus::CompletedOk);
    let out = dst.slice::<u8>();
    for (i, chunk) in out.chunks(1024).enumerate() {
        assert!(chunk.iter().all(|&x| x == i as u8 + 1));
    }

    let n = s.wait_frame(t.id(), 0, Some(WAIT)).unwrap();
    assert!(n >= 1);
    assert!(frames.iter().all(|b| b.is_busy()));

    s.abort(t.id()).unwrap();
    assert_eq!(s.wait(t.id(), Some(WAIT)).unwrap(), TransferStatus::Aborted);
    assert!(frames.iter().all(|b| !b.is_busy()));
}

#[test]
fn cyclic_transfer_counts_frames_until_aborted() {
    let config = Config::default().with_channel(ChannelConfig::vdma(0, Direction::ToDevice));
    let dev = DeviceContext::init(Arc::new(LoopbackEngine::new()), Arc::new(HeapMemory::new()), config).unwrap();
    let s = dev.open();
    let tx = s.acquire(Direction::ToDevice, Mode::Cyclic).unwrap();
    let buf = s.allocate(4096, Direction::ToDevice).unwrap();

    let t = s.submit(tx, buf.id(), 0, 4096).unwrap();
    let mut seen = 0;
    for _ in 0..3 {
        let n = s.wait_frame(t.id(), seen, Some(WAIT)).unwrap();
        assert!(n > seen);
        seen = n;
    }
    // a cyclic transfer never finishes by itself
    assert!(!t.status().is_terminal());

    s.abort(t.id()).unwrap();
    assert_eq!(t.wait(WAIT).unwrap(), TransferStatus::Aborted);
}

#[test]
fn teardown_with_active_cyclic_transfer() {
    let config = Config::default().with_channel(ChannelConfig::vdma(0, Direction::ToDevice));
    let dev = DeviceContext::init(Arc::new(LoopbackEngine::new()), Arc::new(HeapMemory::new()), config).unwrap();
    let owner = dev.new_owner();
    let tx = dev.acquire(owner, Direction::ToDevice, Mode::Cyclic).unwrap();
    let buf = dev.allocate(4096, Direction::ToDevice).unwrap();

    let t = dev.submit(owner, tx, buf.id(), 0, 4096).unwrap();
    t.wait_frame(0, WAIT).unwrap();
    assert!(!t.status().is_terminal());

    dev.teardown();

    assert_eq!(t.status(), TransferStatus::Aborted);
    assert!(!buf.is_busy());
    let frames = t.frames();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(t.frames(), frames);
    assert_eq!(t.status(), TransferStatus::Aborted);
}
