//! Same setup as the blocking demo, waiting with `async-io`.

use std::sync::Arc;
use std::time::Duration;

use xilinx_dma_bridge::AxiDmaEngine;
use xilinx_dma_bridge::ChannelConfig;
use xilinx_dma_bridge::Config;
use xilinx_dma_bridge::DeviceContext;
use xilinx_dma_bridge::Direction;
use xilinx_dma_bridge::Error;
use xilinx_dma_bridge::Mode;
use xilinx_dma_bridge::UdmaBuf;

fn main() -> Result<(), Error> {
    let engine = AxiDmaEngine::new(UdmaBuf::new("udmabuf_descriptors")?)
        .with_uio(0, "uio4")
        .with_uio(1, "uio5");
    let config = Config::default()
        .with_channel(ChannelConfig::axi_dma(0, Direction::ToDevice))
        .with_channel(ChannelConfig::axi_dma(1, Direction::FromDevice));
    let dev = DeviceContext::init(Arc::new(engine), Arc::new(UdmaBuf::new("udmabuf0")?), config)?;

    {
        let session = dev.open();
        let tx = session.acquire(Direction::ToDevice, Mode::OneShot)?;
        let rx = session.acquire(Direction::FromDevice, Mode::OneShot)?;

        let items = 1024;
        let h2d = session.allocate(items * 4, Direction::ToDevice)?;
        let d2h = session.allocate(items * 4, Direction::FromDevice)?;
        for i in h2d.slice::<u32>().iter_mut() {
            *i = fastrand::u32(0..1024);
        }

        async_io::block_on(async {
            let t_h2d = session.submit(tx, h2d.id(), 0, items * 4)?;
            let t_d2h = session.submit(rx, d2h.id(), 0, items * 4)?;
            println!("transfers started");

            let timeout = Some(Duration::from_secs(1));
            session.wait_async(t_h2d.id(), timeout).await?.into_result()?;
            println!("h2d done");
            session.wait_async(t_d2h.id(), timeout).await?.into_result()?;
            println!("d2h done");
            Result::<(), Error>::Ok(())
        })?;

        for (o, i) in d2h.slice::<u32>().iter().zip(h2d.slice::<u32>().iter()) {
            assert_eq!(*o, *i + 123);
        }
    }

    dev.teardown();
    Ok(())
}
