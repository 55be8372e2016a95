use std::sync::Arc;
use std::thread;
use std::time::Duration;

use xilinx_dma_bridge::ChannelConfig;
use xilinx_dma_bridge::ChannelState;
use xilinx_dma_bridge::Config;
use xilinx_dma_bridge::DeviceContext;
use xilinx_dma_bridge::Direction;
use xilinx_dma_bridge::Error;
use xilinx_dma_bridge::HeapMemory;
use xilinx_dma_bridge::LoopbackEngine;
use xilinx_dma_bridge::Mode;
use xilinx_dma_bridge::TransferStatus;

const WAIT: Duration = Duration::from_secs(5);

fn loopback_device(engine: LoopbackEngine) -> (Arc<LoopbackEngine>, DeviceContext) {
    let engine = Arc::new(engine);
    let config = Config::default()
        .with_max_segment_len(1024)
        .with_channel(ChannelConfig::axi_dma(0, Direction::ToDevice))
        .with_channel(ChannelConfig::axi_dma(1, Direction::FromDevice));
    let dev = DeviceContext::init(engine.clone(), Arc::new(HeapMemory::new()), config).unwrap();
    (engine, dev)
}

#[test]
fn round_trip_is_byte_identical_and_repeatable() {
    let (_, dev) = loopback_device(LoopbackEngine::new());
    let s = dev.open();
    let tx = s.acquire(Direction::ToDevice, Mode::OneShot).unwrap();
    let rx = s.acquire(Direction::FromDevice, Mode::OneShot).unwrap();
    let src = s.allocate(8192, Direction::ToDevice).unwrap();
    let dst = s.allocate(8192, Direction::FromDevice).unwrap();
    fastrand::fill(src.slice::<u8>());

    let mut results = Vec::new();
    for _ in 0..2 {
        dst.slice::<u8>().fill(0);
        let r = s.submit(rx, dst.id(), 0, 8192).unwrap();
        let t = s.submit(tx, src.id(), 0, 8192).unwrap();
        assert_eq!(s.wait(t.id(), Some(WAIT)).unwrap(), TransferStatus::CompletedOk);
        assert_eq!(s.wait(r.id(), Some(WAIT)).unwrap(), TransferStatus::CompletedOk);
        assert_eq!(src.slice::<u8>(), dst.slice::<u8>());
        results.push(dst.slice::<u8>().to_vec());
    }
    assert_eq!(results[0], results[1]);
}

#[test]
fn transfers_on_one_channel_complete_in_order() {
    let (_, dev) = loopback_device(LoopbackEngine::new().with_segment_delay(Duration::from_millis(25)));
    let s = dev.open();
    let tx = s.acquire(Direction::ToDevice, Mode::OneShot).unwrap();
    let rx = s.acquire(Direction::FromDevice, Mode::OneShot).unwrap();
    let a = s.allocate(2048, Direction::ToDevice).unwrap();
    let b = s.allocate(2048, Direction::ToDevice).unwrap();
    let dst = s.allocate(4096, Direction::FromDevice).unwrap();
    a.slice::<u8>().fill(0xaa);
    b.slice::<u8>().fill(0xbb);

    let r = s.submit(rx, dst.id(), 0, 4096).unwrap();
    let t1 = s.submit(tx, a.id(), 0, 2048).unwrap();
    // the channel holds one transfer at a time
    assert!(matches!(
        s.submit(tx, b.id(), 0, 2048),
        Err(Error::ChannelBusy(_))
    ));
    assert_eq!(t1.wait(WAIT).unwrap(), TransferStatus::CompletedOk);
    let t2 = s.submit(tx, b.id(), 0, 2048).unwrap();
    assert!(t2.id() > t1.id());
    assert_eq!(t2.wait(WAIT).unwrap(), TransferStatus::CompletedOk);
    assert_eq!(r.wait(WAIT).unwrap(), TransferStatus::CompletedOk);

    let out = dst.slice::<u8>();
    assert!(out[..2048].iter().all(|&x| x == 0xaa));
    assert!(out[2048..].iter().all(|&x| x == 0xbb));
}

#[test]
fn no_double_submission() {
    let (_, dev) = loopback_device(LoopbackEngine::new());
    let s = dev.open();
    let rx = s.acquire(Direction::FromDevice, Mode::OneShot).unwrap();
    let a = s.allocate(512, Direction::FromDevice).unwrap();
    let b = s.allocate(512, Direction::FromDevice).unwrap();

    let first = s.submit(rx, a.id(), 0, 512).unwrap();
    for _ in 0..8 {
        assert!(matches!(s.submit(rx, b.id(), 0, 512), Err(Error::ChannelBusy(_))));
    }
    let channel = dev.channels().into_iter().find(|c| c.id == rx).unwrap();
    assert_eq!(channel.state, ChannelState::Active);
    assert!(!b.is_busy());
    assert!(matches!(
        s.acquire_id(rx, Mode::OneShot),
        Err(Error::ChannelBusy(_))
    ));

    s.abort(first.id()).unwrap();
    assert_eq!(first.wait(WAIT).unwrap(), TransferStatus::Aborted);
}

#[test]
fn out_of_range_never_activates_the_channel() {
    let (_, dev) = loopback_device(LoopbackEngine::new());
    let s = dev.open();
    let tx = s.acquire(Direction::ToDevice, Mode::OneShot).unwrap();
    let buf = s.allocate(1000, Direction::ToDevice).unwrap();

    for _ in 0..64 {
        let offset = fastrand::usize(0..2000);
        let len = fastrand::usize(1000usize.saturating_sub(offset) + 1..3000);
        assert!(offset + len > 1000);
        assert!(matches!(
            s.submit(tx, buf.id(), offset, len),
            Err(Error::OutOfRange { size: 1000, .. })
        ));
        let info = dev.channels().into_iter().find(|c| c.id == tx).unwrap();
        assert_eq!(info.state, ChannelState::Reserved);
        assert!(!buf.is_busy());
    }
    assert!(matches!(
        s.submit(tx, buf.id(), usize::MAX, 2),
        Err(Error::OutOfRange { .. })
    ));
}

#[test]
fn direction_is_enforced() {
    let (_, dev) = loopback_device(LoopbackEngine::new());
    let s = dev.open();
    let tx = s.acquire(Direction::ToDevice, Mode::OneShot).unwrap();
    let rx_buf = s.allocate(64, Direction::FromDevice).unwrap();
    let both = s.allocate(64, Direction::Bidirectional).unwrap();
    assert!(matches!(
        s.submit(tx, rx_buf.id(), 0, 64),
        Err(Error::DirectionMismatch)
    ));
    let h = s.submit(tx, both.id(), 0, 64).unwrap();
    assert_eq!(h.wait(WAIT).unwrap(), TransferStatus::CompletedOk);
}

#[test]
fn release_fails_while_busy_and_succeeds_after() {
    let (_, dev) = loopback_device(LoopbackEngine::new());
    let s = dev.open();
    let rx = s.acquire(Direction::FromDevice, Mode::OneShot).unwrap();
    let buf = s.allocate(4096, Direction::FromDevice).unwrap();

    let h = s.submit(rx, buf.id(), 0, 4096).unwrap();
    assert!(matches!(s.release_buffer(buf.id()), Err(Error::BufferBusy(_))));
    assert!(matches!(s.release_channel(rx), Err(Error::ChannelBusy(_))));

    s.abort(h.id()).unwrap();
    assert_eq!(s.wait(h.id(), Some(WAIT)).unwrap(), TransferStatus::Aborted);
    s.release_buffer(buf.id()).unwrap();
    s.release_channel(rx).unwrap();
    assert_eq!(dev.num_buffers(), 0);
}

#[test]
fn full_page_to_device() {
    let (_, dev) = loopback_device(LoopbackEngine::new());
    let s = dev.open();
    let tx = s.acquire(Direction::ToDevice, Mode::OneShot).unwrap();
    let buf = s.allocate(4096, Direction::ToDevice).unwrap();
    assert!(buf.slice::<u8>().iter().all(|&x| x == 0));

    let h = s.submit(tx, buf.id(), 0, 4096).unwrap();
    assert_eq!(
        s.wait(h.id(), Some(Duration::from_secs(1))).unwrap(),
        TransferStatus::CompletedOk
    );
    s.release_buffer(buf.id()).unwrap();
}

#[test]
fn partially_mapped_user_buffer_is_rejected() {
    let (_, dev) = loopback_device(LoopbackEngine::new());
    let s = dev.open();
    let page = xilinx_dma_bridge::page_size();

    let addr = unsafe {
        let p = libc::mmap(
            std::ptr::null_mut(),
            2 * page,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        assert_ne!(p, libc::MAP_FAILED);
        assert_eq!(libc::munmap((p as *mut u8).add(page) as *mut libc::c_void, page), 0);
        p as usize
    };

    assert!(matches!(
        s.register_user_buffer(addr, 2 * page, Direction::ToDevice),
        Err(Error::InvalidAddress { .. })
    ));
    assert_eq!(dev.num_buffers(), 0);

    let b = s.register_user_buffer(addr, page, Direction::ToDevice).unwrap();
    assert!(matches!(
        s.register_user_buffer(addr + 64, 64, Direction::ToDevice),
        Err(Error::AlreadyMapped { .. })
    ));
    s.release_buffer(b.id()).unwrap();
    unsafe {
        libc::munmap(addr as *mut libc::c_void, page);
    }
}

#[test]
fn hardware_error_is_reported_and_buffer_released() {
    let (engine, dev) = loopback_device(LoopbackEngine::new());
    let s = dev.open();
    let tx = s.acquire(Direction::ToDevice, Mode::OneShot).unwrap();
    let buf = s.allocate(4096, Direction::ToDevice).unwrap();

    engine.inject_error(tx.0, 0x4011).unwrap();
    let h = s.submit(tx, buf.id(), 0, 4096).unwrap();
    assert_eq!(h.wait(WAIT).unwrap(), TransferStatus::CompletedError);
    assert_eq!(h.hw_status(), 0x4011);
    assert!(matches!(
        h.status().into_result(),
        Err(Error::HardwareError(_))
    ));
    s.release_buffer(buf.id()).unwrap();

    // the channel is usable again
    let buf = s.allocate(4096, Direction::ToDevice).unwrap();
    let h = s.submit(tx, buf.id(), 0, 4096).unwrap();
    assert_eq!(h.wait(WAIT).unwrap(), TransferStatus::CompletedOk);
}

#[test]
fn wait_times_out_on_stalled_transfer() {
    let (_, dev) = loopback_device(LoopbackEngine::new());
    let s = dev.open();
    let rx = s.acquire(Direction::FromDevice, Mode::OneShot).unwrap();
    let buf = s.allocate(256, Direction::FromDevice).unwrap();
    let h = s.submit(rx, buf.id(), 0, 256).unwrap();
    assert!(matches!(
        s.wait(h.id(), Some(Duration::from_millis(20))),
        Err(Error::Timeout)
    ));
    assert_eq!(h.status(), TransferStatus::InFlight);
    // still known to the session after a timeout
    s.abort(h.id()).unwrap();
    assert_eq!(s.wait(h.id(), Some(WAIT)).unwrap(), TransferStatus::Aborted);
}

#[test]
fn waiters_on_other_threads_see_completion() {
    let (_, dev) = loopback_device(LoopbackEngine::new());
    let s = dev.open();
    let tx = s.acquire(Direction::ToDevice, Mode::OneShot).unwrap();
    let rx = s.acquire(Direction::FromDevice, Mode::OneShot).unwrap();
    let src = s.allocate(1 << 16, Direction::ToDevice).unwrap();
    let dst = s.allocate(1 << 16, Direction::FromDevice).unwrap();

    let r = s.submit(rx, dst.id(), 0, 1 << 16).unwrap();
    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let r = r.clone();
            thread::spawn(move || r.wait(WAIT).unwrap())
        })
        .collect();
    let t = s.submit(tx, src.id(), 0, 1 << 16).unwrap();
    for w in waiters {
        assert_eq!(w.join().unwrap(), TransferStatus::CompletedOk);
    }
    assert_eq!(t.wait(WAIT).unwrap(), TransferStatus::CompletedOk);
}
