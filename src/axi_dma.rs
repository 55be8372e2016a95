//! AXI DMA engine driven from userspace through UIO.
//!
//! Each channel is one AXI DMA IP exposed as a `uio_pdrv_genirq` device and
//! used in a single direction. Descriptor rings live in a dedicated
//! u-dma-buf. A thread per channel waits for the UIO interrupt and runs the
//! completion callbacks.

use std::fmt;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::prelude::*;
use std::os::unix::io::AsRawFd;
use std::ptr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::parse_size;
use crate::dmb;
use crate::error::Resource;
use crate::scatter_gather::hi32;
use crate::ChannelConfig;
use crate::ChannelId;
use crate::ChannelKind;
use crate::CompletionCallback;
use crate::DescriptorChain;
use crate::Direction;
use crate::DmaEngine;
use crate::DmaMemory;
use crate::DmaRegion;
use crate::DmaStatus;
use crate::Error;
use crate::HwChannel;
use crate::SgDescriptor;
use crate::UdmaBuf;
use crate::DEFAULT_MAX_DESCRIPTORS;
use crate::SG_DESCRIPTOR_LEN;

// Register banks
#[allow(clippy::erasing_op)]
const MM2S: isize = 0x00 / 4;
const S2MM: isize = 0x30 / 4;

// Offsets inside a bank
#[allow(clippy::erasing_op)]
const DMACR: isize = 0x0 / 4;
#[allow(clippy::eq_op)]
const DMASR: isize = 0x4 / 4;
const CURDESC: isize = 0x8 / 4;
const CURDESC_MSB: isize = 0xC / 4;
const TAILDESC: isize = 0x10 / 4;
const TAILDESC_MSB: isize = 0x14 / 4;

const CR_RUN: u32 = 1;
const CR_RESET: u32 = 1 << 2;
const CR_CYCLIC: u32 = 1 << 4;
const CR_IOC_IRQ_EN: u32 = 1 << 12;
const CR_ERR_IRQ_EN: u32 = 1 << 14;
const CR_IRQ_THRESHOLD_1: u32 = 1 << 16;

const SR_SG_INCL: u32 = 1 << 3;
const SR_ERRORS: u32 = 0x770;
const SR_IOC_IRQ: u32 = 1 << 12;
const SR_IRQS: u32 = 0x7000;

const RESET_SPINS: usize = 1_000_000;
const IRQ_POLL_MS: libc::c_int = 10;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Decoded DMASR value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaStatusRegister(pub u32);

impl fmt::Display for DmaStatusRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = self.0;
        write!(f, "{:#010x}: ", c)?;
        write!(f, "{}", if c & 1 != 0 { "halted" } else { "running" })?;
        write!(f, ", {}", if c & 2 != 0 { "idle" } else { "busy" })?;
        write!(
            f,
            ", {}",
            if c & 8 != 0 {
                "scatter gather"
            } else {
                "register mode"
            }
        )?;
        let flags = [
            (4, "internal error"),
            (5, "slave error"),
            (6, "decode error"),
            (8, "sg internal error"),
            (9, "sg slave error"),
            (10, "sg dec error"),
            (12, "ioc_irq"),
            (13, "dly_irq"),
            (14, "err_irq"),
        ];
        for (bit, name) in flags {
            if c & 1 << bit != 0 {
                write!(f, ", {}", name)?;
            }
        }
        Ok(())
    }
}

struct Registers {
    base: *mut u32,
    size: usize,
    bank: isize,
}

impl Registers {
    fn open(uio: &str, direction: Direction) -> Result<(File, Registers), Error> {
        let dev_fd = OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/dev/{}", uio))?;

        let mut size_f = File::open(format!("/sys/class/uio/{}/maps/map0/size", uio))?;
        let mut buf = String::new();
        size_f.read_to_string(&mut buf)?;
        let size = parse_size(&buf)?;

        let base;
        unsafe {
            base = libc::mmap(
                std::ptr::null_mut::<libc::c_void>(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                dev_fd.as_raw_fd(),
                0,
            );
            if base == libc::MAP_FAILED {
                return Err(Error::Mmap);
            }
        }
        let bank = match direction {
            Direction::FromDevice => S2MM,
            _ => MM2S,
        };
        Ok((
            dev_fd,
            Registers {
                base: base as *mut u32,
                size,
                bank,
            },
        ))
    }

    fn read(&self, reg: isize) -> u32 {
        unsafe { ptr::read_volatile(self.base.offset(self.bank + reg)) }
    }

    fn write(&self, reg: isize, value: u32) {
        unsafe { ptr::write_volatile(self.base.offset(self.bank + reg), value) }
    }

    fn write_addr(&self, lsb: isize, msb: isize, addr: usize) {
        // MSB first: writing the LSB of TAILDESC kicks the engine.
        self.write(msb, hi32(addr as u64));
        self.write(lsb, (addr & 0xffff_ffff) as u32);
    }

    fn reset(&self) -> Result<(), Error> {
        self.write(DMACR, CR_RESET);
        for _ in 0..RESET_SPINS {
            if self.read(DMACR) & CR_RESET == 0 {
                self.write(DMASR, SR_IRQS);
                return Ok(());
            }
        }
        Err(Error::HardwareError(format!(
            "reset did not finish: {}",
            DmaStatusRegister(self.read(DMASR))
        )))
    }
}

impl Drop for Registers {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}

struct Running {
    tag: u64,
    callback: CompletionCallback,
    cyclic: bool,
    last: usize,
    abort: bool,
}

struct ChannelShared {
    id: u32,
    uio: String,
    dev_fd: File,
    regs: Registers,
    ring: DmaRegion,
    // Usable descriptors; the ring holds one spare for cyclic tail writes.
    ring_len: usize,
    running: Mutex<Option<Running>>,
    shutdown: AtomicBool,
}

unsafe impl Send for ChannelShared {}
unsafe impl Sync for ChannelShared {}

impl ChannelShared {
    fn descriptor(&self, index: usize) -> SgDescriptor {
        debug_assert!(index <= self.ring_len);
        unsafe {
            SgDescriptor::from_base_ptr(
                self.ring.cpu_ptr().add(index * SG_DESCRIPTOR_LEN) as *mut u32,
                self.ring.dma_addr() as usize + index * SG_DESCRIPTOR_LEN,
            )
        }
    }

    fn enable_uio_irqs(&self) -> Result<(), Error> {
        (&self.dev_fd).write_all(&[1u8, 0, 0, 0])?;
        Ok(())
    }

    fn start(&self, tag: u64, chain: &DescriptorChain, callback: CompletionCallback) -> Result<(), Error> {
        if chain.is_empty() || chain.len() > self.ring_len {
            return Err(Error::DescriptorBuildFailed(format!(
                "{} descriptors, ring holds {}",
                chain.len(),
                self.ring_len
            )));
        }
        let mut running = lock(&self.running);
        if running.is_some() {
            return Err(Error::ChannelBusy(ChannelId(self.id)));
        }

        let n = chain.len();
        for (i, seg) in chain.segments().iter().enumerate() {
            let next = self.descriptor(if i + 1 < n { i + 1 } else { 0 }).phys_addr();
            self.descriptor(i).write_segment(seg, next)?;
        }

        // Ensure that the descriptors and buffers have been written to
        dmb();

        self.regs.reset()?;
        let sr = self.regs.read(DMASR);
        if sr & SR_SG_INCL == 0 {
            return Err(Error::HardwareError("Scatter Gather is disabled".into()));
        }
        self.enable_uio_irqs()?;

        // CURDESC can only be written with the DMA halted.
        let first = self.descriptor(0).phys_addr();
        self.regs.write_addr(CURDESC, CURDESC_MSB, first);
        let mut cr = CR_RUN | CR_IOC_IRQ_EN | CR_ERR_IRQ_EN | CR_IRQ_THRESHOLD_1;
        if chain.is_cyclic() {
            cr |= CR_CYCLIC;
        }
        self.regs.write(DMACR, cr);

        *running = Some(Running {
            tag,
            callback,
            cyclic: chain.is_cyclic(),
            last: n - 1,
            abort: false,
        });
        drop(running);

        // In cyclic mode the tail must point outside the ring.
        let tail = if chain.is_cyclic() {
            self.descriptor(self.ring_len).phys_addr()
        } else {
            self.descriptor(n - 1).phys_addr()
        };
        self.regs.write_addr(TAILDESC, TAILDESC_MSB, tail);
        Ok(())
    }

    /// Flags the chain tagged `tag` for abort, if it is the one running.
    fn request_abort(&self, tag: u64) {
        if let Some(r) = lock(&self.running).as_mut().filter(|r| r.tag == tag) {
            r.abort = true;
        }
    }

    /// Halts the engine and reports `Aborted` if an abort was requested.
    fn service_abort(&self) {
        let mut running = lock(&self.running);
        if !running.as_ref().is_some_and(|r| r.abort) {
            return;
        }
        // Reset under the lock so a following start cannot be hit by it.
        if let Err(e) = self.regs.reset() {
            log::warn!("{} ({}): {}", self.uio, self.id, e);
        }
        let r = running.take();
        drop(running);
        if let Some(mut r) = r {
            (r.callback)(DmaStatus::Aborted);
        }
    }

    fn finish(&self, status: DmaStatus) {
        let running = lock(&self.running).take();
        if let Some(mut r) = running {
            (r.callback)(status);
        }
    }

    fn wait_irq(&self) -> Result<bool, Error> {
        let mut pfd = libc::pollfd {
            fd: self.dev_fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, IRQ_POLL_MS) };
        if rc < 0 {
            let e = std::io::Error::last_os_error();
            if e.kind() == std::io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(e.into());
        }
        if rc == 0 || pfd.revents & libc::POLLIN == 0 {
            return Ok(false);
        }
        let mut buf = [0u8; 4];
        (&self.dev_fd).read_exact(&mut buf)?;
        Ok(true)
    }

    fn service_irq(&self) -> Result<(), Error> {
        let sr = self.regs.read(DMASR);
        // clear irqs in dma
        self.regs.write(DMASR, sr & SR_IRQS);
        self.enable_uio_irqs()?;

        if sr & SR_ERRORS != 0 {
            log::warn!("{} ({}): {}", self.uio, self.id, DmaStatusRegister(sr));
            let _ = self.regs.reset();
            self.finish(DmaStatus::Error(sr));
            return Ok(());
        }
        if sr & SR_IOC_IRQ == 0 {
            return Ok(());
        }

        let mut running = lock(&self.running);
        let done = match running.as_mut() {
            Some(r) if r.cyclic => {
                (r.callback)(DmaStatus::Frame);
                false
            }
            Some(r) => self.descriptor(r.last).completed(),
            None => false,
        };
        drop(running);
        if done {
            dmb(); // the complete flag acts as an acquire lock
            self.finish(DmaStatus::Complete);
        }
        Ok(())
    }

    fn run(&self) {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                let _ = self.regs.reset();
                self.finish(DmaStatus::Aborted);
                return;
            }
            self.service_abort();
            let serviced = self.wait_irq().and_then(|irq| if irq { self.service_irq() } else { Ok(()) });
            if let Err(e) = serviced {
                log::warn!("{} ({}): irq handling failed: {}", self.uio, self.id, e);
                thread::sleep(Duration::from_millis(IRQ_POLL_MS as u64));
            }
        }
    }
}

struct AxiChannel {
    shared: Arc<ChannelShared>,
    thread: Option<JoinHandle<()>>,
}

/// [`DmaEngine`] for AXI DMA IPs reachable through UIO.
pub struct AxiDmaEngine {
    descriptors: Arc<UdmaBuf>,
    ring_len: usize,
    uios: Vec<(u32, String)>,
    channels: Mutex<Vec<Option<AxiChannel>>>,
}

impl fmt::Debug for AxiDmaEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "AxiDmaEngine")?;
        writeln!(f, "  descriptors: {}", self.descriptors.name())?;
        writeln!(f, "  ring_len: {:?}", &self.ring_len)?;
        write!(f, "  uios: {:?}", &self.uios)
    }
}

impl AxiDmaEngine {
    /// Creates the engine with descriptor rings carved from `descriptors`.
    pub fn new(descriptors: UdmaBuf) -> AxiDmaEngine {
        AxiDmaEngine {
            descriptors: Arc::new(descriptors),
            ring_len: DEFAULT_MAX_DESCRIPTORS,
            uios: Vec::new(),
            channels: Mutex::new(Vec::new()),
        }
    }

    /// Maps channel `id` to the UIO device `uio` (e.g. `"uio4"`).
    pub fn with_uio(mut self, id: u32, uio: &str) -> AxiDmaEngine {
        self.uios.push((id, uio.to_string()));
        self
    }

    pub fn with_ring_len(mut self, ring_len: usize) -> AxiDmaEngine {
        self.ring_len = ring_len.max(1);
        self
    }

    /// Current status register of a channel.
    pub fn status(&self, channel: HwChannel) -> Option<DmaStatusRegister> {
        self.shared(channel)
            .map(|s| DmaStatusRegister(s.regs.read(DMASR)))
    }

    fn shared(&self, channel: HwChannel) -> Option<Arc<ChannelShared>> {
        lock(&self.channels)
            .get(channel.0)
            .and_then(|c| c.as_ref())
            .map(|c| c.shared.clone())
    }
}

impl DmaEngine for AxiDmaEngine {
    fn allocate_channel(&self, config: &ChannelConfig) -> Result<HwChannel, Error> {
        if config.kind == ChannelKind::Vdma {
            // VDMA has a register mode interface, only AXI DMA cyclic BD mode
            // is driven here.
            return Err(Error::UnsupportedMode);
        }
        let uio = self
            .uios
            .iter()
            .find(|(id, _)| *id == config.id)
            .map(|(_, uio)| uio.clone())
            .ok_or(Error::NotFound(Resource::Channel(ChannelId(config.id))))?;

        let (dev_fd, regs) = Registers::open(&uio, config.direction)?;
        regs.reset()?;
        let ring = self
            .descriptors
            .alloc_coherent((self.ring_len + 1) * SG_DESCRIPTOR_LEN)?;
        if ring.dma_addr() & 0x3f != 0 {
            self.descriptors.free_coherent(ring);
            return Err(Error::DescriptorBuildFailed("descriptor ring misaligned".into()));
        }

        let shared = Arc::new(ChannelShared {
            id: config.id,
            uio: uio.clone(),
            dev_fd,
            regs,
            ring,
            ring_len: self.ring_len,
            running: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        });
        log::debug!(
            "{} -> channel {} ({:?}), status {}",
            uio,
            config.id,
            config.direction,
            DmaStatusRegister(shared.regs.read(DMASR))
        );

        let worker = shared.clone();
        let thread = thread::Builder::new()
            .name(format!("axi-dma-{}", uio))
            .spawn(move || worker.run())?;

        let mut channels = lock(&self.channels);
        channels.push(Some(AxiChannel {
            shared,
            thread: Some(thread),
        }));
        Ok(HwChannel(channels.len() - 1))
    }

    fn submit(
        &self,
        channel: HwChannel,
        tag: u64,
        chain: &DescriptorChain,
        callback: CompletionCallback,
    ) -> Result<(), Error> {
        let shared = self
            .shared(channel)
            .ok_or_else(|| Error::DescriptorBuildFailed(format!("{:?} not allocated", channel)))?;
        shared.start(tag, chain, callback)
    }

    fn stop_channel(&self, channel: HwChannel, tag: u64) {
        if let Some(shared) = self.shared(channel) {
            shared.request_abort(tag);
        }
    }

    fn free_channel(&self, channel: HwChannel) {
        let taken = lock(&self.channels).get_mut(channel.0).and_then(|c| c.take());
        let Some(mut c) = taken else { return };
        c.shared.shutdown.store(true, Ordering::Release);
        if let Some(t) = c.thread.take() {
            if t.join().is_err() {
                log::warn!("{}: irq thread panicked", c.shared.uio);
            }
        }
        match Arc::try_unwrap(c.shared) {
            Ok(shared) => self.descriptors.free_coherent(shared.ring),
            Err(_) => log::warn!("descriptor ring of {:?} still referenced, leaking it", channel),
        }
    }
}

impl Drop for AxiDmaEngine {
    fn drop(&mut self) {
        let n = lock(&self.channels).len();
        for i in 0..n {
            self.free_channel(HwChannel(i));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_register_decoding() {
        let s = DmaStatusRegister(0x1 | 0x8 | (1 << 5) | (1 << 12)).to_string();
        assert!(s.starts_with("0x00001029: halted, busy, scatter gather"));
        assert!(s.contains("slave error"));
        assert!(s.contains("ioc_irq"));
        assert!(!s.contains("decode error"));
    }

    #[test]
    fn error_mask_covers_dma_and_sg_errors() {
        for bit in [4, 5, 6, 8, 9, 10] {
            assert_ne!(SR_ERRORS & (1 << bit), 0);
        }
        assert_eq!(SR_ERRORS & SR_IRQS, 0);
    }
}
