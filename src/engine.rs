//! Interfaces to the DMA engine and DMA memory backends.
//!
//! The core never touches hardware directly. A backend implements
//! [`DmaEngine`] for channel control and [`DmaMemory`] for making host memory
//! addressable by the device. Two backends ship with the crate: the UIO based
//! [`AxiDmaEngine`](crate::AxiDmaEngine) with [`UdmaBuf`](crate::UdmaBuf)
//! memory, and the in-process [`LoopbackEngine`](crate::LoopbackEngine) with
//! [`HeapMemory`](crate::HeapMemory).

use std::fmt;
use std::ptr::NonNull;
use std::slice;

use crate::ChannelConfig;
use crate::DescriptorChain;
use crate::Direction;
use crate::Error;

/// Backend handle of an allocated channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HwChannel(pub usize);

/// Status reported by a backend through the completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaStatus {
    /// One-shot chain finished.
    Complete,
    /// Cyclic ring finished one lap.
    Frame,
    /// Hardware reported an error, with the raw status register.
    Error(u32),
    /// Chain was stopped before it completed.
    Aborted,
}

/// Callback registered with a chain. Invoked on a backend thread, possibly
/// many times for cyclic chains; the last invocation carries a status other
/// than [`DmaStatus::Frame`].
pub type CompletionCallback = Box<dyn FnMut(DmaStatus) + Send>;

pub trait DmaEngine: Send + Sync {
    /// Claims the hardware channel described by `config`.
    fn allocate_channel(&self, config: &ChannelConfig) -> Result<HwChannel, Error>;

    /// Hands `chain` to the channel. The backend must call `callback` exactly
    /// once with a terminal status, unless it returns an error, in which case
    /// it must not call it at all. `tag` names the chain in `stop_channel`.
    fn submit(
        &self,
        channel: HwChannel,
        tag: u64,
        chain: &DescriptorChain,
        callback: CompletionCallback,
    ) -> Result<(), Error>;

    /// Requests the chain tagged `tag` to stop. If it is still queued or
    /// running, it reports [`DmaStatus::Aborted`] through its callback;
    /// otherwise this does nothing. Does not block.
    fn stop_channel(&self, channel: HwChannel, tag: u64);

    /// Releases the channel. When this returns, no callback for the channel
    /// runs anymore.
    fn free_channel(&self, channel: HwChannel);
}

/// A host memory region the device can address.
///
/// Regions are ownership tokens: they are handed back to the [`DmaMemory`]
/// they came from to be freed.
pub struct DmaRegion {
    cpu: NonNull<u8>,
    dma_addr: u64,
    len: usize,
}

impl fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaRegion")
            .field("cpu", &self.cpu)
            .field("dma_addr", &format_args!("{:#x}", self.dma_addr))
            .field("len", &format_args!("{:#x}", self.len))
            .finish()
    }
}

impl DmaRegion {
    /// # Safety
    ///
    /// `cpu` must be valid for reads and writes of `len` bytes until the
    /// region is returned to its allocator.
    pub unsafe fn new(cpu: NonNull<u8>, dma_addr: u64, len: usize) -> DmaRegion {
        DmaRegion { cpu, dma_addr, len }
    }

    pub fn cpu_ptr(&self) -> *mut u8 {
        self.cpu.as_ptr()
    }

    pub fn dma_addr(&self) -> u64 {
        self.dma_addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[allow(clippy::mut_from_ref)]
    pub(crate) fn bytes(&self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.cpu.as_ptr(), self.len) }
    }
}

// The region is plain memory shared with the device; synchronization of its
// contents is the caller's contract.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

pub trait DmaMemory: Send + Sync {
    /// Allocates a zero-filled coherent region.
    fn alloc_coherent(&self, len: usize) -> Result<DmaRegion, Error>;

    fn free_coherent(&self, region: DmaRegion);

    /// Makes the user range `addr..addr + len` addressable by the device.
    fn map_user(&self, addr: usize, len: usize, direction: Direction) -> Result<DmaRegion, Error>;

    fn unmap_user(&self, region: DmaRegion);

    /// Flushes CPU writes in the range so the device observes them.
    fn sync_for_device(&self, _region: &DmaRegion, _offset: usize, _len: usize) -> Result<(), Error> {
        Ok(())
    }

    /// Invalidates CPU caches for the range after the device wrote it.
    fn sync_for_cpu(&self, _region: &DmaRegion, _offset: usize, _len: usize) -> Result<(), Error> {
        Ok(())
    }
}

pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

/// Rounds `value` up to a multiple of `align`. `None` on overflow.
pub(crate) fn align_up(value: usize, align: usize) -> Option<usize> {
    value.checked_next_multiple_of(align)
}
