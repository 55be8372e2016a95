use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::mem::ManuallyDrop;
use std::slice;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::engine::align_up;
use crate::engine::page_size;
use crate::error::Resource;
use crate::DmaMemory;
use crate::DmaRegion;
use crate::Direction;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Coherent memory allocated by the bridge.
    Coherent,
    /// Memory owned by the caller and registered with the bridge.
    User,
}

/// A DMA-addressable memory region.
///
/// The memory is returned to its allocator when the last reference to the
/// buffer is dropped, so a mapping or a finished transfer handle that still
/// holds the buffer keeps it valid after it left the registry.
pub struct Buffer {
    id: BufferId,
    kind: BufferKind,
    direction: Direction,
    map_offset: u64,
    user_addr: Option<usize>,
    region: ManuallyDrop<DmaRegion>,
    pins: AtomicUsize,
    memory: Arc<dyn DmaMemory>,
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Buffer ({})", &self.id)?;
        writeln!(f, "  kind: {:?}", &self.kind)?;
        writeln!(f, "  direction: {:?}", &self.direction)?;
        writeln!(f, "  size: {:#x?}", self.region.len())?;
        writeln!(f, "  dma_addr: {:#x?}", self.region.dma_addr())?;
        writeln!(f, "  buffer: {:?}", self.region.cpu_ptr())?;
        write!(f, "  map_offset: {:#x?}", &self.map_offset)
    }
}

impl Buffer {
    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn size(&self) -> usize {
        self.region.len()
    }

    pub fn dma_addr(&self) -> u64 {
        self.region.dma_addr()
    }

    pub fn buffer(&self) -> *mut u8 {
        self.region.cpu_ptr()
    }

    /// Offset under which the buffer is mapped through
    /// [`Session::mmap`](crate::Session::mmap).
    pub fn map_offset(&self) -> u64 {
        self.map_offset
    }

    pub fn user_addr(&self) -> Option<usize> {
        self.user_addr
    }

    /// Views the buffer as a slice of `T`.
    ///
    /// The caller must not touch the memory while a transfer that uses it is
    /// in flight.
    #[allow(clippy::mut_from_ref)]
    pub fn slice<T>(&self) -> &mut [T] {
        unsafe {
            slice::from_raw_parts_mut(
                self.region.cpu_ptr() as *mut T,
                self.region.len() / mem::size_of::<T>(),
            )
        }
    }

    /// Whether a non-terminal transfer references the buffer.
    pub fn is_busy(&self) -> bool {
        self.pins.load(Ordering::Acquire) != 0
    }

    pub(crate) fn pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unpin(&self) {
        let prev = self.pins.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unbalanced unpin of buffer {}", self.id);
    }

    pub fn sync_for_device(&self, offset: usize, len: usize) -> Result<(), Error> {
        self.memory.sync_for_device(&self.region, offset, len)
    }

    pub fn sync_for_cpu(&self, offset: usize, len: usize) -> Result<(), Error> {
        self.memory.sync_for_cpu(&self.region, offset, len)
    }

    pub(crate) fn check_range(&self, offset: usize, len: usize) -> Result<(), Error> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size() => Ok(()),
            _ => Err(Error::OutOfRange {
                offset,
                len,
                size: self.size(),
            }),
        }
    }

    fn overlaps(&self, addr: usize, len: usize) -> bool {
        match self.user_addr {
            Some(start) => start < addr + len && addr < start + self.size(),
            None => false,
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let region = unsafe { ManuallyDrop::take(&mut self.region) };
        match self.kind {
            BufferKind::Coherent => self.memory.free_coherent(region),
            BufferKind::User => self.memory.unmap_user(region),
        }
    }
}

/// Tracks the buffers of one device.
///
/// Not synchronized by itself: the owning
/// [`DeviceContext`](crate::DeviceContext) serializes access.
pub struct BufferRegistry {
    memory: Arc<dyn DmaMemory>,
    buffers: BTreeMap<BufferId, Arc<Buffer>>,
    next_id: u32,
    next_offset: u64,
    page_size: usize,
}

impl fmt::Debug for BufferRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferRegistry")
            .field("buffers", &self.buffers.keys().collect::<Vec<_>>())
            .field("next_offset", &format_args!("{:#x}", self.next_offset))
            .finish()
    }
}

impl BufferRegistry {
    pub fn new(memory: Arc<dyn DmaMemory>) -> BufferRegistry {
        BufferRegistry {
            memory,
            buffers: BTreeMap::new(),
            next_id: 1,
            next_offset: 0,
            page_size: page_size(),
        }
    }

    pub fn allocate(&mut self, len: usize, direction: Direction) -> Result<Arc<Buffer>, Error> {
        if len == 0 {
            return Err(Error::OutOfRange {
                offset: 0,
                len: 0,
                size: 0,
            });
        }
        let span = align_up(len, self.page_size).ok_or(Error::NoMemory)?;
        let region = self.memory.alloc_coherent(len)?;
        region.bytes().fill(0);
        let buffer = self.insert(region, span, BufferKind::Coherent, direction, None);
        log::debug!(
            "allocated buffer {} ({:#x} bytes, {:?}) at dma {:#x}",
            buffer.id,
            len,
            direction,
            buffer.dma_addr()
        );
        Ok(buffer)
    }

    pub fn register_user_buffer(
        &mut self,
        addr: usize,
        len: usize,
        direction: Direction,
    ) -> Result<Arc<Buffer>, Error> {
        if len == 0 || addr == 0 || addr.checked_add(len).is_none() {
            return Err(Error::InvalidAddress { addr, len });
        }
        if self.buffers.values().any(|b| b.overlaps(addr, len)) {
            return Err(Error::AlreadyMapped { addr, len });
        }
        let span = align_up(len, self.page_size).ok_or(Error::InvalidAddress { addr, len })?;
        let region = self.memory.map_user(addr, len, direction)?;
        let buffer = self.insert(region, span, BufferKind::User, direction, Some(addr));
        log::debug!(
            "registered user buffer {} at {:#x} ({:#x} bytes, {:?})",
            buffer.id,
            addr,
            len,
            direction
        );
        Ok(buffer)
    }

    pub fn release(&mut self, id: BufferId) -> Result<(), Error> {
        let buffer = self.lookup(id)?;
        if buffer.is_busy() {
            return Err(Error::BufferBusy(id));
        }
        self.buffers.remove(&id);
        log::debug!("released buffer {}", id);
        Ok(())
    }

    /// Removes `id` even if a transfer still pins it. The memory lives on
    /// until the last reference goes away.
    pub(crate) fn forget(&mut self, id: BufferId) -> Result<(), Error> {
        let buffer = self.buffers.remove(&id).ok_or(Error::NotFound(Resource::Buffer(id)))?;
        if buffer.is_busy() {
            log::warn!("buffer {} dropped from the registry while pinned", id);
        }
        Ok(())
    }

    pub fn lookup(&self, id: BufferId) -> Result<Arc<Buffer>, Error> {
        self.buffers
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound(Resource::Buffer(id)))
    }

    pub fn lookup_offset(&self, offset: u64) -> Result<Arc<Buffer>, Error> {
        self.buffers
            .values()
            .find(|b| b.map_offset == offset)
            .cloned()
            .ok_or(Error::NotFound(Resource::Mapping(offset)))
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Empties the registry. Used on teardown, after all channels are quiet.
    pub(crate) fn drain(&mut self) -> Vec<Arc<Buffer>> {
        mem::take(&mut self.buffers).into_values().collect()
    }

    fn insert(
        &mut self,
        region: DmaRegion,
        span: usize,
        kind: BufferKind,
        direction: Direction,
        user_addr: Option<usize>,
    ) -> Arc<Buffer> {
        let id = BufferId(self.next_id);
        self.next_id += 1;
        let map_offset = self.next_offset;
        self.next_offset += span as u64;

        let buffer = Arc::new(Buffer {
            id,
            kind,
            direction,
            map_offset,
            user_addr,
            region: ManuallyDrop::new(region),
            pins: AtomicUsize::new(0),
            memory: self.memory.clone(),
        });
        self.buffers.insert(id, buffer.clone());
        buffer
    }
}
