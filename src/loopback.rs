//! In-process DMA engine.
//!
//! Every to-device channel is wired to the from-device channel allocated at
//! the same position through a bounded byte FIFO, like two AXI DMAs joined by
//! an AXI4-Stream Data FIFO in the fabric. A to-device channel without a
//! partner drains into nothing. Each channel is served by its own thread,
//! which also runs the completion callbacks.
//!
//! Device addresses are host virtual addresses, so the engine must be paired
//! with [`HeapMemory`].

use std::alloc;
use std::alloc::Layout;
use std::collections::VecDeque;
use std::fmt;
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::descriptor::Segment;
use crate::engine::align_up;
use crate::engine::page_size;
use crate::ChannelConfig;
use crate::ChannelId;
use crate::CompletionCallback;
use crate::DescriptorChain;
use crate::Direction;
use crate::DmaEngine;
use crate::DmaMemory;
use crate::DmaRegion;
use crate::DmaStatus;
use crate::Error;
use crate::HwChannel;

const POLL: Duration = Duration::from_millis(1);
pub const DEFAULT_FIFO_DEPTH: usize = 16 * 1024;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Stream {
    fifo: Mutex<VecDeque<u8>>,
    data: Condvar,
    space: Condvar,
    capacity: usize,
    reader: AtomicBool,
}

impl Stream {
    fn new(capacity: usize) -> Stream {
        Stream {
            fifo: Mutex::new(VecDeque::with_capacity(capacity)),
            data: Condvar::new(),
            space: Condvar::new(),
            capacity,
            reader: AtomicBool::new(false),
        }
    }

    /// Returns `false` if `abort` was raised before all bytes went in.
    fn push(&self, mut bytes: &[u8], abort: &AtomicBool) -> bool {
        if !self.reader.load(Ordering::Acquire) {
            return !abort.load(Ordering::Acquire);
        }
        let mut fifo = lock(&self.fifo);
        while !bytes.is_empty() {
            if abort.load(Ordering::Acquire) {
                return false;
            }
            let free = self.capacity - fifo.len();
            if free == 0 {
                fifo = self
                    .space
                    .wait_timeout(fifo, POLL)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
                continue;
            }
            let n = usize::min(free, bytes.len());
            fifo.extend(&bytes[..n]);
            bytes = &bytes[n..];
            self.data.notify_all();
        }
        true
    }

    /// Returns `false` if `abort` was raised before `out` was filled.
    fn pull(&self, mut out: &mut [u8], abort: &AtomicBool) -> bool {
        let mut fifo = lock(&self.fifo);
        while !out.is_empty() {
            if abort.load(Ordering::Acquire) {
                return false;
            }
            if fifo.is_empty() {
                fifo = self
                    .data
                    .wait_timeout(fifo, POLL)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
                continue;
            }
            let n = usize::min(fifo.len(), out.len());
            for (o, b) in out[..n].iter_mut().zip(fifo.drain(..n)) {
                *o = b;
            }
            out = &mut out[n..];
            self.space.notify_all();
        }
        true
    }
}

struct Job {
    tag: u64,
    segments: Vec<Segment>,
    cyclic: bool,
    callback: CompletionCallback,
}

#[derive(Default)]
struct LaneState {
    job: Option<Job>,
    // Tag of the queued or running job.
    active: Option<u64>,
    shutdown: bool,
}

struct LaneShared {
    id: u32,
    direction: Direction,
    stream: Arc<Stream>,
    state: Mutex<LaneState>,
    cond: Condvar,
    abort: AtomicBool,
    inject_error: AtomicU32,
    segment_delay: Option<Duration>,
}

impl LaneShared {
    fn run(&self) {
        loop {
            let mut job = {
                let mut state = lock(&self.state);
                loop {
                    if let Some(job) = state.job.take() {
                        break job;
                    }
                    if state.shutdown {
                        return;
                    }
                    state = self
                        .cond
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            };

            let status = self.execute(&mut job);
            log::trace!("loopback channel {}: job {} -> {:?}", self.id, job.tag, status);

            {
                let mut state = lock(&self.state);
                state.active = None;
                self.abort.store(false, Ordering::Release);
            }
            (job.callback)(status);
        }
    }

    fn execute(&self, job: &mut Job) -> DmaStatus {
        let mut index = 0;
        loop {
            if self.abort.load(Ordering::Acquire) {
                return DmaStatus::Aborted;
            }
            let hw = self.inject_error.swap(0, Ordering::AcqRel);
            if hw != 0 {
                return DmaStatus::Error(hw);
            }
            if let Some(delay) = self.segment_delay {
                thread::sleep(delay);
            }

            let seg = job.segments[index];
            // Identity mapped: the device address is the host address.
            let done = match self.direction {
                Direction::FromDevice => {
                    let out = unsafe { slice::from_raw_parts_mut(seg.dma_addr as *mut u8, seg.len) };
                    self.stream.pull(out, &self.abort)
                }
                _ => {
                    let bytes = unsafe { slice::from_raw_parts(seg.dma_addr as *const u8, seg.len) };
                    self.stream.push(bytes, &self.abort)
                }
            };
            if !done {
                return DmaStatus::Aborted;
            }

            index += 1;
            if index == job.segments.len() {
                if !job.cyclic {
                    return DmaStatus::Complete;
                }
                index = 0;
            }
            if job.cyclic && seg.eof {
                (job.callback)(DmaStatus::Frame);
            }
        }
    }
}

struct Lane {
    shared: Arc<LaneShared>,
    thread: Option<JoinHandle<()>>,
}

impl Lane {
    fn shutdown(&mut self) {
        {
            let mut state = lock(&self.shared.state);
            state.shutdown = true;
            self.shared.abort.store(true, Ordering::Release);
        }
        self.shared.cond.notify_all();
        if let Some(t) = self.thread.take() {
            if t.join().is_err() {
                log::warn!("loopback channel {} worker panicked", self.shared.id);
            }
        }
    }
}

#[derive(Default)]
struct Wiring {
    lanes: Vec<Option<Lane>>,
    streams: Vec<Arc<Stream>>,
    to_device: usize,
    from_device: usize,
}

/// Software DMA engine connecting to-device channels to from-device
/// channels.
pub struct LoopbackEngine {
    wiring: Mutex<Wiring>,
    fifo_depth: usize,
    segment_delay: Option<Duration>,
}

impl fmt::Debug for LoopbackEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let wiring = lock(&self.wiring);
        writeln!(f, "LoopbackEngine")?;
        writeln!(f, "  channels: {:?}", wiring.lanes.iter().flatten().count())?;
        writeln!(f, "  streams: {:?}", wiring.streams.len())?;
        write!(f, "  fifo_depth: {:#x?}", &self.fifo_depth)
    }
}

impl Default for LoopbackEngine {
    fn default() -> LoopbackEngine {
        LoopbackEngine::new()
    }
}

impl LoopbackEngine {
    pub fn new() -> LoopbackEngine {
        LoopbackEngine {
            wiring: Mutex::new(Wiring::default()),
            fifo_depth: DEFAULT_FIFO_DEPTH,
            segment_delay: None,
        }
    }

    pub fn with_fifo_depth(mut self, depth: usize) -> LoopbackEngine {
        self.fifo_depth = depth.max(1);
        self
    }

    /// Slows every descriptor down, to keep transfers in flight for a while.
    pub fn with_segment_delay(mut self, delay: Duration) -> LoopbackEngine {
        self.segment_delay = Some(delay);
        self
    }

    /// Makes the next descriptor processed on channel `id` fail with the
    /// given raw status.
    pub fn inject_error(&self, id: u32, hw_status: u32) -> Result<(), Error> {
        let wiring = lock(&self.wiring);
        let lane = wiring
            .lanes
            .iter()
            .flatten()
            .find(|l| l.shared.id == id)
            .ok_or(Error::NotFound(crate::error::Resource::Channel(ChannelId(id))))?;
        lane.shared.inject_error.store(hw_status.max(1), Ordering::Release);
        Ok(())
    }

    fn lane(&self, channel: HwChannel) -> Option<Arc<LaneShared>> {
        let wiring = lock(&self.wiring);
        wiring
            .lanes
            .get(channel.0)
            .and_then(|l| l.as_ref())
            .map(|l| l.shared.clone())
    }
}

impl DmaEngine for LoopbackEngine {
    fn allocate_channel(&self, config: &ChannelConfig) -> Result<HwChannel, Error> {
        let mut wiring = lock(&self.wiring);
        let position = match config.direction {
            Direction::ToDevice => {
                wiring.to_device += 1;
                wiring.to_device - 1
            }
            Direction::FromDevice => {
                wiring.from_device += 1;
                wiring.from_device - 1
            }
            Direction::Bidirectional => return Err(Error::UnsupportedMode),
        };
        while wiring.streams.len() <= position {
            let stream = Arc::new(Stream::new(self.fifo_depth));
            wiring.streams.push(stream);
        }
        let stream = wiring.streams[position].clone();
        if config.direction == Direction::FromDevice {
            stream.reader.store(true, Ordering::Release);
        }

        let shared = Arc::new(LaneShared {
            id: config.id,
            direction: config.direction,
            stream,
            state: Mutex::new(LaneState::default()),
            cond: Condvar::new(),
            abort: AtomicBool::new(false),
            inject_error: AtomicU32::new(0),
            segment_delay: self.segment_delay,
        });
        let worker = shared.clone();
        let thread = thread::Builder::new()
            .name(format!("dma-loopback-{}", config.id))
            .spawn(move || worker.run())?;

        wiring.lanes.push(Some(Lane {
            shared,
            thread: Some(thread),
        }));
        Ok(HwChannel(wiring.lanes.len() - 1))
    }

    fn submit(
        &self,
        channel: HwChannel,
        tag: u64,
        chain: &DescriptorChain,
        callback: CompletionCallback,
    ) -> Result<(), Error> {
        let lane = self
            .lane(channel)
            .ok_or_else(|| Error::DescriptorBuildFailed(format!("{:?} not allocated", channel)))?;
        if chain.is_empty() {
            return Err(Error::DescriptorBuildFailed("empty chain".into()));
        }
        let mut segments = Vec::new();
        segments
            .try_reserve_exact(chain.len())
            .map_err(|_| Error::DescriptorBuildFailed("out of descriptor memory".into()))?;
        segments.extend_from_slice(chain.segments());

        {
            let mut state = lock(&lane.state);
            if state.active.is_some() || state.shutdown {
                return Err(Error::ChannelBusy(ChannelId(lane.id)));
            }
            state.active = Some(tag);
            state.job = Some(Job {
                tag,
                segments,
                cyclic: chain.is_cyclic(),
                callback,
            });
        }
        lane.cond.notify_all();
        Ok(())
    }

    fn stop_channel(&self, channel: HwChannel, tag: u64) {
        if let Some(lane) = self.lane(channel) {
            let state = lock(&lane.state);
            if state.active == Some(tag) {
                lane.abort.store(true, Ordering::Release);
            }
        }
    }

    fn free_channel(&self, channel: HwChannel) {
        let lane = {
            let mut wiring = lock(&self.wiring);
            wiring.lanes.get_mut(channel.0).and_then(|l| l.take())
        };
        if let Some(mut lane) = lane {
            lane.shutdown();
        }
    }
}

impl Drop for LoopbackEngine {
    fn drop(&mut self) {
        let wiring = self.wiring.get_mut().unwrap_or_else(PoisonError::into_inner);
        for lane in wiring.lanes.iter_mut().flatten() {
            lane.shutdown();
        }
    }
}

/// Heap backed DMA memory with identity device addressing.
#[derive(Debug)]
pub struct HeapMemory {
    limit: usize,
    used: AtomicUsize,
    page_size: usize,
}

impl Default for HeapMemory {
    fn default() -> HeapMemory {
        HeapMemory::new()
    }
}

impl HeapMemory {
    pub fn new() -> HeapMemory {
        HeapMemory::with_limit(usize::MAX)
    }

    /// Limits the total coherent memory handed out.
    pub fn with_limit(limit: usize) -> HeapMemory {
        HeapMemory {
            limit,
            used: AtomicUsize::new(0),
            page_size: page_size(),
        }
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    fn layout(&self, len: usize) -> Result<Layout, Error> {
        let size = align_up(len, self.page_size).ok_or(Error::NoMemory)?;
        Layout::from_size_align(size, self.page_size).map_err(|_| Error::NoMemory)
    }
}

impl DmaMemory for HeapMemory {
    fn alloc_coherent(&self, len: usize) -> Result<DmaRegion, Error> {
        if len == 0 {
            return Err(Error::NoMemory);
        }
        let layout = self.layout(len)?;
        let reserved = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(layout.size()).filter(|&n| n <= self.limit)
            });
        if reserved.is_err() {
            return Err(Error::NoMemory);
        }
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => Ok(unsafe { DmaRegion::new(ptr, ptr.as_ptr() as u64, len) }),
            None => {
                self.used.fetch_sub(layout.size(), Ordering::AcqRel);
                Err(Error::NoMemory)
            }
        }
    }

    fn free_coherent(&self, region: DmaRegion) {
        if let Ok(layout) = self.layout(region.len()) {
            unsafe { alloc::dealloc(region.cpu_ptr(), layout) };
            self.used.fetch_sub(layout.size(), Ordering::AcqRel);
        }
    }

    fn map_user(&self, addr: usize, len: usize, _direction: Direction) -> Result<DmaRegion, Error> {
        check_mapped(addr, len, self.page_size)?;
        let ptr = NonNull::new(addr as *mut u8).ok_or(Error::InvalidAddress { addr, len })?;
        Ok(unsafe { DmaRegion::new(ptr, addr as u64, len) })
    }

    fn unmap_user(&self, _region: DmaRegion) {}
}

/// Fails unless every page of `addr..addr + len` is mapped in this process.
pub(crate) fn check_mapped(addr: usize, len: usize, page_size: usize) -> Result<(), Error> {
    let end = addr
        .checked_add(len)
        .filter(|_| len > 0)
        .ok_or(Error::InvalidAddress { addr, len })?;
    let start = addr / page_size * page_size;
    let span = align_up(end, page_size).ok_or(Error::InvalidAddress { addr, len })? - start;
    let mut residency = Vec::new();
    residency
        .try_reserve_exact(span / page_size)
        .map_err(|_| Error::InvalidAddress { addr, len })?;
    residency.resize(span / page_size, 0u8);
    let rc = unsafe { libc::mincore(start as *mut libc::c_void, span, residency.as_mut_ptr()) };
    if rc != 0 {
        return Err(Error::InvalidAddress { addr, len });
    }
    Ok(())
}
