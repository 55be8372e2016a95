//! Per-open view of a [`DeviceContext`], the layer a character device
//! forwards open, ioctl, mmap and release to.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::slice;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use crate::device::drain_transfers;
use crate::error::Resource;
use crate::Buffer;
use crate::BufferId;
use crate::ChannelId;
use crate::ChannelInfo;
use crate::DeviceContext;
use crate::Direction;
use crate::Error;
use crate::Mode;
use crate::OwnerId;
use crate::TransferHandle;
use crate::TransferStatus;

/// Finished transfers a session keeps for a later `wait`.
const MAX_UNCOLLECTED: usize = 64;

#[derive(Default)]
struct Namespace {
    buffers: BTreeSet<BufferId>,
    channels: BTreeSet<ChannelId>,
    transfers: BTreeMap<u64, TransferHandle>,
}

impl Namespace {
    /// Tracks `handle`, dropping finished transfers that were already waited
    /// for and the oldest finished ones beyond [`MAX_UNCOLLECTED`].
    fn track(&mut self, handle: &TransferHandle) {
        self.transfers
            .retain(|_, h| !(h.status().is_terminal() && h.is_collected()));
        let finished: Vec<u64> = self
            .transfers
            .iter()
            .filter(|(_, h)| h.status().is_terminal())
            .map(|(&id, _)| id)
            .collect();
        for id in finished.iter().take(finished.len().saturating_sub(MAX_UNCOLLECTED)) {
            self.transfers.remove(id);
        }
        self.transfers.insert(handle.id(), handle.clone());
    }
}

/// One open handle on the device.
///
/// A session only sees the buffers, channels and transfers it created.
/// Closing it aborts and waits for its transfers, then releases its channels
/// and buffers.
pub struct Session<'d> {
    device: &'d DeviceContext,
    owner: OwnerId,
    ns: Mutex<Namespace>,
}

impl fmt::Debug for Session<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ns = self.ns();
        f.debug_struct("Session")
            .field("owner", &self.owner)
            .field("buffers", &ns.buffers)
            .field("channels", &ns.channels)
            .field("transfers", &ns.transfers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<'d> Session<'d> {
    pub(crate) fn new(device: &'d DeviceContext, owner: OwnerId) -> Session<'d> {
        log::debug!("session {:?} opened", owner);
        Session {
            device,
            owner,
            ns: Mutex::new(Namespace::default()),
        }
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn device(&self) -> &'d DeviceContext {
        self.device
    }

    pub fn channels(&self) -> Vec<ChannelInfo> {
        self.device.channels()
    }

    pub fn allocate(&self, len: usize, direction: Direction) -> Result<Arc<Buffer>, Error> {
        let buffer = self.device.allocate(len, direction)?;
        self.ns().buffers.insert(buffer.id());
        Ok(buffer)
    }

    pub fn register_user_buffer(&self, addr: usize, len: usize, direction: Direction) -> Result<Arc<Buffer>, Error> {
        let buffer = self.device.register_user_buffer(addr, len, direction)?;
        self.ns().buffers.insert(buffer.id());
        Ok(buffer)
    }

    pub fn release_buffer(&self, id: BufferId) -> Result<(), Error> {
        let mut ns = self.ns();
        if !ns.buffers.contains(&id) {
            return Err(Error::NotFound(Resource::Buffer(id)));
        }
        self.device.release_buffer(id)?;
        ns.buffers.remove(&id);
        Ok(())
    }

    pub fn buffer(&self, id: BufferId) -> Result<Arc<Buffer>, Error> {
        self.check_buffer(&self.ns(), id)?;
        self.device.lookup_buffer(id)
    }

    /// Reserves an idle channel for `direction` and `mode`.
    pub fn acquire(&self, direction: Direction, mode: Mode) -> Result<ChannelId, Error> {
        let id = self.device.acquire(self.owner, direction, mode)?;
        self.ns().channels.insert(id);
        Ok(id)
    }

    /// Reserves the channel `id`.
    pub fn acquire_id(&self, id: ChannelId, mode: Mode) -> Result<ChannelId, Error> {
        let id = self.device.acquire_id(self.owner, id, mode)?;
        self.ns().channels.insert(id);
        Ok(id)
    }

    pub fn release_channel(&self, id: ChannelId) -> Result<(), Error> {
        let mut ns = self.ns();
        if !ns.channels.contains(&id) {
            return Err(Error::NotFound(Resource::Channel(id)));
        }
        self.device.release_channel(self.owner, id)?;
        ns.channels.remove(&id);
        Ok(())
    }

    pub fn submit(&self, channel: ChannelId, buffer: BufferId, offset: usize, len: usize) -> Result<TransferHandle, Error> {
        let mut ns = self.ns();
        self.check_buffer(&ns, buffer)?;
        let handle = self.device.submit(self.owner, channel, buffer, offset, len)?;
        ns.track(&handle);
        Ok(handle)
    }

    pub fn submit_frames(&self, channel: ChannelId, frames: &[(BufferId, usize, usize)]) -> Result<TransferHandle, Error> {
        let mut ns = self.ns();
        for &(b, _, _) in frames {
            self.check_buffer(&ns, b)?;
        }
        let handle = self.device.submit_frames(self.owner, channel, frames)?;
        ns.track(&handle);
        Ok(handle)
    }

    pub fn transfer(&self, id: u64) -> Result<TransferHandle, Error> {
        self.ns()
            .transfers
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound(Resource::Transfer(id)))
    }

    /// Waits for transfer `id` to finish, with the device default timeout if
    /// `timeout` is `None`. A transfer is forgotten once its terminal status
    /// has been returned.
    pub fn wait(&self, id: u64, timeout: Option<Duration>) -> Result<TransferStatus, Error> {
        let handle = self.transfer(id)?;
        let status = handle.wait(timeout.unwrap_or(self.device.config().default_timeout))?;
        self.ns().transfers.remove(&id);
        Ok(status)
    }

    #[cfg(feature = "async")]
    pub async fn wait_async(&self, id: u64, timeout: Option<Duration>) -> Result<TransferStatus, Error> {
        let handle = self.transfer(id)?;
        let status = handle
            .wait_async(timeout.unwrap_or(self.device.config().default_timeout))
            .await?;
        self.ns().transfers.remove(&id);
        Ok(status)
    }

    /// Waits until transfer `id` completed more than `seen` frames.
    pub fn wait_frame(&self, id: u64, seen: u64, timeout: Option<Duration>) -> Result<u64, Error> {
        let handle = self.transfer(id)?;
        handle.wait_frame(seen, timeout.unwrap_or(self.device.config().default_timeout))
    }

    pub fn abort(&self, id: u64) -> Result<(), Error> {
        let handle = self.transfer(id)?;
        self.device.abort(&handle);
        Ok(())
    }

    /// Maps `len` bytes of the buffer registered at mmap `offset`.
    pub fn mmap(&self, offset: u64, len: usize) -> Result<BufferMapping, Error> {
        let buffer = self.device.lookup_mapping(offset)?;
        self.check_buffer(&self.ns(), buffer.id())
            .map_err(|_| Error::NotFound(Resource::Mapping(offset)))?;
        if len == 0 || len > buffer.size() {
            return Err(Error::OutOfRange {
                offset: 0,
                len,
                size: buffer.size(),
            });
        }
        Ok(BufferMapping { buffer, len })
    }

    /// Releases everything the session still holds.
    pub fn close(self) {}

    fn check_buffer(&self, ns: &Namespace, id: BufferId) -> Result<(), Error> {
        if ns.buffers.contains(&id) {
            Ok(())
        } else {
            Err(Error::NotFound(Resource::Buffer(id)))
        }
    }

    fn ns(&self) -> MutexGuard<'_, Namespace> {
        self.ns.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        let ns = std::mem::take(self.ns.get_mut().unwrap_or_else(PoisonError::into_inner));
        let transfers: Vec<_> = ns.transfers.into_values().collect();
        for h in transfers.iter().filter(|h| !h.status().is_terminal()) {
            self.device.abort(h);
        }
        drain_transfers(&transfers, self.device.config().default_timeout);

        // Transfers that outlived the drain still hold channels and buffers.
        for id in ns.channels {
            let released = match self.device.release_channel(self.owner, id) {
                Err(Error::ChannelBusy(_)) => self.device.force_release_channel(self.owner, id),
                r => r,
            };
            if let Err(e) = released {
                log::warn!("session {:?}: channel {}: {}", self.owner, id, e);
            }
        }
        for id in ns.buffers {
            let released = match self.device.release_buffer(id) {
                Err(Error::BufferBusy(_)) => self.device.forget_buffer(id),
                r => r,
            };
            if let Err(e) = released {
                log::warn!("session {:?}: buffer {}: {}", self.owner, id, e);
            }
        }
        log::debug!("session {:?} closed", self.owner);
    }
}

/// A buffer mapped into the caller's view.
///
/// Keeps the buffer memory alive even if the buffer is released.
pub struct BufferMapping {
    buffer: Arc<Buffer>,
    len: usize,
}

impl fmt::Debug for BufferMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferMapping")
            .field("buffer", &self.buffer.id())
            .field("len", &self.len)
            .finish()
    }
}

impl BufferMapping {
    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.buffer.buffer()
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.buffer.buffer(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.buffer.buffer(), self.len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChannelConfig;
    use crate::Config;
    use crate::ChannelState;
    use crate::CompletionCallback;
    use crate::DmaEngine;
    use crate::DmaStatus;
    use crate::HeapMemory;
    use crate::HwChannel;
    use crate::LoopbackEngine;
    use std::thread;

    /// Engine whose chains only finish when the test says so.
    #[derive(Default)]
    struct StuckEngine {
        pending: Mutex<Vec<CompletionCallback>>,
    }

    impl StuckEngine {
        fn complete_all(&self) {
            for mut cb in self.pending.lock().unwrap().drain(..) {
                cb(DmaStatus::Complete);
            }
        }
    }

    impl DmaEngine for StuckEngine {
        fn allocate_channel(&self, config: &ChannelConfig) -> Result<HwChannel, Error> {
            Ok(HwChannel(config.id as usize))
        }

        fn submit(
            &self,
            _channel: HwChannel,
            _tag: u64,
            _chain: &crate::DescriptorChain,
            callback: CompletionCallback,
        ) -> Result<(), Error> {
            self.pending.lock().unwrap().push(callback);
            Ok(())
        }

        fn stop_channel(&self, _channel: HwChannel, _tag: u64) {}

        fn free_channel(&self, _channel: HwChannel) {}
    }

    fn settle(h: &TransferHandle) {
        while !h.status().is_terminal() {
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn device() -> DeviceContext {
        let config = Config::default()
            .with_channel(ChannelConfig::axi_dma(0, Direction::ToDevice))
            .with_channel(ChannelConfig::axi_dma(1, Direction::FromDevice));
        DeviceContext::init(Arc::new(LoopbackEngine::new()), Arc::new(HeapMemory::new()), config).unwrap()
    }

    #[test]
    fn sessions_do_not_see_each_other() {
        let dev = device();
        let a = dev.open();
        let b = dev.open();
        let buf = a.allocate(128, Direction::ToDevice).unwrap();
        assert!(matches!(b.release_buffer(buf.id()), Err(Error::NotFound(_))));
        assert!(matches!(b.mmap(buf.map_offset(), 128), Err(Error::NotFound(_))));

        let ch = a.acquire(Direction::ToDevice, Mode::OneShot).unwrap();
        assert!(matches!(b.release_channel(ch), Err(Error::NotFound(_))));
        assert!(matches!(b.submit(ch, buf.id(), 0, 128), Err(Error::NotFound(_))));
        drop(b);
        drop(a);
        dev.teardown();
    }

    #[test]
    fn mmap_shares_buffer_memory() {
        let dev = device();
        let s = dev.open();
        let buf = s.allocate(4096, Direction::ToDevice).unwrap();
        let mut map = s.mmap(buf.map_offset(), 4096).unwrap();
        map.as_mut_slice()[..4].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(&buf.slice::<u8>()[..4], &[1, 2, 3, 4]);
        assert!(matches!(s.mmap(buf.map_offset(), 4097), Err(Error::OutOfRange { .. })));
        assert!(matches!(s.mmap(0x7fff_0000, 16), Err(Error::NotFound(_))));
    }

    #[test]
    fn close_releases_everything() {
        let dev = device();
        {
            let s = dev.open();
            let buf = s.allocate(512, Direction::FromDevice).unwrap();
            let rx = s.acquire(Direction::FromDevice, Mode::OneShot).unwrap();
            // stalls: nothing feeds the loopback stream
            s.submit(rx, buf.id(), 0, 512).unwrap();
            s.close();
        }
        assert_eq!(dev.num_buffers(), 0);
        assert!(dev
            .channels()
            .iter()
            .all(|c| c.state == crate::ChannelState::Idle));
        dev.teardown();
    }

    #[test]
    fn wait_forgets_finished_transfers() {
        let dev = device();
        let s = dev.open();
        let buf = s.allocate(64, Direction::ToDevice).unwrap();
        let tx = s.acquire(Direction::ToDevice, Mode::OneShot).unwrap();
        let h = s.submit(tx, buf.id(), 0, 64).unwrap();
        assert_eq!(s.wait(h.id(), None).unwrap(), TransferStatus::CompletedOk);
        assert!(matches!(s.wait(h.id(), None), Err(Error::NotFound(_))));
    }

    #[test]
    fn finished_transfers_are_pruned_on_submit() {
        let dev = device();
        let s = dev.open();
        let buf = s.allocate(64, Direction::ToDevice).unwrap();
        let tx = s.acquire(Direction::ToDevice, Mode::OneShot).unwrap();

        let a = s.submit(tx, buf.id(), 0, 64).unwrap();
        assert_eq!(a.wait(Duration::from_secs(5)).unwrap(), TransferStatus::CompletedOk);
        let b = s.submit(tx, buf.id(), 0, 64).unwrap();
        assert!(matches!(s.transfer(a.id()), Err(Error::NotFound(_))));

        // finished but never waited for: still there for the next wait
        settle(&b);
        let c = s.submit(tx, buf.id(), 0, 64).unwrap();
        assert_eq!(s.wait(b.id(), None).unwrap(), TransferStatus::CompletedOk);
        settle(&c);

        for _ in 0..MAX_UNCOLLECTED + 8 {
            let h = s.submit(tx, buf.id(), 0, 64).unwrap();
            settle(&h);
        }
        assert!(s.ns().transfers.len() <= MAX_UNCOLLECTED + 1);
    }

    #[test]
    fn close_frees_channels_held_by_stuck_transfers() {
        let engine = Arc::new(StuckEngine::default());
        let config = Config::default()
            .with_channel(ChannelConfig::axi_dma(0, Direction::ToDevice))
            .with_default_timeout(Duration::from_millis(20));
        let dev = DeviceContext::init(engine.clone(), Arc::new(HeapMemory::new()), config).unwrap();

        let h = {
            let s = dev.open();
            let buf = s.allocate(64, Direction::ToDevice).unwrap();
            let tx = s.acquire(Direction::ToDevice, Mode::OneShot).unwrap();
            let h = s.submit(tx, buf.id(), 0, 64).unwrap();
            s.close();
            h
        };
        assert_eq!(h.status(), TransferStatus::InFlight);
        assert_eq!(dev.num_buffers(), 0);
        let ch = dev.channel(ChannelId(0)).unwrap();
        assert_eq!(ch.owner(), None);
        assert_eq!(ch.state(), ChannelState::Active);

        let s = dev.open();
        assert!(matches!(
            s.acquire(Direction::ToDevice, Mode::OneShot),
            Err(Error::NoChannelAvailable)
        ));
        engine.complete_all();
        assert_eq!(h.status(), TransferStatus::CompletedOk);
        assert!(h.buffers().all(|b| !b.is_busy()));
        assert_eq!(s.acquire(Direction::ToDevice, Mode::OneShot).unwrap(), ChannelId(0));
        drop(s);
        dev.teardown();
    }
}
