use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use crate::error::Resource;
use crate::Buffer;
use crate::BufferId;
use crate::BufferRegistry;
use crate::Channel;
use crate::ChannelId;
use crate::ChannelInfo;
use crate::ChannelManager;
use crate::Config;
use crate::Direction;
use crate::DmaEngine;
use crate::DmaMemory;
use crate::Error;
use crate::Mode;
use crate::OwnerId;
use crate::Session;
use crate::TransferEngine;
use crate::TransferHandle;

struct Inner {
    buffers: BufferRegistry,
    channels: ChannelManager,
    // Submitted transfers, pruned of terminal ones on every submit.
    in_flight: Vec<TransferHandle>,
}

/// One DMA bridge instance.
///
/// Owns the channels and buffers behind a single lock that serializes
/// reservation and allocation. Transfers complete without taking it.
pub struct DeviceContext {
    config: Config,
    inner: Mutex<Inner>,
    transfers: TransferEngine,
    next_owner: AtomicU64,
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        writeln!(f, "DeviceContext ({})", &self.config.chrdev_name)?;
        writeln!(f, "  minor: {:?}", &self.config.minor)?;
        writeln!(f, "  channels: {:?}", &inner.channels)?;
        write!(f, "  buffers: {:?}", &inner.buffers)
    }
}

impl DeviceContext {
    /// Brings up the channels listed in `config` on `engine`.
    pub fn init(engine: Arc<dyn DmaEngine>, memory: Arc<dyn DmaMemory>, config: Config) -> Result<DeviceContext, Error> {
        config.validate()?;
        let channels = ChannelManager::new(engine.clone(), &config.channels)?;
        let transfers = TransferEngine::new(engine, config.max_segment_len, config.max_descriptors);
        log::debug!(
            "{}{}: {} channels",
            config.chrdev_name,
            config.minor,
            channels.len()
        );
        Ok(DeviceContext {
            inner: Mutex::new(Inner {
                buffers: BufferRegistry::new(memory),
                channels,
                in_flight: Vec::new(),
            }),
            transfers,
            config,
            next_owner: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Opens a new session with its own buffer and transfer namespace.
    pub fn open(&self) -> Session<'_> {
        Session::new(self, self.new_owner())
    }

    /// Returns a fresh owner id for direct use of the device API.
    pub fn new_owner(&self) -> OwnerId {
        OwnerId(self.next_owner.fetch_add(1, Ordering::Relaxed))
    }

    pub fn channels(&self) -> Vec<ChannelInfo> {
        self.lock().channels.infos()
    }

    pub fn num_channels(&self) -> usize {
        self.lock().channels.len()
    }

    pub fn num_buffers(&self) -> usize {
        self.lock().buffers.len()
    }

    pub fn allocate(&self, len: usize, direction: Direction) -> Result<Arc<Buffer>, Error> {
        self.lock().buffers.allocate(len, direction)
    }

    pub fn register_user_buffer(&self, addr: usize, len: usize, direction: Direction) -> Result<Arc<Buffer>, Error> {
        self.lock().buffers.register_user_buffer(addr, len, direction)
    }

    pub fn release_buffer(&self, id: BufferId) -> Result<(), Error> {
        self.lock().buffers.release(id)
    }

    pub fn lookup_buffer(&self, id: BufferId) -> Result<Arc<Buffer>, Error> {
        self.lock().buffers.lookup(id)
    }

    pub fn lookup_mapping(&self, offset: u64) -> Result<Arc<Buffer>, Error> {
        self.lock().buffers.lookup_offset(offset)
    }

    pub fn acquire(&self, owner: OwnerId, direction: Direction, mode: Mode) -> Result<ChannelId, Error> {
        Ok(self.lock().channels.acquire(owner, direction, mode)?.id())
    }

    pub fn acquire_id(&self, owner: OwnerId, id: ChannelId, mode: Mode) -> Result<ChannelId, Error> {
        Ok(self.lock().channels.acquire_id(owner, id, mode)?.id())
    }

    pub fn release_channel(&self, owner: OwnerId, id: ChannelId) -> Result<(), Error> {
        self.lock().channels.release(owner, id)
    }

    pub(crate) fn force_release_channel(&self, owner: OwnerId, id: ChannelId) -> Result<(), Error> {
        self.lock().channels.force_release(owner, id)
    }

    pub(crate) fn forget_buffer(&self, id: BufferId) -> Result<(), Error> {
        self.lock().buffers.forget(id)
    }

    /// Submits `len` bytes at `offset` of `buffer` on a channel reserved by
    /// `owner`.
    pub fn submit(
        &self,
        owner: OwnerId,
        channel: ChannelId,
        buffer: BufferId,
        offset: usize,
        len: usize,
    ) -> Result<TransferHandle, Error> {
        let mut inner = self.lock();
        let channel = owned(&inner, owner, channel)?;
        let buffer = inner.buffers.lookup(buffer)?;
        let handle = self.transfers.submit(&channel, &buffer, offset, len)?;
        track(&mut inner, &handle);
        Ok(handle)
    }

    /// Submits a cyclic ring with one frame per `(buffer, offset, len)`.
    pub fn submit_frames(
        &self,
        owner: OwnerId,
        channel: ChannelId,
        frames: &[(BufferId, usize, usize)],
    ) -> Result<TransferHandle, Error> {
        let mut inner = self.lock();
        let channel = owned(&inner, owner, channel)?;
        let frames = frames
            .iter()
            .map(|&(id, offset, len)| Ok((inner.buffers.lookup(id)?, offset, len)))
            .collect::<Result<Vec<_>, Error>>()?;
        let handle = self.transfers.submit_frames(&channel, &frames)?;
        track(&mut inner, &handle);
        Ok(handle)
    }

    /// Requests `handle` to stop. Its final status arrives through `wait`.
    pub fn abort(&self, handle: &TransferHandle) {
        self.transfers.abort(handle);
    }

    /// Stops all transfers and releases every channel and buffer.
    ///
    /// Active transfers are aborted and waited for; channels are then freed
    /// in the engine, which joins its completion context. No completion
    /// callback runs after this returns.
    pub fn teardown(self) {
        let timeout = self.config.default_timeout;
        let DeviceContext {
            config,
            inner,
            transfers,
            ..
        } = self;
        let mut inner = inner.into_inner().unwrap_or_else(PoisonError::into_inner);

        let active = std::mem::take(&mut inner.in_flight);
        for h in active.iter().filter(|h| !h.status().is_terminal()) {
            transfers.abort(h);
        }
        for h in &active {
            match h.wait(timeout) {
                Ok(status) => log::debug!("transfer {} ended {:?}", h.id(), status),
                Err(Error::Timeout) => log::warn!("transfer {} did not stop within {:?}", h.id(), timeout),
                Err(e) => log::warn!("transfer {}: {}", h.id(), e),
            }
        }

        inner.channels.shutdown();
        let buffers = inner.buffers.drain();
        let busy = buffers.iter().filter(|b| b.is_busy()).count();
        if busy > 0 {
            log::warn!("{} buffers still pinned at teardown", busy);
        }
        drop(buffers);
        log::debug!("{}{}: torn down", config.chrdev_name, config.minor);
    }

    /// Live view of one channel, regardless of owner.
    pub fn channel(&self, id: ChannelId) -> Result<Arc<Channel>, Error> {
        self.lock().channels.get(id)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn owned(inner: &Inner, owner: OwnerId, id: ChannelId) -> Result<Arc<Channel>, Error> {
    let channel = inner.channels.get(id)?;
    if channel.owner() != Some(owner) {
        return Err(Error::NotFound(Resource::Channel(id)));
    }
    Ok(channel)
}

fn track(inner: &mut Inner, handle: &TransferHandle) {
    inner.in_flight.retain(|h| !h.status().is_terminal());
    inner.in_flight.push(handle.clone());
}

/// Waits up to `timeout` for each of `handles`, logging the ones that do
/// not finish.
pub(crate) fn drain_transfers(handles: &[TransferHandle], timeout: Duration) {
    for h in handles {
        if let Err(e) = h.wait(timeout) {
            log::warn!("transfer {} on channel {}: {}", h.id(), h.channel_id(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChannelConfig;
    use crate::HeapMemory;
    use crate::LoopbackEngine;
    use crate::TransferStatus;

    fn device() -> DeviceContext {
        let config = Config::default()
            .with_channel(ChannelConfig::axi_dma(0, Direction::ToDevice))
            .with_channel(ChannelConfig::axi_dma(1, Direction::FromDevice));
        DeviceContext::init(Arc::new(LoopbackEngine::new()), Arc::new(HeapMemory::new()), config).unwrap()
    }

    #[test]
    fn init_rejects_invalid_config() {
        let config = Config::default()
            .with_channel(ChannelConfig::axi_dma(0, Direction::ToDevice))
            .with_channel(ChannelConfig::axi_dma(0, Direction::FromDevice));
        let r = DeviceContext::init(Arc::new(LoopbackEngine::new()), Arc::new(HeapMemory::new()), config);
        assert!(matches!(r, Err(Error::InvalidParam(_))));
    }

    #[test]
    fn submit_requires_reservation() {
        let dev = device();
        let owner = dev.new_owner();
        let other = dev.new_owner();
        let b = dev.allocate(64, Direction::ToDevice).unwrap();
        let ch = dev.acquire(owner, Direction::ToDevice, Mode::OneShot).unwrap();
        assert!(matches!(
            dev.submit(other, ch, b.id(), 0, 64),
            Err(Error::NotFound(Resource::Channel(_)))
        ));
        assert!(matches!(
            dev.submit(owner, ch, BufferId(99), 0, 64),
            Err(Error::NotFound(Resource::Buffer(_)))
        ));
        assert_eq!(dev.channel(ch).unwrap().active_transfer(), None);
        dev.teardown();
    }

    #[test]
    fn teardown_aborts_stalled_receive() {
        let dev = device();
        let owner = dev.new_owner();
        let b = dev.allocate(256, Direction::FromDevice).unwrap();
        let rx = dev.acquire(owner, Direction::FromDevice, Mode::OneShot).unwrap();
        let h = dev.submit(owner, rx, b.id(), 0, 256).unwrap();
        dev.teardown();
        assert_eq!(h.status(), TransferStatus::Aborted);
        assert!(!b.is_busy());
    }
}
