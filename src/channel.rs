use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::Resource;
use crate::ChannelConfig;
use crate::ChannelKind;
use crate::Direction;
use crate::DmaEngine;
use crate::Error;
use crate::HwChannel;
use crate::Mode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies who reserved a channel, one per open session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Reserved,
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub direction: Direction,
    pub kind: ChannelKind,
    pub cyclic: bool,
    pub state: ChannelState,
}

const NO_OWNER: u64 = 0;
const NO_TRANSFER: u64 = 0;

/// One hardware DMA channel.
///
/// `owner` and `mode` change only under the device lock. `active` holds the
/// id of the transfer in flight and is the one field the completion path
/// writes, always with compare-exchange.
pub struct Channel {
    id: ChannelId,
    config: ChannelConfig,
    hw: HwChannel,
    owner: AtomicU64,
    mode: AtomicU8,
    active: AtomicU64,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Channel ({})", &self.id)?;
        writeln!(f, "  direction: {:?}", &self.config.direction)?;
        writeln!(f, "  kind: {:?}", &self.config.kind)?;
        writeln!(f, "  hw: {:?}", &self.hw)?;
        write!(f, "  state: {:?}", self.state())
    }
}

impl Channel {
    fn new(config: ChannelConfig, hw: HwChannel) -> Channel {
        Channel {
            id: ChannelId(config.id),
            config,
            hw,
            owner: AtomicU64::new(NO_OWNER),
            mode: AtomicU8::new(0),
            active: AtomicU64::new(NO_TRANSFER),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.config.direction
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn hw(&self) -> HwChannel {
        self.hw
    }

    pub fn state(&self) -> ChannelState {
        if self.active.load(Ordering::Acquire) != NO_TRANSFER {
            ChannelState::Active
        } else if self.owner.load(Ordering::Acquire) != NO_OWNER {
            ChannelState::Reserved
        } else {
            ChannelState::Idle
        }
    }

    /// Mode the channel was reserved for.
    pub fn mode(&self) -> Mode {
        match self.mode.load(Ordering::Acquire) {
            1 => Mode::Cyclic,
            _ => Mode::OneShot,
        }
    }

    pub fn owner(&self) -> Option<OwnerId> {
        match self.owner.load(Ordering::Acquire) {
            NO_OWNER => None,
            o => Some(OwnerId(o)),
        }
    }

    /// Transfer currently in flight on the channel.
    pub fn active_transfer(&self) -> Option<u64> {
        match self.active.load(Ordering::Acquire) {
            NO_TRANSFER => None,
            t => Some(t),
        }
    }

    pub fn info(&self) -> ChannelInfo {
        ChannelInfo {
            id: self.id,
            direction: self.config.direction,
            kind: self.config.kind,
            cyclic: self.config.cyclic,
            state: self.state(),
        }
    }

    /// Claims the channel for `transfer`. Fails if another transfer holds it.
    pub(crate) fn try_activate(&self, transfer: u64) -> bool {
        debug_assert_ne!(transfer, NO_TRANSFER);
        self.active
            .compare_exchange(NO_TRANSFER, transfer, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Frees the channel if `transfer` still holds it.
    pub(crate) fn deactivate(&self, transfer: u64) -> bool {
        self.active
            .compare_exchange(transfer, NO_TRANSFER, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn reserve(&self, owner: OwnerId, mode: Mode) {
        let mode = match mode {
            Mode::OneShot => 0,
            Mode::Cyclic => 1,
        };
        self.mode.store(mode, Ordering::Release);
        self.owner.store(owner.0, Ordering::Release);
    }

    fn unreserve(&self) {
        self.owner.store(NO_OWNER, Ordering::Release);
        self.mode.store(0, Ordering::Release);
    }
}

/// Owns the channels of one device.
///
/// Reservation changes go through `&mut self`; the owning
/// [`DeviceContext`](crate::DeviceContext) serializes them.
pub struct ChannelManager {
    engine: Arc<dyn DmaEngine>,
    channels: Vec<Arc<Channel>>,
}

impl fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.channels.iter().map(|c| c.info()))
            .finish()
    }
}

impl ChannelManager {
    pub fn new(engine: Arc<dyn DmaEngine>, configs: &[ChannelConfig]) -> Result<ChannelManager, Error> {
        let mut channels = Vec::with_capacity(configs.len());
        for config in configs {
            match engine.allocate_channel(config) {
                Ok(hw) => {
                    log::debug!("channel {} ({:?} {:?}) -> {:?}", config.id, config.kind, config.direction, hw);
                    channels.push(Arc::new(Channel::new(config.clone(), hw)));
                }
                Err(e) => {
                    for c in &channels {
                        engine.free_channel(c.hw);
                    }
                    return Err(e);
                }
            }
        }
        Ok(ChannelManager { engine, channels })
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn infos(&self) -> Vec<ChannelInfo> {
        self.channels.iter().map(|c| c.info()).collect()
    }

    pub fn get(&self, id: ChannelId) -> Result<Arc<Channel>, Error> {
        self.channels
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or(Error::NotFound(Resource::Channel(id)))
    }

    /// Reserves an idle channel moving data in `direction` that supports
    /// `mode`.
    pub fn acquire(&mut self, owner: OwnerId, direction: Direction, mode: Mode) -> Result<Arc<Channel>, Error> {
        let mut candidates = self
            .channels
            .iter()
            .filter(|c| c.direction() == direction)
            .peekable();
        if candidates.peek().is_none() {
            return Err(Error::NoChannelAvailable);
        }
        let mut capable = candidates.filter(|c| c.config.supports(mode)).peekable();
        if capable.peek().is_none() {
            return Err(Error::UnsupportedMode);
        }
        let channel = capable
            .find(|c| c.state() == ChannelState::Idle)
            .cloned()
            .ok_or(Error::NoChannelAvailable)?;
        channel.reserve(owner, mode);
        log::debug!("channel {} reserved ({:?}) by {:?}", channel.id, mode, owner);
        Ok(channel)
    }

    /// Reserves a specific channel.
    pub fn acquire_id(&mut self, owner: OwnerId, id: ChannelId, mode: Mode) -> Result<Arc<Channel>, Error> {
        let channel = self.get(id)?;
        if !channel.config.supports(mode) {
            return Err(Error::UnsupportedMode);
        }
        if channel.state() != ChannelState::Idle {
            return Err(Error::ChannelBusy(id));
        }
        channel.reserve(owner, mode);
        log::debug!("channel {} reserved ({:?}) by {:?}", id, mode, owner);
        Ok(channel)
    }

    /// Returns a reserved channel to idle. Fails while a transfer is in
    /// flight.
    pub fn release(&mut self, owner: OwnerId, id: ChannelId) -> Result<(), Error> {
        let channel = self.get(id)?;
        if channel.owner() != Some(owner) {
            return Err(Error::NotFound(Resource::Channel(id)));
        }
        if channel.active_transfer().is_some() {
            return Err(Error::ChannelBusy(id));
        }
        channel.unreserve();
        log::debug!("channel {} released", id);
        Ok(())
    }

    /// Drops `owner`'s reservation even with a transfer in flight, which is
    /// stopped. The channel stays active until that transfer retires.
    pub(crate) fn force_release(&mut self, owner: OwnerId, id: ChannelId) -> Result<(), Error> {
        let channel = self.get(id)?;
        if channel.owner() != Some(owner) {
            return Err(Error::NotFound(Resource::Channel(id)));
        }
        if let Some(t) = channel.active_transfer() {
            log::warn!("channel {} released with transfer {} in flight", id, t);
            self.engine.stop_channel(channel.hw, t);
        }
        channel.unreserve();
        Ok(())
    }

    /// Stops every channel and frees them in the engine. After this returns,
    /// no completion callback runs anymore.
    pub(crate) fn shutdown(&mut self) {
        for c in &self.channels {
            if let Some(t) = c.active_transfer() {
                log::warn!("forcing channel {} quiet with transfer {} in flight", c.id, t);
                self.engine.stop_channel(c.hw, t);
            }
        }
        for c in self.channels.drain(..) {
            self.engine.free_channel(c.hw);
            c.unreserve();
        }
    }
}
