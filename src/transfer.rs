use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::completion::on_complete;
use crate::Buffer;
use crate::ChainBuilder;
use crate::Channel;
use crate::ChannelId;
use crate::Completion;
use crate::Direction;
use crate::DmaEngine;
use crate::Error;
use crate::Mode;
use crate::TransferStatus;

/// Shared state of one submitted transfer.
///
/// Owned jointly by the [`TransferHandle`]s and the callback registered with
/// the engine.
pub(crate) struct Transfer {
    pub(crate) id: u64,
    pub(crate) channel: Arc<Channel>,
    /// Pinned until the transfer retires.
    pub(crate) buffers: Vec<Arc<Buffer>>,
    pub(crate) ranges: Vec<(usize, usize)>,
    pub(crate) cyclic: bool,
    pub(crate) completion: Completion,
    retired: AtomicBool,
    // A wait has returned the terminal status.
    collected: AtomicBool,
}

impl Transfer {
    /// Returns `true` for the one caller that gets to retire the transfer.
    pub(crate) fn retire(&self) -> bool {
        !self.retired.swap(true, Ordering::AcqRel)
    }
}

/// Handle to a submitted transfer.
#[derive(Clone)]
pub struct TransferHandle {
    inner: Arc<Transfer>,
}

impl fmt::Debug for TransferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferHandle")
            .field("id", &self.inner.id)
            .field("channel", &self.inner.channel.id())
            .field("cyclic", &self.inner.cyclic)
            .field("status", &self.status())
            .field("frames", &self.frames())
            .finish()
    }
}

impl TransferHandle {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn channel_id(&self) -> ChannelId {
        self.inner.channel.id()
    }

    pub fn is_cyclic(&self) -> bool {
        self.inner.cyclic
    }

    pub fn status(&self) -> TransferStatus {
        self.inner.completion.status()
    }

    pub fn frames(&self) -> u64 {
        self.inner.completion.frames()
    }

    /// Raw status register value for a transfer that ended in a hardware
    /// error.
    pub fn hw_status(&self) -> u32 {
        self.inner.completion.hw_status()
    }

    pub fn buffers(&self) -> impl Iterator<Item = &Arc<Buffer>> {
        self.inner.buffers.iter()
    }

    /// Blocks until the transfer is finished, then makes device writes
    /// visible to the CPU.
    pub fn wait(&self, timeout: Duration) -> Result<TransferStatus, Error> {
        let status = self.inner.completion.wait(timeout)?;
        self.finish_for_cpu(status)?;
        self.inner.collected.store(true, Ordering::Release);
        Ok(status)
    }

    /// Blocks until a frame beyond `seen` completed. Returns the frame count.
    pub fn wait_frame(&self, seen: u64, timeout: Duration) -> Result<u64, Error> {
        self.inner.completion.wait_frame(seen, timeout)
    }

    #[cfg(feature = "async")]
    pub async fn wait_async(&self, timeout: Duration) -> Result<TransferStatus, Error> {
        let status = self.inner.completion.wait_async(timeout).await?;
        self.finish_for_cpu(status)?;
        self.inner.collected.store(true, Ordering::Release);
        Ok(status)
    }

    fn finish_for_cpu(&self, status: TransferStatus) -> Result<(), Error> {
        if status == TransferStatus::CompletedOk && self.inner.channel.direction() == Direction::FromDevice {
            for (b, &(offset, len)) in self.inner.buffers.iter().zip(&self.inner.ranges) {
                b.sync_for_cpu(offset, len)?;
            }
        }
        Ok(())
    }

    /// Whether a wait already returned the terminal status.
    pub(crate) fn is_collected(&self) -> bool {
        self.inner.collected.load(Ordering::Acquire)
    }

    pub(crate) fn channel(&self) -> &Arc<Channel> {
        &self.inner.channel
    }
}

/// Builds descriptor chains and drives them through the engine.
pub struct TransferEngine {
    engine: Arc<dyn DmaEngine>,
    max_segment_len: usize,
    max_descriptors: usize,
    next_id: AtomicU64,
}

impl fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "TransferEngine")?;
        writeln!(f, "  max_segment_len: {:#x?}", &self.max_segment_len)?;
        write!(f, "  max_descriptors: {:?}", &self.max_descriptors)
    }
}

impl TransferEngine {
    pub fn new(engine: Arc<dyn DmaEngine>, max_segment_len: usize, max_descriptors: usize) -> TransferEngine {
        TransferEngine {
            engine,
            max_segment_len,
            max_descriptors,
            next_id: AtomicU64::new(1),
        }
    }

    /// Submits `len` bytes of `buffer` starting at `offset`. On a channel
    /// reserved for cyclic mode, the range is repeated as one frame per lap.
    pub fn submit(
        &self,
        channel: &Arc<Channel>,
        buffer: &Arc<Buffer>,
        offset: usize,
        len: usize,
    ) -> Result<TransferHandle, Error> {
        self.start(channel, &[(buffer.clone(), offset, len)], channel.mode() == Mode::Cyclic)
    }

    /// Submits a cyclic ring with one frame per entry, in order.
    pub fn submit_frames(
        &self,
        channel: &Arc<Channel>,
        frames: &[(Arc<Buffer>, usize, usize)],
    ) -> Result<TransferHandle, Error> {
        if channel.mode() != Mode::Cyclic {
            return Err(Error::UnsupportedMode);
        }
        self.start(channel, frames, true)
    }

    /// Requests the transfer to stop. The final status arrives through the
    /// completion path like any other.
    pub fn abort(&self, handle: &TransferHandle) {
        if handle.status().is_terminal() {
            return;
        }
        let channel = handle.channel();
        log::debug!("aborting transfer {} on channel {}", handle.id(), channel.id());
        self.engine.stop_channel(channel.hw(), handle.id());
    }

    fn start(
        &self,
        channel: &Arc<Channel>,
        frames: &[(Arc<Buffer>, usize, usize)],
        cyclic: bool,
    ) -> Result<TransferHandle, Error> {
        let mut builder = ChainBuilder::new(self.max_segment_len, self.max_descriptors);
        for (buffer, offset, len) in frames {
            if !buffer.direction().allows(channel.direction()) {
                return Err(Error::DirectionMismatch);
            }
            buffer.check_range(*offset, *len)?;
            builder = builder.frame(buffer.dma_addr() + *offset as u64, *len);
        }
        if channel.active_transfer().is_some() {
            return Err(Error::ChannelBusy(channel.id()));
        }
        let chain = builder.build(cyclic)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let transfer = Arc::new(Transfer {
            id,
            channel: channel.clone(),
            buffers: frames.iter().map(|f| f.0.clone()).collect(),
            ranges: frames.iter().map(|f| (f.1, f.2)).collect(),
            cyclic,
            completion: Completion::new(),
            retired: AtomicBool::new(false),
            collected: AtomicBool::new(false),
        });

        if !channel.try_activate(id) {
            return Err(Error::ChannelBusy(channel.id()));
        }
        for b in &transfer.buffers {
            b.pin();
        }

        let rollback = |transfer: &Transfer| {
            transfer.retire();
            for b in &transfer.buffers {
                b.unpin();
            }
            transfer.channel.deactivate(transfer.id);
        };

        if channel.direction() == Direction::ToDevice {
            for (b, &(offset, len)) in transfer.buffers.iter().zip(&transfer.ranges) {
                if let Err(e) = b.sync_for_device(offset, len) {
                    rollback(&transfer);
                    return Err(e);
                }
            }
        }

        let t = transfer.clone();
        let callback = Box::new(move |status| on_complete(&t, status));
        if let Err(e) = self.engine.submit(channel.hw(), id, &chain, callback) {
            rollback(&transfer);
            return Err(e);
        }
        transfer.completion.mark_in_flight();
        log::trace!(
            "transfer {} on channel {}: {} descriptors, {:#x} bytes{}",
            id,
            channel.id(),
            chain.len(),
            chain.total_len(),
            if cyclic { ", cyclic" } else { "" }
        );

        Ok(TransferHandle { inner: transfer })
    }
}
