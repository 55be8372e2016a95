//! Bridges engine callbacks to waiting callers.
//!
//! Callbacks run on backend threads (the equivalent of interrupt context):
//! they only do atomic updates and wake waiters. The mutex in [`Completion`]
//! exists solely to close the window between a waiter checking the status
//! and going to sleep, and is never held across anything that blocks.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

use crate::transfer::Transfer;
use crate::DmaStatus;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Created, not yet accepted by the engine.
    Pending,
    InFlight,
    CompletedOk,
    /// The engine reported a hardware error.
    CompletedError,
    Aborted,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::CompletedOk | TransferStatus::CompletedError | TransferStatus::Aborted
        )
    }

    /// Turns a terminal status into a `Result`, surfacing hardware errors.
    pub fn into_result(self) -> Result<(), Error> {
        match self {
            TransferStatus::CompletedOk => Ok(()),
            TransferStatus::CompletedError => Err(Error::HardwareError("transfer failed".into())),
            s => Err(Error::HardwareError(format!("transfer not completed: {:?}", s))),
        }
    }

    pub(crate) fn as_raw(self) -> u8 {
        match self {
            TransferStatus::Pending => 0,
            TransferStatus::InFlight => 1,
            TransferStatus::CompletedOk => 2,
            TransferStatus::CompletedError => 3,
            TransferStatus::Aborted => 4,
        }
    }

    pub(crate) fn from_raw(raw: u8) -> TransferStatus {
        match raw {
            0 => TransferStatus::Pending,
            1 => TransferStatus::InFlight,
            2 => TransferStatus::CompletedOk,
            3 => TransferStatus::CompletedError,
            _ => TransferStatus::Aborted,
        }
    }
}

/// Status cell plus wait primitive of one transfer.
#[derive(Debug)]
pub struct Completion {
    status: AtomicU8,
    frames: AtomicU64,
    hw_status: AtomicU32,
    lock: Mutex<()>,
    cond: Condvar,
    #[cfg(feature = "async")]
    waker: Mutex<Option<std::task::Waker>>,
}

impl Default for Completion {
    fn default() -> Completion {
        Completion::new()
    }
}

impl Completion {
    pub fn new() -> Completion {
        Completion {
            status: AtomicU8::new(TransferStatus::Pending.as_raw()),
            frames: AtomicU64::new(0),
            hw_status: AtomicU32::new(0),
            lock: Mutex::new(()),
            cond: Condvar::new(),
            #[cfg(feature = "async")]
            waker: Mutex::new(None),
        }
    }

    pub fn status(&self) -> TransferStatus {
        TransferStatus::from_raw(self.status.load(Ordering::Acquire))
    }

    /// Frames completed so far (cyclic transfers).
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    /// Raw hardware status of a failed transfer, `0` otherwise.
    pub fn hw_status(&self) -> u32 {
        self.hw_status.load(Ordering::Acquire)
    }

    pub(crate) fn mark_in_flight(&self) {
        // Loses against a callback that already finished the transfer.
        let _ = self.status.compare_exchange(
            TransferStatus::Pending.as_raw(),
            TransferStatus::InFlight.as_raw(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Sets the terminal status. Only the first call has an effect.
    pub(crate) fn finish(&self, status: TransferStatus, hw_status: u32) -> bool {
        debug_assert!(status.is_terminal());
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            if TransferStatus::from_raw(current).is_terminal() {
                return false;
            }
            if status == TransferStatus::CompletedError {
                self.hw_status.store(hw_status, Ordering::Release);
            }
            match self.status.compare_exchange_weak(
                current,
                status.as_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.notify();
        true
    }

    pub(crate) fn frame(&self) -> u64 {
        let n = self.frames.fetch_add(1, Ordering::AcqRel) + 1;
        self.notify();
        n
    }

    fn notify(&self) {
        {
            let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.cond.notify_all();
        }
        #[cfg(feature = "async")]
        {
            let waker = self
                .waker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(w) = waker {
                w.wake();
            }
        }
    }

    /// Blocks until the transfer reaches a terminal status.
    pub fn wait(&self, timeout: Duration) -> Result<TransferStatus, Error> {
        self.wait_until(timeout, |c| {
            let s = c.status();
            s.is_terminal().then_some(s)
        })
    }

    /// Blocks until more than `seen` frames completed or the transfer ended.
    /// Returns the frame count.
    pub fn wait_frame(&self, seen: u64, timeout: Duration) -> Result<u64, Error> {
        self.wait_until(timeout, |c| {
            let n = c.frames();
            (n > seen || c.status().is_terminal()).then_some(n)
        })
    }

    fn wait_until<T>(&self, timeout: Duration, check: impl Fn(&Completion) -> Option<T>) -> Result<T, Error> {
        // No deadline when `timeout` runs past what `Instant` can hold.
        let deadline = Instant::now().checked_add(timeout);
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            // Checked under the lock: a notify cannot slip in between the
            // check and the wait.
            if let Some(v) = check(self) {
                return Ok(v);
            }
            guard = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    self.cond
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    #[cfg(feature = "async")]
    pub fn wait_async(&self, timeout: Duration) -> WaitFuture<'_> {
        WaitFuture {
            completion: self,
            timer: async_io::Timer::after(timeout),
        }
    }
}

#[cfg(feature = "async")]
pub struct WaitFuture<'a> {
    completion: &'a Completion,
    timer: async_io::Timer,
}

#[cfg(feature = "async")]
impl std::future::Future for WaitFuture<'_> {
    type Output = Result<TransferStatus, Error>;

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        use std::future::Future;
        use std::task::Poll;

        let status = self.completion.status();
        if status.is_terminal() {
            return Poll::Ready(Ok(status));
        }
        *self
            .completion
            .waker
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(cx.waker().clone());
        // Re-check after publishing the waker.
        let status = self.completion.status();
        if status.is_terminal() {
            return Poll::Ready(Ok(status));
        }
        match std::pin::Pin::new(&mut self.timer).poll(cx) {
            Poll::Ready(_) => Poll::Ready(Err(Error::Timeout)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Completion callback body for `transfer`, run on the engine's thread.
///
/// For one-shot chains the channel slot is freed and the buffers unpinned
/// before the status is published, so a waiter that sees the terminal status
/// can immediately release the buffer or submit again.
pub(crate) fn on_complete(transfer: &Transfer, status: DmaStatus) {
    let terminal = match status {
        DmaStatus::Frame => {
            let n = transfer.completion.frame();
            log::trace!("transfer {} frame {}", transfer.id, n);
            return;
        }
        DmaStatus::Complete => (TransferStatus::CompletedOk, 0),
        DmaStatus::Error(hw) => {
            log::warn!(
                "transfer {} on channel {} failed: status {:#010x}",
                transfer.id,
                transfer.channel.id(),
                hw
            );
            (TransferStatus::CompletedError, hw)
        }
        DmaStatus::Aborted => (TransferStatus::Aborted, 0),
    };

    if transfer.retire() {
        transfer.channel.deactivate(transfer.id);
        for b in &transfer.buffers {
            b.unpin();
        }
        transfer.completion.finish(terminal.0, terminal.1);
        log::trace!("transfer {} -> {:?}", transfer.id, terminal.0);
    }
}
