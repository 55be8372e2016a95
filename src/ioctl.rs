//! ioctl command set of the bridge.
//!
//! Every command takes an [`XdmaArgs`] in and out and returns `0` or a
//! negative errno.

use std::mem;
use std::time::Duration;

use crate::BufferId;
use crate::ChannelId;
use crate::ChannelState;
use crate::Direction;
use crate::Error;
use crate::Mode;
use crate::Session;
use crate::StatusCode;

pub const XDMA_IOC_MAGIC: u8 = b'X';
pub const MAX_FRAMES: usize = 4;

/// Argument block shared by all commands.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct XdmaArgs {
    pub channel: u32,
    pub direction: u32,
    pub mode: u32,
    pub kind: u32,
    pub buffer: u32,
    pub nframes: u32,
    pub offset: u64,
    pub len: u64,
    /// User address on REGISTER_BUFFER, mmap offset out of the buffer calls.
    pub addr: u64,
    pub transfer: u64,
    pub frames: u64,
    /// 0 selects the device default.
    pub timeout_ms: u32,
    pub status: u32,
    pub hw_status: u32,
    pub frame_buffers: [u32; MAX_FRAMES],
}

const IOC_NRBITS: u32 = 8;
const IOC_TYPEBITS: u32 = 8;
const IOC_SIZEBITS: u32 = 14;
const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;
const IOC_READ_WRITE: u32 = 3;

const fn iowr(nr: u32) -> u32 {
    (IOC_READ_WRITE << IOC_DIRSHIFT)
        | ((mem::size_of::<XdmaArgs>() as u32) << IOC_SIZESHIFT)
        | ((XDMA_IOC_MAGIC as u32) << IOC_TYPESHIFT)
        | (nr << IOC_NRSHIFT)
}

pub const XDMA_GET_NUM_CHANNELS: u32 = iowr(0);
pub const XDMA_GET_CHANNEL_INFO: u32 = iowr(1);
pub const XDMA_ACQUIRE_CHANNEL: u32 = iowr(2);
pub const XDMA_RELEASE_CHANNEL: u32 = iowr(3);
pub const XDMA_ALLOC_BUFFER: u32 = iowr(4);
pub const XDMA_REGISTER_BUFFER: u32 = iowr(5);
pub const XDMA_RELEASE_BUFFER: u32 = iowr(6);
pub const XDMA_SUBMIT: u32 = iowr(7);
pub const XDMA_SUBMIT_CYCLIC_FRAMES: u32 = iowr(8);
pub const XDMA_WAIT: u32 = iowr(9);
pub const XDMA_WAIT_FRAME: u32 = iowr(10);
pub const XDMA_ABORT: u32 = iowr(11);

/// `channel` value of ACQUIRE_CHANNEL that picks any matching channel.
pub const ANY_CHANNEL: u32 = u32::MAX;

fn direction(raw: u32) -> Result<Direction, Error> {
    Direction::from_raw(raw).ok_or_else(|| Error::InvalidParam(format!("direction {}", raw)))
}

fn mode(raw: u32) -> Result<Mode, Error> {
    Mode::from_raw(raw).ok_or_else(|| Error::InvalidParam(format!("mode {}", raw)))
}

fn size(raw: u64) -> Result<usize, Error> {
    usize::try_from(raw).map_err(|_| Error::InvalidParam(format!("{:#x} does not fit", raw)))
}

fn timeout(args: &XdmaArgs) -> Option<Duration> {
    match args.timeout_ms {
        0 => None,
        ms => Some(Duration::from_millis(ms as u64)),
    }
}

impl Session<'_> {
    /// Runs one ioctl command. Returns `0` or a negative errno.
    pub fn ioctl(&self, cmd: u32, args: &mut XdmaArgs) -> i32 {
        match self.dispatch(cmd, args) {
            Ok(()) => StatusCode::OK.0,
            Err(e) => {
                log::debug!("ioctl {:#010x}: {}", cmd, e);
                StatusCode::from(&e).0
            }
        }
    }

    fn dispatch(&self, cmd: u32, args: &mut XdmaArgs) -> Result<(), Error> {
        match cmd {
            XDMA_GET_NUM_CHANNELS => {
                args.channel = self.channels().len() as u32;
            }
            XDMA_GET_CHANNEL_INFO => {
                let info = self
                    .channels()
                    .into_iter()
                    .find(|c| c.id == ChannelId(args.channel))
                    .ok_or(Error::NotFound(crate::error::Resource::Channel(ChannelId(args.channel))))?;
                args.direction = info.direction.as_raw();
                args.kind = info.kind.as_raw();
                args.mode = u32::from(info.cyclic);
                args.status = match info.state {
                    ChannelState::Idle => 0,
                    ChannelState::Reserved => 1,
                    ChannelState::Active => 2,
                };
            }
            XDMA_ACQUIRE_CHANNEL => {
                let mode = mode(args.mode)?;
                let id = if args.channel == ANY_CHANNEL {
                    self.acquire(direction(args.direction)?, mode)?
                } else {
                    self.acquire_id(ChannelId(args.channel), mode)?
                };
                args.channel = id.0;
            }
            XDMA_RELEASE_CHANNEL => self.release_channel(ChannelId(args.channel))?,
            XDMA_ALLOC_BUFFER => {
                let b = self.allocate(size(args.len)?, direction(args.direction)?)?;
                args.buffer = b.id().0;
                args.addr = b.map_offset();
            }
            XDMA_REGISTER_BUFFER => {
                let b = self.register_user_buffer(size(args.addr)?, size(args.len)?, direction(args.direction)?)?;
                args.buffer = b.id().0;
                args.addr = b.map_offset();
            }
            XDMA_RELEASE_BUFFER => self.release_buffer(BufferId(args.buffer))?,
            XDMA_SUBMIT => {
                let h = self.submit(
                    ChannelId(args.channel),
                    BufferId(args.buffer),
                    size(args.offset)?,
                    size(args.len)?,
                )?;
                args.transfer = h.id();
            }
            XDMA_SUBMIT_CYCLIC_FRAMES => {
                let n = args.nframes as usize;
                if n == 0 || n > MAX_FRAMES {
                    return Err(Error::InvalidParam(format!("{} frames", n)));
                }
                let offset = size(args.offset)?;
                let mut frames = Vec::with_capacity(n);
                for &id in &args.frame_buffers[..n] {
                    let id = BufferId(id);
                    let len = match args.len {
                        0 => {
                            let size = self.buffer(id)?.size();
                            if offset >= size {
                                return Err(Error::OutOfRange { offset, len: 0, size });
                            }
                            size - offset
                        }
                        len => size(len)?,
                    };
                    frames.push((id, offset, len));
                }
                let h = self.submit_frames(ChannelId(args.channel), &frames)?;
                args.transfer = h.id();
            }
            XDMA_WAIT => {
                let h = self.transfer(args.transfer)?;
                let status = self.wait(args.transfer, timeout(args))?;
                args.status = status.as_raw() as u32;
                args.hw_status = h.hw_status();
                args.frames = h.frames();
            }
            XDMA_WAIT_FRAME => {
                let h = self.transfer(args.transfer)?;
                args.frames = self.wait_frame(args.transfer, args.frames, timeout(args))?;
                args.status = h.status().as_raw() as u32;
            }
            XDMA_ABORT => self.abort(args.transfer)?,
            _ => return Err(Error::InvalidParam(format!("unknown ioctl {:#010x}", cmd))),
        }
        Ok(())
    }
}
