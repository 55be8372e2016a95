//! Userspace bridge to Xilinx AXI DMA engines.
//!
//! A [`DeviceContext`] owns the channels and DMA buffers of one bridge
//! instance. Processes talk to it through [`Session`]s, either with the
//! typed API or the [`ioctl`] command set, and map buffers with
//! [`Session::mmap`].
//!
//! Two backends are provided: [`AxiDmaEngine`] with [`UdmaBuf`] memory for
//! real hardware, and [`LoopbackEngine`] with [`HeapMemory`], which wires
//! to-device channels to from-device channels in software.

mod axi_dma;
mod buffer;
mod channel;
mod chrdev;
mod completion;
mod config;
mod descriptor;
mod device;
mod dmb;
mod engine;
mod error;
pub mod ioctl;
mod loopback;
mod scatter_gather;
mod transfer;
mod udmabuf;

pub use axi_dma::AxiDmaEngine;
pub use axi_dma::DmaStatusRegister;
pub use buffer::Buffer;
pub use buffer::BufferId;
pub use buffer::BufferKind;
pub use buffer::BufferRegistry;
pub use channel::Channel;
pub use channel::ChannelId;
pub use channel::ChannelInfo;
pub use channel::ChannelManager;
pub use channel::ChannelState;
pub use channel::OwnerId;
pub use chrdev::BufferMapping;
pub use chrdev::Session;
pub use completion::Completion;
pub use completion::TransferStatus;
#[cfg(feature = "async")]
pub use completion::WaitFuture;
pub use config::ChannelConfig;
pub use config::ChannelKind;
pub use config::Config;
pub use config::Direction;
pub use config::Mode;
pub use config::DEFAULT_CHRDEV_NAME;
pub use config::DEFAULT_MAX_DESCRIPTORS;
pub use config::DEFAULT_MAX_SEGMENT_LEN;
pub use config::DEFAULT_TIMEOUT;
pub use descriptor::ChainBuilder;
pub use descriptor::DescriptorChain;
pub use descriptor::Segment;
pub use device::DeviceContext;
pub use dmb::dmb;
pub use engine::page_size;
pub use engine::CompletionCallback;
pub use engine::DmaEngine;
pub use engine::DmaMemory;
pub use engine::DmaRegion;
pub use engine::DmaStatus;
pub use engine::HwChannel;
pub use error::Error;
pub use error::Resource;
pub use error::Result;
pub use error::StatusCode;
pub use loopback::HeapMemory;
pub use loopback::LoopbackEngine;
pub use loopback::DEFAULT_FIFO_DEPTH;
pub use scatter_gather::SgDescriptor;
pub use scatter_gather::SG_DESCRIPTOR_LEN;
pub use scatter_gather::SG_MAX_LENGTH;
pub use transfer::TransferEngine;
pub use transfer::TransferHandle;
pub use udmabuf::UdmaBuf;
