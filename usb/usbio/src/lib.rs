//! Asynchronous pipe I/O for an opened USB device.
//!
//! The crate is built from three pieces that share one completion primitive:
//!
//! * [`OvlPool`] hands out reusable asynchronous operations ([`OvlHandle`]) for a device and waits
//!   on them, optionally cancelling or releasing them afterwards.
//! * [`PipeStream`] keeps a bulk or interrupt pipe busy with a fixed set of transfer contexts
//!   driven by a worker thread, and exposes plain blocking `read`/`write`.
//! * [`IsochTransfer`] manages the packet descriptors and frame schedule of isochronous transfers
//!   that are started and waited on through the pool.
//!
//! The device itself is reached through the [`PipeDevice`] trait. [`LoopbackDevice`] is a software
//! implementation for tests and tooling.

pub mod device;
pub mod error;
pub mod event;
pub mod isoch;
pub mod loopback;
pub mod ovl;
pub mod stream;
pub mod timeout;
pub mod usb;

pub use device::{PipeDevice, Rejected, Transfer, TransferKind, TransferOutcome};
pub use error::{ConfigError, DeviceError, ErrorKind, Result, UsbError};
pub use event::{Completer, EventFuture, EventHandle, OperationId};
pub use isoch::{
    calc_packet_information, FrameNumber, IsochPacket, IsochPacketInformation, IsochTransfer,
};
pub use loopback::LoopbackDevice;
pub use ovl::{OvlHandle, OvlPool, PoolConfig, WaitFlags};
pub use stream::{
    CompleteResult, ContextState, NoCallbacks, PipeStream, StreamCallbacks, StreamConfig,
    StreamFlags, StreamInfo, StreamStats, TransferContext,
};
pub use usb::{DeviceSpeed, EndpointDescriptor, EndpointTy, PipeId, PipeInfo};
