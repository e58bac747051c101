//! The device-handle collaborator the core drives.
//!
//! Enumeration, interface claiming and descriptor retrieval belong to whoever implements
//! [`PipeDevice`]; the core only needs pipe metadata, a way to start a transfer, and a way to
//! cancel it.

use std::fmt;

use crate::error::{Result, UsbError};
use crate::event::{Completer, OperationId};
use crate::isoch::IsochPacket;
use crate::usb::{DeviceSpeed, PipeId, PipeInfo};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransferKind {
    /// Bulk or interrupt transfer.
    Bulk,
    Isoch {
        /// `None` lets the host controller schedule the transfer as soon as possible.
        start_frame: Option<u32>,
        packets: Vec<IsochPacket>,
    },
}

/// One request handed to the device. The buffer travels with the request and comes back in the
/// [`TransferOutcome`], so nothing else can touch it while the device owns it.
pub struct Transfer {
    pub pipe_id: PipeId,
    pub buffer: Vec<u8>,
    /// Bytes to send, or the maximum number of bytes to receive. Never exceeds `buffer.len()`.
    pub length: usize,
    pub kind: TransferKind,
}

impl Transfer {
    pub fn bulk(pipe_id: PipeId, buffer: Vec<u8>, length: usize) -> Self {
        Self {
            pipe_id,
            buffer,
            length,
            kind: TransferKind::Bulk,
        }
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("pipe_id", &self.pipe_id)
            .field("buffer_len", &self.buffer.len())
            .field("length", &self.length)
            .field("kind", &self.kind)
            .finish()
    }
}

/// What the device reports back through a [`Completer`].
#[derive(Debug)]
pub struct TransferOutcome {
    /// Bytes actually transferred, or why the transfer failed. A short read is a success.
    pub result: Result<usize>,
    pub buffer: Vec<u8>,
    /// Per-packet results of an isochronous transfer, empty otherwise.
    pub packets: Vec<IsochPacket>,
}

impl TransferOutcome {
    pub fn new(result: Result<usize>, buffer: Vec<u8>) -> Self {
        Self {
            result,
            buffer,
            packets: Vec::new(),
        }
    }
    pub fn with_packets(result: Result<usize>, buffer: Vec<u8>, packets: Vec<IsochPacket>) -> Self {
        Self {
            result,
            buffer,
            packets,
        }
    }
}

/// A submission the device refused to start. The transfer, and with it the buffer, is handed
/// back untouched.
#[derive(Debug)]
pub struct Rejected {
    pub error: UsbError,
    pub transfer: Transfer,
}

impl Rejected {
    pub fn new(error: UsbError, transfer: Transfer) -> Self {
        Self { error, transfer }
    }
}

/// An opened device with a claimed interface.
///
/// Implementations must be usable from several threads at once: streams submit from their worker
/// while callers wait and cancel from their own threads. Completions may be delivered from any
/// thread, including from inside `submit` itself.
pub trait PipeDevice: Send + Sync {
    fn query_pipe(&self, pipe_id: PipeId) -> Result<PipeInfo>;

    fn speed(&self) -> DeviceSpeed;

    fn current_frame_number(&self) -> Result<u32>;

    /// Starts a transfer. On success the device owns `completer` and must complete it exactly
    /// once, with `UsbError::Cancelled` if the transfer is cancelled or aborted.
    fn submit(&self, transfer: Transfer, completer: Completer) -> Result<(), Rejected>;

    /// Requests cancellation of a pending operation. Returns false if the device no longer knows
    /// `op`, typically because it already completed.
    fn cancel(&self, op: OperationId) -> bool;

    /// Cancels every pending operation on a pipe.
    fn abort_pipe(&self, pipe_id: PipeId) -> Result<()>;
}
