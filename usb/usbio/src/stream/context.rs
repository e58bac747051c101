use std::any::Any;
use std::fmt;

use serde::Serialize;

use crate::error::{Result, UsbError};
use crate::ovl::OvlHandle;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
pub enum ContextState {
    /// Owned by the caller side, waiting to be filled (writes) or dispatched (reads).
    Idle,
    /// Waiting for dispatch or in flight on the device.
    Queued,
    /// A finished read waiting to be consumed.
    Complete,
}

/// One of the fixed set of transfers a stream cycles through.
pub struct TransferContext {
    index: usize,
    pub(super) buffer: Vec<u8>,
    pub(super) transfer_length: usize,
    /// Bytes of a completed read already handed to a reader.
    pub(super) consumed: usize,
    pub(super) state: ContextState,
    pub(super) ovl: OvlHandle,
    user_state: Option<Box<dyn Any + Send>>,
}

impl TransferContext {
    pub(super) fn new(index: usize, max_transfer_size: usize, ovl: OvlHandle) -> Self {
        Self {
            index,
            buffer: vec![0; max_transfer_size],
            transfer_length: 0,
            consumed: 0,
            state: ContextState::Idle,
            ovl,
            user_state: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }
    pub fn state(&self) -> ContextState {
        self.state
    }

    /// The transfer buffer. Empty while the device owns it.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Bytes to write, bytes requested by a pending read, or bytes a finished read delivered.
    pub fn transfer_length(&self) -> usize {
        self.transfer_length
    }
    pub fn set_transfer_length(&mut self, length: usize) -> Result<()> {
        if length > self.buffer.len() {
            return Err(UsbError::InvalidArgument("transfer length exceeds the buffer"));
        }
        self.transfer_length = length;
        Ok(())
    }

    /// The bytes a finished read delivered, or the bytes queued for a write.
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.transfer_length.min(self.buffer.len())]
    }

    pub fn user_state(&self) -> Option<&(dyn Any + Send)> {
        self.user_state.as_deref()
    }
    pub fn user_state_mut(&mut self) -> Option<&mut (dyn Any + Send)> {
        self.user_state.as_deref_mut()
    }
    pub fn set_user_state(&mut self, state: Option<Box<dyn Any + Send>>) {
        self.user_state = state;
    }

    pub(super) fn reset(&mut self) {
        self.state = ContextState::Idle;
        self.transfer_length = 0;
        self.consumed = 0;
    }
}

impl fmt::Debug for TransferContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferContext")
            .field("index", &self.index)
            .field("state", &self.state)
            .field("transfer_length", &self.transfer_length)
            .field("consumed", &self.consumed)
            .field("ovl", &self.ovl)
            .finish()
    }
}
