use crate::error::{Result, UsbError};

use super::{StreamInfo, TransferContext};

/// Verdict of [`StreamCallbacks::before_complete`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompleteResult {
    /// Hand the transfer to the caller (reads) or retire it (writes).
    Valid,
    /// Drop the result. Read contexts are resubmitted at once, write contexts go back to the front
    /// of the submission queue.
    Invalid,
}

/// Hooks into a stream's transfer lifecycle.
///
/// Everything except `started` and `stopped` runs on the stream worker while it holds the stream
/// lock, so implementations must not call back into the stream and must not block for long.
/// `started` and `stopped` run on the thread calling [`PipeStream::start`](super::PipeStream::start)
/// and [`PipeStream::stop`](super::PipeStream::stop), once per context.
pub trait StreamCallbacks: Send + Sync {
    /// Called right before a context is dispatched. May adjust the context's transfer length; an
    /// error skips the dispatch and is reported through [`StreamCallbacks::error`].
    fn submit(&self, _info: &StreamInfo, _context: &mut TransferContext) -> Result<()> {
        Ok(())
    }

    /// Called when a transfer fails. Returning true marks the error handled so no blocked reader
    /// or writer sees it.
    fn error(&self, _info: &StreamInfo, _context: &mut TransferContext, _error: &UsbError) -> bool {
        false
    }

    /// Called as soon as the device hands a context back. `error` may be rewritten or cleared.
    fn before_complete(
        &self,
        _info: &StreamInfo,
        _context: &mut TransferContext,
        _error: &mut Option<UsbError>,
    ) -> CompleteResult {
        CompleteResult::Valid
    }

    /// Called once a read enters the complete queue, or once a write finished successfully.
    fn complete(&self, _info: &StreamInfo, _context: &mut TransferContext) {}

    /// An error fails [`PipeStream::start`](super::PipeStream::start).
    fn started(&self, _info: &StreamInfo, _context: &mut TransferContext) -> Result<()> {
        Ok(())
    }

    fn stopped(&self, _info: &StreamInfo, _context: &mut TransferContext) {}
}

/// The callback set of a stream that was created without one.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCallbacks;

impl StreamCallbacks for NoCallbacks {}
