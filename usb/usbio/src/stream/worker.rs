use std::mem;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use log::{debug, error, trace, warn};

use crate::device::Transfer;
use crate::error::{DeviceError, UsbError};

use super::{CompleteResult, ContextState, Shared, StreamState};

/// Upper bound on how long the worker sleeps without a wakeup.
const IDLE_TICK: Duration = Duration::from_millis(100);

fn pause() {
    std::thread::sleep(Duration::from_millis(2));
}

pub(super) fn run(shared: Arc<Shared>) {
    let pipe_id = shared.info.pipe_id();
    debug!("Stream worker for pipe {} running", pipe_id);

    loop {
        let backoff = {
            let mut state = shared.state();
            state.reap(&shared);
            if state.exit {
                break;
            }
            let backoff = if state.stopping || state.fatal.is_some() {
                false
            } else {
                state.dispatch(&shared)
            };
            shared.cond.notify_all();
            backoff
        };

        if backoff {
            pause();
            continue;
        }
        match shared.events.recv_timeout(IDLE_TICK) {
            Ok(_) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        for _ in shared.events.try_iter() {}
    }

    debug!("Stream worker for pipe {} exiting", pipe_id);
}

impl StreamState {
    /// Processes finished transfers strictly in submission order.
    fn reap(&mut self, shared: &Shared) {
        while let Some(&index) = self.in_flight.front() {
            if !self.contexts[index].ovl.is_complete() {
                break;
            }
            self.in_flight.pop_front();
            self.pending_io -= 1;
            self.finish(shared, index);
        }
    }

    fn finish(&mut self, shared: &Shared, index: usize) {
        let info = &shared.info;
        let context = &mut self.contexts[index];

        let result = context
            .ovl
            .result()
            .unwrap_or(Err(UsbError::Cancelled));
        context.buffer = match context.ovl.take_buffer() {
            Ok(buffer) => buffer,
            Err(_) => vec![0; info.max_transfer_size],
        };
        if let Err(err) = context.ovl.reuse() {
            warn!("Pipe {}: context {}: {}", info.pipe_id(), index, err);
        }

        let mut error = match result {
            Ok(length) if length > context.buffer.len() => {
                warn!(
                    "Pipe {}: context {} reported {} bytes for a {} byte buffer",
                    info.pipe_id(),
                    index,
                    length,
                    context.buffer.len()
                );
                context.transfer_length = 0;
                Some(UsbError::Device(DeviceError::Bus))
            }
            Ok(length) => {
                context.transfer_length = length;
                None
            }
            Err(err) => Some(err),
        };
        trace!(
            "Pipe {}: context {} finished: {:?}",
            info.pipe_id(),
            index,
            error.as_ref().map_or(Ok(context.transfer_length), Err)
        );

        let verdict = shared.callbacks.before_complete(info, context, &mut error);
        if verdict == CompleteResult::Invalid {
            self.counters.resubmitted += 1;
            if !info.is_read() {
                // Keeps its data and goes out before anything written after it.
                context.state = ContextState::Queued;
                self.pending.push_front(index);
            } else if self.stopping || self.fatal.is_some() {
                context.reset();
                self.idle.push_back(index);
            } else if !self.submit(shared, index) {
                debug!("Pipe {}: resubmitting context {} failed", info.pipe_id(), index);
            }
            return;
        }

        match error {
            Some(UsbError::Cancelled) if self.stopping => {
                self.counters.cancelled += 1;
                context.reset();
                self.idle.push_back(index);
            }
            Some(err) => {
                if err == UsbError::Cancelled {
                    self.counters.cancelled += 1;
                } else {
                    self.counters.errors += 1;
                }
                self.fail(shared, index, err);
                self.contexts[index].reset();
                self.idle.push_back(index);
            }
            None => {
                self.counters.completed += 1;
                if info.is_read() {
                    context.state = ContextState::Complete;
                    context.consumed = 0;
                    shared.callbacks.complete(info, context);
                    self.complete.push_back(index);
                } else {
                    shared.callbacks.complete(info, context);
                    context.reset();
                    self.idle.push_back(index);
                }
            }
        }
    }

    /// Reports an error through the error callback. Returns true if the callback handled it.
    fn fail(&mut self, shared: &Shared, index: usize, err: UsbError) -> bool {
        let pipe_id = shared.info.pipe_id();
        let handled = shared
            .callbacks
            .error(&shared.info, &mut self.contexts[index], &err);

        if err.is_fatal() && self.fatal.is_none() {
            error!("Pipe {}: {}, halting stream", pipe_id, err);
            self.fatal = Some(err.clone());
        }
        if handled {
            debug!("Pipe {}: context {} error handled: {}", pipe_id, index, err);
        } else {
            warn!("Pipe {}: context {} failed: {}", pipe_id, index, err);
            if self.error.is_none() {
                self.error = Some(err);
            }
        }
        handled
    }

    /// Dispatches idle reads or written contexts until `max_pending_io` transfers are in flight.
    /// Returns true if a dispatch failed and the worker should back off.
    fn dispatch(&mut self, shared: &Shared) -> bool {
        while self.pending_io < shared.info.max_pending_io {
            let next = if shared.info.is_read() {
                self.idle.pop_front()
            } else {
                self.pending.pop_front()
            };
            let index = match next {
                Some(index) => index,
                None => break,
            };
            if !self.submit(shared, index) {
                return true;
            }
        }
        false
    }

    fn submit(&mut self, shared: &Shared, index: usize) -> bool {
        let info = &shared.info;
        let is_read = info.is_read();
        let context = &mut self.contexts[index];

        context.state = ContextState::Queued;
        if is_read {
            context.transfer_length = context.buffer.len();
            context.consumed = 0;
        }

        if let Err(err) = shared.callbacks.submit(info, context) {
            self.counters.errors += 1;
            self.fail(shared, index, err);
            self.contexts[index].reset();
            self.idle.push_back(index);
            return false;
        }

        let buffer = mem::take(&mut context.buffer);
        let transfer = Transfer::bulk(info.pipe_id(), buffer, context.transfer_length);
        match context.ovl.submit(transfer) {
            Ok(op) => {
                trace!(
                    "Pipe {}: dispatched context {} as {}, {} bytes",
                    info.pipe_id(),
                    index,
                    op,
                    context.transfer_length
                );
                self.in_flight.push_back(index);
                self.pending_io += 1;
                self.counters.submitted += 1;
                true
            }
            Err(rejected) => {
                context.buffer = rejected.transfer.buffer;
                self.counters.errors += 1;

                let handled = self.fail(shared, index, rejected.error);
                if handled && !is_read && self.fatal.is_none() {
                    self.pending.push_front(index);
                } else {
                    self.contexts[index].reset();
                    self.idle.push_back(index);
                }
                false
            }
        }
    }
}
