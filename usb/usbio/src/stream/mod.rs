//! Continuous read-ahead and write-behind on one pipe.
//!
//! A [`PipeStream`] owns a fixed set of [`TransferContext`]s and a worker thread. On an IN pipe the
//! worker keeps up to `max_pending_io` reads in flight and queues finished ones for
//! [`PipeStream::read`]; on an OUT pipe [`PipeStream::write`] fills idle contexts and the worker
//! sends them in order.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, warn};
use serde::Serialize;

use crate::device::PipeDevice;
use crate::error::{Result, UsbError};
use crate::ovl::OvlPool;
use crate::timeout::Timeout;
use crate::usb::{PipeId, PipeInfo};

mod callbacks;
mod config;
mod context;
mod worker;

pub use self::callbacks::*;
pub use self::config::*;
pub use self::context::*;

/// How long [`PipeStream::stop`] waits for cancelled transfers to come back from the device.
const CANCEL_WAIT: Duration = Duration::from_secs(5);

/// Sent on the event channel to wake the worker for something other than a completion.
const WAKE: usize = usize::MAX;

/// Everything a callback may want to know about the stream it runs for.
#[derive(Clone, Debug, Serialize)]
pub struct StreamInfo {
    pub pipe: PipeInfo,
    pub max_transfer_size: usize,
    pub max_pending_transfers: usize,
    pub max_pending_io: usize,
    #[serde(skip)]
    pub flags: StreamFlags,
}

impl StreamInfo {
    pub fn pipe_id(&self) -> PipeId {
        self.pipe.pipe_id
    }
    pub fn is_read(&self) -> bool {
        self.pipe.pipe_id.is_in()
    }
}

/// A snapshot of a stream's counters and context distribution.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct StreamStats {
    pub submitted: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub errors: u64,
    pub resubmitted: u64,
    pub idle: usize,
    pub queued: usize,
    pub complete: usize,
    pub pending_io: usize,
}

#[derive(Clone, Copy, Debug, Default)]
struct Counters {
    submitted: u64,
    completed: u64,
    cancelled: u64,
    errors: u64,
    resubmitted: u64,
}

struct StreamState {
    contexts: Vec<TransferContext>,
    /// Idle contexts, next to be filled or dispatched first.
    idle: VecDeque<usize>,
    /// Written contexts waiting for dispatch.
    pending: VecDeque<usize>,
    /// Dispatched contexts in submission order.
    in_flight: VecDeque<usize>,
    /// Finished reads in submission order.
    complete: VecDeque<usize>,
    /// A partially filled write context held back by `NO_PARTIAL_XFERS`.
    staged: Option<usize>,
    pending_io: usize,
    started: bool,
    stopping: bool,
    exit: bool,
    /// The first unhandled error, reported to the next reader or writer.
    error: Option<UsbError>,
    /// Set once the device is gone. Nothing is dispatched afterwards.
    fatal: Option<UsbError>,
    counters: Counters,
}

struct Shared {
    info: StreamInfo,
    callbacks: Arc<dyn StreamCallbacks>,
    state: Mutex<StreamState>,
    cond: Condvar,
    wake: Sender<usize>,
    events: Receiver<usize>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap()
    }
    fn kick(&self) {
        // The receiver lives as long as `self`.
        let _ = self.wake.send(WAKE);
    }
}

/// A started or stopped stream on one bulk or interrupt pipe.
pub struct PipeStream {
    shared: Arc<Shared>,
    pool: OvlPool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PipeStream {
    /// Creates a stopped stream. The direction follows bit 7 of `pipe_id`.
    pub fn new(
        device: Arc<dyn PipeDevice>,
        pipe_id: PipeId,
        config: &StreamConfig,
        callbacks: Arc<dyn StreamCallbacks>,
    ) -> Result<Self> {
        config.validate()?;
        let flags = config.effective_flags()?;

        let pipe = device.query_pipe(pipe_id)?;
        if pipe.is_isoch() {
            return Err(UsbError::InvalidArgument("streams do not carry isochronous pipes"));
        }

        let max_pending_transfers = config.max_pending_transfers;
        let max_pending_io = config.max_pending_io.min(max_pending_transfers);

        let (wake, events) = crossbeam_channel::unbounded();
        let pool = OvlPool::with_notify(device, max_pending_transfers, wake.clone())?;

        let mut contexts = Vec::with_capacity(max_pending_transfers);
        for index in 0..max_pending_transfers {
            contexts.push(TransferContext::new(
                index,
                config.max_transfer_size,
                pool.acquire()?,
            ));
        }

        let info = StreamInfo {
            pipe,
            max_transfer_size: config.max_transfer_size,
            max_pending_transfers,
            max_pending_io,
            flags,
        };
        debug!(
            "Created {} stream on pipe {}: {} x {} bytes, {} in flight",
            if info.is_read() { "read" } else { "write" },
            pipe_id,
            max_pending_transfers,
            config.max_transfer_size,
            max_pending_io
        );

        Ok(Self {
            shared: Arc::new(Shared {
                info,
                callbacks,
                state: Mutex::new(StreamState {
                    contexts,
                    idle: (0..max_pending_transfers).collect(),
                    pending: VecDeque::with_capacity(max_pending_transfers),
                    in_flight: VecDeque::with_capacity(max_pending_transfers),
                    complete: VecDeque::with_capacity(max_pending_transfers),
                    staged: None,
                    pending_io: 0,
                    started: false,
                    stopping: false,
                    exit: false,
                    error: None,
                    fatal: None,
                    counters: Counters::default(),
                }),
                cond: Condvar::new(),
                wake,
                events,
            }),
            pool,
            worker: Mutex::new(None),
        })
    }

    pub fn info(&self) -> &StreamInfo {
        &self.shared.info
    }

    pub fn is_started(&self) -> bool {
        self.shared.state().started
    }

    /// Fires `started` for every context and spawns the worker. Fails without side effects if a
    /// callback refuses or the worker cannot be created.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return Err(UsbError::InvalidArgument("stream already started"));
        }

        {
            let mut state = self.shared.state();
            let info = &self.shared.info;
            for index in 0..state.contexts.len() {
                if let Err(err) = self.shared.callbacks.started(info, &mut state.contexts[index]) {
                    warn!(
                        "Pipe {}: context {} refused to start: {}",
                        info.pipe_id(),
                        index,
                        err
                    );
                    // Undo the contexts that did start.
                    for context in &mut state.contexts[..index] {
                        self.shared.callbacks.stopped(info, context);
                    }
                    return Err(err);
                }
            }
            state.error = None;
            state.fatal = None;
            state.started = true;
        }
        for _ in self.shared.events.try_iter() {}

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("usbio-stream-{}", self.shared.info.pipe_id()))
            .spawn(move || worker::run(shared));

        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                debug!("Started stream on pipe {}", self.shared.info.pipe_id());
                Ok(())
            }
            Err(err) => {
                error!("Failed to spawn stream worker: {}", err);
                self.shared.state().started = false;
                Err(UsbError::ResourceExhausted("cannot spawn stream worker"))
            }
        }
    }

    /// Stops dispatching, gives pending transfers `cancel_timeout` to finish, cancels the rest and
    /// fires `stopped` for every context. Every context is idle afterwards and the stream can be
    /// started again.
    pub fn stop(&self, cancel_timeout: Duration) -> Result<()> {
        let mut worker = self.worker.lock().unwrap();
        let handle = worker
            .take()
            .ok_or(UsbError::InvalidArgument("stream is not started"))?;
        let pipe_id = self.shared.info.pipe_id();

        let mut state = self.shared.state();
        state.stopping = true;
        self.shared.kick();
        self.shared.cond.notify_all();

        let grace = Timeout::new(cancel_timeout);
        while !state.in_flight.is_empty() && !grace.is_expired() {
            state = self
                .shared
                .cond
                .wait_timeout(state, grace.remaining())
                .unwrap()
                .0;
        }

        if !state.in_flight.is_empty() {
            debug!(
                "Pipe {}: cancelling {} pending transfers",
                pipe_id,
                state.in_flight.len()
            );
            for &index in &state.in_flight {
                if let Err(err) = state.contexts[index].ovl.cancel() {
                    warn!("Pipe {}: failed to cancel context {}: {}", pipe_id, index, err);
                }
            }

            let deadline = Timeout::new(CANCEL_WAIT);
            while !state.in_flight.is_empty() && !deadline.is_expired() {
                state = self
                    .shared
                    .cond
                    .wait_timeout(state, deadline.remaining())
                    .unwrap()
                    .0;
            }
        }

        state.exit = true;
        drop(state);
        self.shared.kick();
        if handle.join().is_err() {
            error!("Pipe {}: stream worker panicked", pipe_id);
        }

        let mut state = self.shared.state();
        let StreamState {
            contexts,
            idle,
            pending,
            in_flight,
            complete,
            staged,
            counters,
            ..
        } = &mut *state;

        for index in in_flight.drain(..) {
            let context = &mut contexts[index];
            match context.ovl.take_buffer() {
                Ok(buffer) if context.ovl.is_complete() => context.buffer = buffer,
                _ => {
                    warn!(
                        "Pipe {}: context {} never came back from the device, abandoning it",
                        pipe_id, index
                    );
                    context.ovl.abandon();
                    context.buffer = vec![0; self.shared.info.max_transfer_size];
                }
            }
            counters.cancelled += 1;
        }
        pending.clear();
        complete.clear();
        idle.clear();
        *staged = None;

        for context in contexts.iter_mut() {
            context.reset();
            if let Err(err) = context.ovl.reuse() {
                warn!("Pipe {}: context {}: {}", pipe_id, context.index(), err);
            }
            idle.push_back(context.index());
            self.shared.callbacks.stopped(&self.shared.info, context);
        }

        state.pending_io = 0;
        state.started = false;
        state.stopping = false;
        state.exit = false;
        self.shared.cond.notify_all();
        drop(state);

        for _ in self.shared.events.try_iter() {}
        debug!("Stopped stream on pipe {}", pipe_id);
        Ok(())
    }

    fn wait<'a>(
        &self,
        state: MutexGuard<'a, StreamState>,
        deadline: Option<Timeout>,
    ) -> (MutexGuard<'a, StreamState>, bool) {
        match deadline {
            None => (self.shared.cond.wait(state).unwrap(), false),
            Some(deadline) => {
                if deadline.is_expired() {
                    return (state, true);
                }
                let state = self
                    .shared
                    .cond
                    .wait_timeout(state, deadline.remaining())
                    .unwrap()
                    .0;
                (state, deadline.is_expired())
            }
        }
    }

    /// Copies finished reads into `buffer`, blocking until data arrives.
    ///
    /// Without `NO_PARTIAL_XFERS` this returns as soon as at least one byte was delivered and no
    /// more is ready. With it, reading continues until `buffer` is full or a short transfer marks
    /// the end of the data.
    pub fn read(&self, buffer: &mut [u8]) -> Result<usize> {
        if !self.shared.info.is_read() {
            return Err(UsbError::InvalidArgument("read on a write stream"));
        }
        let no_partial = self.shared.info.flags.no_partial_xfers();
        let max_transfer_size = self.shared.info.max_transfer_size;
        let deadline = self.shared.info.flags.timeout().map(Timeout::new);

        let mut state = self.shared.state();
        if !state.started {
            return Err(UsbError::InvalidArgument("stream is not started"));
        }

        let mut total = 0;
        loop {
            if total == buffer.len() {
                return Ok(total);
            }
            if state.stopping || !state.started {
                return if total > 0 { Ok(total) } else { Err(UsbError::Cancelled) };
            }

            if let Some(&index) = state.complete.front() {
                let context = &mut state.contexts[index];
                let available = &context.buffer[context.consumed..context.transfer_length];
                let count = available.len().min(buffer.len() - total);
                buffer[total..total + count].copy_from_slice(&available[..count]);
                context.consumed += count;
                total += count;

                let end_of_data = context.transfer_length < max_transfer_size;
                if context.consumed == context.transfer_length {
                    context.reset();
                    state.complete.pop_front();
                    state.idle.push_back(index);
                    self.shared.kick();

                    if end_of_data {
                        return Ok(total);
                    }
                }
                continue;
            }

            if let Some(err) = state.error.take() {
                if total > 0 {
                    state.error = Some(err);
                    return Ok(total);
                }
                return Err(err);
            }
            if let Some(err) = state.fatal.clone() {
                return if total > 0 { Ok(total) } else { Err(err) };
            }
            if total > 0 && !no_partial {
                return Ok(total);
            }

            let (next, timed_out) = self.wait(state, deadline);
            state = next;
            if timed_out {
                return if total > 0 { Ok(total) } else { Err(UsbError::Timeout) };
            }
        }
    }

    /// Queues `data` for sending, blocking while no context is idle.
    ///
    /// Without `NO_PARTIAL_XFERS` this returns short once at least one byte was accepted and no
    /// idle context remains. With it, every byte is accepted before returning, and a trailing
    /// partial chunk is held back until a later write fills it or [`PipeStream::flush`] sends it.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if self.shared.info.is_read() {
            return Err(UsbError::InvalidArgument("write on a read stream"));
        }
        let no_partial = self.shared.info.flags.no_partial_xfers();
        let max_transfer_size = self.shared.info.max_transfer_size;
        let deadline = self.shared.info.flags.timeout().map(Timeout::new);

        let mut state = self.shared.state();
        if !state.started {
            return Err(UsbError::InvalidArgument("stream is not started"));
        }

        let mut total = 0;
        loop {
            if total == data.len() {
                return Ok(total);
            }
            if state.stopping || !state.started {
                return if total > 0 { Ok(total) } else { Err(UsbError::Cancelled) };
            }
            if let Some(err) = state.error.take() {
                if total > 0 {
                    state.error = Some(err);
                    return Ok(total);
                }
                return Err(err);
            }
            if let Some(err) = state.fatal.clone() {
                return if total > 0 { Ok(total) } else { Err(err) };
            }

            let index = match state.staged.take() {
                Some(index) => index,
                None => match state.idle.pop_front() {
                    Some(index) => index,
                    None => {
                        if total > 0 && !no_partial {
                            return Ok(total);
                        }
                        let (next, timed_out) = self.wait(state, deadline);
                        state = next;
                        if timed_out {
                            return if total > 0 { Ok(total) } else { Err(UsbError::Timeout) };
                        }
                        continue;
                    }
                },
            };

            let context = &mut state.contexts[index];
            let filled = context.transfer_length;
            let count = (max_transfer_size - filled).min(data.len() - total);
            context.buffer[filled..filled + count].copy_from_slice(&data[total..total + count]);
            context.transfer_length += count;
            total += count;

            if context.transfer_length == max_transfer_size || !no_partial {
                context.state = ContextState::Queued;
                state.pending.push_back(index);
                self.shared.kick();
            } else {
                state.staged = Some(index);
            }
        }
    }

    /// Queues a partial chunk held back by `NO_PARTIAL_XFERS`. Returns the number of bytes it
    /// carried, zero if nothing was staged.
    pub fn flush(&self) -> Result<usize> {
        let mut state = self.shared.state();
        if !state.started {
            return Err(UsbError::InvalidArgument("stream is not started"));
        }
        match state.staged.take() {
            Some(index) => {
                let length = state.contexts[index].transfer_length;
                state.contexts[index].state = ContextState::Queued;
                state.pending.push_back(index);
                self.shared.kick();
                Ok(length)
            }
            None => Ok(0),
        }
    }

    pub fn stats(&self) -> StreamStats {
        let state = self.shared.state();
        let mut stats = StreamStats {
            submitted: state.counters.submitted,
            completed: state.counters.completed,
            cancelled: state.counters.cancelled,
            errors: state.counters.errors,
            resubmitted: state.counters.resubmitted,
            pending_io: state.pending_io,
            ..StreamStats::default()
        };
        for context in &state.contexts {
            match context.state {
                ContextState::Idle => stats.idle += 1,
                ContextState::Queued => stats.queued += 1,
                ContextState::Complete => stats.complete += 1,
            }
        }
        stats
    }

    /// Stops the stream if needed and releases its operations.
    pub fn free(self) {}
}

impl Drop for PipeStream {
    fn drop(&mut self) {
        let started = self.worker.lock().unwrap().is_some();
        if started {
            if let Err(err) = self.stop(Duration::ZERO) {
                warn!("Failed to stop stream while freeing it: {}", err);
            }
        }
        self.pool.clone().free();
    }
}

impl fmt::Debug for PipeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeStream")
            .field("info", &self.shared.info)
            .field("stats", &self.stats())
            .finish()
    }
}
