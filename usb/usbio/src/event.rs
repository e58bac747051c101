//! Completion events shared by the operation pool, the stream worker and the isochronous manager.
//!
//! An event is armed when an operation is handed to the device and signalled exactly once, from
//! whatever thread the device completes on. It stays signalled (manual reset) until its owner
//! resets it for the next operation.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::task;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use futures::future::FusedFuture;
use log::{trace, warn};

use crate::device::TransferOutcome;
use crate::error::Result;
use crate::isoch::IsochPacket;

/// Identifies one submission. Never reused, so a completion that arrives after its slot was
/// recycled can be told apart from the current operation.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct OperationId(u64);

impl OperationId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

#[derive(Default)]
struct EventState {
    op: Option<OperationId>,
    result: Option<Result<usize>>,
    buffer: Option<Vec<u8>>,
    packets: Option<Vec<IsochPacket>>,
    wakers: Vec<task::Waker>,
}

pub(crate) struct CompletionEvent {
    index: usize,
    state: Mutex<EventState>,
    cond: Condvar,
    notify: Option<Sender<usize>>,
}

impl CompletionEvent {
    pub(crate) fn new(index: usize, notify: Option<Sender<usize>>) -> Self {
        Self {
            index,
            state: Mutex::new(EventState::default()),
            cond: Condvar::new(),
            notify,
        }
    }
    fn state(&self) -> MutexGuard<'_, EventState> {
        self.state.lock().unwrap()
    }

    /// Arms the event for a new operation. The caller guarantees nothing is in flight.
    pub(crate) fn arm(&self) -> OperationId {
        let op = OperationId::next();
        let mut state = self.state();
        state.op = Some(op);
        state.result = None;
        state.buffer = None;
        state.packets = None;
        op
    }
    /// Drops a failed submission so the event reads as idle again.
    pub(crate) fn disarm(&self, op: OperationId) {
        let mut state = self.state();
        if state.op == Some(op) && state.result.is_none() {
            state.op = None;
        }
    }
    pub(crate) fn reset(&self) {
        let mut state = self.state();
        state.op = None;
        state.result = None;
        state.buffer = None;
        state.packets = None;
    }

    fn complete(&self, op: OperationId, outcome: TransferOutcome) -> bool {
        let wakers = {
            let mut state = self.state();
            if state.op != Some(op) || state.result.is_some() {
                warn!(
                    "Dropping late completion of {} on event {} ({:?})",
                    op, self.index, outcome.result
                );
                return false;
            }
            trace!("{} completed on event {}: {:?}", op, self.index, outcome.result);

            state.result = Some(outcome.result);
            state.buffer = Some(outcome.buffer);
            state.packets = Some(outcome.packets);
            std::mem::take(&mut state.wakers)
        };

        self.cond.notify_all();
        for waker in wakers {
            waker.wake();
        }
        if let Some(notify) = &self.notify {
            // The receiver only disappears once the owning stream is gone.
            let _ = notify.send(self.index);
        }
        true
    }

    pub(crate) fn op(&self) -> Option<OperationId> {
        self.state().op
    }
    pub(crate) fn is_signalled(&self) -> bool {
        self.state().result.is_some()
    }
    pub(crate) fn in_flight(&self) -> bool {
        let state = self.state();
        state.op.is_some() && state.result.is_none()
    }
    pub(crate) fn result(&self) -> Option<Result<usize>> {
        self.state().result.clone()
    }
    pub(crate) fn take_buffer(&self) -> Option<Vec<u8>> {
        self.state().buffer.take()
    }
    pub(crate) fn take_packets(&self) -> Option<Vec<IsochPacket>> {
        self.state().packets.take()
    }

    /// Blocks until signalled or until `timeout` elapses. `None` waits forever.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.state();

        while state.result.is_none() {
            match deadline {
                None => state = self.cond.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    state = self.cond.wait_timeout(state, deadline - now).unwrap().0;
                }
            }
        }
        true
    }
}

/// The device's half of an armed event. Completing consumes it, so an operation can only be
/// completed once.
pub struct Completer {
    event: Arc<CompletionEvent>,
    op: OperationId,
}

impl Completer {
    pub(crate) fn new(event: Arc<CompletionEvent>, op: OperationId) -> Self {
        Self { event, op }
    }
    pub fn op(&self) -> OperationId {
        self.op
    }
    /// Returns false if the operation was already recycled by its owner.
    pub fn complete(self, outcome: TransferOutcome) -> bool {
        self.event.complete(self.op, outcome)
    }
}

impl fmt::Debug for Completer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field("event", &self.event.index)
            .field("op", &self.op)
            .finish()
    }
}

/// The raw waitable behind an acquired operation, for callers running their own event loop.
///
/// Only meaningful while the operation is acquired; once released the event may be re-armed for
/// somebody else's transfer.
#[derive(Clone)]
pub struct EventHandle {
    event: Arc<CompletionEvent>,
}

impl EventHandle {
    pub(crate) fn new(event: Arc<CompletionEvent>) -> Self {
        Self { event }
    }
    pub fn is_set(&self) -> bool {
        self.event.is_signalled()
    }
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.event.wait(timeout)
    }
    pub fn wait_async(&self) -> EventFuture {
        EventFuture {
            event: Some(Arc::clone(&self.event)),
        }
    }
}

impl fmt::Debug for EventHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandle")
            .field("index", &self.event.index)
            .field("set", &self.is_set())
            .finish()
    }
}

/// Resolves once the event is signalled.
pub struct EventFuture {
    event: Option<Arc<CompletionEvent>>,
}

impl Future for EventFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, context: &mut task::Context) -> task::Poll<Self::Output> {
        let this = self.get_mut();
        let event = match this.event {
            Some(ref event) => event,
            None => panic!("Polling finished EventFuture again."),
        };

        {
            let mut state = event.state();
            if state.result.is_none() {
                if !state.wakers.iter().any(|w| w.will_wake(context.waker())) {
                    state.wakers.push(context.waker().clone());
                }
                return task::Poll::Pending;
            }
        }
        this.event = None;
        task::Poll::Ready(())
    }
}

impl FusedFuture for EventFuture {
    fn is_terminated(&self) -> bool {
        self.event.is_none()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    fn outcome(len: usize) -> TransferOutcome {
        TransferOutcome::new(Ok(len), vec![0; len])
    }

    #[test]
    fn late_completion_is_ignored() {
        let event = Arc::new(CompletionEvent::new(0, None));
        let stale = Completer::new(Arc::clone(&event), event.arm());
        let current = Completer::new(Arc::clone(&event), event.arm());

        assert!(!stale.complete(outcome(1)));
        assert!(!event.is_signalled());
        assert!(current.complete(outcome(4)));
        assert_eq!(event.result(), Some(Ok(4)));
    }

    #[test]
    fn wait_times_out_then_sees_completion() {
        let event = Arc::new(CompletionEvent::new(0, None));
        let completer = Completer::new(Arc::clone(&event), event.arm());

        assert!(!event.wait(Some(Duration::from_millis(5))));

        let worker = thread::spawn(move || completer.complete(outcome(8)));
        assert!(event.wait(None));
        assert!(worker.join().unwrap());
        assert_eq!(event.take_buffer().map(|b| b.len()), Some(8));
    }

    #[test]
    fn future_resolves_on_completion() {
        let event = Arc::new(CompletionEvent::new(0, None));
        let completer = Completer::new(Arc::clone(&event), event.arm());
        let handle = EventHandle::new(Arc::clone(&event));

        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            completer.complete(outcome(2))
        });
        futures::executor::block_on(handle.wait_async());
        assert!(handle.is_set());
        worker.join().unwrap();
    }
}
