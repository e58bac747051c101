//! Pools of reusable asynchronous operations bound to one device.
//!
//! An [`OvlHandle`] is acquired from an [`OvlPool`], used for one transfer at a time, and either
//! re-used for the next transfer or released back to the pool. The pool remembers the order in
//! which handles were acquired so that [`OvlPool::wait_oldest`] can drain transfers in
//! submission order even though the device may complete them in any order.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crossbeam_channel::Sender;
use log::{debug, trace, warn};
use serde::Deserialize;

use crate::device::{PipeDevice, Rejected, Transfer};
use crate::error::{Result, UsbError};
use crate::event::{CompletionEvent, Completer, EventHandle, OperationId};
use crate::timeout::Timeout;
use crate::usb::PipeId;

bitflags::bitflags! {
    /// Actions taken when [`OvlHandle::wait`] returns.
    #[derive(Default)]
    pub struct WaitFlags: u32 {
        /// Release the operation back to its pool if it completed successfully.
        const RELEASE_ON_SUCCESS = 0x0001;
        /// Release the operation back to its pool if it failed.
        const RELEASE_ON_FAIL = 0x0002;
        const RELEASE_ON_SUCCESS_FAIL = 0x0003;
        /// Cancel the operation if the wait times out, but keep it acquired.
        const CANCEL_ON_TIMEOUT = 0x0004;
        /// Cancel the operation if the wait times out and release it.
        const RELEASE_ON_TIMEOUT = 0x000C;
        const RELEASE_ALWAYS = 0x000F;
        /// Run alerts queued with [`OvlPool::queue_alert`] while waiting.
        const ALERTABLE = 0x0010;
    }
}

/// How long alertable waits sleep between checks of the alert queue.
const ALERT_SLICE: Duration = Duration::from_millis(2);

/// How long a cancelled operation is given to come back from the device.
const CANCEL_WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct PoolConfig {
    pub capacity: usize,
}

type Alert = Box<dyn FnOnce() + Send>;

struct SlotMeta {
    event: Arc<CompletionEvent>,
    generation: u32,
    acquired: bool,
}

struct PoolLists {
    slots: Vec<SlotMeta>,
    /// Acquired slots, oldest acquisition first.
    acquired: VecDeque<usize>,
    /// Released slots, most recently released last.
    refurbished: Vec<usize>,
}

struct PoolInner {
    device: Arc<dyn PipeDevice>,
    capacity: usize,
    lists: Mutex<PoolLists>,
    alerts: Mutex<VecDeque<Alert>>,
    notify: Option<Sender<usize>>,
}

impl PoolInner {
    fn lists(&self) -> MutexGuard<'_, PoolLists> {
        self.lists.lock().unwrap()
    }
    fn run_alerts(&self) {
        loop {
            let alert = self.alerts.lock().unwrap().pop_front();
            match alert {
                Some(alert) => alert(),
                None => break,
            }
        }
    }
}

/// A bounded pool of asynchronous operations for one device.
#[derive(Clone)]
pub struct OvlPool {
    inner: Arc<PoolInner>,
}

impl OvlPool {
    pub fn new(device: Arc<dyn PipeDevice>, capacity: usize) -> Result<Self> {
        Self::create(device, capacity, None)
    }
    pub fn from_config(device: Arc<dyn PipeDevice>, config: &PoolConfig) -> Result<Self> {
        Self::new(device, config.capacity)
    }
    /// Like [`OvlPool::new`], but every completion also sends the slot index on `notify`.
    pub(crate) fn with_notify(
        device: Arc<dyn PipeDevice>,
        capacity: usize,
        notify: Sender<usize>,
    ) -> Result<Self> {
        Self::create(device, capacity, Some(notify))
    }
    fn create(
        device: Arc<dyn PipeDevice>,
        capacity: usize,
        notify: Option<Sender<usize>>,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(UsbError::InvalidArgument("pool capacity must be non-zero"));
        }
        debug!("Creating operation pool with capacity {}", capacity);

        Ok(Self {
            inner: Arc::new(PoolInner {
                device,
                capacity,
                lists: Mutex::new(PoolLists {
                    slots: Vec::with_capacity(capacity),
                    acquired: VecDeque::with_capacity(capacity),
                    refurbished: Vec::with_capacity(capacity),
                }),
                alerts: Mutex::new(VecDeque::new()),
                notify,
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
    pub fn device(&self) -> &Arc<dyn PipeDevice> {
        &self.inner.device
    }
    pub fn acquired_count(&self) -> usize {
        self.inner.lists().acquired.len()
    }

    /// Takes a free operation, preferring the most recently released one. Never blocks and
    /// never retries: an exhausted pool is reported as `ResourceExhausted`.
    pub fn acquire(&self) -> Result<OvlHandle> {
        let mut lists = self.inner.lists();

        let index = match lists.refurbished.pop() {
            Some(index) => index,
            None if lists.slots.len() < self.inner.capacity => {
                let index = lists.slots.len();
                let event = CompletionEvent::new(index, self.inner.notify.clone());
                lists.slots.push(SlotMeta {
                    event: Arc::new(event),
                    generation: 0,
                    acquired: false,
                });
                index
            }
            None => return Err(UsbError::ResourceExhausted("no free operation in pool")),
        };

        let slot = &mut lists.slots[index];
        slot.acquired = true;
        slot.generation = slot.generation.wrapping_add(1);
        slot.event.reset();
        let handle = OvlHandle {
            pool: Arc::clone(&self.inner),
            index,
            generation: slot.generation,
            event: Arc::clone(&slot.event),
        };
        lists.acquired.push_back(index);

        trace!("Acquired operation {}", index);
        Ok(handle)
    }

    /// Waits on the operation that has been acquired the longest, regardless of which
    /// operations have already completed. The handle is returned together with the wait result
    /// so the caller can re-use or release it.
    pub fn wait_oldest(
        &self,
        timeout: Option<Duration>,
        flags: WaitFlags,
    ) -> Result<(OvlHandle, Result<usize>)> {
        let handle = {
            let lists = self.inner.lists();
            let index = *lists
                .acquired
                .front()
                .ok_or(UsbError::InvalidArgument("no acquired operations in pool"))?;
            let slot = &lists.slots[index];
            OvlHandle {
                pool: Arc::clone(&self.inner),
                index,
                generation: slot.generation,
                event: Arc::clone(&slot.event),
            }
        };
        let result = handle.wait(timeout, flags);
        Ok((handle, result))
    }

    /// Queues `alert` to run on the next thread that performs an alertable wait on this pool.
    pub fn queue_alert<F>(&self, alert: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.alerts.lock().unwrap().push_back(Box::new(alert));
    }

    /// Cancels whatever is still in flight and invalidates every outstanding handle.
    pub fn free(self) {
        let mut lists = self.inner.lists();
        let PoolLists {
            slots,
            acquired,
            refurbished,
        } = &mut *lists;

        for index in acquired.drain(..) {
            let slot = &mut slots[index];
            if slot.event.in_flight() {
                if let Some(op) = slot.event.op() {
                    warn!("Freeing pool with {} still in flight, cancelling", op);
                    self.inner.device.cancel(op);
                }
            }
            slot.acquired = false;
            slot.generation = slot.generation.wrapping_add(1);
            refurbished.push(index);
        }
        debug!("Freed operation pool");
    }
}

impl fmt::Debug for OvlPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lists = self.inner.lists();
        f.debug_struct("OvlPool")
            .field("capacity", &self.inner.capacity)
            .field("allocated", &lists.slots.len())
            .field("acquired", &lists.acquired)
            .field("refurbished", &lists.refurbished)
            .finish()
    }
}

/// One acquired operation. Cloning yields another reference to the same operation, not a new
/// one; once the operation is released every clone becomes stale and reports
/// `InvalidArgument`.
#[derive(Clone)]
pub struct OvlHandle {
    pool: Arc<PoolInner>,
    index: usize,
    generation: u32,
    event: Arc<CompletionEvent>,
}

impl OvlHandle {
    /// Position of this operation inside its pool.
    pub fn index(&self) -> usize {
        self.index
    }

    fn check(&self) -> Result<()> {
        let lists = self.pool.lists();
        let slot = &lists.slots[self.index];
        if slot.acquired && slot.generation == self.generation {
            Ok(())
        } else {
            Err(UsbError::InvalidArgument("operation is not acquired"))
        }
    }

    /// Returns the operation to its pool. Releasing an operation that is still in flight is a
    /// caller error.
    pub fn release(&self) -> Result<()> {
        let mut lists = self.pool.lists();
        {
            let slot = &lists.slots[self.index];
            if !slot.acquired || slot.generation != self.generation {
                return Err(UsbError::InvalidArgument("operation is not acquired"));
            }
            if slot.event.in_flight() {
                return Err(UsbError::InvalidArgument("operation is still in flight"));
            }
        }

        lists.slots[self.index].acquired = false;
        lists.slots[self.index].event.reset();
        lists.acquired.retain(|&index| index != self.index);
        lists.refurbished.push(self.index);

        trace!("Released operation {}", self.index);
        Ok(())
    }

    /// Clears the completion state for another transfer while keeping ownership. The operation
    /// moves to the back of the acquisition order.
    pub fn reuse(&self) -> Result<()> {
        let mut lists = self.pool.lists();
        {
            let slot = &lists.slots[self.index];
            if !slot.acquired || slot.generation != self.generation {
                return Err(UsbError::InvalidArgument("operation is not acquired"));
            }
            if slot.event.in_flight() {
                return Err(UsbError::InvalidArgument("operation is still in flight"));
            }
        }

        lists.slots[self.index].event.reset();
        lists.acquired.retain(|&index| index != self.index);
        lists.acquired.push_back(self.index);
        Ok(())
    }

    /// Non-blocking poll. Does no validation, it only looks at the completion event.
    pub fn is_complete(&self) -> bool {
        self.event.is_signalled()
    }

    pub fn event_handle(&self) -> Result<EventHandle> {
        self.check()?;
        Ok(EventHandle::new(Arc::clone(&self.event)))
    }

    /// Starts a bulk or interrupt IN transfer of up to `length` bytes.
    pub fn read_pipe(&self, pipe_id: PipeId, length: usize) -> Result<()> {
        if !pipe_id.is_in() {
            return Err(UsbError::InvalidArgument("read on an OUT pipe"));
        }
        self.submit(Transfer::bulk(pipe_id, vec![0; length], length))
            .map(|_| ())
            .map_err(|rejected| rejected.error)
    }

    /// Starts a bulk or interrupt OUT transfer of `data`.
    pub fn write_pipe(&self, pipe_id: PipeId, data: Vec<u8>) -> Result<()> {
        if pipe_id.is_in() {
            return Err(UsbError::InvalidArgument("write on an IN pipe"));
        }
        let length = data.len();
        self.submit(Transfer::bulk(pipe_id, data, length))
            .map(|_| ())
            .map_err(|rejected| rejected.error)
    }

    pub(crate) fn submit(&self, transfer: Transfer) -> Result<OperationId, Rejected> {
        if let Err(error) = self.check() {
            return Err(Rejected::new(error, transfer));
        }
        if self.event.op().is_some() {
            return Err(Rejected::new(
                UsbError::InvalidArgument("operation must be re-used before resubmitting"),
                transfer,
            ));
        }

        let op = self.event.arm();
        trace!("Submitting {} on operation {}: {:?}", op, self.index, transfer);

        let completer = Completer::new(Arc::clone(&self.event), op);
        match self.pool.device.submit(transfer, completer) {
            Ok(()) => Ok(op),
            Err(rejected) => {
                self.event.disarm(op);
                Err(rejected)
            }
        }
    }

    /// The buffer of the completed transfer, with read data in its first `transferred` bytes.
    pub fn take_buffer(&self) -> Result<Vec<u8>> {
        self.check()?;
        self.event
            .take_buffer()
            .ok_or(UsbError::InvalidArgument("no completed transfer buffer"))
    }

    pub(crate) fn take_packets(&self) -> Option<Vec<crate::isoch::IsochPacket>> {
        self.event.take_packets()
    }

    pub(crate) fn op(&self) -> Option<OperationId> {
        self.event.op()
    }

    pub(crate) fn result(&self) -> Option<Result<usize>> {
        self.event.result()
    }

    /// Forgets a transfer the device never gave back. A completion arriving later is dropped.
    pub(crate) fn abandon(&self) {
        self.event.reset();
    }

    /// Asks the device to cancel the pending transfer. Returns false if nothing was pending.
    pub fn cancel(&self) -> Result<bool> {
        self.check()?;
        if !self.event.in_flight() {
            return Ok(false);
        }
        Ok(match self.event.op() {
            Some(op) => self.pool.device.cancel(op),
            None => false,
        })
    }

    /// Waits for the transfer to finish and applies `flags`.
    ///
    /// Returns the transferred length on success, the device error on failure, `Timeout` if the
    /// wait elapsed, and `Cancelled` if the wait elapsed and the transfer was cancelled. When a
    /// cancellation races with a natural completion, the completion wins.
    pub fn wait(&self, timeout: Option<Duration>, flags: WaitFlags) -> Result<usize> {
        self.check()?;
        if self.event.op().is_none() {
            return Err(UsbError::InvalidArgument("no transfer submitted on operation"));
        }

        let signalled = if flags.contains(WaitFlags::ALERTABLE) {
            self.wait_alertable(timeout)
        } else {
            self.event.wait(timeout)
        };

        if signalled {
            let result = self.event.result().unwrap_or(Err(UsbError::Cancelled));
            let release = match result {
                Ok(_) => flags.contains(WaitFlags::RELEASE_ON_SUCCESS),
                Err(_) => flags.contains(WaitFlags::RELEASE_ON_FAIL),
            };
            if release {
                self.release()?;
            }
            return result;
        }

        if !flags.contains(WaitFlags::CANCEL_ON_TIMEOUT) {
            return Err(UsbError::Timeout);
        }

        if let Some(op) = self.event.op() {
            debug!("Wait on operation {} timed out, cancelling {}", self.index, op);
            self.pool.device.cancel(op);
        }
        if !self.event.wait(Some(CANCEL_WAIT)) {
            warn!(
                "Operation {} did not complete after cancellation, leaving it acquired",
                self.index
            );
            return Err(UsbError::Cancelled);
        }

        let result = match self.event.result() {
            Some(Ok(len)) => Ok(len),
            Some(Err(UsbError::Cancelled)) | None => Err(UsbError::Cancelled),
            Some(Err(error)) => Err(error),
        };
        let release = flags.contains(WaitFlags::RELEASE_ON_TIMEOUT)
            || match result {
                Ok(_) => flags.contains(WaitFlags::RELEASE_ON_SUCCESS),
                Err(_) => flags.contains(WaitFlags::RELEASE_ON_FAIL),
            };
        if release {
            self.release()?;
        }
        result
    }

    /// Waits, cancelling the transfer on timeout. The operation stays acquired.
    pub fn wait_or_cancel(&self, timeout: Option<Duration>) -> Result<usize> {
        self.wait(timeout, WaitFlags::CANCEL_ON_TIMEOUT)
    }

    /// Waits, cancelling the transfer on timeout, and always releases the operation.
    pub fn wait_and_release(&self, timeout: Option<Duration>) -> Result<usize> {
        self.wait(timeout, WaitFlags::RELEASE_ALWAYS)
    }

    fn wait_alertable(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(Timeout::new);
        loop {
            self.pool.run_alerts();

            let slice = match deadline {
                Some(deadline) => deadline.slice(ALERT_SLICE),
                None => ALERT_SLICE,
            };
            if self.event.wait(Some(slice)) {
                return true;
            }
            if deadline.map_or(false, |deadline| deadline.is_expired()) {
                return false;
            }
        }
    }
}

impl fmt::Debug for OvlHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OvlHandle")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .field("complete", &self.is_complete())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wait_flag_values() {
        assert_eq!(WaitFlags::RELEASE_ON_SUCCESS_FAIL.bits(), 0x3);
        assert_eq!(WaitFlags::RELEASE_ON_TIMEOUT.bits(), 0xC);
        assert!(WaitFlags::RELEASE_ON_TIMEOUT.contains(WaitFlags::CANCEL_ON_TIMEOUT));
        assert_eq!(
            WaitFlags::RELEASE_ALWAYS,
            WaitFlags::RELEASE_ON_SUCCESS_FAIL | WaitFlags::RELEASE_ON_TIMEOUT
        );
        assert_eq!(WaitFlags::ALERTABLE.bits(), 0x10);
    }
}
