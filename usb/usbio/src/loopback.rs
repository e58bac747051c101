//! A software [`PipeDevice`] that completes transfers on its own reactor thread.
//!
//! OUT transfers are captured per pipe, IN transfers are served from data injected with
//! [`LoopbackDevice::inject`] and stay pending until some arrives. Stalls and disconnects can be
//! injected to exercise the error paths of the pool and the stream.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, trace, warn};

use crate::device::{PipeDevice, Rejected, Transfer, TransferKind, TransferOutcome};
use crate::error::{DeviceError, Result, UsbError};
use crate::event::{Completer, OperationId};
use crate::isoch::IsochPacket;
use crate::usb::{
    DeviceSpeed, EndpointDescriptor, EndpointTy, PipeId, PipeInfo, ENDPOINT_DESCRIPTOR_KIND,
    ENDPOINT_DESCRIPTOR_LEN,
};

const REACTOR_TICK: Duration = Duration::from_millis(50);

/// Frame counter value right after the device is created.
const FIRST_FRAME: u32 = 1000;

fn endpoint(address: u8, ty: EndpointTy, max_packet_size: u16, interval: u8) -> EndpointDescriptor {
    EndpointDescriptor {
        length: ENDPOINT_DESCRIPTOR_LEN,
        kind: ENDPOINT_DESCRIPTOR_KIND,
        address,
        attributes: ty as u8,
        max_packet_size: max_packet_size.to_le(),
        interval,
    }
}

struct Pending {
    transfer: Transfer,
    completer: Completer,
    due: Instant,
}

struct Pipe {
    info: PipeInfo,
    queue: VecDeque<Pending>,
    injected: VecDeque<u8>,
    captured: Vec<u8>,
    stall_next: bool,
    max_in_flight: usize,
}

impl Pipe {
    fn new(info: PipeInfo) -> Self {
        Self {
            info,
            queue: VecDeque::new(),
            injected: VecDeque::new(),
            captured: Vec::new(),
            stall_next: false,
            max_in_flight: 0,
        }
    }
}

struct LoopState {
    pipes: BTreeMap<PipeId, Pipe>,
    disconnected: bool,
    shutdown: bool,
}

struct Inner {
    speed: DeviceSpeed,
    latency: Mutex<Duration>,
    epoch: Instant,
    state: Mutex<LoopState>,
    captured_cond: Condvar,
    kick: Sender<()>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap()
    }
    fn kick(&self) {
        let _ = self.kick.send(());
    }
}

type Completion = (Completer, TransferOutcome);

fn finish(completions: Vec<Completion>) {
    for (completer, outcome) in completions {
        completer.complete(outcome);
    }
}

fn cancelled(pending: Pending) -> Completion {
    (
        pending.completer,
        TransferOutcome::with_packets(
            Err(UsbError::Cancelled),
            pending.transfer.buffer,
            match pending.transfer.kind {
                TransferKind::Isoch { packets, .. } => packets,
                TransferKind::Bulk => Vec::new(),
            },
        ),
    )
}

fn failed(pending: Pending, error: DeviceError) -> Completion {
    let (completer, mut outcome) = cancelled(pending);
    outcome.result = Err(UsbError::Device(error));
    (completer, outcome)
}

/// Runs one transfer against the pipe's data. Returns `None` if an IN bulk transfer has to wait
/// for injected data.
fn serve(pipe: &mut Pipe, pending: &mut Pending) -> Option<TransferOutcome> {
    let transfer = &mut pending.transfer;
    let is_in = pipe.info.pipe_id.is_in();

    match &mut transfer.kind {
        TransferKind::Bulk if is_in => {
            if pipe.injected.is_empty() && transfer.length > 0 {
                return None;
            }
            let count = transfer.length.min(pipe.injected.len());
            for (dst, src) in transfer.buffer[..count]
                .iter_mut()
                .zip(pipe.injected.drain(..count))
            {
                *dst = src;
            }
            Some(TransferOutcome::new(Ok(count), Vec::new()))
        }
        TransferKind::Bulk => {
            pipe.captured.extend_from_slice(&transfer.buffer[..transfer.length]);
            Some(TransferOutcome::new(Ok(transfer.length), Vec::new()))
        }
        TransferKind::Isoch { packets, .. } => {
            let mut total = 0;
            for packet in packets.iter_mut() {
                let start = (packet.offset as usize).min(transfer.length);
                let end = (start + packet.length as usize).min(transfer.length);
                if is_in {
                    let count = end.saturating_sub(start).min(pipe.injected.len());
                    for (dst, src) in transfer.buffer[start..start + count]
                        .iter_mut()
                        .zip(pipe.injected.drain(..count))
                    {
                        *dst = src;
                    }
                    packet.length = count as u32;
                    total += count;
                } else if start < end {
                    pipe.captured.extend_from_slice(&transfer.buffer[start..end]);
                    total += end - start;
                }
                packet.status = 0;
            }
            Some(TransferOutcome::new(Ok(total), Vec::new()))
        }
    }
}

fn run_reactor(inner: Arc<Inner>, kicks: Receiver<()>) {
    debug!("Loopback reactor running");
    loop {
        let mut completions = Vec::new();
        let mut next_due: Option<Instant> = None;
        let shutdown = {
            let mut state = inner.state();
            let now = Instant::now();
            let mut captured = false;

            for pipe in state.pipes.values_mut() {
                while let Some(mut pending) = pipe.queue.pop_front() {
                    if pending.due > now {
                        next_due = Some(next_due.map_or(pending.due, |due| due.min(pending.due)));
                        pipe.queue.push_front(pending);
                        break;
                    }
                    if pipe.stall_next {
                        pipe.stall_next = false;
                        trace!(
                            "Loopback: stalling {} on pipe {}",
                            pending.completer.op(),
                            pipe.info.pipe_id
                        );
                        completions.push(failed(pending, DeviceError::Stall));
                        continue;
                    }
                    match serve(pipe, &mut pending) {
                        Some(mut outcome) => {
                            let Pending {
                                transfer,
                                completer,
                                ..
                            } = pending;
                            if let TransferKind::Isoch { packets, .. } = transfer.kind {
                                outcome.packets = packets;
                            }
                            outcome.buffer = transfer.buffer;
                            captured |= !pipe.info.pipe_id.is_in();
                            completions.push((completer, outcome));
                        }
                        None => {
                            pipe.queue.push_front(pending);
                            break;
                        }
                    }
                }
            }

            if captured {
                inner.captured_cond.notify_all();
            }
            state.shutdown
        };

        finish(completions);
        if shutdown {
            break;
        }

        let wait = next_due
            .map(|due| due.saturating_duration_since(Instant::now()))
            .unwrap_or(REACTOR_TICK)
            .min(REACTOR_TICK);
        match kicks.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        for _ in kicks.try_iter() {}
    }
    debug!("Loopback reactor exiting");
}

/// See the module documentation.
pub struct LoopbackDevice {
    inner: Arc<Inner>,
    reactor: Option<JoinHandle<()>>,
}

impl LoopbackDevice {
    pub fn new(speed: DeviceSpeed) -> Result<Self> {
        let (kick, kicks) = crossbeam_channel::unbounded();
        let inner = Arc::new(Inner {
            speed,
            latency: Mutex::new(Duration::ZERO),
            epoch: Instant::now(),
            state: Mutex::new(LoopState {
                pipes: BTreeMap::new(),
                disconnected: false,
                shutdown: false,
            }),
            captured_cond: Condvar::new(),
            kick,
        });

        let reactor_inner = Arc::clone(&inner);
        let reactor = thread::Builder::new()
            .name("usbio-loopback".to_string())
            .spawn(move || run_reactor(reactor_inner, kicks))
            .map_err(|err| {
                warn!("Failed to spawn loopback reactor: {}", err);
                UsbError::ResourceExhausted("cannot spawn loopback reactor")
            })?;

        Ok(Self {
            inner,
            reactor: Some(reactor),
        })
    }

    /// Delays every completion by at least `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.lock().unwrap() = latency;
    }

    pub fn add_pipe(&self, info: PipeInfo) {
        debug!("Loopback: adding {:?} pipe {}", info.ty, info.pipe_id);
        self.inner
            .state()
            .pipes
            .insert(info.pipe_id, Pipe::new(info));
    }

    /// Adds the pipe described by a raw endpoint descriptor.
    pub fn add_endpoint(&self, bytes: &[u8]) -> Result<PipeId> {
        self.add_descriptor(&EndpointDescriptor::from_bytes(bytes)?)
    }

    fn add_descriptor(&self, desc: &EndpointDescriptor) -> Result<PipeId> {
        let info = PipeInfo::from_descriptor(desc, self.inner.speed)?;
        if info.ty == EndpointTy::Ctrl {
            return Err(UsbError::InvalidArgument("control pipes are not supported"));
        }
        self.add_pipe(info);
        Ok(info.pipe_id)
    }

    pub fn add_bulk_pipe(&self, address: u8, max_packet_size: u16) -> Result<PipeId> {
        self.add_descriptor(&endpoint(address, EndpointTy::Bulk, max_packet_size, 0))
    }

    pub fn add_isoch_pipe(&self, address: u8, max_packet_size: u16, interval: u8) -> Result<PipeId> {
        self.add_descriptor(&endpoint(address, EndpointTy::Isoch, max_packet_size, interval))
    }

    fn with_pipe<T, F>(&self, pipe_id: PipeId, f: F) -> Result<T>
    where
        F: FnOnce(&mut Pipe) -> T,
    {
        let mut state = self.inner.state();
        let pipe = state
            .pipes
            .get_mut(&pipe_id)
            .ok_or(UsbError::InvalidArgument("unknown pipe"))?;
        Ok(f(pipe))
    }

    /// Makes `data` available to IN transfers on `pipe_id`.
    pub fn inject(&self, pipe_id: PipeId, data: &[u8]) -> Result<()> {
        self.with_pipe(pipe_id, |pipe| pipe.injected.extend(data.iter().copied()))?;
        self.inner.kick();
        Ok(())
    }

    /// Everything OUT transfers delivered on `pipe_id` so far.
    pub fn captured(&self, pipe_id: PipeId) -> Result<Vec<u8>> {
        self.with_pipe(pipe_id, |pipe| pipe.captured.clone())
    }

    /// Blocks until at least `len` bytes were captured on `pipe_id` or `timeout` elapses.
    pub fn wait_captured(&self, pipe_id: PipeId, len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state();
        loop {
            let pipe = state
                .pipes
                .get(&pipe_id)
                .ok_or(UsbError::InvalidArgument("unknown pipe"))?;
            if pipe.captured.len() >= len {
                return Ok(pipe.captured.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(UsbError::Timeout);
            }
            state = self
                .inner
                .captured_cond
                .wait_timeout(state, deadline - now)
                .unwrap()
                .0;
        }
    }

    /// Fails the next transfer on `pipe_id` with a stall.
    pub fn stall_next(&self, pipe_id: PipeId) -> Result<()> {
        self.with_pipe(pipe_id, |pipe| pipe.stall_next = true)?;
        self.inner.kick();
        Ok(())
    }

    /// Fails everything pending with `Disconnected` and refuses further submissions.
    pub fn disconnect(&self) {
        let completions: Vec<Completion> = {
            let mut state = self.inner.state();
            state.disconnected = true;
            state
                .pipes
                .values_mut()
                .flat_map(|pipe| pipe.queue.drain(..))
                .map(|pending| failed(pending, DeviceError::Disconnected))
                .collect()
        };
        debug!("Loopback: disconnected with {} transfers pending", completions.len());
        finish(completions);
    }

    /// The most transfers that were ever pending at once on `pipe_id`.
    pub fn max_in_flight(&self, pipe_id: PipeId) -> Result<usize> {
        self.with_pipe(pipe_id, |pipe| pipe.max_in_flight)
    }

    pub fn in_flight(&self, pipe_id: PipeId) -> Result<usize> {
        self.with_pipe(pipe_id, |pipe| pipe.queue.len())
    }
}

impl PipeDevice for LoopbackDevice {
    fn query_pipe(&self, pipe_id: PipeId) -> Result<PipeInfo> {
        self.with_pipe(pipe_id, |pipe| pipe.info)
    }

    fn speed(&self) -> DeviceSpeed {
        self.inner.speed
    }

    fn current_frame_number(&self) -> Result<u32> {
        if self.inner.state().disconnected {
            return Err(UsbError::Device(DeviceError::Disconnected));
        }
        let millis = self.inner.epoch.elapsed().as_millis() as u32;
        Ok(FIRST_FRAME.wrapping_add(millis))
    }

    fn submit(&self, transfer: Transfer, completer: Completer) -> Result<(), Rejected> {
        let latency = *self.inner.latency.lock().unwrap();
        let mut state = self.inner.state();
        if state.disconnected {
            return Err(Rejected::new(DeviceError::Disconnected.into(), transfer));
        }
        if transfer.length > transfer.buffer.len() {
            return Err(Rejected::new(
                UsbError::InvalidArgument("transfer length exceeds its buffer"),
                transfer,
            ));
        }
        let pipe = match state.pipes.get_mut(&transfer.pipe_id) {
            Some(pipe) => pipe,
            None => return Err(Rejected::new(UsbError::InvalidArgument("unknown pipe"), transfer)),
        };
        let is_isoch = matches!(transfer.kind, TransferKind::Isoch { .. });
        if is_isoch != pipe.info.is_isoch() {
            return Err(Rejected::new(
                UsbError::InvalidArgument("transfer type does not match the pipe"),
                transfer,
            ));
        }

        trace!("Loopback: queueing {} on pipe {}", completer.op(), transfer.pipe_id);
        pipe.queue.push_back(Pending {
            transfer,
            completer,
            due: Instant::now() + latency,
        });
        pipe.max_in_flight = pipe.max_in_flight.max(pipe.queue.len());
        drop(state);

        self.inner.kick();
        Ok(())
    }

    fn cancel(&self, op: OperationId) -> bool {
        let found = {
            let mut state = self.inner.state();
            state.pipes.values_mut().find_map(|pipe| {
                let position = pipe.queue.iter().position(|p| p.completer.op() == op)?;
                pipe.queue.remove(position)
            })
        };
        match found {
            Some(pending) => {
                trace!("Loopback: cancelled {}", op);
                finish(vec![cancelled(pending)]);
                true
            }
            None => false,
        }
    }

    fn abort_pipe(&self, pipe_id: PipeId) -> Result<()> {
        let completions: Vec<Completion> =
            self.with_pipe(pipe_id, |pipe| pipe.queue.drain(..).map(cancelled).collect())?;
        debug!("Loopback: aborted {} transfers on pipe {}", completions.len(), pipe_id);
        finish(completions);
        Ok(())
    }
}

impl Drop for LoopbackDevice {
    fn drop(&mut self) {
        let completions: Vec<Completion> = {
            let mut state = self.inner.state();
            state.shutdown = true;
            state
                .pipes
                .values_mut()
                .flat_map(|pipe| pipe.queue.drain(..))
                .map(cancelled)
                .collect()
        };
        finish(completions);
        self.inner.kick();

        if let Some(reactor) = self.reactor.take() {
            if reactor.join().is_err() {
                warn!("Loopback reactor panicked");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn endpoints_come_from_descriptors() {
        let device = LoopbackDevice::new(DeviceSpeed::High).unwrap();
        // Interrupt IN, 1024 bytes with two additional transactions per microframe.
        let pipe_id = device
            .add_endpoint(&[7, 5, 0x85, 3, 0x00, 0x14, 4])
            .unwrap();
        let info = device.query_pipe(pipe_id).unwrap();
        assert_eq!(info.ty, EndpointTy::Interrupt);
        assert_eq!(info.max_packet_size, 1024);
        assert_eq!(info.max_bytes_per_interval, 3072);

        assert!(device.add_endpoint(&[7, 5, 0x00, 0, 64, 0, 0]).is_err());
        assert!(device.add_endpoint(&[9, 4, 0, 0, 1, 0, 0]).is_err());
    }

    #[test]
    fn isoch_read_fills_packets() {
        let device = LoopbackDevice::new(DeviceSpeed::Full).unwrap();
        let pipe_id = device.add_isoch_pipe(0x83, 64, 1).unwrap();

        let mut pipe = Pipe::new(device.query_pipe(pipe_id).unwrap());
        pipe.injected.extend([1u8; 10].iter().copied());
        let packet = |offset| IsochPacket {
            offset,
            length: 8,
            status: 1,
        };
        let packets = vec![packet(0), packet(8)];
        let event = Arc::new(crate::event::CompletionEvent::new(0, None));
        let mut pending = Pending {
            transfer: Transfer {
                pipe_id,
                buffer: vec![0; 16],
                length: 16,
                kind: TransferKind::Isoch {
                    start_frame: None,
                    packets,
                },
            },
            completer: Completer::new(Arc::clone(&event), event.arm()),
            due: Instant::now(),
        };

        let outcome = serve(&mut pipe, &mut pending).unwrap();
        assert_eq!(outcome.result, Ok(10));
        match &pending.transfer.kind {
            TransferKind::Isoch { packets, .. } => {
                assert_eq!(packets[0].length, 8);
                assert_eq!(packets[1].length, 2);
                assert!(packets.iter().all(|p| p.status == 0));
            }
            TransferKind::Bulk => unreachable!(),
        }
    }
}
