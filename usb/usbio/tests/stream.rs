use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use usbio::{
    CompleteResult, Completer, DeviceError, DeviceSpeed, ErrorKind, LoopbackDevice, NoCallbacks,
    OperationId, PipeDevice, PipeId, PipeInfo, PipeStream, Rejected, StreamCallbacks,
    StreamConfig, StreamFlags, StreamInfo, Transfer, TransferContext, TransferOutcome, UsbError,
};

const WAIT: Duration = Duration::from_secs(5);

fn eventually<F: Fn() -> bool>(f: F) -> bool {
    for _ in 0..500 {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

fn device() -> (Arc<LoopbackDevice>, PipeId, PipeId) {
    let device = Arc::new(LoopbackDevice::new(DeviceSpeed::High).unwrap());
    let ep_in = device.add_bulk_pipe(0x81, 512).unwrap();
    let ep_out = device.add_bulk_pipe(0x01, 512).unwrap();
    (device, ep_in, ep_out)
}

#[derive(Default)]
struct Recorder {
    started: AtomicUsize,
    stopped: AtomicUsize,
    completed: AtomicUsize,
    errors: AtomicUsize,
    handle_errors: bool,
    refuse_start: bool,
    reject_next: AtomicBool,
}

impl StreamCallbacks for Recorder {
    fn error(&self, _info: &StreamInfo, _context: &mut TransferContext, _error: &UsbError) -> bool {
        self.errors.fetch_add(1, Ordering::SeqCst);
        self.handle_errors
    }

    fn before_complete(
        &self,
        _info: &StreamInfo,
        _context: &mut TransferContext,
        _error: &mut Option<UsbError>,
    ) -> CompleteResult {
        if self.reject_next.swap(false, Ordering::SeqCst) {
            CompleteResult::Invalid
        } else {
            CompleteResult::Valid
        }
    }

    fn complete(&self, _info: &StreamInfo, _context: &mut TransferContext) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn started(&self, _info: &StreamInfo, context: &mut TransferContext) -> usbio::Result<()> {
        if self.refuse_start && context.index() == 2 {
            return Err(UsbError::InvalidArgument("refused"));
        }
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stopped(&self, _info: &StreamInfo, _context: &mut TransferContext) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

fn stream(
    device: &Arc<LoopbackDevice>,
    pipe_id: PipeId,
    config: StreamConfig,
    callbacks: Arc<dyn StreamCallbacks>,
) -> PipeStream {
    PipeStream::new(device.clone(), pipe_id, &config, callbacks).unwrap()
}

#[test]
fn invalid_configuration_is_rejected() {
    let (device, ep_in, _) = device();
    let err = PipeStream::new(
        device.clone(),
        ep_in,
        &StreamConfig::new(512, 0, 1),
        Arc::new(NoCallbacks),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let unknown = PipeId::new(0x85).unwrap();
    assert!(PipeStream::new(
        device,
        unknown,
        &StreamConfig::new(512, 4, 2),
        Arc::new(NoCallbacks)
    )
    .is_err());
}

#[test]
fn io_requires_a_started_stream_and_matching_direction() {
    let (device, ep_in, ep_out) = device();
    let reader = stream(&device, ep_in, StreamConfig::new(64, 2, 1), Arc::new(NoCallbacks));
    let writer = stream(&device, ep_out, StreamConfig::new(64, 2, 1), Arc::new(NoCallbacks));

    let mut buffer = [0; 8];
    assert_eq!(reader.read(&mut buffer).unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert_eq!(writer.write(&buffer).unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert!(reader.stop(Duration::ZERO).is_err());

    reader.start().unwrap();
    assert!(reader.start().is_err());
    assert_eq!(reader.write(&buffer).unwrap_err().kind(), ErrorKind::InvalidArgument);
}

#[test]
fn read_stream_keeps_max_pending_io_in_flight() {
    let (device, ep_in, _) = device();
    let reader = stream(&device, ep_in, StreamConfig::new(64, 4, 2), Arc::new(NoCallbacks));
    reader.start().unwrap();

    assert!(eventually(|| device.in_flight(ep_in).unwrap() == 2));
    let stats = reader.stats();
    assert_eq!(stats.queued, 2);
    assert_eq!(stats.idle + stats.complete, 2);
    assert_eq!(stats.pending_io, 2);

    device.inject(ep_in, &[0xAA; 64 * 8]).unwrap();
    let mut buffer = vec![0; 64 * 8];
    let mut total = 0;
    while total < buffer.len() {
        total += reader.read(&mut buffer[total..]).unwrap();
    }
    assert!(buffer.iter().all(|&b| b == 0xAA));
    assert!(device.max_in_flight(ep_in).unwrap() <= 2);
}

#[test]
fn read_without_partial_transfers_stops_at_short_transfer() {
    let (device, ep_in, _) = device();
    let config = StreamConfig::new(64, 4, 2).with_flags(StreamFlags::NO_PARTIAL_XFERS);
    let reader = stream(&device, ep_in, config, Arc::new(NoCallbacks));
    reader.start().unwrap();

    let data: Vec<u8> = (0..202).map(|i| i as u8).collect();
    assert!(eventually(|| device.in_flight(ep_in).unwrap() == 2));
    device.inject(ep_in, &data).unwrap();

    let mut buffer = vec![0; 300];
    assert_eq!(reader.read(&mut buffer).unwrap(), 202);
    assert_eq!(&buffer[..202], &data[..]);
}

#[test]
fn read_keeps_the_unconsumed_remainder() {
    let (device, ep_in, _) = device();
    let reader = stream(&device, ep_in, StreamConfig::new(64, 2, 1), Arc::new(NoCallbacks));
    reader.start().unwrap();
    device.inject(ep_in, b"0123456789").unwrap();

    let mut buffer = [0; 4];
    assert_eq!(reader.read(&mut buffer).unwrap(), 4);
    assert_eq!(&buffer, b"0123");
    assert_eq!(reader.read(&mut buffer).unwrap(), 4);
    assert_eq!(&buffer, b"4567");
    assert_eq!(reader.read(&mut buffer).unwrap(), 2);
    assert_eq!(&buffer[..2], b"89");
}

#[test]
fn write_splits_into_contexts_and_preserves_order() {
    let (device, _, ep_out) = device();
    device.set_latency(Duration::from_millis(20));
    let writer = stream(&device, ep_out, StreamConfig::new(512, 4, 2), Arc::new(NoCallbacks));
    writer.start().unwrap();

    let data: Vec<u8> = (0..2048).map(|i| (i % 251) as u8).collect();
    assert_eq!(writer.write(&data).unwrap(), 2048);

    let captured = device.wait_captured(ep_out, 2048, WAIT).unwrap();
    assert_eq!(captured, data);
    assert!(device.max_in_flight(ep_out).unwrap() <= 2);
    assert!(eventually(|| writer.stats().idle == 4));
    assert_eq!(writer.stats().submitted, 4);
}

#[test]
fn write_blocks_until_contexts_free_up() {
    let (device, _, ep_out) = device();
    device.set_latency(Duration::from_millis(10));
    let writer = stream(&device, ep_out, StreamConfig::new(16, 2, 1), Arc::new(NoCallbacks));
    writer.start().unwrap();

    let data: Vec<u8> = (0..160).map(|i| i as u8).collect();
    let mut total = 0;
    while total < data.len() {
        total += writer.write(&data[total..]).unwrap();
    }
    assert_eq!(device.wait_captured(ep_out, 160, WAIT).unwrap(), data);
}

#[test]
fn partial_chunk_is_staged_until_flushed() {
    let (device, _, ep_out) = device();
    let config = StreamConfig::new(512, 4, 2).with_flags(StreamFlags::NO_PARTIAL_XFERS);
    let writer = stream(&device, ep_out, config, Arc::new(NoCallbacks));
    writer.start().unwrap();

    let data = vec![7; 700];
    assert_eq!(writer.write(&data).unwrap(), 700);
    assert_eq!(device.wait_captured(ep_out, 512, WAIT).unwrap().len(), 512);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(device.captured(ep_out).unwrap().len(), 512);

    assert_eq!(writer.flush().unwrap(), 188);
    assert_eq!(device.wait_captured(ep_out, 700, WAIT).unwrap(), data);
    assert_eq!(writer.flush().unwrap(), 0);
}

#[test]
fn stop_cancels_pending_reads_and_fires_stopped_per_context() {
    let (device, ep_in, _) = device();
    let recorder = Arc::new(Recorder::default());
    let reader = stream(&device, ep_in, StreamConfig::new(64, 4, 2), recorder.clone());

    reader.start().unwrap();
    assert_eq!(recorder.started.load(Ordering::SeqCst), 4);
    assert!(eventually(|| device.in_flight(ep_in).unwrap() == 2));

    reader.stop(Duration::ZERO).unwrap();
    assert_eq!(recorder.stopped.load(Ordering::SeqCst), 4);
    assert_eq!(device.in_flight(ep_in).unwrap(), 0);
    let stats = reader.stats();
    assert_eq!(stats.cancelled, 2);
    assert_eq!(stats.idle, 4);
    assert_eq!(stats.pending_io, 0);
    assert!(!reader.is_started());

    // A stopped stream can be started again.
    reader.start().unwrap();
    device.inject(ep_in, &[1; 10]).unwrap();
    let mut buffer = [0; 10];
    assert_eq!(reader.read(&mut buffer).unwrap(), 10);
}

#[test]
fn stop_wakes_blocked_readers() {
    let (device, ep_in, _) = device();
    let reader = Arc::new(stream(&device, ep_in, StreamConfig::new(64, 2, 1), Arc::new(NoCallbacks)));
    reader.start().unwrap();

    let blocked = {
        let reader = Arc::clone(&reader);
        thread::spawn(move || {
            let mut buffer = [0; 16];
            reader.read(&mut buffer)
        })
    };
    thread::sleep(Duration::from_millis(50));
    reader.stop(Duration::from_millis(10)).unwrap();
    assert_eq!(blocked.join().unwrap(), Err(UsbError::Cancelled));
}

#[test]
fn read_times_out_with_use_timeout() {
    let (device, ep_in, _) = device();
    let reader = stream(
        &device,
        ep_in,
        StreamConfig::new(64, 2, 1).with_timeout_ms(30),
        Arc::new(NoCallbacks),
    );
    reader.start().unwrap();

    let mut buffer = [0; 16];
    assert_eq!(reader.read(&mut buffer), Err(UsbError::Timeout));
}

#[test]
fn unhandled_errors_reach_the_reader() {
    let (device, ep_in, _) = device();
    device.stall_next(ep_in).unwrap();
    let recorder = Arc::new(Recorder::default());
    let reader = stream(&device, ep_in, StreamConfig::new(64, 2, 1), recorder.clone());
    reader.start().unwrap();

    let mut buffer = [0; 16];
    assert_eq!(reader.read(&mut buffer), Err(UsbError::Device(DeviceError::Stall)));
    assert_eq!(recorder.errors.load(Ordering::SeqCst), 1);

    device.inject(ep_in, &[3; 16]).unwrap();
    assert_eq!(reader.read(&mut buffer), Ok(16));
}

/// Completes every transfer on the spot, claiming more bytes than the buffer holds.
struct Overreporting {
    inner: Arc<LoopbackDevice>,
}

impl PipeDevice for Overreporting {
    fn query_pipe(&self, pipe_id: PipeId) -> usbio::Result<PipeInfo> {
        self.inner.query_pipe(pipe_id)
    }
    fn speed(&self) -> DeviceSpeed {
        self.inner.speed()
    }
    fn current_frame_number(&self) -> usbio::Result<u32> {
        self.inner.current_frame_number()
    }
    fn submit(&self, transfer: Transfer, completer: Completer) -> Result<(), Rejected> {
        let length = transfer.buffer.len() + 100;
        completer.complete(TransferOutcome::new(Ok(length), transfer.buffer));
        Ok(())
    }
    fn cancel(&self, op: OperationId) -> bool {
        self.inner.cancel(op)
    }
    fn abort_pipe(&self, pipe_id: PipeId) -> usbio::Result<()> {
        self.inner.abort_pipe(pipe_id)
    }
}

#[test]
fn oversized_completions_are_bus_errors() {
    let (device, ep_in, _) = device();
    let device: Arc<dyn PipeDevice> = Arc::new(Overreporting { inner: device });
    let recorder = Arc::new(Recorder::default());
    let reader = PipeStream::new(device, ep_in, &StreamConfig::new(64, 2, 1), recorder.clone())
        .unwrap();
    reader.start().unwrap();

    let mut buffer = [0u8; 256];
    assert_eq!(
        reader.read(&mut buffer),
        Err(UsbError::Device(DeviceError::Bus))
    );
    assert_eq!(recorder.completed.load(Ordering::SeqCst), 0);
    reader.stop(Duration::ZERO).unwrap();
}

#[test]
fn handled_errors_are_suppressed() {
    let (device, ep_in, _) = device();
    device.stall_next(ep_in).unwrap();
    let recorder = Arc::new(Recorder {
        handle_errors: true,
        ..Recorder::default()
    });
    let reader = stream(&device, ep_in, StreamConfig::new(64, 2, 1), recorder.clone());
    reader.start().unwrap();

    assert!(eventually(|| recorder.errors.load(Ordering::SeqCst) == 1));
    device.inject(ep_in, &[5; 8]).unwrap();
    let mut buffer = [0; 8];
    assert_eq!(reader.read(&mut buffer), Ok(8));
    assert_eq!(reader.stats().errors, 1);
}

#[test]
fn rejected_read_is_resubmitted() {
    let (device, ep_in, _) = device();
    let recorder = Arc::new(Recorder::default());
    recorder.reject_next.store(true, Ordering::SeqCst);
    let reader = stream(&device, ep_in, StreamConfig::new(64, 2, 1), recorder.clone());
    reader.start().unwrap();

    assert!(eventually(|| device.in_flight(ep_in).unwrap() == 1));
    device.inject(ep_in, b"first").unwrap();
    assert!(eventually(|| reader.stats().resubmitted == 1));
    assert_eq!(reader.stats().queued, 1);

    device.inject(ep_in, b"second").unwrap();
    let mut buffer = [0; 64];
    assert_eq!(reader.read(&mut buffer), Ok(6));
    assert_eq!(&buffer[..6], b"second");
    assert_eq!(recorder.completed.load(Ordering::SeqCst), 1);
}

#[test]
fn rejected_write_goes_out_again_first() {
    let (device, _, ep_out) = device();
    let recorder = Arc::new(Recorder::default());
    recorder.reject_next.store(true, Ordering::SeqCst);
    let writer = stream(&device, ep_out, StreamConfig::new(4, 4, 1), recorder.clone());
    writer.start().unwrap();

    assert_eq!(writer.write(b"AAAABBBB"), Ok(8));
    assert_eq!(
        device.wait_captured(ep_out, 12, WAIT).unwrap(),
        b"AAAAAAAABBBB"
    );
    assert_eq!(writer.stats().resubmitted, 1);
}

#[test]
fn disconnect_halts_the_stream() {
    let (device, ep_in, _) = device();
    let reader = stream(&device, ep_in, StreamConfig::new(64, 4, 2), Arc::new(NoCallbacks));
    reader.start().unwrap();
    assert!(eventually(|| device.in_flight(ep_in).unwrap() == 2));

    device.disconnect();
    let mut buffer = [0; 16];
    let disconnected = Err(UsbError::Device(DeviceError::Disconnected));
    assert_eq!(reader.read(&mut buffer), disconnected);
    assert_eq!(reader.read(&mut buffer), disconnected);
    assert_eq!(reader.stats().queued, 0);
    assert_eq!(reader.stats().submitted, 2);
}

#[test]
fn refused_start_has_no_side_effects() {
    let (device, ep_in, _) = device();
    let recorder = Arc::new(Recorder {
        refuse_start: true,
        ..Recorder::default()
    });
    let reader = stream(&device, ep_in, StreamConfig::new(64, 4, 2), recorder.clone());

    assert!(reader.start().is_err());
    assert!(!reader.is_started());
    thread::sleep(Duration::from_millis(20));
    assert_eq!(device.in_flight(ep_in).unwrap(), 0);

    // Contexts that started before the refusal are stopped again.
    assert_eq!(recorder.started.load(Ordering::SeqCst), 2);
    assert_eq!(recorder.stopped.load(Ordering::SeqCst), 2);
}

#[test]
fn dropping_a_started_stream_stops_it() {
    let (device, ep_in, _) = device();
    let recorder = Arc::new(Recorder::default());
    let reader = stream(&device, ep_in, StreamConfig::new(64, 3, 3), recorder.clone());
    reader.start().unwrap();
    assert!(eventually(|| device.in_flight(ep_in).unwrap() == 3));

    reader.free();
    assert_eq!(recorder.stopped.load(Ordering::SeqCst), 3);
    assert_eq!(device.in_flight(ep_in).unwrap(), 0);
}
