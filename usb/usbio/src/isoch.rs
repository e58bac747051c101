//! Isochronous transfers: a fixed set of packet descriptors laid over one transfer buffer.

use std::fmt;
use std::sync::Arc;

use log::{debug, trace, warn};
use serde::Serialize;

use crate::device::{PipeDevice, Transfer, TransferKind};
use crate::error::{Result, UsbError};
use crate::event::OperationId;
use crate::ovl::OvlHandle;
use crate::usb::{PipeId, PipeInfo};

/// One packet of an isochronous transfer.
///
/// After a read the device fills in `length` and `status`. After a write only `status` is
/// updated; the lengths the caller set are left alone.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize)]
pub struct IsochPacket {
    /// Absolute offset of the packet inside the transfer buffer.
    pub offset: u32,
    pub length: u32,
    /// Zero on success, otherwise a device specific status code.
    pub status: u32,
}

/// Scheduling figures derived from a pipe's interval and bandwidth.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct IsochPacketInformation {
    /// Packets scheduled per 1ms frame.
    pub packets_per_frame: u32,
    pub polling_period_micro_seconds: u32,
    pub bytes_per_millisecond: u32,
}

/// The starting frame of an isochronous transfer. On return from [`IsochTransfer::read`] and
/// [`IsochTransfer::write`] it holds the frame the next transfer should start on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameNumber {
    Asap,
    Frame(u32),
}

/// Derives the packet schedule of an isochronous pipe.
///
/// High speed (and faster) intervals are exponents counted in 125us microframes, full speed
/// intervals are plain milliseconds.
pub fn calc_packet_information(
    is_high_speed: bool,
    pipe: &PipeInfo,
) -> Result<IsochPacketInformation> {
    let interval = u32::from(pipe.interval);
    if interval == 0 {
        return Err(UsbError::InvalidArgument("isochronous interval must be non-zero"));
    }

    if is_high_speed {
        if interval > 16 {
            return Err(UsbError::InvalidArgument("high speed interval out of range"));
        }
        let microframes = 1u32 << (interval - 1);
        let packets_per_frame = match interval {
            1 => 8,
            2 => 4,
            3 => 2,
            _ => 1,
        };
        Ok(IsochPacketInformation {
            packets_per_frame,
            polling_period_micro_seconds: microframes * 1000 / 8,
            bytes_per_millisecond: pipe.max_bytes_per_interval * 8 / microframes,
        })
    } else {
        Ok(IsochPacketInformation {
            packets_per_frame: 1,
            polling_period_micro_seconds: interval * 1000,
            bytes_per_millisecond: pipe.max_bytes_per_interval / interval,
        })
    }
}

struct Pending {
    op: OperationId,
    number_of_packets: usize,
    is_read: bool,
}

/// Packet descriptors plus the transfer buffer they describe.
///
/// The buffer is handed to the device for the duration of a transfer and comes back through
/// [`IsochTransfer::reclaim`]; until then the buffer and the packets are not accessible.
pub struct IsochTransfer {
    device: Arc<dyn PipeDevice>,
    pipe: PipeInfo,
    info: IsochPacketInformation,
    packets: Vec<IsochPacket>,
    number_of_packets: usize,
    buffer: Option<Vec<u8>>,
    buffer_size: usize,
    pending: Option<Pending>,
}

impl IsochTransfer {
    /// Binds `max_number_of_packets` descriptors to `buffer`, spacing the packets evenly across
    /// it. All packets are active until [`IsochTransfer::set_number_of_packets`] says otherwise.
    pub fn new(
        device: Arc<dyn PipeDevice>,
        pipe_id: PipeId,
        max_number_of_packets: usize,
        buffer: Vec<u8>,
    ) -> Result<Self> {
        if max_number_of_packets == 0 {
            return Err(UsbError::InvalidArgument("isochronous transfer needs packets"));
        }
        if buffer.is_empty() {
            return Err(UsbError::InvalidArgument("isochronous transfer needs a buffer"));
        }
        if buffer.len() > u32::MAX as usize {
            return Err(UsbError::InvalidArgument("isochronous buffer too large"));
        }
        let pipe = device.query_pipe(pipe_id)?;
        if !pipe.is_isoch() {
            return Err(UsbError::InvalidArgument("pipe is not isochronous"));
        }
        let info = calc_packet_information(device.speed().is_high_speed(), &pipe)?;

        let buffer_size = buffer.len();
        let mut transfer = Self {
            device,
            pipe,
            info,
            packets: vec![IsochPacket::default(); max_number_of_packets],
            number_of_packets: max_number_of_packets,
            buffer: Some(buffer),
            buffer_size,
            pending: None,
        };
        transfer.set_packet_offsets(buffer_size / max_number_of_packets)?;

        debug!(
            "Isochronous transfer on pipe {}: {} packets over {} bytes, {:?}",
            pipe_id, max_number_of_packets, buffer_size, info
        );
        Ok(transfer)
    }

    pub fn pipe(&self) -> &PipeInfo {
        &self.pipe
    }
    pub fn packet_information(&self) -> IsochPacketInformation {
        self.info
    }
    pub fn max_number_of_packets(&self) -> usize {
        self.packets.len()
    }
    pub fn number_of_packets(&self) -> usize {
        self.number_of_packets
    }
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn check_idle(&self) -> Result<()> {
        if self.pending.is_some() {
            Err(UsbError::InvalidArgument("isochronous transfer in flight"))
        } else {
            Ok(())
        }
    }

    pub fn set_number_of_packets(&mut self, number_of_packets: usize) -> Result<()> {
        self.check_idle()?;
        if number_of_packets > self.packets.len() {
            return Err(UsbError::InvalidArgument("more packets than were allocated"));
        }
        self.number_of_packets = number_of_packets;
        Ok(())
    }

    /// Places the active packets `packet_size` bytes apart, starting at offset zero.
    pub fn set_packet_offsets(&mut self, packet_size: usize) -> Result<()> {
        self.check_idle()?;
        let packet_size = u32::try_from(packet_size)
            .map_err(|_| UsbError::InvalidArgument("packet size too large"))?;

        let mut offset = 0u32;
        for packet in &mut self.packets[..self.number_of_packets] {
            packet.offset = offset;
            offset = offset.saturating_add(packet_size);
        }
        Ok(())
    }

    pub fn set_packet(&mut self, index: usize, packet: IsochPacket) -> Result<()> {
        self.check_idle()?;
        if index >= self.number_of_packets {
            return Err(UsbError::InvalidArgument("packet index out of range"));
        }
        self.packets[index] = packet;
        Ok(())
    }

    pub fn get_packet(&self, index: usize) -> Result<IsochPacket> {
        self.check_idle()?;
        if index >= self.number_of_packets {
            return Err(UsbError::InvalidArgument("packet index out of range"));
        }
        Ok(self.packets[index])
    }

    /// Calls `f` with each active packet from `start` on, stopping early when it returns false.
    pub fn enum_packets<F>(&mut self, start: usize, mut f: F) -> Result<()>
    where
        F: FnMut(usize, &mut IsochPacket) -> bool,
    {
        self.check_idle()?;
        if start > self.number_of_packets {
            return Err(UsbError::InvalidArgument("start index out of range"));
        }
        for index in start..self.number_of_packets {
            if !f(index, &mut self.packets[index]) {
                break;
            }
        }
        Ok(())
    }

    pub fn buffer(&self) -> Result<&[u8]> {
        self.buffer
            .as_deref()
            .ok_or(UsbError::InvalidArgument("isochronous transfer in flight"))
    }
    pub fn buffer_mut(&mut self) -> Result<&mut [u8]> {
        self.buffer
            .as_deref_mut()
            .ok_or(UsbError::InvalidArgument("isochronous transfer in flight"))
    }

    /// The bytes of one packet, as delimited by its offset and length.
    pub fn packet_data(&self, index: usize) -> Result<&[u8]> {
        let packet = self.get_packet(index)?;
        let buffer = self.buffer()?;
        let start = packet.offset as usize;
        let end = start.saturating_add(packet.length as usize);
        buffer
            .get(start..end)
            .ok_or(UsbError::InvalidArgument("packet lies outside the buffer"))
    }

    pub fn current_frame_number(&self) -> Result<u32> {
        self.device.current_frame_number()
    }

    /// Starts reading into the buffer. `data_length` of zero uses the whole buffer,
    /// `number_of_packets` of zero uses every active packet.
    pub fn read(
        &mut self,
        ovl: &OvlHandle,
        frame: &mut FrameNumber,
        data_length: usize,
        number_of_packets: usize,
    ) -> Result<()> {
        if !self.pipe.pipe_id.is_in() {
            return Err(UsbError::InvalidArgument("read on an OUT pipe"));
        }
        self.start(ovl, frame, data_length, number_of_packets, true)
    }

    /// Starts writing the buffer. `data_length` of zero uses the whole buffer,
    /// `number_of_packets` of zero uses every active packet.
    pub fn write(
        &mut self,
        ovl: &OvlHandle,
        frame: &mut FrameNumber,
        data_length: usize,
        number_of_packets: usize,
    ) -> Result<()> {
        if self.pipe.pipe_id.is_in() {
            return Err(UsbError::InvalidArgument("write on an IN pipe"));
        }
        self.start(ovl, frame, data_length, number_of_packets, false)
    }

    fn start(
        &mut self,
        ovl: &OvlHandle,
        frame: &mut FrameNumber,
        data_length: usize,
        number_of_packets: usize,
        is_read: bool,
    ) -> Result<()> {
        self.check_idle()?;

        let data_length = match data_length {
            0 => self.buffer_size,
            len if len > self.buffer_size => {
                return Err(UsbError::InvalidArgument("data length exceeds the buffer"))
            }
            len => len,
        };
        let number_of_packets = match number_of_packets {
            0 => self.number_of_packets,
            n if n > self.number_of_packets => {
                return Err(UsbError::InvalidArgument("more packets than are active"))
            }
            n => n,
        };
        if number_of_packets == 0 {
            return Err(UsbError::InvalidArgument("no active packets"));
        }

        // Packets travel with their full span so the device knows how much each one may carry.
        // Each packet ends where the next used one starts; the last one runs to `data_length`.
        let mut packets = self.packets[..number_of_packets].to_vec();
        let offsets: Vec<u32> = packets.iter().map(|packet| packet.offset).collect();
        for (index, packet) in packets.iter_mut().enumerate() {
            let start = (packet.offset as usize).min(data_length);
            let end = match offsets.get(index + 1) {
                Some(&next) => (next as usize).min(data_length),
                None => data_length,
            };
            if start > end {
                return Err(UsbError::InvalidArgument("packet offsets out of order"));
            }
            packet.length = (end - start) as u32;
            packet.status = 0;
        }

        let (start_frame, first_frame) = match *frame {
            FrameNumber::Asap => (None, self.device.current_frame_number()?),
            FrameNumber::Frame(frame) => (Some(frame), frame),
        };

        let buffer = self
            .buffer
            .take()
            .ok_or(UsbError::InvalidArgument("isochronous buffer missing"))?;
        let transfer = Transfer {
            pipe_id: self.pipe.pipe_id,
            buffer,
            length: data_length,
            kind: TransferKind::Isoch {
                start_frame,
                packets,
            },
        };

        let op = match ovl.submit(transfer) {
            Ok(op) => op,
            Err(rejected) => {
                self.buffer = Some(rejected.transfer.buffer);
                return Err(rejected.error);
            }
        };
        self.pending = Some(Pending {
            op,
            number_of_packets,
            is_read,
        });

        let ppf = self.info.packets_per_frame as usize;
        let frames = (number_of_packets + ppf - 1) / ppf;
        let next = first_frame.wrapping_add(frames as u32);
        trace!(
            "Isochronous {} of {} packets from frame {} ({:?}), next frame {}",
            if is_read { "read" } else { "write" },
            number_of_packets,
            first_frame,
            start_frame,
            next
        );
        *frame = FrameNumber::Frame(next);
        Ok(())
    }

    /// Takes the buffer and packet results back from a completed operation and returns the
    /// operation's own result. The operation must have been waited on (or polled complete) first.
    pub fn reclaim(&mut self, ovl: &OvlHandle) -> Result<usize> {
        let pending = match &self.pending {
            Some(pending) if ovl.op() == Some(pending.op) => pending,
            _ => {
                return Err(UsbError::InvalidArgument(
                    "operation does not carry this isochronous transfer",
                ))
            }
        };
        if !ovl.is_complete() {
            return Err(UsbError::InvalidArgument("isochronous transfer still in flight"));
        }
        let number_of_packets = pending.number_of_packets;
        let is_read = pending.is_read;
        self.pending = None;

        self.buffer = Some(match ovl.take_buffer() {
            Ok(buffer) => buffer,
            Err(_) => {
                warn!("Isochronous buffer was taken from its operation, replacing it");
                vec![0; self.buffer_size]
            }
        });

        if let Some(results) = ovl.take_packets() {
            for (packet, result) in self.packets[..number_of_packets].iter_mut().zip(results) {
                if is_read {
                    packet.length = result.length;
                }
                packet.status = result.status;
            }
        }

        ovl.result().unwrap_or(Err(UsbError::Cancelled))
    }

    pub fn free(self) {
        if let Some(pending) = &self.pending {
            warn!(
                "Freeing isochronous transfer while {} is still outstanding",
                pending.op
            );
        }
    }
}

impl fmt::Debug for IsochTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsochTransfer")
            .field("pipe_id", &self.pipe.pipe_id)
            .field("number_of_packets", &self.number_of_packets)
            .field("max_number_of_packets", &self.packets.len())
            .field("buffer_size", &self.buffer_size)
            .field("pending", &self.pending.is_some())
            .finish()
    }
}
