use std::fmt;

use plain::Plain;
use serde::{Deserialize, Serialize};

use crate::error::{Result, UsbError};

/// The descriptor for a USB Endpoint.
///
/// Each endpoint of an interface has its own descriptor. The information in this structure is
/// used to size transfers and, for periodic endpoints, to derive the schedule.
///
/// See USB32 9.6.6
///
/// The offsets for the fields in the packet are described in USB32 Table 9-26
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct EndpointDescriptor {
    pub length: u8,
    pub kind: u8,
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

unsafe impl Plain for EndpointDescriptor {}

/// Mask that is ANDed to the [EndpointDescriptor].attributes buffer to get the endpoint type.
pub const ENDP_ATTR_TY_MASK: u8 = 0x3;

pub const ENDPOINT_DESCRIPTOR_KIND: u8 = 0x05;
pub const ENDPOINT_DESCRIPTOR_LEN: u8 = 7;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum EndpointTy {
    Ctrl = 0,
    Isoch = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl EndpointDescriptor {
    /// Parses a raw endpoint descriptor, as found inside a configuration descriptor.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let desc = plain::from_bytes::<Self>(bytes)
            .map_err(|_| UsbError::InvalidArgument("endpoint descriptor too short"))?;

        if desc.length < ENDPOINT_DESCRIPTOR_LEN || desc.kind != ENDPOINT_DESCRIPTOR_KIND {
            return Err(UsbError::InvalidArgument("not an endpoint descriptor"));
        }
        Ok(*desc)
    }
    pub fn ty(&self) -> EndpointTy {
        match self.attributes & ENDP_ATTR_TY_MASK {
            0 => EndpointTy::Ctrl,
            1 => EndpointTy::Isoch,
            2 => EndpointTy::Bulk,
            3 => EndpointTy::Interrupt,
            _ => unreachable!(),
        }
    }
    pub fn pipe_id(&self) -> Result<PipeId> {
        PipeId::new(self.address)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum EndpBinaryDirection {
    Out,
    In,
}

/// The endpoint address of a pipe: bit 7 is the direction, bits 3:0 the endpoint number.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct PipeId(u8);

impl PipeId {
    pub const DIRECTION_IN: u8 = 0x80;
    const RESERVED_BITS: u8 = 0x70;

    /// Rejects the default control pipe and addresses with reserved bits set.
    pub fn new(address: u8) -> Result<Self> {
        if address & Self::RESERVED_BITS != 0 {
            return Err(UsbError::InvalidArgument("reserved bits set in pipe id"));
        }
        if address & 0x0F == 0 {
            return Err(UsbError::InvalidArgument("pipe id refers to the control endpoint"));
        }
        Ok(Self(address))
    }
    pub fn raw(self) -> u8 {
        self.0
    }
    pub fn number(self) -> u8 {
        self.0 & 0x0F
    }
    pub fn direction(self) -> EndpBinaryDirection {
        if self.0 & Self::DIRECTION_IN != 0 {
            EndpBinaryDirection::In
        } else {
            EndpBinaryDirection::Out
        }
    }
    pub fn is_in(self) -> bool {
        self.direction() == EndpBinaryDirection::In
    }
}

impl TryFrom<u8> for PipeId {
    type Error = UsbError;

    fn try_from(address: u8) -> Result<Self> {
        Self::new(address)
    }
}

impl From<PipeId> for u8 {
    fn from(pipe_id: PipeId) -> Self {
        pipe_id.0
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum DeviceSpeed {
    Low,
    Full,
    High,
    Super,
}

impl DeviceSpeed {
    /// High speed and faster buses schedule in 125us microframes instead of 1ms frames.
    pub fn is_high_speed(self) -> bool {
        matches!(self, Self::High | Self::Super)
    }
}

/// What the core needs to know about one pipe of a claimed interface.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct PipeInfo {
    pub pipe_id: PipeId,
    pub ty: EndpointTy,
    pub max_packet_size: u16,
    pub interval: u8,
    pub max_bytes_per_interval: u32,
}

impl PipeInfo {
    pub fn from_descriptor(desc: &EndpointDescriptor, speed: DeviceSpeed) -> Result<Self> {
        let raw_mps = u16::from_le(desc.max_packet_size);
        let interval = desc.interval;

        // USB2 9.6.6: bits 12:11 of wMaxPacketSize give additional transactions per microframe.
        let max_packet_size = raw_mps & 0x07FF;
        let max_bytes_per_interval = if speed.is_high_speed() {
            let mult = 1 + u32::from((raw_mps >> 11) & 0x3);
            u32::from(max_packet_size) * mult
        } else {
            u32::from(max_packet_size)
        };

        Ok(Self {
            pipe_id: desc.pipe_id()?,
            ty: desc.ty(),
            max_packet_size,
            interval,
            max_bytes_per_interval,
        })
    }
    pub fn is_isoch(&self) -> bool {
        self.ty == EndpointTy::Isoch
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use core::mem;

    #[test]
    fn descriptor_size() {
        assert_eq!(mem::size_of::<EndpointDescriptor>(), 7);
    }

    #[test]
    fn parse_high_bandwidth_isoch_in() {
        // bEndpointAddress 0x81, isoch, 1024 bytes with two extra transactions, interval 1
        let raw = [7, 5, 0x81, 0x05, 0x00, 0x14, 1];
        let desc = EndpointDescriptor::from_bytes(&raw).unwrap();
        assert_eq!(desc.ty(), EndpointTy::Isoch);

        let info = PipeInfo::from_descriptor(&desc, DeviceSpeed::High).unwrap();
        assert!(info.pipe_id.is_in());
        assert_eq!(info.max_packet_size, 1024);
        assert_eq!(info.max_bytes_per_interval, 3072);
    }

    #[test]
    fn rejects_bad_pipe_ids() {
        assert!(PipeId::new(0x80).is_err());
        assert!(PipeId::new(0x00).is_err());
        assert!(PipeId::new(0x91).is_err());
        assert_eq!(PipeId::new(0x02).unwrap().direction(), EndpBinaryDirection::Out);
        assert_eq!(PipeId::new(0x82).unwrap().to_string(), "0x82");
    }

    #[test]
    fn rejects_other_descriptors() {
        let interface = [9, 4, 0, 0, 2, 0xFF, 0, 0, 0];
        assert!(EndpointDescriptor::from_bytes(&interface).is_err());
        assert!(EndpointDescriptor::from_bytes(&[7, 5]).is_err());
    }
}
