//! Control setup packets
//!
//! A [`SetupPacket`] is the 8-byte header that starts every control
//! transfer. The device side decodes one with [`SetupPacket::from_bytes()`].
//! Host-side code, and tests, format standard requests with the
//! constructors, like [`SetupPacket::get_descriptor()`].

use crate::descriptor;
use usb_device::{
    control::{Recipient, RequestType},
    endpoint::EndpointAddress,
    UsbDirection,
};

/// Standard request codes (`bRequest`)
pub mod request {
    pub const GET_STATUS: u8 = 0x00;
    pub const CLEAR_FEATURE: u8 = 0x01;
    pub const SET_FEATURE: u8 = 0x03;
    pub const SET_ADDRESS: u8 = 0x05;
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const SET_DESCRIPTOR: u8 = 0x07;
    pub const GET_CONFIGURATION: u8 = 0x08;
    pub const SET_CONFIGURATION: u8 = 0x09;
    pub const GET_INTERFACE: u8 = 0x0A;
    pub const SET_INTERFACE: u8 = 0x0B;
    pub const SYNCH_FRAME: u8 = 0x0C;
}

/// Standard feature selectors (`wValue` of SET_FEATURE and CLEAR_FEATURE)
pub mod feature {
    pub const ENDPOINT_HALT: u16 = 0;
    pub const DEVICE_REMOTE_WAKEUP: u16 = 1;
    pub const TEST_MODE: u16 = 2;
}

const DIRECTION_MASK: u8 = 0x80;
const TYPE_SHIFT: u8 = 5;
const TYPE_MASK: u8 = 0b11;
const RECIPIENT_MASK: u8 = 0b1_1111;

/// A control setup packet
///
/// Multi-byte fields are little endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct SetupPacket {
    /// `bmRequestType`
    pub request_type: u8,
    /// `bRequest`
    pub request: u8,
    /// `wValue`
    pub value: u16,
    /// `wIndex`
    pub index: u16,
    /// `wLength`
    pub length: u16,
}

impl SetupPacket {
    pub const SIZE: usize = 8;

    /// Decode a setup packet from its wire format
    pub const fn from_bytes(raw: [u8; 8]) -> Self {
        SetupPacket {
            request_type: raw[0],
            request: raw[1],
            value: u16::from_le_bytes([raw[2], raw[3]]),
            index: u16::from_le_bytes([raw[4], raw[5]]),
            length: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }

    /// Encode the setup packet in its wire format
    pub const fn to_bytes(&self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// Compose a `bmRequestType` value
    pub fn request_type_bits(
        direction: UsbDirection,
        kind: RequestType,
        recipient: Recipient,
    ) -> u8 {
        direction as u8 | (kind as u8) << TYPE_SHIFT | recipient as u8
    }

    /// The direction of the data stage
    ///
    /// Without a data stage, this is meaningless; see [`has_data()`](Self::has_data).
    pub fn direction(&self) -> UsbDirection {
        UsbDirection::from(self.request_type & DIRECTION_MASK)
    }

    /// Standard, class, vendor, or reserved
    pub fn kind(&self) -> RequestType {
        match (self.request_type >> TYPE_SHIFT) & TYPE_MASK {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    /// The recipient of the request
    pub fn recipient(&self) -> Recipient {
        match self.request_type & RECIPIENT_MASK {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Reserved,
        }
    }

    /// Indicates if the transfer has a data stage
    pub fn has_data(&self) -> bool {
        self.length > 0
    }

    /// The target interface, for interface requests
    pub fn interface(&self) -> u8 {
        self.index.to_le_bytes()[0]
    }

    /// The target endpoint, for endpoint requests
    pub fn endpoint(&self) -> EndpointAddress {
        EndpointAddress::from(self.index.to_le_bytes()[0])
    }

    /// The descriptor type, for GET_DESCRIPTOR and SET_DESCRIPTOR
    pub fn descriptor_type(&self) -> u8 {
        self.value.to_le_bytes()[1]
    }

    /// The descriptor index, for GET_DESCRIPTOR and SET_DESCRIPTOR
    pub fn descriptor_index(&self) -> u8 {
        self.value.to_le_bytes()[0]
    }

    fn standard(direction: UsbDirection, recipient: Recipient, request: u8) -> Self {
        SetupPacket {
            request_type: Self::request_type_bits(direction, RequestType::Standard, recipient),
            request,
            ..Default::default()
        }
    }

    pub fn get_status(recipient: Recipient, index: u16) -> Self {
        SetupPacket {
            index,
            length: 2,
            ..Self::standard(UsbDirection::In, recipient, request::GET_STATUS)
        }
    }

    pub fn clear_feature(recipient: Recipient, feature: u16, index: u16) -> Self {
        SetupPacket {
            value: feature,
            index,
            ..Self::standard(UsbDirection::Out, recipient, request::CLEAR_FEATURE)
        }
    }

    pub fn set_feature(recipient: Recipient, feature: u16, index: u16) -> Self {
        SetupPacket {
            value: feature,
            index,
            ..Self::standard(UsbDirection::Out, recipient, request::SET_FEATURE)
        }
    }

    pub fn set_address(address: u8) -> Self {
        SetupPacket {
            value: address.into(),
            ..Self::standard(UsbDirection::Out, Recipient::Device, request::SET_ADDRESS)
        }
    }

    /// Request `length` bytes of a descriptor
    ///
    /// `language` is the string language ID, or zero for other descriptors.
    pub fn get_descriptor(kind: u8, index: u8, language: u16, length: u16) -> Self {
        SetupPacket {
            value: u16::from_le_bytes([index, kind]),
            index: language,
            length,
            ..Self::standard(UsbDirection::In, Recipient::Device, request::GET_DESCRIPTOR)
        }
    }

    /// Request the 18-byte device descriptor
    pub fn get_device_descriptor() -> Self {
        Self::get_descriptor(descriptor::DEVICE, 0, 0, 18)
    }

    pub fn get_configuration() -> Self {
        SetupPacket {
            length: 1,
            ..Self::standard(UsbDirection::In, Recipient::Device, request::GET_CONFIGURATION)
        }
    }

    pub fn set_configuration(value: u8) -> Self {
        SetupPacket {
            value: value.into(),
            ..Self::standard(UsbDirection::Out, Recipient::Device, request::SET_CONFIGURATION)
        }
    }

    pub fn get_interface(interface: u8) -> Self {
        SetupPacket {
            index: interface.into(),
            length: 1,
            ..Self::standard(UsbDirection::In, Recipient::Interface, request::GET_INTERFACE)
        }
    }

    pub fn set_interface(interface: u8, alternate: u8) -> Self {
        SetupPacket {
            value: alternate.into(),
            index: interface.into(),
            ..Self::standard(UsbDirection::Out, Recipient::Interface, request::SET_INTERFACE)
        }
    }
}

impl From<[u8; 8]> for SetupPacket {
    fn from(raw: [u8; 8]) -> Self {
        Self::from_bytes(raw)
    }
}
