//! Descriptor lookup
//!
//! The control pipeline answers GET_DESCRIPTOR, and opens endpoints on
//! SET_CONFIGURATION, by looking through descriptors that you supply. This
//! module doesn't build descriptors. Build them at compile time, or with your
//! favorite descriptor builder, and hand over the bytes.

use crate::driver::{Speed, TransferKind};
use usb_device::endpoint::EndpointAddress;

pub const DEVICE: u8 = 0x01;
pub const CONFIGURATION: u8 = 0x02;
pub const STRING: u8 = 0x03;
pub const INTERFACE: u8 = 0x04;
pub const ENDPOINT: u8 = 0x05;
pub const DEVICE_QUALIFIER: u8 = 0x06;
pub const OTHER_SPEED_CONFIGURATION: u8 = 0x07;
pub const INTERFACE_ASSOCIATION: u8 = 0x0B;
pub const BOS: u8 = 0x0F;

/// A source of descriptors
pub trait Descriptors {
    /// Returns the descriptor of type `kind` at `index`, for a bus running
    /// at `speed`
    ///
    /// For configuration-like descriptors, the slice spans the complete
    /// descriptor hierarchy, `wTotalLength` bytes. Return `None` if there's
    /// no such descriptor.
    fn get(&self, kind: u8, index: u8, speed: Speed) -> Option<&[u8]>;

    /// Returns the complete configuration descriptor with `bConfigurationValue`
    /// equal to `value`
    fn configuration(&self, value: u8, speed: Speed) -> Option<&[u8]> {
        (0..=u8::MAX)
            .map_while(|index| self.get(CONFIGURATION, index, speed))
            .find(|config| configuration_value(config) == Some(value))
    }
}

/// Descriptors laid out back to back in a byte slice
///
/// This is the layout that descriptor tables usually take: the device
/// descriptor, then each configuration hierarchy, then the string and BOS
/// descriptors. Supply a separate blob for high speed if your configuration
/// differs between speeds.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorSet<'d> {
    full_speed: &'d [u8],
    high_speed: Option<&'d [u8]>,
}

impl<'d> DescriptorSet<'d> {
    /// Use the same descriptors at every speed
    pub const fn new(descriptors: &'d [u8]) -> Self {
        DescriptorSet {
            full_speed: descriptors,
            high_speed: None,
        }
    }

    /// Use `high_speed` when the bus runs at high speed
    pub const fn with_high_speed(self, high_speed: &'d [u8]) -> Self {
        DescriptorSet {
            high_speed: Some(high_speed),
            ..self
        }
    }

    fn blob(&self, speed: Speed) -> &'d [u8] {
        match (speed, self.high_speed) {
            (Speed::High, Some(high_speed)) => high_speed,
            _ => self.full_speed,
        }
    }
}

/// Descriptor types whose `wTotalLength` covers a hierarchy.
fn has_total_length(kind: u8) -> bool {
    matches!(kind, CONFIGURATION | OTHER_SPEED_CONFIGURATION | BOS)
}

impl Descriptors for DescriptorSet<'_> {
    fn get(&self, kind: u8, index: u8, speed: Speed) -> Option<&[u8]> {
        let blob = self.blob(speed);
        let mut offset = 0;
        let mut seen = 0;
        for descriptor in DescriptorIter::new(blob) {
            let at = offset;
            offset += descriptor.len();
            if descriptor[1] != kind {
                continue;
            }
            if seen != index {
                seen += 1;
                continue;
            }
            if has_total_length(kind) && descriptor.len() >= 4 {
                let total = u16::from_le_bytes([descriptor[2], descriptor[3]]) as usize;
                return blob.get(at..at + total);
            }
            return Some(descriptor);
        }
        None
    }
}

/// Walks a descriptor blob, one descriptor at a time
///
/// Iteration stops at the end of the blob, at a descriptor with a zero
/// `bLength`, or at a descriptor that claims to run past the end.
#[derive(Debug, Clone)]
pub struct DescriptorIter<'d> {
    remaining: &'d [u8],
}

impl<'d> DescriptorIter<'d> {
    pub const fn new(blob: &'d [u8]) -> Self {
        DescriptorIter { remaining: blob }
    }
}

impl<'d> Iterator for DescriptorIter<'d> {
    type Item = &'d [u8];
    fn next(&mut self) -> Option<&'d [u8]> {
        let len = usize::from(*self.remaining.first()?);
        if len < 2 || len > self.remaining.len() {
            self.remaining = &[];
            return None;
        }
        let (descriptor, rest) = self.remaining.split_at(len);
        self.remaining = rest;
        Some(descriptor)
    }
}

/// An endpoint described by an endpoint descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: EndpointAddress,
    pub kind: TransferKind,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointInfo {
    /// Parse a 7-byte endpoint descriptor
    pub fn parse(descriptor: &[u8]) -> Option<Self> {
        match *descriptor {
            [len, ENDPOINT, address, attributes, mps_lo, mps_hi, interval, ..] if len >= 7 => {
                Some(EndpointInfo {
                    address: EndpointAddress::from(address),
                    kind: TransferKind::from_attributes(attributes),
                    max_packet_size: u16::from_le_bytes([mps_lo, mps_hi]),
                    interval,
                })
            }
            _ => None,
        }
    }
}

/// An interface descriptor, and the endpoint descriptors that follow it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub number: u8,
    pub alternate: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

impl InterfaceInfo {
    fn parse(descriptor: &[u8]) -> Option<Self> {
        match *descriptor {
            [len, INTERFACE, number, alternate, _, class, subclass, protocol, ..] if len >= 9 => {
                Some(InterfaceInfo {
                    number,
                    alternate,
                    class,
                    subclass,
                    protocol,
                })
            }
            _ => None,
        }
    }
}

/// Iterates the interface descriptors in a configuration hierarchy
pub fn interfaces(config: &[u8]) -> impl Iterator<Item = InterfaceInfo> + '_ {
    DescriptorIter::new(config).filter_map(InterfaceInfo::parse)
}

/// Iterates the endpoints of `interface`, alternate setting `alternate`, in
/// a configuration hierarchy
pub fn endpoints(
    config: &[u8],
    interface: u8,
    alternate: u8,
) -> impl Iterator<Item = EndpointInfo> + '_ {
    let mut selected = false;
    DescriptorIter::new(config).filter_map(move |descriptor| {
        if let Some(info) = InterfaceInfo::parse(descriptor) {
            selected = info.number == interface && info.alternate == alternate;
            None
        } else if selected {
            EndpointInfo::parse(descriptor)
        } else {
            None
        }
    })
}

/// Returns the `bConfigurationValue` of a configuration descriptor
pub fn configuration_value(config: &[u8]) -> Option<u8> {
    match *config {
        [len, CONFIGURATION, _, _, _, value, ..] if len >= 9 => Some(value),
        _ => None,
    }
}

/// Returns `bmAttributes` of a configuration descriptor
pub fn configuration_attributes(config: &[u8]) -> Option<u8> {
    match *config {
        [len, CONFIGURATION, _, _, _, _, _, attributes, ..] if len >= 9 => Some(attributes),
        _ => None,
    }
}

/// Self-powered bit of the configuration `bmAttributes`
pub const ATTRIBUTE_SELF_POWERED: u8 = 1 << 6;

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use usb_device::UsbDirection;

    pub const DEVICE_DESCRIPTOR: [u8; 18] = [
        18, DEVICE, 0x00, 0x02, 0x00, 0x00, 0x00, 64, 0x09, 0x12, 0x01, 0x00, 0x00, 0x01, 1, 2, 0,
        1,
    ];

    /// One configuration: interface 0 with one interrupt IN endpoint, and
    /// interface 1 with no endpoints at alternate 0, and bulk endpoints at
    /// alternate 1.
    pub const CONFIG: [u8; 55] = [
        // Configuration, wTotalLength = 55
        9, CONFIGURATION, 55, 0, 2, 1, 0, 0xC0, 50,
        // Interface 0, alt 0, 1 endpoint, HID
        9, INTERFACE, 0, 0, 1, 0x03, 0x00, 0x00, 0,
        // EP 0x81, interrupt, 8 bytes, 10 ms
        7, ENDPOINT, 0x81, 0x03, 8, 0, 10,
        // Interface 1, alt 0, no endpoints, vendor
        9, INTERFACE, 1, 0, 0, 0xFF, 0x00, 0x00, 0,
        // Interface 1, alt 1, 1 endpoint, vendor
        9, INTERFACE, 1, 1, 1, 0xFF, 0x00, 0x00, 0,
        // EP 0x02, bulk, 64 bytes
        7, ENDPOINT, 0x02, 0x02, 64, 0, 0,
        // Trailing class descriptor inside the hierarchy
        5, 0x24, 0x01, 0x02, 0x03,
    ];

    pub const LANGUAGES: [u8; 4] = [4, STRING, 0x09, 0x04];

    pub fn blob() -> Vec<u8> {
        let mut blob = Vec::new();
        blob.extend_from_slice(&DEVICE_DESCRIPTOR);
        blob.extend_from_slice(&CONFIG);
        blob.extend_from_slice(&LANGUAGES);
        blob
    }

    #[test]
    fn lookup_by_type_and_index() {
        let blob = blob();
        let set = DescriptorSet::new(&blob);
        assert_eq!(set.get(DEVICE, 0, Speed::Full), Some(&DEVICE_DESCRIPTOR[..]));
        assert_eq!(set.get(CONFIGURATION, 0, Speed::Full), Some(&CONFIG[..]));
        assert_eq!(set.get(STRING, 0, Speed::Full), Some(&LANGUAGES[..]));
        assert_eq!(set.get(STRING, 1, Speed::Full), None);
        assert_eq!(set.get(CONFIGURATION, 1, Speed::Full), None);
        assert_eq!(set.get(BOS, 0, Speed::Full), None);
        assert_eq!(set.configuration(1, Speed::Full), Some(&CONFIG[..]));
        assert_eq!(set.configuration(2, Speed::Full), None);
        assert_eq!(set.configuration(0, Speed::Full), None);
    }

    #[test]
    fn high_speed_blob() {
        let full = blob();
        let high = [18, DEVICE, 0x00, 0x02, 0, 0, 0, 64, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        let set = DescriptorSet::new(&full).with_high_speed(&high);
        assert_eq!(set.get(DEVICE, 0, Speed::High), Some(&high[..]));
        assert_eq!(set.get(DEVICE, 0, Speed::Full), Some(&DEVICE_DESCRIPTOR[..]));
        assert_eq!(set.get(CONFIGURATION, 0, Speed::High), None);
    }

    #[test]
    fn malformed_descriptors_stop_iteration() {
        let blob = [4, STRING, 0x09, 0x04, 0, DEVICE, 1, 2];
        assert_eq!(DescriptorIter::new(&blob).count(), 1);
        let blob = [4, STRING, 0x09, 0x04, 9, DEVICE, 1, 2];
        assert_eq!(DescriptorIter::new(&blob).count(), 1);
    }

    #[test]
    fn endpoints_by_alternate_setting() {
        let none: Vec<_> = endpoints(&CONFIG, 1, 0).collect();
        assert!(none.is_empty());

        let bulk: Vec<_> = endpoints(&CONFIG, 1, 1).collect();
        assert_eq!(
            bulk,
            [EndpointInfo {
                address: EndpointAddress::from_parts(2, UsbDirection::Out),
                kind: TransferKind::Bulk,
                max_packet_size: 64,
                interval: 0,
            }]
        );

        let interrupt: Vec<_> = endpoints(&CONFIG, 0, 0).collect();
        assert_eq!(interrupt.len(), 1);
        assert_eq!(interrupt[0].kind, TransferKind::Interrupt);
        assert_eq!(interrupt[0].interval, 10);

        assert_eq!(interfaces(&CONFIG).count(), 3);
        assert_eq!(configuration_value(&CONFIG), Some(1));
        assert_eq!(
            configuration_attributes(&CONFIG).map(|attr| attr & ATTRIBUTE_SELF_POWERED),
            Some(ATTRIBUTE_SELF_POWERED)
        );
    }
}
