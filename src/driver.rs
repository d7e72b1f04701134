//! Controller driver interface
//!
//! The core doesn't touch hardware. Each USB controller family implements
//! [`Driver`], and reports bus activity back to the core as
//! [`Event`](crate::device::Event)s.
//!
//! Drivers must not block in any of these methods, since the core calls them
//! from the USB interrupt.

use crate::descriptor::EndpointInfo;
use usb_device::{endpoint::EndpointAddress, UsbDirection};

pub use usb_device::{Result, UsbError};

/// Direct index to the OUT control endpoint
pub fn ep0_out() -> EndpointAddress {
    // Constructor not currently const. Otherwise, this would
    // be a const.
    EndpointAddress::from_parts(0, UsbDirection::Out)
}

/// Direct index to the IN control endpoint
pub fn ep0_in() -> EndpointAddress {
    EndpointAddress::from_parts(0, UsbDirection::In)
}

/// The number of endpoint slots needed to index every endpoint address,
/// both directions
pub const ENDPOINT_SLOTS: usize = 16 * 2;

/// Converts an endpoint address into a dense index
///
/// OUT and IN endpoints with the same number sit next to each other.
pub fn endpoint_index(ep: EndpointAddress) -> usize {
    (ep.index() * 2) + (UsbDirection::In == ep.direction()) as usize
}

/// The speed negotiated with the host.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Speed {
    Low,
    #[default]
    Full,
    High,
    Super,
}

/// Endpoint transfer type.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferKind {
    /// Decode the transfer type from an endpoint's `bmAttributes`
    pub const fn from_attributes(attributes: u8) -> Self {
        match attributes & 0b11 {
            0 => TransferKind::Control,
            1 => TransferKind::Isochronous,
            2 => TransferKind::Bulk,
            _ => TransferKind::Interrupt,
        }
    }
}

/// A USB device controller
///
/// Transfers are asynchronous. `ep_start_write()` and `ep_start_read()`
/// queue a transfer and return right away. The driver reports completion
/// with an `Ep0In` / `EpIn` or `Ep0Out` / `EpOut` event.
pub trait Driver {
    /// Bring up the controller, and attach to the bus
    fn init(&mut self) -> Result<()>;

    /// Detach from the bus, and shut down the controller
    fn deinit(&mut self) -> Result<()>;

    /// Apply the device address assigned by the host
    fn set_address(&mut self, address: u8) -> Result<()>;

    /// Indicates that the controller latches the address itself, and needs
    /// it before the SET_ADDRESS status stage
    ///
    /// When this returns `false`, the core calls `set_address()` after the
    /// status stage completes.
    fn set_address_before_status(&self) -> bool {
        false
    }

    /// The speed negotiated during the last bus reset
    fn port_speed(&self) -> Speed {
        Speed::Full
    }

    /// Configure an endpoint described by `info`
    fn ep_open(&mut self, info: &EndpointInfo) -> Result<()>;

    /// Disable an endpoint, cancelling any queued transfer
    fn ep_close(&mut self, ep: EndpointAddress) -> Result<()>;

    fn ep_set_stall(&mut self, ep: EndpointAddress) -> Result<()>;

    /// Clear a stall, and reset the endpoint's data toggle
    fn ep_clear_stall(&mut self, ep: EndpointAddress) -> Result<()>;

    fn ep_is_stalled(&self, ep: EndpointAddress) -> bool;

    /// Queue `data` for the host on an IN endpoint
    ///
    /// The driver copies `data` before returning. An empty slice sends a
    /// zero-length packet.
    fn ep_start_write(&mut self, ep: EndpointAddress, data: &[u8]) -> Result<()>;

    /// Accept up to `max_len` bytes from the host on an OUT endpoint
    ///
    /// A `max_len` of zero expects a zero-length packet.
    fn ep_start_read(&mut self, ep: EndpointAddress, max_len: usize) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::{endpoint_index, ep0_in, ep0_out, TransferKind, ENDPOINT_SLOTS};
    use usb_device::{endpoint::EndpointAddress, UsbDirection};

    #[test]
    fn endpoint_indices_are_dense() {
        assert_eq!(endpoint_index(ep0_out()), 0);
        assert_eq!(endpoint_index(ep0_in()), 1);
        assert_eq!(endpoint_index(EndpointAddress::from(0x02)), 4);
        assert_eq!(endpoint_index(EndpointAddress::from(0x83)), 7);
        assert_eq!(
            endpoint_index(EndpointAddress::from_parts(15, UsbDirection::In)),
            ENDPOINT_SLOTS - 1
        );
    }

    #[test]
    fn transfer_kind_from_attributes() {
        assert_eq!(TransferKind::from_attributes(0x00), TransferKind::Control);
        assert_eq!(TransferKind::from_attributes(0x05), TransferKind::Isochronous);
        assert_eq!(TransferKind::from_attributes(0x02), TransferKind::Bulk);
        assert_eq!(TransferKind::from_attributes(0x03), TransferKind::Interrupt);
    }
}
