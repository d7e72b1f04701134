//! HID interface
//!
//! [`HidClass`] answers the HID descriptor requests and the HID class
//! requests for one interface. It sends input reports on its interrupt IN
//! endpoint whenever the endpoint is idle, and your [`HidReports`] has a
//! report ready.

use crate::{
    class::{
        ClassHandler, ClassId, Notification, Registry, RegistryError, RequestError, RequestResult,
    },
    driver::Driver,
    setup::{request as standard, SetupPacket},
};
use usb_device::endpoint::EndpointAddress;

/// HID class request codes
pub mod request {
    pub const GET_REPORT: u8 = 0x01;
    pub const GET_IDLE: u8 = 0x02;
    pub const GET_PROTOCOL: u8 = 0x03;
    pub const SET_REPORT: u8 = 0x09;
    pub const SET_IDLE: u8 = 0x0A;
    pub const SET_PROTOCOL: u8 = 0x0B;
}

/// HID descriptor type
pub const HID_DESCRIPTOR: u8 = 0x21;
/// Report descriptor type
pub const REPORT_DESCRIPTOR: u8 = 0x22;

/// The largest report the class moves in one transfer
pub const MAX_REPORT_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[repr(u8)]
pub enum Protocol {
    Boot = 0,
    Report = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[repr(u8)]
pub enum ReportType {
    Input = 1,
    Output = 2,
    Feature = 3,
}

impl ReportType {
    pub const fn from_u8(kind: u8) -> Option<Self> {
        match kind {
            1 => Some(ReportType::Input),
            2 => Some(ReportType::Output),
            3 => Some(ReportType::Feature),
            _ => None,
        }
    }
}

/// Application reports
pub trait HidReports {
    /// Produce the next input report, if one is ready
    ///
    /// Called when the IN endpoint is idle.
    fn next_input(&mut self, buf: &mut [u8]) -> Option<usize>;

    /// Answer GET_REPORT
    ///
    /// Return `None` to stall the request.
    fn get_report(&mut self, kind: ReportType, id: u8, buf: &mut [u8]) -> Option<usize>;

    /// Accept an output or feature report, from SET_REPORT or from the
    /// interrupt OUT endpoint
    fn set_report(&mut self, kind: ReportType, id: u8, data: &[u8]);
}

/// A HID interface
pub struct HidClass<'d, R> {
    interface: u8,
    in_ep: EndpointAddress,
    out_ep: Option<EndpointAddress>,
    hid_descriptor: &'d [u8],
    report_descriptor: &'d [u8],
    reports: R,
    /// Idle rate, in 4 ms units.
    idle: u8,
    protocol: Protocol,
    configured: bool,
    /// An input report is queued on the IN endpoint.
    in_busy: bool,
    staging: [u8; MAX_REPORT_LEN],
}

impl<'d, R: HidReports> HidClass<'d, R> {
    /// Create a HID interface
    ///
    /// `hid_descriptor` is the 9-byte HID descriptor that also appears in the
    /// configuration hierarchy.
    pub fn new(
        interface: u8,
        in_ep: EndpointAddress,
        hid_descriptor: &'d [u8],
        report_descriptor: &'d [u8],
        reports: R,
    ) -> Self {
        HidClass {
            interface,
            in_ep,
            out_ep: None,
            hid_descriptor,
            report_descriptor,
            reports,
            idle: 0,
            protocol: Protocol::Report,
            configured: false,
            in_busy: false,
            staging: [0; MAX_REPORT_LEN],
        }
    }

    /// Also receive output reports on an interrupt OUT endpoint
    pub fn with_out_endpoint(mut self, out_ep: EndpointAddress) -> Self {
        self.out_ep = Some(out_ep);
        self
    }

    /// Register this interface and its endpoints
    pub fn attach<'h, const N: usize>(
        &'h mut self,
        registry: &mut Registry<'h, N>,
    ) -> Result<ClassId, RegistryError>
    where
        'd: 'h,
        R: 'h,
    {
        let (interface, in_ep, out_ep) = (self.interface, self.in_ep, self.out_ep);
        let id = registry.register(self)?;
        registry.add_interface(id, interface)?;
        registry.add_endpoint(id, in_ep)?;
        if let Some(out_ep) = out_ep {
            registry.add_endpoint(id, out_ep)?;
        }
        Ok(id)
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// The idle rate, in 4 ms units
    pub fn idle(&self) -> u8 {
        self.idle
    }

    pub fn reports(&self) -> &R {
        &self.reports
    }

    pub fn reports_mut(&mut self) -> &mut R {
        &mut self.reports
    }

    fn restore_defaults(&mut self) {
        self.idle = 0;
        self.protocol = Protocol::Report;
        self.configured = false;
        self.in_busy = false;
    }

    /// Start the next input report, if the endpoint is free.
    fn poll_input(&mut self, bus: &mut dyn Driver) {
        if !self.configured || self.in_busy {
            return;
        }
        let Some(len) = self.reports.next_input(&mut self.staging) else {
            return;
        };
        let len = len.min(MAX_REPORT_LEN);
        match bus.ep_start_write(self.in_ep, &self.staging[..len]) {
            Ok(()) => self.in_busy = true,
            Err(_) => warn!("HID {} INPUT REPORT DROPPED", self.interface),
        }
    }

    fn prime_out(&mut self, bus: &mut dyn Driver) {
        if let Some(out_ep) = self.out_ep {
            if bus.ep_start_read(out_ep, MAX_REPORT_LEN).is_err() {
                warn!("HID {} OUT PRIME FAILED", self.interface);
            }
        }
    }
}

impl<R: HidReports> ClassHandler for HidClass<'_, R> {
    fn custom_request(&mut self, setup: &SetupPacket, buf: &mut [u8]) -> RequestResult {
        if setup.request != standard::GET_DESCRIPTOR {
            return Err(RequestError::NotHandled);
        }
        let descriptor = match setup.descriptor_type() {
            HID_DESCRIPTOR => self.hid_descriptor,
            REPORT_DESCRIPTOR => self.report_descriptor,
            _ => return Err(RequestError::NotHandled),
        };
        let len = descriptor.len().min(buf.len());
        buf[..len].copy_from_slice(&descriptor[..len]);
        Ok(len)
    }

    fn class_request(&mut self, setup: &SetupPacket, buf: &mut [u8]) -> RequestResult {
        let [id, kind] = setup.value.to_le_bytes();
        match setup.request {
            request::GET_REPORT => {
                let kind = ReportType::from_u8(kind).ok_or(RequestError::Invalid)?;
                self.reports
                    .get_report(kind, id, buf)
                    .map(|len| len.min(buf.len()))
                    .ok_or(RequestError::Invalid)
            }
            request::SET_REPORT => {
                let kind = ReportType::from_u8(kind).ok_or(RequestError::Invalid)?;
                self.reports.set_report(kind, id, buf);
                Ok(0)
            }
            request::GET_IDLE => {
                *buf.first_mut().ok_or(RequestError::Invalid)? = self.idle;
                Ok(1)
            }
            request::SET_IDLE => {
                // The high byte is the duration. Per-report rates collapse
                // into one.
                self.idle = kind;
                Ok(0)
            }
            request::GET_PROTOCOL => {
                *buf.first_mut().ok_or(RequestError::Invalid)? = self.protocol as u8;
                Ok(1)
            }
            request::SET_PROTOCOL => {
                self.protocol = match setup.value {
                    0 => Protocol::Boot,
                    1 => Protocol::Report,
                    _ => return Err(RequestError::Invalid),
                };
                debug!("HID {} PROTOCOL {}", self.interface, setup.value);
                Ok(0)
            }
            _ => {
                warn!("HID {} UNKNOWN REQUEST {}", self.interface, setup.request);
                Err(RequestError::NotHandled)
            }
        }
    }

    fn notify(&mut self, bus: &mut dyn Driver, event: Notification) {
        match event {
            Notification::Reset | Notification::Disconnected | Notification::Deinit => {
                self.restore_defaults()
            }
            Notification::Configured(0) => self.restore_defaults(),
            Notification::Configured(_) => {
                self.configured = true;
                self.in_busy = false;
                self.prime_out(bus);
            }
            Notification::ClearHalt(ep) if ep == self.in_ep => self.in_busy = false,
            Notification::Sof => self.poll_input(bus),
            _ => {}
        }
    }

    fn endpoint_out(&mut self, bus: &mut dyn Driver, ep: EndpointAddress, data: &[u8]) {
        if Some(ep) == self.out_ep {
            self.reports.set_report(ReportType::Output, 0, data);
            self.prime_out(bus);
        }
    }

    fn endpoint_in(&mut self, bus: &mut dyn Driver, ep: EndpointAddress, _: usize) {
        if ep == self.in_ep {
            self.in_busy = false;
            self.poll_input(bus);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{request, HidClass, HidReports, Protocol, ReportType, REPORT_DESCRIPTOR};
    use crate::{
        class::{ClassHandler, Notification, Registry, RequestError},
        descriptor::{tests as fixtures, DescriptorSet},
        device::{Event, UsbDevice},
        setup::{request as standard, SetupPacket},
        testing::{control_in, control_out, enumerate, MockDriver},
    };
    use std::{collections::VecDeque, vec::Vec};
    use usb_device::endpoint::EndpointAddress;

    const HID: [u8; 9] = [9, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, 6, 0];
    const REPORT: [u8; 6] = [0x05, 0x01, 0x09, 0x06, 0xA1, 0x01];

    #[derive(Default)]
    struct Keyboard {
        pending: VecDeque<[u8; 8]>,
        leds: Vec<(ReportType, u8, Vec<u8>)>,
    }

    impl HidReports for Keyboard {
        fn next_input(&mut self, buf: &mut [u8]) -> Option<usize> {
            let report = self.pending.pop_front()?;
            buf[..8].copy_from_slice(&report);
            Some(8)
        }

        fn get_report(&mut self, kind: ReportType, id: u8, buf: &mut [u8]) -> Option<usize> {
            (kind == ReportType::Input && id == 0).then(|| {
                buf[..8].fill(0);
                8
            })
        }

        fn set_report(&mut self, kind: ReportType, id: u8, data: &[u8]) {
            self.leds.push((kind, id, data.to_vec()));
        }
    }

    fn class_setup(request: u8, value: u16, length: u16) -> SetupPacket {
        let direction = if length > 0 && request < 0x08 { 0x80 } else { 0 };
        SetupPacket {
            request_type: direction | 0x21,
            request,
            value,
            index: 0,
            length,
        }
    }

    #[test]
    fn hid_requests() {
        let blob = fixtures::blob();
        let descriptors = DescriptorSet::new(&blob);
        let mut hid = HidClass::new(
            0,
            EndpointAddress::from(0x81),
            &HID,
            &REPORT,
            Keyboard::default(),
        );
        let mut registry = Registry::new();
        hid.attach(&mut registry).unwrap();
        let mut device: UsbDevice<'_, MockDriver, 2> =
            UsbDevice::new(MockDriver::new(), &descriptors, registry);
        enumerate(&mut device);

        let report_descriptor = SetupPacket {
            request_type: 0x81,
            request: standard::GET_DESCRIPTOR,
            value: u16::from(REPORT_DESCRIPTOR) << 8,
            index: 0,
            length: 0x40,
        };
        assert_eq!(control_in(&mut device, report_descriptor), Some(REPORT.to_vec()));
        let hid_descriptor = SetupPacket {
            value: 0x2100,
            ..report_descriptor
        };
        assert_eq!(control_in(&mut device, hid_descriptor), Some(HID.to_vec()));

        assert!(control_out(&mut device, class_setup(request::SET_IDLE, 0x7D00, 0), &[]));
        assert_eq!(control_in(&mut device, class_setup(request::GET_IDLE, 0, 1)), Some(vec![0x7D]));

        assert_eq!(
            control_in(&mut device, class_setup(request::GET_PROTOCOL, 0, 1)),
            Some(vec![1])
        );
        assert!(control_out(&mut device, class_setup(request::SET_PROTOCOL, 0, 0), &[]));
        assert_eq!(
            control_in(&mut device, class_setup(request::GET_PROTOCOL, 0, 1)),
            Some(vec![0])
        );
        assert!(!control_out(&mut device, class_setup(request::SET_PROTOCOL, 2, 0), &[]));

        assert_eq!(
            control_in(&mut device, class_setup(request::GET_REPORT, 0x0100, 8)),
            Some(vec![0; 8])
        );
        // No feature reports
        assert_eq!(control_in(&mut device, class_setup(request::GET_REPORT, 0x0300, 8)), None);

        // Caps lock LED
        assert!(control_out(&mut device, class_setup(request::SET_REPORT, 0x0200, 1), &[0x02]));

        // Bus reset restores the report protocol.
        device.handle_event(Event::Reset);
        drop(device);
        assert_eq!(hid.protocol(), Protocol::Report);
        assert_eq!(hid.idle(), 0);
        assert_eq!(hid.reports().leds, [(ReportType::Output, 0, vec![0x02])]);
    }

    #[test]
    fn unknown_class_request_is_not_handled() {
        let blob = fixtures::blob();
        let descriptors = DescriptorSet::new(&blob);
        let mut hid = HidClass::new(
            0,
            EndpointAddress::from(0x81),
            &HID,
            &REPORT,
            Keyboard::default(),
        );
        let unknown = SetupPacket {
            request_type: 0xA1,
            request: 0x55,
            value: 0,
            index: 0,
            length: 1,
        };
        let mut buf = [0; 8];
        assert_eq!(hid.class_request(&unknown, &mut buf), Err(RequestError::NotHandled));

        let mut registry = Registry::new();
        hid.attach(&mut registry).unwrap();
        let mut device: UsbDevice<'_, MockDriver, 2> =
            UsbDevice::new(MockDriver::new(), &descriptors, registry);
        enumerate(&mut device);
        assert_eq!(control_in(&mut device, unknown), None);
        assert_eq!(
            control_in(&mut device, class_setup(request::GET_IDLE, 0, 1)),
            Some(vec![0])
        );
    }

    #[test]
    fn input_reports_wait_for_idle_endpoint() {
        let blob = fixtures::blob();
        let descriptors = DescriptorSet::new(&blob);
        let mut keyboard = Keyboard::default();
        keyboard.pending.push_back([0, 0, 4, 0, 0, 0, 0, 0]);
        keyboard.pending.push_back([0; 8]);
        let in_ep = EndpointAddress::from(0x81);
        let mut hid = HidClass::new(0, in_ep, &HID, &REPORT, keyboard);
        let mut registry = Registry::new();
        hid.attach(&mut registry).unwrap();
        let mut device: UsbDevice<'_, MockDriver, 2> =
            UsbDevice::new(MockDriver::new(), &descriptors, registry);

        // Nothing before configuration.
        device.handle_event(Event::Sof);
        assert!(device.driver_mut().take_writes().is_empty());

        enumerate(&mut device);
        device.handle_event(Event::Sof);
        assert_eq!(
            device.driver_mut().take_writes(),
            [(in_ep, vec![0, 0, 4, 0, 0, 0, 0, 0])]
        );
        // Still busy
        device.handle_event(Event::Sof);
        assert!(device.driver_mut().take_writes().is_empty());

        device.handle_event(Event::EpIn { ep: in_ep, nbytes: 8 });
        assert_eq!(device.driver_mut().take_writes(), [(in_ep, vec![0; 8])]);
        device.handle_event(Event::EpIn { ep: in_ep, nbytes: 8 });
        device.handle_event(Event::Sof);
        assert!(device.driver_mut().take_writes().is_empty());
    }

    #[test]
    fn output_reports_on_interrupt_out() {
        let mut hid = HidClass::new(
            0,
            EndpointAddress::from(0x81),
            &HID,
            &REPORT,
            Keyboard::default(),
        )
        .with_out_endpoint(EndpointAddress::from(0x01));
        let mut bus = MockDriver::new();

        hid.notify(&mut bus, Notification::Configured(1));
        assert_eq!(bus.take_reads(), [(EndpointAddress::from(0x01), 64)]);
        hid.endpoint_out(&mut bus, EndpointAddress::from(0x01), &[0x05]);
        assert_eq!(bus.take_reads(), [(EndpointAddress::from(0x01), 64)]);
        assert_eq!(hid.reports().leds, [(ReportType::Output, 0, vec![0x05])]);

        // Not ours
        hid.endpoint_out(&mut bus, EndpointAddress::from(0x02), &[0x06]);
        assert_eq!(hid.reports().leds.len(), 1);
    }
}
