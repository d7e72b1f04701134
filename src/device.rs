//! USB device
//!
//! A [`UsbDevice`] owns a [`Driver`], the endpoint zero control pipe, and
//! the class [`Registry`]. Your USB interrupt handler translates controller
//! status into [`Event`]s, and hands them to [`UsbDevice::handle_event()`].
//!
//! The device answers the standard requests itself, after giving the class
//! that owns the target interface the first look. Class and vendor requests
//! go to the registered classes.

use crate::{
    class::{ClassId, Notification, Registry, RequestError, RequestResult, MAX_INTERFACES},
    control::{ControlPipe, ControlState, RequestHandler},
    descriptor::{self, Descriptors, EndpointInfo},
    driver::{self, endpoint_index, ep0_in, ep0_out, Driver, Speed, TransferKind, ENDPOINT_SLOTS},
    setup::{feature, request, SetupPacket},
};
use usb_device::{
    control::{Recipient, RequestType},
    device::UsbDeviceState,
    endpoint::EndpointAddress,
};

/// The EP0 max packet size used until the device descriptor says otherwise.
const DEFAULT_EP0_MAX_PACKET_SIZE: usize = 64;

bitflags::bitflags! {
    /// Device GET_STATUS bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceStatus : u16 {
        const SELF_POWERED = 1 << 0;
        const REMOTE_WAKEUP = 1 << 1;
    }
}

/// Endpoint GET_STATUS halt bit.
const ENDPOINT_HALTED: u16 = 1 << 0;

/// Bus activity, reported by the controller driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event<'d> {
    /// The host reset the bus.
    Reset,
    /// VBUS appeared.
    Connected,
    /// VBUS went away.
    Disconnected,
    Suspend,
    Resume,
    /// Start of frame.
    Sof,
    /// A setup packet arrived on EP0.
    Setup([u8; 8]),
    /// The controller sent `nbytes` on EP0 IN.
    Ep0In { nbytes: usize },
    /// The controller received `data` on EP0 OUT.
    Ep0Out { data: &'d [u8] },
    /// The controller sent `nbytes` on a non-zero IN endpoint.
    EpIn { ep: EndpointAddress, nbytes: usize },
    /// The controller received `data` on a non-zero OUT endpoint.
    EpOut { ep: EndpointAddress, data: &'d [u8] },
}

/// Device state behind the control pipe
struct DeviceCore<'h, const N: usize> {
    registry: Registry<'h, N>,
    descriptors: &'h dyn Descriptors,
    state: UsbDeviceState,
    /// State to restore on resume.
    suspended_from: Option<UsbDeviceState>,
    address: u8,
    /// Address waiting for the SET_ADDRESS status stage.
    pending_address: Option<u8>,
    configuration: u8,
    alternates: [u8; MAX_INTERFACES],
    status: DeviceStatus,
}

/// Copy as much of `data` as fits in `buf`.
fn reply(buf: &mut [u8], data: &[u8]) -> RequestResult {
    let len = data.len().min(buf.len());
    buf[..len].copy_from_slice(&data[..len]);
    Ok(len)
}

fn invalid<E>(_: E) -> RequestError {
    RequestError::Invalid
}

impl<'h, const N: usize> DeviceCore<'h, N> {
    fn speed(bus: &dyn Driver) -> Speed {
        bus.port_speed()
    }

    fn ep0_max_packet_size(&self, speed: Speed) -> usize {
        self.descriptors
            .get(descriptor::DEVICE, 0, speed)
            .and_then(|device| device.get(7))
            .map_or(DEFAULT_EP0_MAX_PACKET_SIZE, |&mps| usize::from(mps))
    }

    /// The descriptor hierarchy of the active configuration.
    fn active_configuration(&self, speed: Speed) -> Option<&'h [u8]> {
        if self.configuration == 0 {
            return None;
        }
        let descriptors: &'h dyn Descriptors = self.descriptors;
        descriptors.configuration(self.configuration, speed)
    }

    /// Open the endpoints of an alternate setting
    ///
    /// If an endpoint fails to open, the endpoints opened before it are
    /// closed again.
    fn open_alternate(
        bus: &mut dyn Driver,
        config: &[u8],
        interface: u8,
        alternate: u8,
    ) -> driver::Result<()> {
        for (opened, info) in descriptor::endpoints(config, interface, alternate).enumerate() {
            debug!(
                "OPEN EP{} {} MPS {}",
                info.address.index(),
                u8::from(info.address),
                info.max_packet_size
            );
            if let Err(err) = bus.ep_open(&info) {
                warn!("OPEN EP{} FAILED", info.address.index());
                for info in descriptor::endpoints(config, interface, alternate).take(opened) {
                    if bus.ep_close(info.address).is_err() {
                        warn!("CLOSE EP{} FAILED", info.address.index());
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn close_alternate(
        bus: &mut dyn Driver,
        config: &[u8],
        interface: u8,
        alternate: u8,
    ) -> driver::Result<()> {
        for info in descriptor::endpoints(config, interface, alternate) {
            bus.ep_close(info.address)?;
        }
        Ok(())
    }

    /// Close the endpoints of every interface's current alternate setting.
    fn close_configuration(&mut self, bus: &mut dyn Driver) {
        let Some(config) = self.active_configuration(Self::speed(bus)) else {
            return;
        };
        for iface in descriptor::interfaces(config) {
            let current = self.alternates.get(usize::from(iface.number)).copied();
            if current == Some(iface.alternate)
                && Self::close_alternate(bus, config, iface.number, iface.alternate).is_err()
            {
                warn!("CLOSE INTERFACE {} FAILED", iface.number);
            }
        }
    }

    fn open_ep0(&self, bus: &mut dyn Driver, max_packet_size: usize) {
        for address in [ep0_out(), ep0_in()] {
            let info = EndpointInfo {
                address,
                kind: TransferKind::Control,
                max_packet_size: max_packet_size as u16,
                interval: 0,
            };
            if bus.ep_open(&info).is_err() {
                error!("OPEN EP0 FAILED");
            }
        }
    }

    fn reset(&mut self, bus: &mut dyn Driver) {
        self.close_configuration(bus);
        self.state = UsbDeviceState::Default;
        self.suspended_from = None;
        self.address = 0;
        self.pending_address = None;
        self.configuration = 0;
        self.alternates = [0; MAX_INTERFACES];
        self.status.remove(DeviceStatus::REMOTE_WAKEUP);
    }

    fn configured(&self) -> bool {
        self.state == UsbDeviceState::Configured
    }

    /// The SET_ADDRESS status stage completed.
    fn apply_address(&mut self, bus: &mut dyn Driver) {
        let Some(address) = self.pending_address.take() else {
            return;
        };
        if bus.set_address(address).is_err() {
            error!("SET ADDRESS {} FAILED", address);
            return;
        }
        self.enter_address(address);
    }

    fn enter_address(&mut self, address: u8) {
        debug!("ADDRESS {}", address);
        self.address = address;
        self.state = if address == 0 {
            UsbDeviceState::Default
        } else {
            UsbDeviceState::Addressed
        };
    }

    fn standard_request(
        &mut self,
        bus: &mut dyn Driver,
        setup: &SetupPacket,
        buf: &mut [u8],
    ) -> RequestResult {
        match setup.recipient() {
            Recipient::Device => self.device_request(bus, setup, buf),
            Recipient::Interface => self.interface_request(bus, setup, buf),
            Recipient::Endpoint => self.endpoint_request(bus, setup, buf),
            _ => Err(RequestError::NotHandled),
        }
    }

    fn device_request(
        &mut self,
        bus: &mut dyn Driver,
        setup: &SetupPacket,
        buf: &mut [u8],
    ) -> RequestResult {
        match setup.request {
            request::GET_STATUS => reply(buf, &self.status.bits().to_le_bytes()),
            request::CLEAR_FEATURE | request::SET_FEATURE => {
                let enable = setup.request == request::SET_FEATURE;
                match setup.value {
                    feature::DEVICE_REMOTE_WAKEUP => {
                        self.status.set(DeviceStatus::REMOTE_WAKEUP, enable);
                        self.registry.notify(bus, Notification::RemoteWakeup(enable));
                        Ok(0)
                    }
                    // Test modes are for compliance fixtures, not for us.
                    _ => Err(RequestError::Invalid),
                }
            }
            request::SET_ADDRESS => {
                let address = setup.value;
                if address > 127 || self.configured() {
                    return Err(RequestError::Invalid);
                }
                let address = address as u8;
                if bus.set_address_before_status() {
                    bus.set_address(address).map_err(invalid)?;
                    self.enter_address(address);
                } else {
                    self.pending_address = Some(address);
                }
                Ok(0)
            }
            request::GET_DESCRIPTOR => {
                let descriptor = self
                    .descriptors
                    .get(
                        setup.descriptor_type(),
                        setup.descriptor_index(),
                        Self::speed(bus),
                    )
                    .ok_or(RequestError::Invalid)?;
                reply(buf, descriptor)
            }
            request::GET_CONFIGURATION => reply(buf, &[self.configuration]),
            request::SET_CONFIGURATION => self.set_configuration(bus, setup.value as u8),
            // SET_DESCRIPTOR, and anything unknown
            _ => Err(RequestError::Invalid),
        }
    }

    fn set_configuration(&mut self, bus: &mut dyn Driver, value: u8) -> RequestResult {
        if self.state == UsbDeviceState::Default {
            return Err(RequestError::Invalid);
        }
        let speed = Self::speed(bus);
        let config = match value {
            0 => None,
            value => Some(
                self.descriptors
                    .configuration(value, speed)
                    .ok_or(RequestError::Invalid)?,
            ),
        };

        let previous = self.configuration;
        self.close_configuration(bus);
        self.alternates = [0; MAX_INTERFACES];
        self.configuration = 0;
        self.state = UsbDeviceState::Addressed;

        if let Some(config) = config {
            let defaults = || descriptor::interfaces(config).filter(|iface| iface.alternate == 0);
            for (opened, iface) in defaults().enumerate() {
                if Self::open_alternate(bus, config, iface.number, 0).is_ok() {
                    continue;
                }
                error!("CONFIGURATION {} FAILED", value);
                for iface in defaults().take(opened) {
                    if Self::close_alternate(bus, config, iface.number, 0).is_err() {
                        warn!("CLOSE INTERFACE {} FAILED", iface.number);
                    }
                }
                if previous != 0 {
                    self.registry.notify(bus, Notification::Configured(0));
                }
                return Err(RequestError::Invalid);
            }
            if let Some(attributes) = descriptor::configuration_attributes(config) {
                self.status.set(
                    DeviceStatus::SELF_POWERED,
                    attributes & descriptor::ATTRIBUTE_SELF_POWERED != 0,
                );
            }
            self.configuration = value;
            self.state = UsbDeviceState::Configured;
        }
        debug!("CONFIGURATION {}", value);
        self.registry.notify(bus, Notification::Configured(value));
        Ok(0)
    }

    fn interface_request(
        &mut self,
        bus: &mut dyn Driver,
        setup: &SetupPacket,
        buf: &mut [u8],
    ) -> RequestResult {
        let config = match self.active_configuration(Self::speed(bus)) {
            Some(config) if self.configured() => config,
            _ => return Err(RequestError::Invalid),
        };
        let number = setup.interface();
        let current = *self
            .alternates
            .get(usize::from(number))
            .ok_or(RequestError::Invalid)?;
        if !descriptor::interfaces(config).any(|iface| iface.number == number) {
            return Err(RequestError::Invalid);
        }

        match setup.request {
            request::GET_STATUS => reply(buf, &[0, 0]),
            request::GET_INTERFACE => reply(buf, &[current]),
            request::SET_INTERFACE => {
                let alternate = setup.value as u8;
                if !descriptor::interfaces(config)
                    .any(|iface| iface.number == number && iface.alternate == alternate)
                {
                    return Err(RequestError::Invalid);
                }
                Self::close_alternate(bus, config, number, current).map_err(invalid)?;
                if Self::open_alternate(bus, config, number, alternate).is_err() {
                    warn!("INTERFACE {} ALTERNATE {} FAILED", number, alternate);
                    if Self::open_alternate(bus, config, number, current).is_err() {
                        error!("INTERFACE {} ALTERNATE {} RESTORE FAILED", number, current);
                    }
                    return Err(RequestError::Invalid);
                }
                self.alternates[usize::from(number)] = alternate;
                debug!("INTERFACE {} ALTERNATE {}", number, alternate);
                if let Some(owner) = self.registry.interface_owner(number) {
                    self.registry.notify_class(
                        owner,
                        bus,
                        Notification::SetInterface {
                            interface: number,
                            alternate,
                        },
                    );
                }
                Ok(0)
            }
            _ => Err(RequestError::Invalid),
        }
    }

    fn endpoint_request(
        &mut self,
        bus: &mut dyn Driver,
        setup: &SetupPacket,
        buf: &mut [u8],
    ) -> RequestResult {
        let ep = setup.endpoint();
        if endpoint_index(ep) >= ENDPOINT_SLOTS || (ep.index() != 0 && !self.configured()) {
            return Err(RequestError::Invalid);
        }

        match (setup.request, setup.value) {
            (request::GET_STATUS, _) => {
                let status = if bus.ep_is_stalled(ep) { ENDPOINT_HALTED } else { 0 };
                reply(buf, &status.to_le_bytes())
            }
            (request::CLEAR_FEATURE, feature::ENDPOINT_HALT) => {
                bus.ep_clear_stall(ep).map_err(invalid)?;
                if let Some(owner) = self.registry.endpoint_owner(ep) {
                    self.registry
                        .notify_class(owner, bus, Notification::ClearHalt(ep));
                }
                Ok(0)
            }
            (request::SET_FEATURE, feature::ENDPOINT_HALT) => {
                bus.ep_set_stall(ep).map_err(invalid)?;
                Ok(0)
            }
            // SYNCH_FRAME, unknown features, and anything unknown
            _ => Err(RequestError::Invalid),
        }
    }
}

impl<const N: usize> RequestHandler for DeviceCore<'_, N> {
    fn handle(
        &mut self,
        bus: &mut dyn Driver,
        setup: &SetupPacket,
        buf: &mut [u8],
    ) -> RequestResult {
        match setup.kind() {
            RequestType::Standard => match self.registry.custom_request(setup, buf) {
                Err(RequestError::NotHandled) => self.standard_request(bus, setup, buf),
                result => result,
            },
            RequestType::Class => self.registry.class_request(setup, buf),
            RequestType::Vendor => self.registry.vendor_request(setup, buf),
            RequestType::Reserved => Err(RequestError::Invalid),
        }
    }
}

/// A USB device
///
/// `N` is the maximum number of classes.
pub struct UsbDevice<'h, D, const N: usize = 8> {
    driver: D,
    ep0: ControlPipe,
    core: DeviceCore<'h, N>,
}

impl<'h, D: Driver, const N: usize> UsbDevice<'h, D, N> {
    /// Create a device that answers with `descriptors`, and routes class
    /// traffic through `registry`
    ///
    /// Register your classes before creating the device. Then, call
    /// [`init()`](UsbDevice::init).
    pub fn new(driver: D, descriptors: &'h dyn Descriptors, registry: Registry<'h, N>) -> Self {
        let mut core = DeviceCore {
            registry,
            descriptors,
            state: UsbDeviceState::Default,
            suspended_from: None,
            address: 0,
            pending_address: None,
            configuration: 0,
            alternates: [0; MAX_INTERFACES],
            status: DeviceStatus::empty(),
        };
        if let Some(config) = descriptors.configuration(1, driver.port_speed()) {
            let self_powered = descriptor::configuration_attributes(config)
                .is_some_and(|attributes| attributes & descriptor::ATTRIBUTE_SELF_POWERED != 0);
            core.status.set(DeviceStatus::SELF_POWERED, self_powered);
        }
        let mps = core.ep0_max_packet_size(driver.port_speed());
        UsbDevice {
            driver,
            ep0: ControlPipe::new(mps),
            core,
        }
    }

    /// Start the controller, and tell every class
    pub fn init(&mut self) -> driver::Result<()> {
        self.driver.init()?;
        self.core.registry.notify(&mut self.driver, Notification::Init);
        debug!("DEVICE INIT");
        Ok(())
    }

    /// Tell every class, then stop the controller
    pub fn deinit(&mut self) -> driver::Result<()> {
        self.core.registry.notify(&mut self.driver, Notification::Deinit);
        self.core.reset(&mut self.driver);
        debug!("DEVICE DEINIT");
        self.driver.deinit()
    }

    /// Process one bus event
    ///
    /// Call this from your USB interrupt handler, in the order that the
    /// controller reported the events.
    pub fn handle_event(&mut self, event: Event<'_>) {
        let bus: &mut dyn Driver = &mut self.driver;
        let core = &mut self.core;
        match event {
            Event::Reset => {
                debug!("RESET");
                core.reset(bus);
                let mps = core.ep0_max_packet_size(bus.port_speed());
                self.ep0.reset(mps);
                core.open_ep0(bus, self.ep0.max_packet_size());
                core.registry.notify(bus, Notification::Reset);
            }
            Event::Connected => {
                debug!("CONNECTED");
                core.registry.notify(bus, Notification::Connected);
            }
            Event::Disconnected => {
                debug!("DISCONNECTED");
                core.reset(bus);
                self.ep0.reset(self.ep0.max_packet_size());
                core.registry.notify(bus, Notification::Disconnected);
            }
            Event::Suspend => {
                if core.state != UsbDeviceState::Suspend {
                    core.suspended_from = Some(core.state);
                    core.state = UsbDeviceState::Suspend;
                }
                core.registry.notify(bus, Notification::Suspend);
            }
            Event::Resume => {
                if let Some(state) = core.suspended_from.take() {
                    core.state = state;
                }
                core.registry.notify(bus, Notification::Resume);
            }
            Event::Sof => core.registry.notify(bus, Notification::Sof),
            Event::Setup(raw) => self.ep0.setup(bus, core, raw),
            Event::Ep0In { nbytes } => {
                if let Some(setup) = self.ep0.in_complete(bus, nbytes) {
                    if setup.kind() == RequestType::Standard
                        && setup.recipient() == Recipient::Device
                        && setup.request == request::SET_ADDRESS
                    {
                        core.apply_address(bus);
                    }
                }
            }
            Event::Ep0Out { data } => {
                self.ep0.out_complete(bus, core, data);
            }
            Event::EpIn { ep, nbytes } => {
                if !core.registry.endpoint_in(bus, ep, nbytes) {
                    trace!("EP{} IN WITHOUT OWNER", ep.index());
                }
            }
            Event::EpOut { ep, data } => {
                if !core.registry.endpoint_out(bus, ep, data) {
                    trace!("EP{} OUT WITHOUT OWNER", ep.index());
                }
            }
        }
    }

    /// The device state, as seen by the host
    pub fn state(&self) -> UsbDeviceState {
        self.core.state
    }

    /// The address assigned by the host
    pub fn address(&self) -> u8 {
        self.core.address
    }

    /// The active configuration value, or zero
    pub fn configuration(&self) -> u8 {
        self.core.configuration
    }

    /// The active alternate setting of `interface`
    pub fn alternate(&self, interface: u8) -> Option<u8> {
        self.core.alternates.get(usize::from(interface)).copied()
    }

    /// The control transfer stage
    pub fn control_state(&self) -> ControlState {
        self.ep0.state()
    }

    /// Indicates if the host enabled remote wakeup
    pub fn remote_wakeup_enabled(&self) -> bool {
        self.core.status.contains(DeviceStatus::REMOTE_WAKEUP)
    }

    /// Report a self-powered device in GET_STATUS
    pub fn set_self_powered(&mut self, self_powered: bool) {
        self.core.status.set(DeviceStatus::SELF_POWERED, self_powered);
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Access the driver, for example to start transfers on class endpoints
    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Access the class registry
    pub fn registry_mut(&mut self) -> &mut Registry<'h, N> {
        &mut self.core.registry
    }

    /// Deliver `event` to one class, with access to the driver
    pub fn notify_class(&mut self, id: ClassId, event: Notification) {
        self.core.registry.notify_class(id, &mut self.driver, event);
    }

    /// Release the driver and the registry
    pub fn free(self) -> (D, Registry<'h, N>) {
        (self.driver, self.core.registry)
    }
}

impl<D: Driver, const N: usize> UsbDevice<'_, D, N> {
    /// Send data on a class IN endpoint, outside of a class callback
    pub fn write(&mut self, ep: EndpointAddress, data: &[u8]) -> driver::Result<()> {
        self.driver.ep_start_write(ep, data)
    }
}
