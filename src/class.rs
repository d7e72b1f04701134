//! Class request dispatch
//!
//! A USB class (HID, a vendor streaming interface, ...) implements
//! [`ClassHandler`], then registers with a [`Registry`]. The registry maps
//! interface numbers and endpoint addresses to the class that owns them. The
//! control pipeline asks the registry to route requests, notifications, and
//! endpoint completions.
//!
//! Every handler method has a default that doesn't handle anything, so
//! classes only implement what they need.

use crate::{
    driver::{endpoint_index, Driver, ENDPOINT_SLOTS},
    setup::SetupPacket,
};
use core::fmt;
use usb_device::{control::Recipient, endpoint::EndpointAddress};

pub mod display;
pub mod hid;

/// The highest interface number, plus one, that a registry tracks
pub const MAX_INTERFACES: usize = 16;

/// Why a handler didn't produce a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum RequestError {
    /// The handler doesn't recognize the request. The dispatcher may try
    /// another handler, and stalls if none accepts it.
    NotHandled,
    /// The handler recognized the request, but can't satisfy it. The
    /// dispatcher stalls immediately.
    Invalid,
}

/// The outcome of a request handler
///
/// For IN requests, `Ok` carries the number of response bytes written into
/// the buffer. For OUT requests, the count is ignored.
pub type RequestResult = core::result::Result<usize, RequestError>;

/// Bus and device events delivered to classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Notification {
    /// The device is starting up.
    Init,
    /// The device is shutting down.
    Deinit,
    /// The host reset the bus. All endpoints except EP0 are closed.
    Reset,
    Connected,
    Disconnected,
    Suspend,
    Resume,
    /// Start of frame.
    Sof,
    /// The host selected a configuration, and its endpoints are open.
    Configured(u8),
    /// The host selected an alternate setting of an interface owned by the
    /// class. The alternate setting's endpoints are open.
    SetInterface { interface: u8, alternate: u8 },
    /// The host cleared the halt of an endpoint owned by the class.
    ClearHalt(EndpointAddress),
    /// The host enabled or disabled remote wakeup.
    RemoteWakeup(bool),
}

/// A USB class
///
/// Request handlers receive the setup packet, and a buffer:
///
/// - for IN requests, the buffer is `wLength` bytes of space for the
///   response;
/// - for OUT requests, the buffer holds the data stage sent by the host.
pub trait ClassHandler {
    /// Handle a class-specific request directed at an interface or endpoint
    /// owned by the class
    fn class_request(&mut self, setup: &SetupPacket, buf: &mut [u8]) -> RequestResult {
        let _ = (setup, buf);
        Err(RequestError::NotHandled)
    }

    /// Intercept a standard request directed at an interface owned by the
    /// class, before the core handles it
    ///
    /// HID uses this for its class descriptors.
    fn custom_request(&mut self, setup: &SetupPacket, buf: &mut [u8]) -> RequestResult {
        let _ = (setup, buf);
        Err(RequestError::NotHandled)
    }

    /// Handle a vendor request
    ///
    /// Vendor requests are offered to every class, in registration order.
    fn vendor_request(&mut self, setup: &SetupPacket, buf: &mut [u8]) -> RequestResult {
        let _ = (setup, buf);
        Err(RequestError::NotHandled)
    }

    /// React to a bus or device event
    fn notify(&mut self, bus: &mut dyn Driver, event: Notification) {
        let _ = (bus, event);
    }

    /// An OUT transfer completed on an endpoint owned by the class
    ///
    /// Call `ep_start_read()` to accept more data.
    fn endpoint_out(&mut self, bus: &mut dyn Driver, ep: EndpointAddress, data: &[u8]) {
        let _ = (bus, ep, data);
    }

    /// An IN transfer of `nbytes` completed on an endpoint owned by the class
    fn endpoint_in(&mut self, bus: &mut dyn Driver, ep: EndpointAddress, nbytes: usize) {
        let _ = (bus, ep, nbytes);
    }
}

/// Identifies a class in a [`Registry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct ClassId(u8);

impl ClassId {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Registry errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum RegistryError {
    /// Every class slot is taken.
    Full,
    /// The class ID isn't registered.
    UnknownClass,
    /// The interface number is at least [`MAX_INTERFACES`].
    InvalidInterface(u8),
    /// Another class already owns the interface.
    DuplicateInterface(u8),
    /// Another class already owns the endpoint.
    DuplicateEndpoint(u8),
    /// The endpoint number is 16 or more.
    InvalidEndpoint(u8),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Full => f.write_str("class registry is full"),
            RegistryError::UnknownClass => f.write_str("class is not registered"),
            RegistryError::InvalidInterface(number) => {
                write!(f, "interface {number} is out of range")
            }
            RegistryError::DuplicateInterface(number) => {
                write!(f, "interface {number} is already registered")
            }
            RegistryError::DuplicateEndpoint(address) => {
                write!(f, "endpoint {address:#04x} is already registered")
            }
            RegistryError::InvalidEndpoint(address) => {
                write!(f, "endpoint {address:#04x} is out of range")
            }
        }
    }
}

/// Class storage, and the interface and endpoint routing tables
///
/// `N` is the maximum number of classes. The registry borrows each class for
/// `'h`; drop the registry, or [`unregister()`](Registry::unregister) a
/// class, to get it back.
pub struct Registry<'h, const N: usize = 8> {
    classes: [Option<&'h mut dyn ClassHandler>; N],
    interfaces: [Option<ClassId>; MAX_INTERFACES],
    endpoints: [Option<ClassId>; ENDPOINT_SLOTS],
}

impl<const N: usize> Default for Registry<'_, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'h, const N: usize> Registry<'h, N> {
    pub fn new() -> Self {
        Registry {
            classes: core::array::from_fn(|_| None),
            interfaces: [None; MAX_INTERFACES],
            endpoints: [None; ENDPOINT_SLOTS],
        }
    }

    /// Add a class, returning the ID used to attach its interfaces and
    /// endpoints
    pub fn register(&mut self, class: &'h mut dyn ClassHandler) -> Result<ClassId, RegistryError> {
        let (index, slot) = self
            .classes
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.is_none())
            .ok_or(RegistryError::Full)?;
        *slot = Some(class);
        let id = ClassId(index as u8);
        debug!("CLASS REGISTER {}", index);
        Ok(id)
    }

    /// Route requests for interface `number` to class `id`
    pub fn add_interface(&mut self, id: ClassId, number: u8) -> Result<(), RegistryError> {
        self.check(id)?;
        let slot = self
            .interfaces
            .get_mut(usize::from(number))
            .ok_or(RegistryError::InvalidInterface(number))?;
        if slot.is_some() {
            return Err(RegistryError::DuplicateInterface(number));
        }
        *slot = Some(id);
        Ok(())
    }

    /// Route completions and requests for endpoint `ep` to class `id`
    pub fn add_endpoint(&mut self, id: ClassId, ep: EndpointAddress) -> Result<(), RegistryError> {
        self.check(id)?;
        let slot = self
            .endpoints
            .get_mut(endpoint_index(ep))
            .ok_or(RegistryError::InvalidEndpoint(ep.into()))?;
        if slot.is_some() {
            return Err(RegistryError::DuplicateEndpoint(ep.into()));
        }
        *slot = Some(id);
        Ok(())
    }

    /// Remove a class, and every route to it
    pub fn unregister(&mut self, id: ClassId) -> Result<&'h mut dyn ClassHandler, RegistryError> {
        let class = self
            .classes
            .get_mut(id.index())
            .and_then(Option::take)
            .ok_or(RegistryError::UnknownClass)?;
        for slot in self.interfaces.iter_mut().chain(self.endpoints.iter_mut()) {
            if *slot == Some(id) {
                *slot = None;
            }
        }
        debug!("CLASS UNREGISTER {}", id.index());
        Ok(class)
    }

    fn check(&self, id: ClassId) -> Result<(), RegistryError> {
        match self.classes.get(id.index()) {
            Some(Some(_)) => Ok(()),
            _ => Err(RegistryError::UnknownClass),
        }
    }

    fn class(&mut self, id: ClassId) -> Option<&mut (dyn ClassHandler + 'h)> {
        self.classes.get_mut(id.index())?.as_deref_mut()
    }

    /// The class that owns interface `number`
    pub fn interface_owner(&self, number: u8) -> Option<ClassId> {
        self.interfaces.get(usize::from(number)).copied().flatten()
    }

    /// The class that owns endpoint `ep`
    pub fn endpoint_owner(&self, ep: EndpointAddress) -> Option<ClassId> {
        self.endpoints.get(endpoint_index(ep)).copied().flatten()
    }

    /// Offer a standard interface request to the class that owns the
    /// interface
    pub fn custom_request(&mut self, setup: &SetupPacket, buf: &mut [u8]) -> RequestResult {
        if setup.recipient() != Recipient::Interface {
            return Err(RequestError::NotHandled);
        }
        match self.interface_owner(setup.interface()) {
            Some(id) => self
                .class(id)
                .map_or(Err(RequestError::NotHandled), |class| {
                    class.custom_request(setup, buf)
                }),
            None => Err(RequestError::NotHandled),
        }
    }

    /// Route a class request by its recipient
    pub fn class_request(&mut self, setup: &SetupPacket, buf: &mut [u8]) -> RequestResult {
        let owner = match setup.recipient() {
            Recipient::Interface => self.interface_owner(setup.interface()),
            Recipient::Endpoint => self.endpoint_owner(setup.endpoint()),
            _ => None,
        };
        match owner.and_then(|id| self.class(id)) {
            Some(class) => class.class_request(setup, buf),
            None => {
                debug!("CLASS REQUEST WITHOUT OWNER {}", setup.index);
                Err(RequestError::NotHandled)
            }
        }
    }

    /// Offer a vendor request to every class, in registration order
    ///
    /// The first answer other than `NotHandled` wins.
    pub fn vendor_request(&mut self, setup: &SetupPacket, buf: &mut [u8]) -> RequestResult {
        for class in self.classes.iter_mut().flatten() {
            match class.vendor_request(setup, buf) {
                Err(RequestError::NotHandled) => continue,
                result => return result,
            }
        }
        Err(RequestError::NotHandled)
    }

    /// Deliver `event` to every class
    pub fn notify(&mut self, bus: &mut dyn Driver, event: Notification) {
        for class in self.classes.iter_mut().flatten() {
            class.notify(bus, event);
        }
    }

    /// Deliver `event` to one class
    pub fn notify_class(&mut self, id: ClassId, bus: &mut dyn Driver, event: Notification) {
        if let Some(class) = self.class(id) {
            class.notify(bus, event);
        }
    }

    /// Route an OUT completion; returns `false` if no class owns `ep`
    pub fn endpoint_out(&mut self, bus: &mut dyn Driver, ep: EndpointAddress, data: &[u8]) -> bool {
        match self.endpoint_owner(ep).and_then(|id| self.class(id)) {
            Some(class) => {
                class.endpoint_out(bus, ep, data);
                true
            }
            None => false,
        }
    }

    /// Route an IN completion; returns `false` if no class owns `ep`
    pub fn endpoint_in(
        &mut self,
        bus: &mut dyn Driver,
        ep: EndpointAddress,
        nbytes: usize,
    ) -> bool {
        match self.endpoint_owner(ep).and_then(|id| self.class(id)) {
            Some(class) => {
                class.endpoint_in(bus, ep, nbytes);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ClassHandler, Notification, Registry, RegistryError, RequestError, RequestResult,
        MAX_INTERFACES,
    };
    use crate::{setup::SetupPacket, testing::MockDriver};
    use std::{cell::RefCell, vec::Vec};
    use usb_device::endpoint::EndpointAddress;

    /// Answers with a fixed byte, and records what it sees.
    struct Recorder<'t> {
        tag: u8,
        vendor: RequestResult,
        log: &'t RefCell<Vec<(u8, &'static str)>>,
    }

    impl<'t> Recorder<'t> {
        fn new(tag: u8, log: &'t RefCell<Vec<(u8, &'static str)>>) -> Self {
            Recorder {
                tag,
                vendor: Err(RequestError::NotHandled),
                log,
            }
        }
    }

    impl ClassHandler for Recorder<'_> {
        fn class_request(&mut self, _: &SetupPacket, buf: &mut [u8]) -> RequestResult {
            self.log.borrow_mut().push((self.tag, "class"));
            buf[0] = self.tag;
            Ok(1)
        }
        fn custom_request(&mut self, _: &SetupPacket, _: &mut [u8]) -> RequestResult {
            self.log.borrow_mut().push((self.tag, "custom"));
            Err(RequestError::NotHandled)
        }
        fn vendor_request(&mut self, _: &SetupPacket, buf: &mut [u8]) -> RequestResult {
            self.log.borrow_mut().push((self.tag, "vendor"));
            if self.vendor.is_ok() {
                buf[0] = self.tag;
            }
            self.vendor
        }
        fn notify(&mut self, _: &mut dyn crate::driver::Driver, event: Notification) {
            if event == Notification::Reset {
                self.log.borrow_mut().push((self.tag, "reset"));
            }
        }
        fn endpoint_out(
            &mut self,
            _: &mut dyn crate::driver::Driver,
            _: EndpointAddress,
            _: &[u8],
        ) {
            self.log.borrow_mut().push((self.tag, "out"));
        }
    }

    fn class_setup(request_type: u8, index: u16) -> SetupPacket {
        SetupPacket {
            request_type,
            request: 0x01,
            value: 0,
            index,
            length: 1,
        }
    }

    #[test]
    fn routes_by_interface_and_endpoint() {
        let log = RefCell::new(Vec::new());
        let mut a = Recorder::new(0xA, &log);
        let mut b = Recorder::new(0xB, &log);
        let mut registry: Registry<4> = Registry::new();
        let id_a = registry.register(&mut a).unwrap();
        let id_b = registry.register(&mut b).unwrap();
        registry.add_interface(id_a, 0).unwrap();
        registry.add_interface(id_b, 1).unwrap();
        registry.add_endpoint(id_b, EndpointAddress::from(0x81)).unwrap();

        let mut buf = [0; 8];
        // Class, interface 1
        assert_eq!(registry.class_request(&class_setup(0xA1, 1), &mut buf), Ok(1));
        assert_eq!(buf[0], 0xB);
        // Class, interface 0
        assert_eq!(registry.class_request(&class_setup(0xA1, 0), &mut buf), Ok(1));
        assert_eq!(buf[0], 0xA);
        // Class, endpoint 0x81
        assert_eq!(registry.class_request(&class_setup(0xA2, 0x81), &mut buf), Ok(1));
        assert_eq!(buf[0], 0xB);
        // Class, unknown interface, and device recipient
        assert_eq!(
            registry.class_request(&class_setup(0xA1, 5), &mut buf),
            Err(RequestError::NotHandled)
        );
        assert_eq!(
            registry.class_request(&class_setup(0xA0, 0), &mut buf),
            Err(RequestError::NotHandled)
        );
        // Class, endpoint numbers past the routing table
        for index in [0x10, 0x7F, 0xFF] {
            assert_eq!(
                registry.class_request(&class_setup(0xA2, index), &mut buf),
                Err(RequestError::NotHandled)
            );
        }

        let mut bus = MockDriver::new();
        assert!(registry.endpoint_out(&mut bus, EndpointAddress::from(0x81), &[]));
        assert!(!registry.endpoint_out(&mut bus, EndpointAddress::from(0x01), &[]));

        drop(registry);
        assert_eq!(
            *log.borrow(),
            [(0xB, "class"), (0xA, "class"), (0xB, "class"), (0xB, "out")]
        );
    }

    #[test]
    fn custom_requests_only_for_interfaces() {
        let log = RefCell::new(Vec::new());
        let mut a = Recorder::new(0xA, &log);
        let mut registry: Registry<2> = Registry::new();
        let id = registry.register(&mut a).unwrap();
        registry.add_interface(id, 3).unwrap();

        let mut buf = [0; 8];
        let to_interface = SetupPacket::get_interface(3);
        assert_eq!(
            registry.custom_request(&to_interface, &mut buf),
            Err(RequestError::NotHandled)
        );
        let to_device = SetupPacket::get_configuration();
        assert_eq!(
            registry.custom_request(&to_device, &mut buf),
            Err(RequestError::NotHandled)
        );
        drop(registry);
        assert_eq!(*log.borrow(), [(0xA, "custom")]);
    }

    #[test]
    fn vendor_first_answer_wins() {
        let log = RefCell::new(Vec::new());
        let mut a = Recorder::new(0xA, &log);
        let mut b = Recorder::new(0xB, &log);
        let mut c = Recorder::new(0xC, &log);
        b.vendor = Ok(1);
        c.vendor = Ok(1);

        let mut registry: Registry<4> = Registry::new();
        registry.register(&mut a).unwrap();
        registry.register(&mut b).unwrap();
        registry.register(&mut c).unwrap();

        let mut buf = [0; 1];
        assert_eq!(registry.vendor_request(&class_setup(0xC0, 0), &mut buf), Ok(1));
        assert_eq!(buf[0], 0xB);
        drop(registry);
        assert_eq!(*log.borrow(), [(0xA, "vendor"), (0xB, "vendor")]);
    }

    #[test]
    fn vendor_invalid_stops_dispatch() {
        let log = RefCell::new(Vec::new());
        let mut a = Recorder::new(0xA, &log);
        let mut b = Recorder::new(0xB, &log);
        a.vendor = Err(RequestError::Invalid);
        b.vendor = Ok(1);

        let mut registry: Registry<2> = Registry::new();
        registry.register(&mut a).unwrap();
        registry.register(&mut b).unwrap();

        let mut buf = [0; 1];
        assert_eq!(
            registry.vendor_request(&class_setup(0x40, 0), &mut buf),
            Err(RequestError::Invalid)
        );
        drop(registry);
        assert_eq!(*log.borrow(), [(0xA, "vendor")]);
    }

    #[test]
    fn registration_errors() {
        let log = RefCell::new(Vec::new());
        let mut a = Recorder::new(0xA, &log);
        let mut b = Recorder::new(0xB, &log);
        let mut c = Recorder::new(0xC, &log);
        let mut d = Recorder::new(0xD, &log);

        let mut registry: Registry<2> = Registry::new();
        let id_a = registry.register(&mut a).unwrap();
        let id_b = registry.register(&mut b).unwrap();
        assert_eq!(registry.register(&mut c).err(), Some(RegistryError::Full));

        registry.add_interface(id_a, 0).unwrap();
        assert_eq!(
            registry.add_interface(id_b, 0),
            Err(RegistryError::DuplicateInterface(0))
        );
        assert_eq!(
            registry.add_interface(id_b, MAX_INTERFACES as u8),
            Err(RegistryError::InvalidInterface(MAX_INTERFACES as u8))
        );
        registry.add_endpoint(id_a, EndpointAddress::from(0x02)).unwrap();
        assert_eq!(
            registry.add_endpoint(id_b, EndpointAddress::from(0x02)),
            Err(RegistryError::DuplicateEndpoint(0x02))
        );
        // Same number, other direction
        registry.add_endpoint(id_b, EndpointAddress::from(0x82)).unwrap();
        assert_eq!(
            registry.add_endpoint(id_b, EndpointAddress::from(0x90)),
            Err(RegistryError::InvalidEndpoint(0x90))
        );

        assert!(registry.unregister(id_a).is_ok());
        assert_eq!(registry.interface_owner(0), None);
        assert_eq!(registry.endpoint_owner(EndpointAddress::from(0x02)), None);
        assert_eq!(registry.add_interface(id_a, 1), Err(RegistryError::UnknownClass));
        assert!(registry.unregister(id_a).is_err());

        // The freed slot is reused.
        assert_eq!(registry.register(&mut d), Ok(id_a));
    }

    #[test]
    fn notifications_reach_every_class() {
        let log = RefCell::new(Vec::new());
        let mut a = Recorder::new(0xA, &log);
        let mut b = Recorder::new(0xB, &log);
        let mut registry: Registry<2> = Registry::new();
        registry.register(&mut a).unwrap();
        let id_b = registry.register(&mut b).unwrap();

        let mut bus = MockDriver::new();
        registry.notify(&mut bus, Notification::Reset);
        registry.notify_class(id_b, &mut bus, Notification::Reset);
        drop(registry);
        assert_eq!(*log.borrow(), [(0xA, "reset"), (0xB, "reset"), (0xB, "reset")]);
    }
}
