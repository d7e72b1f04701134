//! Test doubles

use crate::{
    control::ControlState,
    descriptor::EndpointInfo,
    device::{Event, UsbDevice},
    driver::{endpoint_index, ep0_in, ep0_out, Driver, Result, Speed, UsbError, ENDPOINT_SLOTS},
    setup::SetupPacket,
};
use std::vec::Vec;
use usb_device::{device::UsbDeviceState, endpoint::EndpointAddress};

/// A driver that records what the core asks of it
#[derive(Debug)]
pub struct MockDriver {
    pub initialized: bool,
    pub address: Option<u8>,
    /// Latch the address before the status stage.
    pub early_address: bool,
    pub speed: Speed,
    /// Fail every `ep_start_write()`.
    pub fail_writes: bool,
    /// Fail `ep_open()` for this endpoint.
    pub fail_open: Option<EndpointAddress>,
    pub opened: Vec<EndpointInfo>,
    pub closed: Vec<EndpointAddress>,
    writes: Vec<(EndpointAddress, Vec<u8>)>,
    reads: Vec<(EndpointAddress, usize)>,
    stalled: [bool; ENDPOINT_SLOTS],
}

impl MockDriver {
    pub fn new() -> Self {
        MockDriver {
            initialized: false,
            address: None,
            early_address: false,
            speed: Speed::Full,
            fail_writes: false,
            fail_open: None,
            opened: Vec::new(),
            closed: Vec::new(),
            writes: Vec::new(),
            reads: Vec::new(),
            stalled: [false; ENDPOINT_SLOTS],
        }
    }

    /// Drain the recorded writes
    pub fn take_writes(&mut self) -> Vec<(EndpointAddress, Vec<u8>)> {
        std::mem::take(&mut self.writes)
    }

    /// Drain the recorded reads
    pub fn take_reads(&mut self) -> Vec<(EndpointAddress, usize)> {
        std::mem::take(&mut self.reads)
    }

    pub fn is_stalled(&self, ep: EndpointAddress) -> bool {
        self.stalled[endpoint_index(ep)]
    }

    pub fn is_open(&self, ep: EndpointAddress) -> bool {
        let opened = self.opened.iter().filter(|info| info.address == ep).count();
        let closed = self.closed.iter().filter(|&&closed| closed == ep).count();
        opened > closed
    }
}

impl Driver for MockDriver {
    fn init(&mut self) -> Result<()> {
        self.initialized = true;
        Ok(())
    }

    fn deinit(&mut self) -> Result<()> {
        self.initialized = false;
        Ok(())
    }

    fn set_address(&mut self, address: u8) -> Result<()> {
        self.address = Some(address);
        Ok(())
    }

    fn set_address_before_status(&self) -> bool {
        self.early_address
    }

    fn port_speed(&self) -> Speed {
        self.speed
    }

    fn ep_open(&mut self, info: &EndpointInfo) -> Result<()> {
        if self.fail_open == Some(info.address) {
            return Err(UsbError::InvalidEndpoint);
        }
        self.opened.push(*info);
        Ok(())
    }

    fn ep_close(&mut self, ep: EndpointAddress) -> Result<()> {
        self.closed.push(ep);
        Ok(())
    }

    fn ep_set_stall(&mut self, ep: EndpointAddress) -> Result<()> {
        self.stalled[endpoint_index(ep)] = true;
        Ok(())
    }

    fn ep_clear_stall(&mut self, ep: EndpointAddress) -> Result<()> {
        self.stalled[endpoint_index(ep)] = false;
        Ok(())
    }

    fn ep_is_stalled(&self, ep: EndpointAddress) -> bool {
        self.is_stalled(ep)
    }

    fn ep_start_write(&mut self, ep: EndpointAddress, data: &[u8]) -> Result<()> {
        if self.fail_writes {
            return Err(UsbError::InvalidState);
        }
        self.writes.push((ep, data.to_vec()));
        Ok(())
    }

    fn ep_start_read(&mut self, ep: EndpointAddress, max_len: usize) -> Result<()> {
        self.reads.push((ep, max_len));
        Ok(())
    }
}

/// Run a complete IN control transfer, returning the data stage, or `None`
/// if the device stalled
pub fn control_in<const N: usize>(
    device: &mut UsbDevice<'_, MockDriver, N>,
    setup: SetupPacket,
) -> Option<Vec<u8>> {
    device.handle_event(Event::Setup(setup.to_bytes()));
    let mut data = Vec::new();
    loop {
        match device.control_state() {
            ControlState::DataIn => {
                let writes = device.driver_mut().take_writes();
                assert_eq!(writes.len(), 1);
                let (ep, packet) = &writes[0];
                assert_eq!(*ep, ep0_in());
                data.extend_from_slice(packet);
                device.handle_event(Event::Ep0In {
                    nbytes: packet.len(),
                });
            }
            ControlState::StatusOut => {
                let reads = device.driver_mut().take_reads();
                assert!(reads.contains(&(ep0_out(), 0)));
                device.handle_event(Event::Ep0Out { data: &[] });
                assert_eq!(device.control_state(), ControlState::Idle);
                return Some(data);
            }
            ControlState::Stalled => return None,
            state => panic!("unexpected control state {state:?}"),
        }
    }
}

/// Run a complete OUT control transfer. Returns `false` if the device
/// stalled.
pub fn control_out<const N: usize>(
    device: &mut UsbDevice<'_, MockDriver, N>,
    setup: SetupPacket,
    data: &[u8],
) -> bool {
    device.handle_event(Event::Setup(setup.to_bytes()));
    for chunk in data.chunks(64) {
        if device.control_state() != ControlState::DataOut {
            break;
        }
        device.handle_event(Event::Ep0Out { data: chunk });
    }
    match device.control_state() {
        ControlState::StatusIn => {
            let writes = device.driver_mut().take_writes();
            assert_eq!(writes, [(ep0_in(), Vec::new())]);
            device.handle_event(Event::Ep0In { nbytes: 0 });
            assert_eq!(device.control_state(), ControlState::Idle);
            true
        }
        ControlState::Stalled => false,
        state => panic!("unexpected control state {state:?}"),
    }
}

/// Reset, address, and configure the device with configuration 1
pub fn enumerate<const N: usize>(device: &mut UsbDevice<'_, MockDriver, N>) {
    device.init().unwrap();
    device.handle_event(Event::Reset);
    assert!(control_out(device, SetupPacket::set_address(7), &[]));
    assert!(control_out(device, SetupPacket::set_configuration(1), &[]));
    assert_eq!(device.state(), UsbDeviceState::Configured);
    device.driver_mut().take_writes();
    device.driver_mut().take_reads();
}
