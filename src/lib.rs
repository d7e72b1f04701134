//! A USB device stack core
//!
//! `usbd-core` runs the device side of USB enumeration and class traffic
//! above a controller driver. It provides
//!
//! - the endpoint zero control pipeline, with standard, class, custom, and
//!   vendor request dispatch ([`device`], [`class`]);
//! - frame reassembly for streaming endpoints ([`stream`]), built on a
//!   fixed-size block pool ([`mempool`]) and a ring buffer ([`ringbuf`]);
//! - HID and bulk display interfaces ([`class::hid`], [`class::display`]).
//!
//! The stack doesn't touch hardware. A controller driver implements
//! [`Driver`](driver::Driver), and turns its interrupts into
//! [`Event`](device::Event)s.
//!
//! # Example
//!
//! ```
//! # use usbd_core::{descriptor::EndpointInfo, driver::{Driver, Result}};
//! # use usbd_core::usb_device::endpoint::EndpointAddress;
//! # struct Controller;
//! # impl Driver for Controller {
//! #     fn init(&mut self) -> Result<()> { Ok(()) }
//! #     fn deinit(&mut self) -> Result<()> { Ok(()) }
//! #     fn set_address(&mut self, _: u8) -> Result<()> { Ok(()) }
//! #     fn ep_open(&mut self, _: &EndpointInfo) -> Result<()> { Ok(()) }
//! #     fn ep_close(&mut self, _: EndpointAddress) -> Result<()> { Ok(()) }
//! #     fn ep_set_stall(&mut self, _: EndpointAddress) -> Result<()> { Ok(()) }
//! #     fn ep_clear_stall(&mut self, _: EndpointAddress) -> Result<()> { Ok(()) }
//! #     fn ep_is_stalled(&self, _: EndpointAddress) -> bool { false }
//! #     fn ep_start_write(&mut self, _: EndpointAddress, _: &[u8]) -> Result<()> { Ok(()) }
//! #     fn ep_start_read(&mut self, _: EndpointAddress, _: usize) -> Result<()> { Ok(()) }
//! # }
//! use usbd_core::{
//!     class::Registry,
//!     descriptor::DescriptorSet,
//!     device::{Event, UsbDevice},
//!     ControlState,
//! };
//!
//! // Device descriptor, then a configuration with no interfaces
//! static DESCRIPTORS: &[u8] = &[
//!     18, 1, 0x00, 0x02, 0, 0, 0, 64, 0x09, 0x12, 0x01, 0x00, 0x00, 0x01, 0, 0, 0, 1,
//!     9, 2, 9, 0, 0, 1, 0, 0x80, 50,
//! ];
//!
//! let descriptors = DescriptorSet::new(DESCRIPTORS);
//! let mut device: UsbDevice<_> = UsbDevice::new(Controller, &descriptors, Registry::new());
//! device.init().unwrap();
//!
//! // From the USB interrupt handler
//! device.handle_event(Event::Reset);
//! device.handle_event(Event::Setup([0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]));
//! assert_eq!(device.control_state(), ControlState::DataIn);
//! ```
//!
//! # Features
//!
//! - `std`: hosted support, including [`StdSemaphore`](osal::StdSemaphore).
//! - `log`: log through the [`log`](https://crates.io/crates/log) facade.
//! - `defmt-03`: log through `defmt`, and derive `defmt::Format` on public
//!   types.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[macro_use]
mod log;

mod control;
#[cfg(test)]
mod testing;

pub mod class;
pub mod descriptor;
pub mod device;
pub mod driver;
pub mod mempool;
pub mod osal;
pub mod ringbuf;
pub mod setup;
pub mod stream;

pub use control::{ControlState, CONTROL_BUFFER_SIZE};
pub use usb_device;
