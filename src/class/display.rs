//! Bulk display sink
//!
//! [`DisplayClass`] receives frames on a vendor interface's bulk OUT
//! endpoint. Each frame starts with a [`SizedFraming`] header, and the class
//! reassembles frames into a block pool through a [`StreamProducer`]. The
//! application receives them with the matching
//! [`StreamConsumer`](crate::stream::StreamConsumer).
//!
//! The host can query the stream counters, and resynchronize the stream,
//! with vendor requests addressed to the interface.

use crate::{
    class::{
        ClassHandler, ClassId, Notification, Registry, RegistryError, RequestError, RequestResult,
    },
    driver::Driver,
    osal::Semaphore,
    setup::SetupPacket,
    stream::{SizedFraming, StreamProducer, StreamStats},
};
use usb_device::{control::Recipient, endpoint::EndpointAddress};

/// Vendor request codes
pub mod request {
    /// Returns the frame, drop, and error counters, each `u32` LE.
    pub const GET_STATS: u8 = 0x01;
    /// Abandons the frame in progress.
    pub const RESYNC: u8 = 0x02;
}

/// A display sink interface
pub struct DisplayClass<'p, 'a, S> {
    interface: u8,
    out_ep: EndpointAddress,
    max_packet_size: usize,
    stream: StreamProducer<'p, 'a, S, SizedFraming>,
    configured: bool,
}

impl<'p, 'a, S: Semaphore> DisplayClass<'p, 'a, S> {
    /// Create a sink on `interface`
    ///
    /// `stream` must use the same max packet size as `out_ep`.
    pub fn new(
        interface: u8,
        out_ep: EndpointAddress,
        max_packet_size: usize,
        stream: StreamProducer<'p, 'a, S, SizedFraming>,
    ) -> Self {
        DisplayClass {
            interface,
            out_ep,
            max_packet_size,
            stream,
            configured: false,
        }
    }

    /// Register this interface and its endpoint
    pub fn attach<'h, const N: usize>(
        &'h mut self,
        registry: &mut Registry<'h, N>,
    ) -> Result<ClassId, RegistryError>
    where
        'p: 'h,
        'a: 'h,
        S: 'h,
    {
        let (interface, out_ep) = (self.interface, self.out_ep);
        let id = registry.register(self)?;
        registry.add_interface(id, interface)?;
        registry.add_endpoint(id, out_ep)?;
        Ok(id)
    }

    pub fn stats(&self) -> StreamStats {
        self.stream.stats()
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    fn prime(&mut self, bus: &mut dyn Driver) {
        if bus.ep_start_read(self.out_ep, self.max_packet_size).is_err() {
            warn!("DISPLAY {} PRIME FAILED", self.interface);
        }
    }

    fn stop(&mut self) {
        self.configured = false;
        self.stream.reset();
    }
}

impl<S: Semaphore> ClassHandler for DisplayClass<'_, '_, S> {
    fn vendor_request(&mut self, setup: &SetupPacket, buf: &mut [u8]) -> RequestResult {
        if setup.recipient() != Recipient::Interface || setup.interface() != self.interface {
            return Err(RequestError::NotHandled);
        }
        match setup.request {
            request::GET_STATS => {
                let stats = self.stream.stats();
                let mut reply = [0; 12];
                for (chunk, count) in reply
                    .chunks_exact_mut(4)
                    .zip([stats.frames, stats.dropped, stats.errors])
                {
                    chunk.copy_from_slice(&count.to_le_bytes());
                }
                let len = reply.len().min(buf.len());
                buf[..len].copy_from_slice(&reply[..len]);
                Ok(len)
            }
            request::RESYNC => {
                debug!("DISPLAY {} RESYNC", self.interface);
                self.stream.reset();
                Ok(0)
            }
            _ => {
                warn!("DISPLAY {} UNKNOWN REQUEST {}", self.interface, setup.request);
                Err(RequestError::NotHandled)
            }
        }
    }

    fn notify(&mut self, bus: &mut dyn Driver, event: Notification) {
        match event {
            Notification::Configured(0) => self.stop(),
            Notification::Configured(_) => {
                self.configured = true;
                self.stream.reset();
                self.prime(bus);
            }
            Notification::Reset | Notification::Disconnected | Notification::Deinit => self.stop(),
            Notification::ClearHalt(ep) if ep == self.out_ep => {
                self.stream.reset();
                self.prime(bus);
            }
            _ => {}
        }
    }

    fn endpoint_out(&mut self, bus: &mut dyn Driver, ep: EndpointAddress, data: &[u8]) {
        if ep != self.out_ep || !self.configured {
            return;
        }
        self.stream.packet(data);
        self.prime(bus);
    }
}
