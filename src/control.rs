//! Endpoint zero control transfers
//!
//! The pipe sequences each control transfer through its setup, data, and
//! status stages. It doesn't interpret requests; a [`RequestHandler`] does
//! that. The pipe never blocks, and it never waits on the handler.

use crate::{
    class::RequestResult,
    driver::{ep0_in, ep0_out, Driver},
    setup::SetupPacket,
};
use usb_device::UsbDirection;

/// Size of the EP0 staging buffer
///
/// This bounds both IN replies and OUT data stages. Longer OUT data stages
/// are stalled, and longer IN replies are truncated.
pub const CONTROL_BUFFER_SIZE: usize = 512;

/// Control transfer stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum ControlState {
    /// Waiting for a setup packet.
    Idle,
    /// A setup packet is being dispatched.
    SetupReceived,
    /// Sending the reply to the host.
    DataIn,
    /// Collecting the data stage from the host.
    DataOut,
    /// Sending the zero-length status packet.
    StatusIn,
    /// Waiting for the host's zero-length status packet.
    StatusOut,
    /// The request failed. The next setup packet clears the stall.
    Stalled,
}

/// Interprets setup packets
pub(crate) trait RequestHandler {
    /// Handle `setup`
    ///
    /// For IN requests, `buf` is room for the reply. For OUT requests, `buf`
    /// holds the data stage.
    fn handle(
        &mut self,
        bus: &mut dyn Driver,
        setup: &SetupPacket,
        buf: &mut [u8],
    ) -> RequestResult;
}

pub(crate) struct ControlPipe {
    state: ControlState,
    setup: SetupPacket,
    buffer: [u8; CONTROL_BUFFER_SIZE],
    /// Reply length, or expected OUT data length.
    len: usize,
    /// Bytes sent or received so far.
    offset: usize,
    /// Send a zero-length packet after the last IN data packet.
    zlp: bool,
    max_packet_size: usize,
}

/// The smallest EP0 max packet size a device may declare.
const MIN_MAX_PACKET_SIZE: usize = 8;

const fn clamp_max_packet_size(max_packet_size: usize) -> usize {
    if max_packet_size < MIN_MAX_PACKET_SIZE {
        MIN_MAX_PACKET_SIZE
    } else {
        max_packet_size
    }
}

impl ControlPipe {
    pub(crate) const fn new(max_packet_size: usize) -> Self {
        ControlPipe {
            state: ControlState::Idle,
            setup: SetupPacket {
                request_type: 0,
                request: 0,
                value: 0,
                index: 0,
                length: 0,
            },
            buffer: [0; CONTROL_BUFFER_SIZE],
            len: 0,
            offset: 0,
            zlp: false,
            max_packet_size: clamp_max_packet_size(max_packet_size),
        }
    }

    pub(crate) fn state(&self) -> ControlState {
        self.state
    }

    pub(crate) fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Drop any transfer in progress, and use a new EP0 max packet size.
    pub(crate) fn reset(&mut self, max_packet_size: usize) {
        self.max_packet_size = clamp_max_packet_size(max_packet_size);
        self.clear();
    }

    fn clear(&mut self) {
        self.state = ControlState::Idle;
        self.len = 0;
        self.offset = 0;
        self.zlp = false;
    }

    fn enter(&mut self, state: ControlState) {
        trace!("EP0 STATE {} -> {}", self.state as u8, state as u8);
        self.state = state;
    }

    fn stall(&mut self, bus: &mut dyn Driver) {
        warn!(
            "EP0 STALL REQUEST {} TYPE {}",
            self.setup.request, self.setup.request_type
        );
        self.enter(ControlState::Stalled);
        for ep in [ep0_in(), ep0_out()] {
            if bus.ep_set_stall(ep).is_err() {
                error!("EP0 STALL FAILED");
            }
        }
    }

    /// A setup packet arrived
    ///
    /// Whatever the pipe was doing, it starts over.
    pub(crate) fn setup(
        &mut self,
        bus: &mut dyn Driver,
        handler: &mut dyn RequestHandler,
        raw: [u8; 8],
    ) {
        if self.state == ControlState::Stalled {
            for ep in [ep0_in(), ep0_out()] {
                if bus.ep_clear_stall(ep).is_err() {
                    error!("EP0 CLEAR STALL FAILED");
                }
            }
        }
        self.clear();

        let setup = SetupPacket::from_bytes(raw);
        self.setup = setup;
        self.enter(ControlState::SetupReceived);
        debug!(
            "EP0 SETUP {} {} {} {} {}",
            setup.request_type, setup.request, setup.value, setup.index, setup.length
        );

        let length = usize::from(setup.length);
        if setup.has_data() && setup.direction() == UsbDirection::Out {
            if length > CONTROL_BUFFER_SIZE {
                warn!("EP0 OUT DATA STAGE TOO LONG {}", length);
                self.stall(bus);
                return;
            }
            self.len = length;
            self.enter(ControlState::DataOut);
            self.read_next(bus);
            return;
        }

        let limit = length.min(CONTROL_BUFFER_SIZE);
        match handler.handle(bus, &setup, &mut self.buffer[..limit]) {
            Err(_) => self.stall(bus),
            Ok(_) if !setup.has_data() => self.status_in(bus),
            Ok(written) => {
                let written = written.min(limit);
                self.len = written;
                self.zlp = written > 0 && written < length && written % self.max_packet_size == 0;
                self.enter(ControlState::DataIn);
                self.write_next(bus);
            }
        }
    }

    /// The controller finished sending a packet on EP0 IN
    ///
    /// Returns the setup packet when its status stage completes.
    pub(crate) fn in_complete(
        &mut self,
        bus: &mut dyn Driver,
        nbytes: usize,
    ) -> Option<SetupPacket> {
        match self.state {
            ControlState::DataIn => {
                self.offset = (self.offset + nbytes).min(self.len);
                if self.offset < self.len {
                    self.write_next(bus);
                } else if self.zlp {
                    self.zlp = false;
                    self.start_write(bus, 0);
                } else {
                    self.enter(ControlState::StatusOut);
                    if bus.ep_start_read(ep0_out(), 0).is_err() {
                        self.stall(bus);
                    }
                }
                None
            }
            ControlState::StatusIn => {
                self.enter(ControlState::Idle);
                Some(self.setup)
            }
            _ => {
                trace!("EP0 IN IGNORED {}", nbytes);
                None
            }
        }
    }

    /// The controller received a packet on EP0 OUT
    ///
    /// Returns the setup packet when its status stage completes.
    pub(crate) fn out_complete(
        &mut self,
        bus: &mut dyn Driver,
        handler: &mut dyn RequestHandler,
        data: &[u8],
    ) -> Option<SetupPacket> {
        match self.state {
            ControlState::DataOut => {
                let count = data.len().min(self.len - self.offset);
                self.buffer[self.offset..self.offset + count].copy_from_slice(&data[..count]);
                self.offset += count;

                let short = data.len() < self.max_packet_size;
                if self.offset < self.len && !short {
                    self.read_next(bus);
                    return None;
                }

                let setup = self.setup;
                match handler.handle(bus, &setup, &mut self.buffer[..self.offset]) {
                    Ok(_) => self.status_in(bus),
                    Err(_) => self.stall(bus),
                }
                None
            }
            ControlState::StatusOut => {
                self.enter(ControlState::Idle);
                Some(self.setup)
            }
            _ => {
                trace!("EP0 OUT IGNORED {}", data.len());
                None
            }
        }
    }

    fn status_in(&mut self, bus: &mut dyn Driver) {
        self.enter(ControlState::StatusIn);
        if bus.ep_start_write(ep0_in(), &[]).is_err() {
            self.stall(bus);
        }
    }

    fn write_next(&mut self, bus: &mut dyn Driver) {
        let chunk = (self.len - self.offset).min(self.max_packet_size);
        self.start_write(bus, chunk);
    }

    fn start_write(&mut self, bus: &mut dyn Driver, chunk: usize) {
        let data = &self.buffer[self.offset..self.offset + chunk];
        if bus.ep_start_write(ep0_in(), data).is_err() {
            self.stall(bus);
        }
    }

    fn read_next(&mut self, bus: &mut dyn Driver) {
        let chunk = (self.len - self.offset).min(self.max_packet_size);
        if bus.ep_start_read(ep0_out(), chunk).is_err() {
            self.stall(bus);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ControlPipe, ControlState, RequestHandler, CONTROL_BUFFER_SIZE};
    use crate::{
        class::{RequestError, RequestResult},
        driver::{ep0_in, ep0_out, Driver},
        setup::SetupPacket,
        testing::MockDriver,
    };

    /// Replies to IN requests with `reply`, and records OUT data.
    struct Scripted {
        reply: Result<Vec<u8>, RequestError>,
        calls: Vec<(SetupPacket, Vec<u8>)>,
    }

    impl Scripted {
        fn new(reply: Result<Vec<u8>, RequestError>) -> Self {
            Scripted {
                reply,
                calls: Vec::new(),
            }
        }
    }

    impl RequestHandler for Scripted {
        fn handle(
            &mut self,
            _: &mut dyn Driver,
            setup: &SetupPacket,
            buf: &mut [u8],
        ) -> RequestResult {
            self.calls.push((*setup, buf.to_vec()));
            let reply = self.reply.clone()?;
            let n = reply.len().min(buf.len());
            buf[..n].copy_from_slice(&reply[..n]);
            Ok(reply.len())
        }
    }

    fn vendor_in(length: u16) -> [u8; 8] {
        let [lo, hi] = length.to_le_bytes();
        [0xC0, 0x01, 0, 0, 0, 0, lo, hi]
    }

    fn vendor_out(length: u16) -> [u8; 8] {
        let [lo, hi] = length.to_le_bytes();
        [0x40, 0x02, 0, 0, 0, 0, lo, hi]
    }

    #[test]
    fn in_transfer_in_packets() {
        let mut bus = MockDriver::new();
        let mut pipe = ControlPipe::new(8);
        let mut handler = Scripted::new(Ok((0..20).collect()));

        pipe.setup(&mut bus, &mut handler, vendor_in(64));
        assert_eq!(pipe.state(), ControlState::DataIn);
        assert_eq!(bus.take_writes(), [(ep0_in(), (0..8).collect::<Vec<u8>>())]);

        assert!(pipe.in_complete(&mut bus, 8).is_none());
        assert!(pipe.in_complete(&mut bus, 8).is_none());
        assert_eq!(
            bus.take_writes(),
            [
                (ep0_in(), (8..16).collect::<Vec<u8>>()),
                (ep0_in(), (16..20).collect::<Vec<u8>>()),
            ]
        );

        // Short final packet, so no ZLP.
        assert!(pipe.in_complete(&mut bus, 4).is_none());
        assert_eq!(pipe.state(), ControlState::StatusOut);
        assert!(bus.take_writes().is_empty());
        assert_eq!(bus.take_reads(), [(ep0_out(), 0)]);

        let done = pipe.out_complete(&mut bus, &mut handler, &[]);
        assert_eq!(done, Some(SetupPacket::from_bytes(vendor_in(64))));
        assert_eq!(pipe.state(), ControlState::Idle);
        assert_eq!(handler.calls.len(), 1);
    }

    #[test]
    fn zero_max_packet_size_is_clamped() {
        let mut bus = MockDriver::new();
        let mut pipe = ControlPipe::new(0);
        assert_eq!(pipe.max_packet_size(), 8);
        let mut handler = Scripted::new(Ok(vec![0xAA; 12]));

        pipe.setup(&mut bus, &mut handler, vendor_in(18));
        assert_eq!(bus.take_writes(), [(ep0_in(), vec![0xAA; 8])]);
        pipe.in_complete(&mut bus, 8);
        assert_eq!(bus.take_writes(), [(ep0_in(), vec![0xAA; 4])]);
        pipe.in_complete(&mut bus, 4);
        assert_eq!(pipe.state(), ControlState::StatusOut);

        pipe.reset(0);
        assert_eq!(pipe.max_packet_size(), 8);
    }

    #[test]
    fn zlp_after_full_packet_reply_shorter_than_requested() {
        let mut bus = MockDriver::new();
        let mut pipe = ControlPipe::new(8);
        let mut handler = Scripted::new(Ok(vec![0xAA; 16]));

        pipe.setup(&mut bus, &mut handler, vendor_in(32));
        pipe.in_complete(&mut bus, 8);
        pipe.in_complete(&mut bus, 8);
        assert_eq!(pipe.state(), ControlState::DataIn);
        let writes = bus.take_writes();
        assert_eq!(writes.len(), 3);
        assert!(writes[2].1.is_empty());

        pipe.in_complete(&mut bus, 0);
        assert_eq!(pipe.state(), ControlState::StatusOut);
    }

    #[test]
    fn no_zlp_when_reply_fills_request() {
        let mut bus = MockDriver::new();
        let mut pipe = ControlPipe::new(8);
        let mut handler = Scripted::new(Ok(vec![0xAA; 40]));

        // The reply is truncated to wLength.
        pipe.setup(&mut bus, &mut handler, vendor_in(16));
        pipe.in_complete(&mut bus, 8);
        pipe.in_complete(&mut bus, 8);
        assert_eq!(pipe.state(), ControlState::StatusOut);
        let writes = bus.take_writes();
        assert_eq!(writes.len(), 2);
        assert!(writes.iter().all(|(_, data)| data.len() == 8));
    }

    #[test]
    fn empty_reply_is_a_zero_length_data_packet() {
        let mut bus = MockDriver::new();
        let mut pipe = ControlPipe::new(64);
        let mut handler = Scripted::new(Ok(Vec::new()));

        pipe.setup(&mut bus, &mut handler, vendor_in(4));
        assert_eq!(bus.take_writes(), [(ep0_in(), Vec::new())]);
        pipe.in_complete(&mut bus, 0);
        assert_eq!(pipe.state(), ControlState::StatusOut);
    }

    #[test]
    fn no_data_request_goes_to_status_in() {
        let mut bus = MockDriver::new();
        let mut pipe = ControlPipe::new(64);
        let mut handler = Scripted::new(Ok(Vec::new()));

        pipe.setup(&mut bus, &mut handler, vendor_out(0));
        assert_eq!(pipe.state(), ControlState::StatusIn);
        assert_eq!(bus.take_writes(), [(ep0_in(), Vec::new())]);
        assert_eq!(
            pipe.in_complete(&mut bus, 0),
            Some(SetupPacket::from_bytes(vendor_out(0)))
        );
        assert_eq!(pipe.state(), ControlState::Idle);
    }

    #[test]
    fn out_data_stage_then_dispatch() {
        let mut bus = MockDriver::new();
        let mut pipe = ControlPipe::new(8);
        let mut handler = Scripted::new(Ok(Vec::new()));

        pipe.setup(&mut bus, &mut handler, vendor_out(12));
        assert_eq!(pipe.state(), ControlState::DataOut);
        assert!(handler.calls.is_empty());
        assert_eq!(bus.take_reads(), [(ep0_out(), 8)]);

        assert!(pipe.out_complete(&mut bus, &mut handler, &[1; 8]).is_none());
        assert_eq!(bus.take_reads(), [(ep0_out(), 4)]);
        assert!(handler.calls.is_empty());

        assert!(pipe.out_complete(&mut bus, &mut handler, &[2; 4]).is_none());
        assert_eq!(pipe.state(), ControlState::StatusIn);
        assert_eq!(handler.calls.len(), 1);
        assert_eq!(handler.calls[0].1, [1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 2, 2]);
        assert_eq!(bus.take_writes(), [(ep0_in(), Vec::new())]);

        assert!(pipe.in_complete(&mut bus, 0).is_some());
        assert_eq!(pipe.state(), ControlState::Idle);
    }

    #[test]
    fn short_packet_ends_out_data_stage() {
        let mut bus = MockDriver::new();
        let mut pipe = ControlPipe::new(8);
        let mut handler = Scripted::new(Ok(Vec::new()));

        pipe.setup(&mut bus, &mut handler, vendor_out(32));
        pipe.out_complete(&mut bus, &mut handler, &[7; 3]);
        assert_eq!(pipe.state(), ControlState::StatusIn);
        assert_eq!(handler.calls[0].1, [7, 7, 7]);
    }

    #[test]
    fn rejected_out_data_stalls() {
        let mut bus = MockDriver::new();
        let mut pipe = ControlPipe::new(8);
        let mut handler = Scripted::new(Err(RequestError::Invalid));

        pipe.setup(&mut bus, &mut handler, vendor_out(2));
        pipe.out_complete(&mut bus, &mut handler, &[1, 2]);
        assert_eq!(pipe.state(), ControlState::Stalled);
        assert!(bus.is_stalled(ep0_in()) && bus.is_stalled(ep0_out()));
    }

    #[test]
    fn oversized_out_data_stage_stalls_without_dispatch() {
        let mut bus = MockDriver::new();
        let mut pipe = ControlPipe::new(64);
        let mut handler = Scripted::new(Ok(Vec::new()));

        pipe.setup(&mut bus, &mut handler, vendor_out(CONTROL_BUFFER_SIZE as u16 + 1));
        assert_eq!(pipe.state(), ControlState::Stalled);
        assert!(handler.calls.is_empty());
        assert!(bus.take_reads().is_empty());
    }

    #[test]
    fn unhandled_request_stalls_and_next_setup_starts_clean() {
        let mut bus = MockDriver::new();
        let mut pipe = ControlPipe::new(8);

        let mut handler = Scripted::new(Ok(vec![0x11; 20]));
        pipe.setup(&mut bus, &mut handler, vendor_in(20));
        pipe.in_complete(&mut bus, 8);
        bus.take_writes();

        // A new setup in the middle of a data stage abandons it.
        let mut refusing = Scripted::new(Err(RequestError::NotHandled));
        pipe.setup(&mut bus, &mut refusing, vendor_in(20));
        assert_eq!(pipe.state(), ControlState::Stalled);
        assert!(bus.is_stalled(ep0_in()) && bus.is_stalled(ep0_out()));
        assert!(bus.take_writes().is_empty());

        // Completions while stalled are ignored.
        assert!(pipe.in_complete(&mut bus, 8).is_none());
        assert_eq!(pipe.state(), ControlState::Stalled);

        let mut handler = Scripted::new(Ok(vec![0x22; 4]));
        pipe.setup(&mut bus, &mut handler, vendor_in(4));
        assert!(!bus.is_stalled(ep0_in()) && !bus.is_stalled(ep0_out()));
        assert_eq!(pipe.state(), ControlState::DataIn);
        assert_eq!(bus.take_writes(), [(ep0_in(), vec![0x22; 4])]);
        pipe.in_complete(&mut bus, 4);
        assert_eq!(pipe.state(), ControlState::StatusOut);
    }

    #[test]
    fn driver_failure_stalls() {
        let mut bus = MockDriver::new();
        bus.fail_writes = true;
        let mut pipe = ControlPipe::new(64);
        let mut handler = Scripted::new(Ok(vec![1, 2, 3]));
        pipe.setup(&mut bus, &mut handler, vendor_in(3));
        assert_eq!(pipe.state(), ControlState::Stalled);
    }

    #[test]
    fn setup_packet_is_recorded() {
        let mut bus = MockDriver::new();
        let mut pipe = ControlPipe::new(64);
        let mut handler = Scripted::new(Ok(vec![1]));
        let setup = SetupPacket::get_configuration();
        pipe.setup(&mut bus, &mut handler, setup.to_bytes());
        assert_eq!(handler.calls[0].0, setup);
        assert_eq!(handler.calls[0].1.len(), 1);
    }
}
