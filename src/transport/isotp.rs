use super::{DiagnosticTransport, SessionFilterSet};
use crate::data_link::{NoFilter, SessionFilter};
use crate::error::{AutomotiveError, Result, TimeoutKind};
use crate::physical::CanLink;
use crate::timer::{Clock, StdClock};
use crate::types::{CanId, Config, Frame, IdFormat, SequenceCounter, CAN_MAX_DLEN};
use std::time::Duration;

const SF_PCI: u8 = 0x00; // Single Frame
const FF_PCI: u8 = 0x10; // First Frame
const CF_PCI: u8 = 0x20; // Consecutive Frame
const FC_PCI: u8 = 0x30; // Flow Control

/// Largest payload a 12-bit first-frame length can announce
pub const MAX_PAYLOAD: usize = 0xFFF;
/// Longest payload sent as a single frame, in either addressing variant
pub const SINGLE_FRAME_MAX: usize = 6;

const SID_TESTER_PRESENT: u8 = 0x3E;
const SUPPRESS_POSITIVE_RESPONSE: u8 = 0x80;

/// ISO-TP addressing variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingVariant {
    Standard,
    /// Every frame starts with this target address byte
    OneByteExtended(u8),
}

/// Flow status carried in the low nibble of a flow control frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlowStatus {
    ContinueToSend,
    Wait,
    Overflow,
}

impl FlowStatus {
    fn from_pci(pci: u8) -> Option<Self> {
        match pci & 0x0F {
            0 => Some(FlowStatus::ContinueToSend),
            1 => Some(FlowStatus::Wait),
            2 => Some(FlowStatus::Overflow),
            _ => None,
        }
    }
}

/// Addressing and framing of one ISO-TP session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransmissionParameters {
    pub own_id: CanId,  // we transmit on this
    pub peer_id: CanId, // the ECU answers on this
    pub address_format: IdFormat,
    pub addressing: AddressingVariant,
    /// Address byte the peer's frames must lead with under one-byte extended addressing
    pub reply_address: Option<u8>,
    pub full_frame: bool, // pad every frame to 8 bytes
    pub padding_byte: u8,
    pub use_filters: bool,
}

impl Default for TransmissionParameters {
    fn default() -> Self {
        Self {
            own_id: 0x7E0,
            peer_id: 0x7E8,
            address_format: IdFormat::Standard,
            addressing: AddressingVariant::Standard,
            reply_address: None,
            full_frame: false,
            padding_byte: 0xCC,
            use_filters: false,
        }
    }
}

impl Config for TransmissionParameters {
    fn validate(&self) -> Result<()> {
        self.address_format.check(self.own_id)?;
        self.address_format.check(self.peer_id)?;
        Ok(())
    }
}

/// ISO-TP timing parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoTpTiming {
    pub request_timeout: Duration,  // frame accepted onto the bus
    pub response_timeout: Duration, // next expected frame from the peer
}

impl Default for IsoTpTiming {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(1000),
            response_timeout: Duration::from_millis(1000),
        }
    }
}

/// ISO-TP configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoTpConfig {
    pub params: TransmissionParameters,
    pub timing: IsoTpTiming,
    /// Flow control WAIT frames tolerated before giving up
    pub max_wait_frames: u8,
    /// Send a suppressed tester present after this much idle time
    pub tester_present_interval: Option<Duration>,
}

impl Default for IsoTpConfig {
    fn default() -> Self {
        Self {
            params: TransmissionParameters::default(),
            timing: IsoTpTiming::default(),
            max_wait_frames: 8,
            tester_present_interval: None,
        }
    }
}

impl Config for IsoTpConfig {
    fn validate(&self) -> Result<()> {
        self.params.validate()?;
        if self.timing.response_timeout.is_zero() {
            return Err(AutomotiveError::InvalidParameter("response timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Decode an STmin byte into the pause between consecutive frames.
///
/// `0x00..=0x7F` are milliseconds, `0xF1..=0xF9` are 100 µs steps, everything else means no wait.
pub fn decode_separation_time(st_min: u8) -> Duration {
    match st_min {
        0x00..=0x7F => Duration::from_millis(st_min as u64),
        0xF1..=0xF9 => Duration::from_micros((st_min & 0x0F) as u64 * 100),
        _ => Duration::ZERO,
    }
}

/// Sender state for one multi-frame write
#[derive(Debug, Clone, Copy)]
struct FlowControlState {
    frame_index: SequenceCounter,
    block_size: u8,
    separation_time: Duration,
}

/// ISO-TP session over a [`CanLink`]
pub struct IsoTpSession<L: CanLink, F: SessionFilter = NoFilter, C: Clock = StdClock> {
    config: IsoTpConfig,
    link: L,
    filters: F,
    clock: C,
    filter_set: SessionFilterSet,
    last_activity: Duration,
}

impl<L: CanLink> IsoTpSession<L> {
    /// Session without hardware filtering on the system clock
    pub fn with_link(config: IsoTpConfig, link: L) -> Result<Self> {
        Self::new(config, link, NoFilter, StdClock::default())
    }
}

impl<L: CanLink, F: SessionFilter, C: Clock> IsoTpSession<L, F, C> {
    pub fn new(config: IsoTpConfig, link: L, filters: F, clock: C) -> Result<Self> {
        config.validate()?;
        let last_activity = clock.now();
        let mut session = Self {
            config,
            link,
            filters,
            clock,
            filter_set: SessionFilterSet::default(),
            last_activity,
        };
        if session.config.params.use_filters {
            session.enable_filters()?;
        }
        Ok(session)
    }

    pub fn params(&self) -> &TransmissionParameters {
        &self.config.params
    }

    pub fn config(&self) -> &IsoTpConfig {
        &self.config
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn filters(&self) -> &F {
        &self.filters
    }

    pub fn filters_active(&self) -> bool {
        self.filter_set.is_active()
    }

    /// Swap addressing; installed filters for the old pair are retracted before the new pair goes in.
    pub fn set_transmission_parameters(&mut self, params: TransmissionParameters) -> Result<()> {
        params.validate()?;
        self.filter_set.retract(&mut self.filters)?;
        tracing::debug!(
            own = %format_args!("{:#x}", params.own_id),
            peer = %format_args!("{:#x}", params.peer_id),
            "ISO-TP parameters updated"
        );
        self.config.params = params;
        if self.config.params.use_filters {
            self.enable_filters()?;
        }
        Ok(())
    }

    pub fn set_timeouts(&mut self, request: Duration, response: Duration) {
        self.config.timing = IsoTpTiming {
            request_timeout: request,
            response_timeout: response,
        };
    }

    /// Install exact filters for our own and the peer identifier on both controllers.
    pub fn enable_filters(&mut self) -> Result<()> {
        let params = &self.config.params;
        self.filter_set.install(
            &mut self.filters,
            params.own_id,
            params.peer_id,
            params.address_format,
        )
    }

    pub fn disable_filters(&mut self) -> Result<()> {
        self.filter_set.retract(&mut self.filters)
    }

    /// Send `payload`, segmenting and running flow control as needed.
    pub fn write(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_PAYLOAD {
            return Err(AutomotiveError::PayloadTooLarge(payload.len()));
        }
        self.config.params.validate()?;

        if payload.len() <= SINGLE_FRAME_MAX {
            self.send_single_frame(payload)
        } else {
            self.send_multi_frame(payload)
        }
    }

    /// Wait for the next message from the peer and reassemble it.
    pub fn read(&mut self) -> Result<Vec<u8>> {
        let frame = self.receive_from_peer(TimeoutKind::Response)?;
        let offset = self.pci_offset();
        if frame.len() <= offset {
            return Err(AutomotiveError::ProtocolViolation("frame carries no PCI".into()));
        }

        let pci = frame.byte(offset);
        match pci & 0xF0 {
            SF_PCI => {
                let len = (pci & 0x0F) as usize;
                let data = frame.data().get(offset + 1..).unwrap_or(&[]);
                if len > data.len() {
                    return Err(AutomotiveError::ProtocolViolation(format!(
                        "single frame announces {} bytes but carries {}",
                        len,
                        data.len()
                    )));
                }
                Ok(data[..len].to_vec())
            }
            FF_PCI if frame.len() != CAN_MAX_DLEN => Err(AutomotiveError::ProtocolViolation(format!(
                "first frame with DLC {}",
                frame.len()
            ))),
            FF_PCI => self.receive_multi_frame(&frame),
            _ => Err(AutomotiveError::ProtocolViolation(format!(
                "unexpected PCI {:#04x} at start of message",
                pci
            ))),
        }
    }

    pub fn request_response_client(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        self.write(request)?;
        self.read()
    }

    /// Send a suppressed tester present when the session sat idle past the configured interval.
    pub fn on_timer_tick(&mut self) {
        let Some(interval) = self.config.tester_present_interval else {
            return;
        };
        if self.clock.elapsed_since(self.last_activity) < interval {
            return;
        }
        if let Err(err) = self.send_single_frame(&[SID_TESTER_PRESENT, SUPPRESS_POSITIVE_RESPONSE]) {
            tracing::debug!(%err, "tester present not sent");
        }
    }

    fn pci_offset(&self) -> usize {
        match self.config.params.addressing {
            AddressingVariant::Standard => 0,
            AddressingVariant::OneByteExtended(_) => 1,
        }
    }

    fn cf_payload_len(&self) -> usize {
        CAN_MAX_DLEN - 1 - self.pci_offset()
    }

    fn build_frame(&self, body: &[u8]) -> Result<Frame> {
        let params = &self.config.params;
        let mut buf = Vec::with_capacity(CAN_MAX_DLEN);
        if let AddressingVariant::OneByteExtended(target) = params.addressing {
            buf.push(target);
        }
        buf.extend_from_slice(body);
        if params.full_frame {
            buf.resize(CAN_MAX_DLEN, params.padding_byte);
        }
        Frame::new(params.own_id, params.address_format, &buf)
    }

    fn send_body(&mut self, body: &[u8]) -> Result<()> {
        let frame = self.build_frame(body)?;
        self.link.send(&frame, self.config.timing.request_timeout)?;
        self.last_activity = self.clock.now();
        Ok(())
    }

    fn receive_from_peer(&mut self, kind: TimeoutKind) -> Result<Frame> {
        let frame = self
            .link
            .receive(Some(self.config.params.peer_id), self.config.timing.response_timeout)
            .ok_or(AutomotiveError::Timeout(kind))?;
        self.last_activity = self.clock.now();
        self.check_reply_address(&frame)?;
        Ok(frame)
    }

    fn check_reply_address(&self, frame: &Frame) -> Result<()> {
        let params = &self.config.params;
        let (AddressingVariant::OneByteExtended(_), Some(expected)) = (params.addressing, params.reply_address) else {
            return Ok(());
        };
        if frame.is_empty() || frame.byte(0) != expected {
            return Err(AutomotiveError::ProtocolViolation(format!(
                "frame addressed to {:#04x}, expected {:#04x}",
                frame.byte(0),
                expected
            )));
        }
        Ok(())
    }

    fn send_single_frame(&mut self, data: &[u8]) -> Result<()> {
        let mut body = Vec::with_capacity(1 + data.len());
        body.push(SF_PCI | data.len() as u8);
        body.extend_from_slice(data);
        self.send_body(&body)
    }

    fn send_multi_frame(&mut self, data: &[u8]) -> Result<()> {
        let first_len = SINGLE_FRAME_MAX - self.pci_offset();
        let mut body = Vec::with_capacity(CAN_MAX_DLEN);
        body.push(FF_PCI | ((data.len() >> 8) as u8 & 0x0F));
        body.push(data.len() as u8);
        body.extend_from_slice(&data[..first_len]);
        self.send_body(&body)?;
        tracing::debug!(len = data.len(), "ISO-TP first frame sent");

        let mut flow = self.await_flow_control(SequenceCounter::new(1))?;
        let chunk_len = self.cf_payload_len();
        let mut sent_in_block: u8 = 0;

        for chunk in data[first_len..].chunks(chunk_len) {
            if flow.block_size != 0 && sent_in_block == flow.block_size {
                flow = self.await_flow_control(flow.frame_index)?;
                sent_in_block = 0;
            } else if sent_in_block > 0 {
                self.clock.sleep(flow.separation_time);
            }

            let mut body = Vec::with_capacity(CAN_MAX_DLEN);
            body.push(CF_PCI | flow.frame_index.advance());
            body.extend_from_slice(chunk);
            if let Err(err) = self.send_body(&body) {
                tracing::warn!(%err, "consecutive frame failed, transfer aborted");
                return Err(err);
            }
            sent_in_block = sent_in_block.saturating_add(1);
        }
        Ok(())
    }

    fn await_flow_control(&mut self, frame_index: SequenceCounter) -> Result<FlowControlState> {
        let offset = self.pci_offset();
        let mut waits = 0;
        loop {
            let frame = self.receive_from_peer(TimeoutKind::FlowControl)?;
            let pci = frame.byte(offset);
            if pci & 0xF0 != FC_PCI {
                return Err(AutomotiveError::ProtocolViolation(format!(
                    "expected flow control, got PCI {:#04x}",
                    pci
                )));
            }

            match FlowStatus::from_pci(pci) {
                Some(FlowStatus::ContinueToSend) => {
                    let state = FlowControlState {
                        frame_index,
                        block_size: frame.byte(offset + 1),
                        separation_time: decode_separation_time(frame.byte(offset + 2)),
                    };
                    tracing::trace!(
                        block_size = state.block_size,
                        st = ?state.separation_time,
                        "flow control: continue to send"
                    );
                    return Ok(state);
                }
                Some(FlowStatus::Wait) => {
                    waits += 1;
                    if waits > self.config.max_wait_frames {
                        return Err(AutomotiveError::Timeout(TimeoutKind::FlowControl));
                    }
                }
                Some(FlowStatus::Overflow) => {
                    return Err(AutomotiveError::ProtocolViolation("receiver reported overflow".into()));
                }
                None => {
                    return Err(AutomotiveError::ProtocolViolation(format!(
                        "invalid flow status {:#04x}",
                        pci
                    )));
                }
            }
        }
    }

    fn receive_multi_frame(&mut self, first: &Frame) -> Result<Vec<u8>> {
        let offset = self.pci_offset();
        let total = ((first.byte(offset) as usize & 0x0F) << 8) | first.byte(offset + 1) as usize;
        if total <= SINGLE_FRAME_MAX {
            return Err(AutomotiveError::ProtocolViolation(format!(
                "first frame announces only {} bytes",
                total
            )));
        }

        let mut data = Vec::with_capacity(total);
        data.extend_from_slice(first.data().get(offset + 2..).unwrap_or(&[]));
        data.truncate(total);

        // Continue to send, no block limit, no separation time
        self.send_body(&[FC_PCI, 0x00, 0x00])?;

        let chunk_len = self.cf_payload_len();
        let mut expected = SequenceCounter::new(1);
        while data.len() < total {
            let frame = self.receive_from_peer(TimeoutKind::Response)?;
            let pci = frame.byte(offset);
            if pci & 0xF0 != CF_PCI {
                return Err(AutomotiveError::ProtocolViolation(format!(
                    "expected consecutive frame, got PCI {:#04x}",
                    pci
                )));
            }
            if pci & 0x0F != expected.value() {
                return Err(AutomotiveError::ProtocolViolation(format!(
                    "sequence number {} where {} was expected",
                    pci & 0x0F,
                    expected.value()
                )));
            }
            expected.advance();

            let chunk = frame.data().get(offset + 1..).unwrap_or(&[]);
            let take = chunk.len().min(chunk_len).min(total - data.len());
            data.extend_from_slice(&chunk[..take]);
        }
        tracing::debug!(len = total, "ISO-TP message reassembled");
        Ok(data)
    }
}

impl<L: CanLink, F: SessionFilter, C: Clock> DiagnosticTransport for IsoTpSession<L, F, C> {
    fn write(&mut self, payload: &[u8]) -> Result<()> {
        IsoTpSession::write(self, payload)
    }

    fn read(&mut self) -> Result<Vec<u8>> {
        IsoTpSession::read(self)
    }

    fn request_response_client(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        IsoTpSession::request_response_client(self, request)
    }

    fn set_timeouts(&mut self, request: Duration, response: Duration) {
        IsoTpSession::set_timeouts(self, request, response)
    }

    fn on_timer_tick(&mut self) {
        IsoTpSession::on_timer_tick(self)
    }
}
