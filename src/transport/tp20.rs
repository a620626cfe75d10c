//! TP2.0 transport (SAE J2819 / VW TP 2.0).
//!
//! A channel is negotiated on a broadcast setup identifier, then carried on a
//! pair of dynamically assigned 11-bit identifiers:
//!
//! | Byte 0          | Meaning                                         |
//! |-----------------|-------------------------------------------------|
//! | `0x0X`          | data, more follows, ACK expected                |
//! | `0x1X`          | data, last segment, ACK expected                |
//! | `0x2X`          | data, more follows, no ACK                      |
//! | `0x3X`          | data, last segment, no ACK                      |
//! | `0x9X` / `0xBX` | NACK / ACK, `X` is the next expected counter    |
//! | `0xA0`..`0xA8`  | connection setup, ack, test, disconnect         |
//! | `0xC0` / `0xD0` | channel setup request / positive reply          |
//!
//! While a channel is open the peer probes it with connection tests. Those are
//! answered by [`Tp20Session::on_receive_interrupt`] when no request is in
//! flight; foreground calls suspend that listener through a [`ListenerGuard`].

use super::{DiagnosticTransport, SessionFilterSet};
use crate::data_link::{NoFilter, SessionFilter};
use crate::error::{AutomotiveError, Result, TimeoutKind};
use crate::physical::CanLink;
use crate::timer::{Clock, StdClock};
use crate::types::{CanId, Config, Frame, IdFormat, SequenceCounter, CAN_MAX_DLEN};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

const OP_ACK_FOLLOW: u8 = 0x00;
const OP_ACK_LAST: u8 = 0x10;
const OP_NOACK_FOLLOW: u8 = 0x20;
const OP_NOACK_LAST: u8 = 0x30;
const OP_NACK: u8 = 0x90;
const OP_ACK: u8 = 0xB0;

const CONNECTION_SETUP: u8 = 0xA0;
const CONNECTION_ACK: u8 = 0xA1;
const CONNECTION_TEST: u8 = 0xA3;
const DISCONNECT: u8 = 0xA8;

const CHANNEL_SETUP: u8 = 0xC0;
const CHANNEL_ACCEPTED: u8 = 0xD0;

/// Largest payload the 12-bit length of a first segment can announce
pub const MAX_PAYLOAD: usize = 0xFFF;

const SINGLE_SEGMENT_LIMIT: usize = 6;
const FIRST_SEGMENT_DATA: usize = 5;
const SEGMENT_DATA: usize = CAN_MAX_DLEN - 1;
const SINGLE_WRITE_ATTEMPTS: usize = 3;
const SETUP_ATTEMPTS: usize = 2;
/// Connection tests in a row without a real reply before the channel is declared dead
const MAX_CONSECUTIVE_TESTS: usize = 5;
/// Peer frames skipped while waiting for the disconnect echo
const DISCONNECT_WAIT_FRAMES: usize = 16;
const BACKLOG_LIMIT: usize = 32;

/// Decode a TP2.0 timing byte.
///
/// The two high bits select the unit (0.1 ms, 1 ms, 10 ms, 100 ms), the low six bits the scale.
pub fn decode_timing(byte: u8) -> Duration {
    let unit_us: u64 = match byte >> 6 {
        0 => 100,
        1 => 1_000,
        2 => 10_000,
        _ => 100_000,
    };
    Duration::from_micros(unit_us * (byte & 0x3F) as u64)
}

/// Encode `duration` with the finest unit that can hold it, truncating below that unit.
pub fn encode_timing(duration: Duration) -> Result<u8> {
    let micros = duration.as_micros();
    for (unit, unit_us) in [100u128, 1_000, 10_000, 100_000].into_iter().enumerate() {
        let scale = micros / unit_us;
        if scale <= 0x3F {
            return Ok(((unit as u8) << 6) | scale as u8);
        }
    }
    Err(AutomotiveError::InvalidParameter(format!(
        "{:?} exceeds the TP2.0 timing range",
        duration
    )))
}

/// TP2.0 session configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tp20Config {
    pub request_timeout: Duration,
    /// Wait for each peer frame; not recomputed from the negotiated T1
    pub response_timeout: Duration,
    /// Silence tolerated before an open channel is torn down
    pub session_timeout: Duration,
    /// Probe the peer with connection tests at this interval
    pub channel_test_interval: Option<Duration>,
    pub block_size: u8,
    pub t1: u8,
    pub t3: u8,
    /// Broadcast identifier channel setup requests are sent on
    pub setup_id: CanId,
}

impl Default for Tp20Config {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(1000),
            response_timeout: Duration::from_millis(1000),
            session_timeout: Duration::from_millis(5000),
            channel_test_interval: None,
            block_size: 0x0F,
            t1: 0x8A,
            t3: 0x32,
            setup_id: 0x200,
        }
    }
}

impl Config for Tp20Config {
    fn validate(&self) -> Result<()> {
        IdFormat::Standard.check(self.setup_id)?;
        if self.block_size > 0x0F {
            return Err(AutomotiveError::InvalidParameter(format!(
                "block size {:#x} does not fit four bits",
                self.block_size
            )));
        }
        if self.response_timeout.is_zero() || self.session_timeout.is_zero() {
            return Err(AutomotiveError::InvalidParameter("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Negotiating,
    InSession,
    Closing,
}

/// Negotiated channel parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelParams {
    /// We transmit on this identifier
    pub own_id: CanId,
    /// The peer transmits on this identifier
    pub peer_id: CanId,
    pub block_size: u8,
    pub t1: u8,
    pub t3: u8,
    /// Pause before every frame we emit, decoded from T3
    pub wait_time: Duration,
    /// Peer's ACK timeout, decoded from T1
    pub ack_timeout: Duration,
}

impl ChannelParams {
    fn new(own_id: CanId, peer_id: CanId, block_size: u8, t1: u8, t3: u8) -> Self {
        Self {
            own_id,
            peer_id,
            block_size,
            t1,
            t3,
            wait_time: decode_timing(t3),
            ack_timeout: decode_timing(t1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckOutcome {
    Ack,
    Nack,
}

/// TP2.0 session over a [`CanLink`]
pub struct Tp20Session<L: CanLink, F: SessionFilter = NoFilter, C: Clock = StdClock> {
    config: Tp20Config,
    link: L,
    filters: F,
    clock: C,
    filter_set: SessionFilterSet,
    state: SessionState,
    channel: Option<ChannelParams>,
    counter: SequenceCounter,
    listener_armed: bool,
    timer_armed: bool,
    last_contact: Duration,
    last_test_sent: Duration,
    /// Data frames the listener picked up while no request was in flight
    backlog: VecDeque<Frame>,
}

impl<L: CanLink> Tp20Session<L> {
    pub fn with_link(config: Tp20Config, link: L) -> Result<Self> {
        Self::new(config, link, NoFilter, StdClock::default())
    }
}

impl<L: CanLink, F: SessionFilter, C: Clock> Tp20Session<L, F, C> {
    pub fn new(config: Tp20Config, link: L, filters: F, clock: C) -> Result<Self> {
        config.validate()?;
        let now = clock.now();
        Ok(Self {
            config,
            link,
            filters,
            clock,
            filter_set: SessionFilterSet::default(),
            state: SessionState::Idle,
            channel: None,
            counter: SequenceCounter::new(0),
            listener_armed: false,
            timer_armed: false,
            last_contact: now,
            last_test_sent: now,
            backlog: VecDeque::new(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn channel(&self) -> Option<&ChannelParams> {
        self.channel.as_ref()
    }

    pub fn config(&self) -> &Tp20Config {
        &self.config
    }

    /// Whether the asynchronous receive and timer hooks are live
    pub fn listener_armed(&self) -> bool {
        self.listener_armed && self.timer_armed
    }

    pub fn filters_active(&self) -> bool {
        self.filter_set.is_active()
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

    /// Counter the next data frame will carry
    pub fn current_counter(&self) -> u8 {
        self.counter.value()
    }

    pub fn set_timeouts(&mut self, request: Duration, response: Duration) {
        self.config.request_timeout = request;
        self.config.response_timeout = response;
    }

    /// Negotiate a channel with the ECU at logical address `request_address`.
    ///
    /// A status byte other than `0xD0` in the setup reply comes back verbatim as
    /// [`AutomotiveError::ChannelRejected`].
    pub fn channel_setup(&mut self, request_address: u8, target_id: CanId, app_type: u8) -> Result<ChannelParams> {
        if self.state != SessionState::Idle {
            return Err(AutomotiveError::InvalidParameter("a channel is already open".into()));
        }
        IdFormat::Standard.check(target_id)?;
        let reply_id = target_id.checked_add(request_address as CanId).ok_or_else(|| {
            AutomotiveError::InvalidParameter(format!("no reply identifier for target {:#x}", target_id))
        })?;
        IdFormat::Standard.check(reply_id)?;

        self.filter_set.retract(&mut self.filters)?;
        self.state = SessionState::Negotiating;
        tracing::debug!(
            address = %format_args!("{:#04x}", request_address),
            target = %format_args!("{:#x}", target_id),
            "TP2.0 channel setup"
        );

        match self.negotiate(request_address, target_id, reply_id, app_type) {
            Ok(channel) => {
                self.open(channel, SequenceCounter::new(0))?;
                Ok(channel)
            }
            Err(err) => {
                tracing::debug!(%err, "TP2.0 channel setup failed");
                self.state = SessionState::Idle;
                Err(err)
            }
        }
    }

    /// [`channel_setup`](Self::channel_setup) on the configured setup identifier.
    pub fn connect(&mut self, request_address: u8, app_type: u8) -> Result<ChannelParams> {
        self.channel_setup(request_address, self.config.setup_id, app_type)
    }

    /// Re-enter an already negotiated channel without repeating the setup exchange.
    pub fn resume_session(&mut self, local_id: CanId, remote_id: CanId, counter: u8) -> Result<()> {
        IdFormat::Standard.check(local_id)?;
        IdFormat::Standard.check(remote_id)?;
        if self.state != SessionState::Idle {
            self.teardown();
        }
        let channel = ChannelParams::new(
            local_id,
            remote_id,
            self.config.block_size,
            self.config.t1,
            self.config.t3,
        );
        tracing::debug!(counter, "TP2.0 session resumed");
        self.open(channel, SequenceCounter::new(counter))
    }

    /// Leave the channel; unless `silent`, a disconnect is sent and its echo awaited.
    ///
    /// Filters are retracted whatever the disconnect outcome.
    pub fn close_channel(&mut self, silent: bool) -> Result<()> {
        if self.state == SessionState::Idle {
            return self.filter_set.retract(&mut self.filters);
        }
        self.state = SessionState::Closing;
        self.disarm();

        let outcome = if silent { Ok(()) } else { self.disconnect() };
        self.teardown();
        outcome
    }

    /// Suspend the keep-alive listener for a foreground exchange.
    ///
    /// Frames already queued from the peer are run through the keep-alive
    /// handler first. The listener is re-armed when the guard drops, if the
    /// channel is still open.
    pub fn suspend_listener(&mut self) -> ListenerGuard<'_, L, F, C> {
        self.drain_peer_frames();
        self.disarm();
        ListenerGuard { session: self }
    }

    /// Send `payload`; with `ack` the peer must acknowledge the last segment.
    pub fn write(&mut self, payload: &[u8], ack: bool) -> Result<()> {
        self.check_ready(payload)?;
        self.suspend_listener().write_segments(payload, ack)
    }

    /// Wait for the next message from the peer, answering connection tests meanwhile.
    pub fn read(&mut self) -> Result<Vec<u8>> {
        self.ensure_in_session()?;
        self.suspend_listener().read_segments()
    }

    pub fn request_response_client(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        self.check_ready(request)?;
        let mut guard = self.suspend_listener();
        guard.write_segments(request, true)?;
        guard.read_segments()
    }

    /// Receive-interrupt hook: serve peer frames that arrive while no request is in flight.
    pub fn on_receive_interrupt(&mut self) {
        if !self.listener_armed {
            return;
        }
        self.drain_peer_frames();
    }

    /// Timer hook: tear the channel down after `session_timeout` of silence and
    /// send connection tests when configured.
    pub fn on_timer_tick(&mut self) {
        if !self.timer_armed || self.state != SessionState::InSession {
            return;
        }
        let silent_for = self.clock.elapsed_since(self.last_contact);
        if silent_for >= self.config.session_timeout {
            tracing::warn!(?silent_for, "TP2.0 peer went silent, closing channel");
            self.disarm();
            self.teardown();
            return;
        }
        if let Some(interval) = self.config.channel_test_interval {
            if self.clock.elapsed_since(self.last_test_sent) >= interval {
                self.last_test_sent = self.clock.now();
                if let Err(err) = self.transmit(&[CONNECTION_TEST]) {
                    tracing::debug!(%err, "connection test not sent");
                }
            }
        }
    }

    fn negotiate(
        &mut self,
        request_address: u8,
        target_id: CanId,
        reply_id: CanId,
        app_type: u8,
    ) -> Result<ChannelParams> {
        let request = [request_address, CHANNEL_SETUP, 0x00, 0x10, 0x00, 0x03, app_type];

        let mut reply = None;
        for attempt in 1..=SETUP_ATTEMPTS {
            self.send_on(target_id, &request)?;
            reply = self.link.receive(Some(reply_id), self.config.response_timeout);
            if reply.is_some() {
                break;
            }
            tracing::debug!(attempt, "no channel setup reply");
        }
        let reply = reply.ok_or(AutomotiveError::Timeout(TimeoutKind::Response))?;

        let status = reply.byte(1);
        if status != CHANNEL_ACCEPTED {
            return Err(AutomotiveError::ChannelRejected(status));
        }
        let peer_id = reply.byte(2) as CanId | ((reply.byte(3) as CanId & 0x07) << 8);
        let own_id = reply.byte(4) as CanId | ((reply.byte(5) as CanId & 0x07) << 8);

        let proposal = [
            CONNECTION_SETUP,
            self.config.block_size,
            self.config.t1,
            0xFF,
            self.config.t3,
            0xFF,
        ];
        self.send_on(own_id, &proposal)?;
        let answer = self
            .link
            .receive(Some(peer_id), self.config.response_timeout)
            .ok_or(AutomotiveError::Timeout(TimeoutKind::Response))?;
        if answer.byte(0) != CONNECTION_ACK {
            return Err(AutomotiveError::ProtocolViolation(format!(
                "connection setup answered with {:#04x}",
                answer.byte(0)
            )));
        }

        let channel = ChannelParams::new(own_id, peer_id, answer.byte(1), answer.byte(2), answer.byte(4));
        tracing::debug!(
            own = %format_args!("{:#x}", own_id),
            peer = %format_args!("{:#x}", peer_id),
            block_size = channel.block_size,
            wait = ?channel.wait_time,
            ack_timeout = ?channel.ack_timeout,
            "TP2.0 channel negotiated"
        );
        Ok(channel)
    }

    fn open(&mut self, channel: ChannelParams, counter: SequenceCounter) -> Result<()> {
        self.channel = Some(channel);
        self.counter = counter;
        self.backlog.clear();
        if let Err(err) = self
            .filter_set
            .install(&mut self.filters, channel.own_id, channel.peer_id, IdFormat::Standard)
        {
            self.channel = None;
            self.state = SessionState::Idle;
            return Err(err);
        }
        self.state = SessionState::InSession;
        let now = self.clock.now();
        self.last_contact = now;
        self.last_test_sent = now;
        self.listener_armed = true;
        self.timer_armed = true;
        Ok(())
    }

    fn disarm(&mut self) {
        self.listener_armed = false;
        self.timer_armed = false;
    }

    fn rearm(&mut self) {
        if self.state == SessionState::InSession {
            self.listener_armed = true;
            self.timer_armed = true;
        }
    }

    /// Back to idle: filters retracted, channel forgotten.
    fn teardown(&mut self) {
        if let Err(err) = self.filter_set.retract(&mut self.filters) {
            tracing::warn!(%err, "session filters not fully retracted");
        }
        self.channel = None;
        self.backlog.clear();
        self.state = SessionState::Idle;
        tracing::debug!("TP2.0 channel closed");
    }

    fn disconnect(&mut self) -> Result<()> {
        self.transmit(&[DISCONNECT])?;
        let started = self.clock.now();
        for _ in 0..DISCONNECT_WAIT_FRAMES {
            let frame = self.next_peer_frame()?;
            if frame.byte(0) == DISCONNECT {
                return Ok(());
            }
            tracing::trace!(?frame, "ignored while waiting for disconnect echo");
            if self.clock.elapsed_since(started) >= self.config.response_timeout {
                break;
            }
        }
        tracing::warn!("no disconnect echo from peer");
        Err(AutomotiveError::Timeout(TimeoutKind::Response))
    }

    fn ensure_in_session(&self) -> Result<()> {
        if self.state == SessionState::InSession {
            Ok(())
        } else {
            Err(AutomotiveError::NotInSession)
        }
    }

    fn check_ready(&self, payload: &[u8]) -> Result<()> {
        self.ensure_in_session()?;
        if payload.len() > MAX_PAYLOAD {
            return Err(AutomotiveError::PayloadTooLarge(payload.len()));
        }
        Ok(())
    }

    fn channel_params(&self) -> Result<ChannelParams> {
        self.channel.ok_or(AutomotiveError::NotInSession)
    }

    fn send_on(&mut self, id: CanId, body: &[u8]) -> Result<()> {
        let wait = self.channel.map_or(Duration::ZERO, |channel| channel.wait_time);
        self.clock.sleep(wait);
        let frame = Frame::new(id, IdFormat::Standard, body)?;
        tracing::trace!(?frame, "TP2.0 tx");
        self.link.send(&frame, self.config.request_timeout)
    }

    /// Emit a frame on the negotiated identifier.
    fn transmit(&mut self, body: &[u8]) -> Result<()> {
        let own_id = self.channel_params()?.own_id;
        self.send_on(own_id, body)
    }

    fn next_peer_frame(&mut self) -> Result<Frame> {
        if let Some(frame) = self.backlog.pop_front() {
            return Ok(frame);
        }
        let peer_id = self.channel_params()?.peer_id;
        let frame = self
            .link
            .receive(Some(peer_id), self.config.response_timeout)
            .ok_or(AutomotiveError::Timeout(TimeoutKind::Response))?;
        tracing::trace!(?frame, "TP2.0 rx");
        Ok(frame)
    }

    fn send_ack(&mut self, received_counter: u8) -> Result<()> {
        let next = SequenceCounter::new(received_counter).next();
        self.transmit(&[OP_ACK | next.value()])
    }

    fn answer_connection_test(&mut self) -> Result<()> {
        let channel = self.channel_params()?;
        self.last_contact = self.clock.now();
        self.transmit(&[CONNECTION_ACK, channel.block_size, channel.t1, 0xFF, channel.t3, 0xFF])
    }

    /// Keep-alive handler for one frame that arrived outside a foreground exchange.
    fn handle_unsolicited(&mut self, frame: Frame) {
        match frame.byte(0) {
            CONNECTION_TEST => {
                if let Err(err) = self.answer_connection_test() {
                    tracing::debug!(%err, "connection test left unanswered");
                }
            }
            CONNECTION_ACK => self.last_contact = self.clock.now(),
            DISCONNECT => {
                tracing::debug!("TP2.0 peer disconnected");
                self.state = SessionState::Closing;
                self.disarm();
                if let Err(err) = self.transmit(&[DISCONNECT]) {
                    tracing::debug!(%err, "disconnect echo not sent");
                }
                self.teardown();
            }
            byte if byte & 0xC0 == 0 => {
                if self.backlog.len() >= BACKLOG_LIMIT {
                    tracing::warn!("TP2.0 backlog full, dropping oldest frame");
                    self.backlog.pop_front();
                }
                self.backlog.push_back(frame);
            }
            _ => tracing::trace!(?frame, "stray TP2.0 frame dropped"),
        }
    }

    fn drain_peer_frames(&mut self) {
        while self.state == SessionState::InSession {
            let Some(peer_id) = self.channel.map(|channel| channel.peer_id) else {
                return;
            };
            match self.link.receive(Some(peer_id), Duration::ZERO) {
                Some(frame) => self.handle_unsolicited(frame),
                None => return,
            }
        }
    }

    fn await_ack(&mut self) -> Result<AckOutcome> {
        let mut tests = 0;
        loop {
            let frame = match self.next_peer_frame() {
                Ok(frame) => frame,
                Err(AutomotiveError::Timeout(_)) => return Err(AutomotiveError::Timeout(TimeoutKind::Ack)),
                Err(err) => return Err(err),
            };
            let byte = frame.byte(0);
            match byte & 0xF0 {
                OP_ACK => {
                    self.last_contact = self.clock.now();
                    return Ok(AckOutcome::Ack);
                }
                OP_NACK => return Ok(AckOutcome::Nack),
                _ if byte == CONNECTION_TEST => {
                    tests += 1;
                    self.answer_connection_test()?;
                    if tests >= MAX_CONSECUTIVE_TESTS {
                        tracing::warn!(tests, "only connection tests while waiting for ACK, channel considered dead");
                        self.teardown();
                        return Err(AutomotiveError::SessionClosed);
                    }
                }
                _ if byte == DISCONNECT => {
                    self.handle_unsolicited(frame);
                    return Err(AutomotiveError::SessionClosed);
                }
                // the peer may start its reply before our ACK is processed
                _ if byte & 0xC0 == 0 => {
                    tests = 0;
                    self.backlog.push_back(frame);
                }
                _ => tracing::trace!(?frame, "ignored while waiting for ACK"),
            }
        }
    }

    fn write_segments(&mut self, payload: &[u8], ack: bool) -> Result<()> {
        if payload.len() < SINGLE_SEGMENT_LIMIT {
            self.write_single(payload, ack)
        } else {
            self.write_multi(payload, ack)
        }
    }

    fn write_single(&mut self, payload: &[u8], ack: bool) -> Result<()> {
        let op = if ack { OP_ACK_LAST } else { OP_NOACK_LAST };
        for attempt in 1..=SINGLE_WRITE_ATTEMPTS {
            let mut body = Vec::with_capacity(3 + payload.len());
            body.push(op | self.counter.advance());
            body.push(0x00);
            body.push(payload.len() as u8);
            body.extend_from_slice(payload);
            self.transmit(&body)?;

            if !ack {
                return Ok(());
            }
            match self.await_ack()? {
                AckOutcome::Ack => return Ok(()),
                AckOutcome::Nack => tracing::warn!(attempt, "TP2.0 NACK"),
            }
        }
        Err(AutomotiveError::Nack)
    }

    fn write_multi(&mut self, payload: &[u8], ack: bool) -> Result<()> {
        let block_size = self.channel_params()?.block_size as usize;
        let (head, tail) = payload.split_at(FIRST_SEGMENT_DATA);
        let segments: Vec<&[u8]> = std::iter::once(head).chain(tail.chunks(SEGMENT_DATA)).collect();
        let last = segments.len() - 1;

        for (index, chunk) in segments.iter().enumerate() {
            let op = if index == last {
                if ack {
                    OP_ACK_LAST
                } else {
                    OP_NOACK_LAST
                }
            } else if block_size != 0 && (index + 1) % block_size == 0 {
                OP_ACK_FOLLOW
            } else {
                OP_NOACK_FOLLOW
            };

            let mut body = Vec::with_capacity(CAN_MAX_DLEN);
            body.push(op | self.counter.advance());
            if index == 0 {
                body.push((payload.len() >> 8) as u8);
                body.push(payload.len() as u8);
            }
            body.extend_from_slice(chunk);
            self.transmit(&body)?;

            if op == OP_ACK_FOLLOW || op == OP_ACK_LAST {
                if self.await_ack()? == AckOutcome::Nack {
                    tracing::warn!(segment = index, "TP2.0 block NACKed, transfer aborted");
                    return Err(AutomotiveError::Nack);
                }
            }
        }
        Ok(())
    }

    fn read_segments(&mut self) -> Result<Vec<u8>> {
        let mut tests = 0;
        let mut message: Option<(usize, Vec<u8>)> = None;

        loop {
            let frame = self.next_peer_frame()?;
            let byte = frame.byte(0);

            match byte {
                CONNECTION_TEST => {
                    tests += 1;
                    self.answer_connection_test()?;
                    if tests >= MAX_CONSECUTIVE_TESTS {
                        tracing::warn!(tests, "only connection tests from peer, channel considered dead");
                        self.teardown();
                        return Err(AutomotiveError::SessionClosed);
                    }
                    continue;
                }
                DISCONNECT => {
                    self.handle_unsolicited(frame);
                    return Err(AutomotiveError::SessionClosed);
                }
                CONNECTION_ACK => {
                    self.last_contact = self.clock.now();
                    continue;
                }
                _ if byte & 0xC0 != 0 => {
                    tracing::trace!(?frame, "ignored while waiting for data");
                    continue;
                }
                _ => {}
            }

            self.last_contact = self.clock.now();
            let op = byte & 0xF0;
            let counter = byte & 0x0F;
            let needs_ack = op == OP_ACK_FOLLOW || op == OP_ACK_LAST;
            let is_last = op == OP_ACK_LAST || op == OP_NOACK_LAST;

            if message.is_none() && frame.byte(3) == 0x7F && frame.byte(5) == 0x78 {
                tracing::debug!("response pending");
                if needs_ack {
                    self.send_ack(counter)?;
                }
                continue;
            }
            tests = 0;

            let first = message.is_none();
            let (total, data) = message.get_or_insert_with(|| {
                let total = ((frame.byte(1) as usize) << 8) | frame.byte(2) as usize;
                (total, Vec::with_capacity(total))
            });
            let body = frame.data().get(if first { 3 } else { 1 }..).unwrap_or(&[]);
            let take = body.len().min(*total - data.len());
            data.extend_from_slice(&body[..take]);

            if needs_ack {
                self.send_ack(counter)?;
            }
            if is_last {
                let (total, data) = message.take().unwrap_or_default();
                if data.len() != total {
                    return Err(AutomotiveError::ProtocolViolation(format!(
                        "message ended after {} of {} bytes",
                        data.len(),
                        total
                    )));
                }
                return Ok(data);
            }
        }
    }
}

/// Foreground critical section with the keep-alive listener suspended.
///
/// Dereferences to the session; dropping it re-arms the listener when the channel is still open.
pub struct ListenerGuard<'a, L: CanLink, F: SessionFilter, C: Clock> {
    session: &'a mut Tp20Session<L, F, C>,
}

impl<L: CanLink, F: SessionFilter, C: Clock> Deref for ListenerGuard<'_, L, F, C> {
    type Target = Tp20Session<L, F, C>;

    fn deref(&self) -> &Self::Target {
        self.session
    }
}

impl<L: CanLink, F: SessionFilter, C: Clock> DerefMut for ListenerGuard<'_, L, F, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session
    }
}

impl<L: CanLink, F: SessionFilter, C: Clock> Drop for ListenerGuard<'_, L, F, C> {
    fn drop(&mut self) {
        self.session.rearm();
    }
}

impl<L: CanLink, F: SessionFilter, C: Clock> DiagnosticTransport for Tp20Session<L, F, C> {
    fn write(&mut self, payload: &[u8]) -> Result<()> {
        Tp20Session::write(self, payload, true)
    }

    fn read(&mut self) -> Result<Vec<u8>> {
        Tp20Session::read(self)
    }

    fn request_response_client(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        Tp20Session::request_response_client(self, request)
    }

    fn set_timeouts(&mut self, request: Duration, response: Duration) {
        Tp20Session::set_timeouts(self, request, response)
    }

    fn on_receive_interrupt(&mut self) {
        Tp20Session::on_receive_interrupt(self)
    }

    fn on_timer_tick(&mut self) {
        Tp20Session::on_timer_tick(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physical::mock::MockLink;
    use crate::timer::ManualClock;
    use rstest::rstest;

    const PEER: CanId = 0x301;
    const OWN: CanId = 0x302;

    fn frame(id: CanId, data: &[u8]) -> Frame {
        Frame::new(id, IdFormat::Standard, data).unwrap()
    }

    /// ECU at logical address 0x01 answering setup with rID 0x301 / own 0x302
    fn ecu_handshake(sent: &Frame) -> Vec<Frame> {
        match sent.byte(1) {
            CHANNEL_SETUP if sent.id() == 0x200 => {
                vec![frame(0x201, &[0x00, CHANNEL_ACCEPTED, 0x01, 0x03, 0x02, 0x03, 0x01])]
            }
            _ if sent.byte(0) == CONNECTION_SETUP => {
                vec![frame(PEER, &[CONNECTION_ACK, 0x0F, 0x8A, 0xFF, 0x32, 0xFF])]
            }
            _ => Vec::new(),
        }
    }

    fn open_session(link: &MockLink) -> Tp20Session<MockLink, NoFilter, ManualClock> {
        let mut session =
            Tp20Session::new(Tp20Config::default(), link.clone(), NoFilter, ManualClock::new()).unwrap();
        session.channel_setup(0x01, 0x200, 0x01).unwrap();
        link.take_sent();
        session
    }

    #[rstest]
    #[case(0x8A, Duration::from_millis(100))]
    #[case(0x32, Duration::from_millis(5))]
    #[case(0x4A, Duration::from_millis(10))]
    #[case(0xC1, Duration::from_millis(100))]
    #[case(0x00, Duration::ZERO)]
    fn test_decode_timing(#[case] byte: u8, #[case] expected: Duration) {
        assert_eq!(decode_timing(byte), expected);
    }

    #[test]
    fn test_encode_timing_picks_finest_unit() {
        assert_eq!(encode_timing(Duration::from_millis(5)).unwrap(), 0x32);
        assert_eq!(encode_timing(Duration::from_millis(100)).unwrap(), 0x4A);
        assert!(encode_timing(Duration::from_secs(7)).is_err());
    }

    #[test]
    fn test_channel_setup_negotiates_identifiers() {
        let link = MockLink::with_responder(ecu_handshake);
        let mut session =
            Tp20Session::new(Tp20Config::default(), link.clone(), NoFilter, ManualClock::new()).unwrap();

        let channel = session.channel_setup(0x01, 0x200, 0x01).unwrap();

        assert_eq!(session.state(), SessionState::InSession);
        assert_eq!(channel.peer_id, 0x301);
        assert_eq!(channel.own_id, 0x302);
        assert_eq!(channel.wait_time, Duration::from_millis(5));
        assert!(session.listener_armed());
        assert_eq!(session.current_counter(), 0);

        let sent = link.sent();
        assert_eq!(sent[0].id(), 0x200);
        assert_eq!(sent[0].data(), &[0x01, 0xC0, 0x00, 0x10, 0x00, 0x03, 0x01]);
        assert_eq!(sent[1].id(), 0x302);
        assert_eq!(sent[1].data(), &[0xA0, 0x0F, 0x8A, 0xFF, 0x32, 0xFF]);
    }

    #[test]
    fn test_channel_setup_rejected_status_is_returned() {
        let link = MockLink::with_responder(|sent| {
            vec![frame(0x201, &[0x00, 0xD6, 0x00, 0x00, 0x00, 0x00, sent.byte(6)])]
        });
        let mut session = Tp20Session::with_link(Tp20Config::default(), link).unwrap();

        assert_eq!(
            session.connect(0x01, 0x01),
            Err(AutomotiveError::ChannelRejected(0xD6))
        );
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_channel_setup_retries_once() {
        let link = MockLink::silent();
        let mut session =
            Tp20Session::new(Tp20Config::default(), link.clone(), NoFilter, ManualClock::new()).unwrap();

        assert!(session.channel_setup(0x01, 0x200, 0x01).unwrap_err().is_timeout());
        assert_eq!(link.sent().len(), 2);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_channel_setup_rejects_unreachable_reply_id() {
        let link = MockLink::with_responder(ecu_handshake);
        let mut session =
            Tp20Session::new(Tp20Config::default(), link.clone(), NoFilter, ManualClock::new()).unwrap();

        assert!(matches!(
            session.channel_setup(0x01, u32::MAX, 0x01),
            Err(AutomotiveError::InvalidParameter(_))
        ));
        assert!(matches!(
            session.channel_setup(0xFF, 0x7FF, 0x01),
            Err(AutomotiveError::InvalidParameter(_))
        ));
        assert!(link.sent().is_empty());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_single_frame_write_carries_counter() {
        let link = MockLink::with_responder(ecu_handshake);
        let mut session = open_session(&link);

        session.write(&[0x10, 0x89], false).unwrap();
        session.write(&[0x3E], false).unwrap();

        let sent = link.sent();
        assert_eq!(sent[0].data(), &[0x30, 0x00, 0x02, 0x10, 0x89]);
        assert_eq!(sent[1].data(), &[0x31, 0x00, 0x01, 0x3E]);
        assert_eq!(session.current_counter(), 2);
    }

    #[test]
    fn test_single_frame_nack_is_retried() {
        let link = MockLink::with_responder(ecu_handshake);
        let mut session = open_session(&link);
        let mut nacks = 2;
        link.set_responder(move |sent| {
            if sent.byte(0) & 0xF0 != OP_ACK_LAST {
                return Vec::new();
            }
            let next = (sent.byte(0) + 1) & 0x0F;
            if nacks > 0 {
                nacks -= 1;
                vec![frame(PEER, &[OP_NACK | next])]
            } else {
                vec![frame(PEER, &[OP_ACK | next])]
            }
        });

        session.write(&[0x1A, 0x9B], true).unwrap();

        let sent = link.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].byte(0), 0x10);
        assert_eq!(sent[1].byte(0), 0x11);
        assert_eq!(sent[2].byte(0), 0x12);
    }

    #[test]
    fn test_single_frame_gives_up_after_three_nacks() {
        let link = MockLink::with_responder(ecu_handshake);
        let mut session = open_session(&link);
        link.set_responder(|_| vec![frame(PEER, &[OP_NACK])]);

        assert_eq!(session.write(&[0x1A], true), Err(AutomotiveError::Nack));
        assert_eq!(link.sent().len(), 3);
        assert!(session.listener_armed());
    }

    #[test]
    fn test_ack_timeout_fails_immediately() {
        let link = MockLink::with_responder(ecu_handshake);
        let mut session = open_session(&link);
        link.set_responder(|_| Vec::new());

        assert_eq!(
            session.write(&[0x1A], true),
            Err(AutomotiveError::Timeout(TimeoutKind::Ack))
        );
        assert_eq!(link.sent().len(), 1);
    }

    #[test]
    fn test_multi_frame_write_waits_for_block_ack() {
        let link = MockLink::with_responder(ecu_handshake);
        let mut session = open_session(&link);
        link.set_responder(|sent| match sent.byte(0) & 0xF0 {
            OP_ACK_FOLLOW | OP_ACK_LAST => vec![frame(PEER, &[OP_ACK | ((sent.byte(0) + 1) & 0x0F)])],
            _ => Vec::new(),
        });

        // 5 + 14 * 7 + 1 bytes: 16 segments, block boundary after the 15th
        let payload: Vec<u8> = (0..104u32).map(|b| b as u8).collect();
        session.write(&payload, true).unwrap();

        let sent = link.sent();
        let data: Vec<&Frame> = sent.iter().filter(|f| f.byte(0) & 0xC0 == 0).collect();
        assert_eq!(data.len(), 16);
        assert_eq!(data[0].data()[..3], [0x20, 0x00, 104]);
        assert_eq!(data[13].byte(0), 0x2D);
        assert_eq!(data[14].byte(0), 0x0E);
        assert_eq!(data[15].byte(0), 0x1F);

        let mut rebuilt = data[0].data()[3..].to_vec();
        for segment in &data[1..] {
            rebuilt.extend_from_slice(&segment.data()[1..]);
        }
        assert_eq!(rebuilt, payload);
    }

    #[test]
    fn test_block_nack_aborts_multi_frame_write() {
        let link = MockLink::with_responder(ecu_handshake);
        let mut session = open_session(&link);
        link.set_responder(|sent| match sent.byte(0) & 0xF0 {
            OP_ACK_FOLLOW => vec![frame(PEER, &[OP_NACK | ((sent.byte(0) + 1) & 0x0F)])],
            _ => Vec::new(),
        });

        let payload: Vec<u8> = (0..104u32).map(|b| b as u8).collect();
        assert_eq!(session.write(&payload, true), Err(AutomotiveError::Nack));

        let sent = link.sent();
        assert_eq!(sent.len(), 15);
        assert_eq!(sent[14].byte(0), 0x0E);
        assert_eq!(session.state(), SessionState::InSession);
        assert!(session.listener_armed());
    }

    #[test]
    fn test_multi_frame_write_without_ack() {
        let link = MockLink::with_responder(ecu_handshake);
        let mut session = open_session(&link);
        link.set_responder(|_| Vec::new());

        let payload: Vec<u8> = (0..20u8).collect();
        session.write(&payload, false).unwrap();

        let ops: Vec<u8> = link.sent().iter().map(|f| f.byte(0)).collect();
        assert_eq!(ops, vec![0x20, 0x21, 0x22, 0x33]);
        assert_eq!(link.sent()[3].data(), &[0x33, 19]);
    }

    #[test]
    fn test_every_frame_waits_t3() {
        let link = MockLink::with_responder(ecu_handshake);
        let clock = ManualClock::new();
        let mut session = Tp20Session::new(Tp20Config::default(), link.clone(), NoFilter, clock.clone()).unwrap();
        session.channel_setup(0x01, 0x200, 0x01).unwrap();
        let before = clock.sleeps().len();

        session.write(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08], false).unwrap();

        let sleeps = clock.sleeps();
        assert_eq!(sleeps.len() - before, 2);
        assert!(sleeps[before..].iter().all(|d| *d == Duration::from_millis(5)));
    }

    #[test]
    fn test_read_acks_and_answers_connection_tests() {
        let link = MockLink::with_responder(ecu_handshake);
        let mut session = open_session(&link);
        link.inject(frame(PEER, &[CONNECTION_TEST]));
        link.inject(frame(PEER, &[0x04, 0x00, 0x07, 0x62, 0xF1, 0x90, 0x57]));
        link.inject(frame(PEER, &[0x15, 0x41, 0x55, 0x5A]));

        let response = session.read().unwrap();

        assert_eq!(response, vec![0x62, 0xF1, 0x90, 0x57, 0x41, 0x55, 0x5A]);
        let sent: Vec<Vec<u8>> = link.sent().iter().map(|f| f.data().to_vec()).collect();
        assert_eq!(
            sent,
            vec![
                vec![0xA1, 0x0F, 0x8A, 0xFF, 0x32, 0xFF],
                vec![0xB5],
                vec![0xB6],
            ]
        );
    }

    #[test]
    fn test_response_pending_keeps_waiting() {
        let link = MockLink::with_responder(ecu_handshake);
        let mut session = open_session(&link);
        link.inject(frame(PEER, &[0x10, 0x00, 0x03, 0x7F, 0x22, 0x78]));
        link.inject(frame(PEER, &[0x31, 0x00, 0x02, 0x62, 0x01]));

        assert_eq!(session.read().unwrap(), vec![0x62, 0x01]);
        assert_eq!(link.sent().len(), 1);
        assert_eq!(link.sent()[0].data(), &[0xB1]);
    }

    #[test]
    fn test_five_connection_tests_end_the_session() {
        let link = MockLink::with_responder(ecu_handshake);
        let mut session = open_session(&link);
        // ECU acknowledges the request, then only ever probes the channel
        link.set_responder(|sent| match sent.byte(0) {
            CONNECTION_ACK => vec![frame(PEER, &[CONNECTION_TEST])],
            byte if byte & 0xF0 == OP_ACK_LAST => vec![
                frame(PEER, &[OP_ACK | ((byte + 1) & 0x0F)]),
                frame(PEER, &[CONNECTION_TEST]),
            ],
            _ => Vec::new(),
        });

        assert_eq!(
            session.request_response_client(&[0x22, 0xF1, 0x90]),
            Err(AutomotiveError::SessionClosed)
        );
        assert_eq!(link.sent().len(), 6);
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.listener_armed());
    }

    #[test]
    fn test_connection_tests_while_waiting_for_ack_end_the_session() {
        let link = MockLink::with_responder(ecu_handshake);
        let mut session = open_session(&link);
        link.set_responder(|_| vec![frame(PEER, &[CONNECTION_TEST])]);

        assert_eq!(session.write(&[0x3E], true), Err(AutomotiveError::SessionClosed));

        let sent = link.sent();
        assert_eq!(sent.len(), 6);
        assert!(sent[1..].iter().all(|f| f.byte(0) == CONNECTION_ACK));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.listener_armed());
    }

    #[test]
    fn test_disconnect_echo_wait_is_bounded() {
        let link = MockLink::with_responder(ecu_handshake);
        let mut session = open_session(&link);
        link.set_responder(|_| Vec::new());
        for _ in 0..20 {
            link.inject(frame(PEER, &[CONNECTION_TEST]));
        }

        assert_eq!(
            session.close_channel(false),
            Err(AutomotiveError::Timeout(TimeoutKind::Response))
        );
        assert_eq!(link.pending(), 20 - DISCONNECT_WAIT_FRAMES);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_disconnect_while_idle() {
        let link = MockLink::with_responder(ecu_handshake);
        let mut session = open_session(&link);
        link.inject(frame(PEER, &[DISCONNECT]));

        session.on_receive_interrupt();

        assert_eq!(session.state(), SessionState::Idle);
        let sent = link.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id(), OWN);
        assert_eq!(sent[0].data(), &[DISCONNECT]);

        session.on_timer_tick();
        session.on_receive_interrupt();
        assert_eq!(link.sent().len(), 1);
        assert_eq!(session.write(&[0x3E], false), Err(AutomotiveError::NotInSession));
    }

    #[test]
    fn test_listener_answers_tests_and_keeps_data() {
        let link = MockLink::with_responder(ecu_handshake);
        let mut session = open_session(&link);
        link.inject(frame(PEER, &[CONNECTION_TEST]));
        link.inject(frame(PEER, &[0x30, 0x00, 0x01, 0x7E]));

        session.on_receive_interrupt();

        assert_eq!(link.sent().len(), 1);
        assert_eq!(link.pending(), 0);
        assert_eq!(session.read().unwrap(), vec![0x7E]);
    }

    #[test]
    fn test_guard_suspends_and_rearms() {
        let link = MockLink::with_responder(ecu_handshake);
        let mut session = open_session(&link);
        link.inject(frame(PEER, &[CONNECTION_TEST]));
        {
            let guard = session.suspend_listener();
            assert!(!guard.listener_armed());
            assert_eq!(link.pending(), 0);
        }
        assert!(session.listener_armed());
        assert_eq!(link.sent().len(), 1);
    }

    #[test]
    fn test_session_timeout_closes_channel() {
        let link = MockLink::with_responder(ecu_handshake);
        let clock = ManualClock::new();
        let mut session = Tp20Session::new(Tp20Config::default(), link.clone(), NoFilter, clock.clone()).unwrap();
        session.channel_setup(0x01, 0x200, 0x01).unwrap();

        clock.advance(Duration::from_millis(4000));
        session.on_timer_tick();
        assert_eq!(session.state(), SessionState::InSession);

        link.inject(frame(PEER, &[CONNECTION_TEST]));
        session.on_receive_interrupt();
        clock.advance(Duration::from_millis(4000));
        session.on_timer_tick();
        assert_eq!(session.state(), SessionState::InSession);

        clock.advance(Duration::from_millis(1000));
        session.on_timer_tick();
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_timer_sends_connection_tests() {
        let link = MockLink::with_responder(ecu_handshake);
        let clock = ManualClock::new();
        let config = Tp20Config {
            channel_test_interval: Some(Duration::from_millis(1000)),
            ..Default::default()
        };
        let mut session = Tp20Session::new(config, link.clone(), NoFilter, clock.clone()).unwrap();
        session.channel_setup(0x01, 0x200, 0x01).unwrap();
        link.take_sent();

        clock.advance(Duration::from_millis(500));
        session.on_timer_tick();
        assert!(link.sent().is_empty());

        clock.advance(Duration::from_millis(600));
        session.on_timer_tick();
        assert_eq!(link.sent()[0].data(), &[CONNECTION_TEST]);
    }

    #[test]
    fn test_close_channel_waits_for_echo() {
        let link = MockLink::with_responder(ecu_handshake);
        let mut session = open_session(&link);
        link.set_responder(|sent| match sent.byte(0) {
            DISCONNECT => vec![frame(PEER, &[DISCONNECT])],
            _ => Vec::new(),
        });

        session.close_channel(false).unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.channel().is_none());
    }

    #[test]
    fn test_close_channel_without_echo_still_tears_down() {
        let link = MockLink::with_responder(ecu_handshake);
        let mut session = open_session(&link);
        link.set_responder(|_| Vec::new());

        assert!(session.close_channel(false).unwrap_err().is_timeout());
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.listener_armed());
    }

    #[test]
    fn test_resume_session_uses_given_counter() {
        let link = MockLink::silent();
        let mut session =
            Tp20Session::new(Tp20Config::default(), link.clone(), NoFilter, ManualClock::new()).unwrap();

        session.resume_session(0x740, 0x300, 0x0B).unwrap();
        assert_eq!(session.state(), SessionState::InSession);
        assert_eq!(session.current_counter(), 0x0B);

        session.write(&[0x3E, 0x00], false).unwrap();
        assert_eq!(link.sent()[0].id(), 0x740);
        assert_eq!(link.sent()[0].byte(0), 0x3B);
    }

    #[test]
    fn test_write_outside_session_is_rejected() {
        let mut session = Tp20Session::with_link(Tp20Config::default(), MockLink::silent()).unwrap();
        assert_eq!(session.write(&[0x3E], true), Err(AutomotiveError::NotInSession));
        assert_eq!(session.read(), Err(AutomotiveError::NotInSession));
    }
}
