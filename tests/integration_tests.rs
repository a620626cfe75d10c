use libcandiag::application::{DiagnosticClient, RequestBuilder};
use libcandiag::config::StackConfig;
use libcandiag::data_link::mock::MockFilterBank;
use libcandiag::data_link::{Controller, FilterKind, FilterTable, NoFilter};
use libcandiag::error::AutomotiveError;
use libcandiag::physical::mock::MockLink;
use libcandiag::timer::ManualClock;
use libcandiag::transport::isotp::{IsoTpConfig, IsoTpSession};
use libcandiag::transport::keepalive;
use libcandiag::transport::tp20::{SessionState, Tp20Config, Tp20Session};
use libcandiag::types::{CanId, Frame, IdFormat};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

const TESTER: CanId = 0x7E0;
const ECU: CanId = 0x7E8;

fn ecu_frame(id: CanId, data: &[u8]) -> Frame {
    Frame::new(id, IdFormat::Standard, data).unwrap()
}

/// ISO-TP ECU that echoes every complete message back to the tester
#[derive(Default)]
struct IsoTpEchoEcu {
    received: Vec<u8>,
    expected: usize,
    outgoing: Vec<Frame>,
}

impl IsoTpEchoEcu {
    fn on_frame(&mut self, frame: &Frame) -> Vec<Frame> {
        if frame.id() != TESTER {
            return Vec::new();
        }
        let pci = frame.byte(0);
        match pci & 0xF0 {
            0x00 => {
                let len = (pci & 0x0F) as usize;
                self.reply(frame.data()[1..1 + len].to_vec())
            }
            0x10 => {
                self.expected = ((pci as usize & 0x0F) << 8) | frame.byte(1) as usize;
                self.received = frame.data()[2..].to_vec();
                vec![ecu_frame(ECU, &[0x30, 0x00, 0x00])]
            }
            0x20 => {
                let remaining = self.expected - self.received.len();
                let data = &frame.data()[1..];
                self.received.extend_from_slice(&data[..data.len().min(remaining)]);
                if self.received.len() == self.expected {
                    let message = std::mem::take(&mut self.received);
                    self.reply(message)
                } else {
                    Vec::new()
                }
            }
            0x30 => std::mem::take(&mut self.outgoing),
            _ => Vec::new(),
        }
    }

    fn reply(&mut self, message: Vec<u8>) -> Vec<Frame> {
        if message.len() <= 6 {
            let mut data = vec![message.len() as u8];
            data.extend_from_slice(&message);
            return vec![ecu_frame(ECU, &data)];
        }
        let len = message.len();
        let mut first = vec![0x10 | (len >> 8) as u8, len as u8];
        first.extend_from_slice(&message[..6]);
        self.outgoing = message[6..]
            .chunks(7)
            .enumerate()
            .map(|(i, chunk)| {
                let mut data = vec![0x20 | ((i + 1) & 0x0F) as u8];
                data.extend_from_slice(chunk);
                ecu_frame(ECU, &data)
            })
            .collect();
        vec![ecu_frame(ECU, &first)]
    }
}

fn echo_link() -> MockLink {
    let mut ecu = IsoTpEchoEcu::default();
    MockLink::with_responder(move |frame| ecu.on_frame(frame))
}

fn isotp_session(link: &MockLink) -> IsoTpSession<MockLink, NoFilter, ManualClock> {
    IsoTpSession::new(IsoTpConfig::default(), link.clone(), NoFilter, ManualClock::new()).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_isotp_multi_frame_count(len in 7usize..=4095) {
        let link = MockLink::with_responder(|frame| {
            if frame.byte(0) & 0xF0 == 0x10 {
                vec![ecu_frame(ECU, &[0x30, 0x00, 0x00])]
            } else {
                Vec::new()
            }
        });
        let mut isotp = isotp_session(&link);
        let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();

        isotp.write(&payload).unwrap();

        let sent = link.sent();
        prop_assert_eq!(sent.len(), (len - 6).div_ceil(7) + 1);
        prop_assert_eq!(sent[0].byte(0) & 0xF0, 0x10);
        for (i, frame) in sent[1..].iter().enumerate() {
            prop_assert_eq!(frame.byte(0), 0x20 | ((i + 1) % 16) as u8);
        }
    }

    #[test]
    fn prop_isotp_echo_round_trip(payload in proptest::collection::vec(any::<u8>(), 0..=4095)) {
        let link = echo_link();
        let mut isotp = isotp_session(&link);

        prop_assert_eq!(isotp.request_response_client(&payload).unwrap(), payload);
    }
}

#[test]
fn test_isotp_echo_boundaries() {
    for len in [0, 1, 6, 7, 8, 13, 14, 111, 112, 113, 4095] {
        let link = echo_link();
        let mut isotp = isotp_session(&link);
        let payload: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();

        assert_eq!(isotp.request_response_client(&payload).unwrap(), payload, "len {}", len);
    }
}

#[test]
fn test_isotp_full_stack_with_filters() {
    let config = StackConfig::from_toml_str(
        r#"
        [isotp]
        own_id = 0x7E0
        peer_id = 0x7E8
        use_filters = true
        full_frame = true
        "#,
    )
    .unwrap();
    let table = Arc::new(Mutex::new(FilterTable::with_capacity(
        MockFilterBank::new(),
        config.filters.capacity_words,
    )));
    let link = echo_link();
    let isotp = IsoTpSession::new(config.isotp_config().unwrap(), link.clone(), table.clone(), ManualClock::new())
        .unwrap();

    {
        let table = table.lock();
        assert!(table.is_enabled());
        assert!(table.accepts(ECU, IdFormat::Standard, Controller::Can1));
        assert!(table.accepts(TESTER, IdFormat::Standard, Controller::Can2));
        assert!(!table.accepts(0x7DF, IdFormat::Standard, Controller::Can1));
        assert_eq!(table.bank().words(), &[0x07E0_07E8, 0x27E0_27E8]);
    }

    let mut client = DiagnosticClient::new(isotp);
    let request = RequestBuilder::new(0x2E).did(0xF198).params(&[0x55; 12]);
    let echoed = client.request(&request);
    // the echo ECU answers with the request itself, which is not a positive reply to 0x2E
    assert!(matches!(echoed, Err(AutomotiveError::ProtocolViolation(_))));
    assert!(link.sent().iter().all(|frame| frame.len() == 8));

    client.transport_mut().disable_filters().unwrap();
    let table = table.lock();
    assert!(table.entries().is_empty());
    assert!(!table.is_enabled());
}

/// TP2.0 ECU at logical address 0x01: negotiates 0x300/0x740 and answers UDS reads
#[derive(Default)]
struct Tp20Ecu {
    counter: u8,
    request: Vec<u8>,
}

impl Tp20Ecu {
    const RX: CanId = 0x740; // tester sends here
    const TX: CanId = 0x300; // ECU answers here

    fn on_frame(&mut self, frame: &Frame) -> Vec<Frame> {
        let byte = frame.byte(0);
        if frame.id() == 0x200 && frame.byte(1) == 0xC0 {
            return vec![ecu_frame(0x201, &[0x00, 0xD0, 0x00, 0x03, 0x40, 0x07, 0x01])];
        }
        if frame.id() != Self::RX {
            return Vec::new();
        }
        match byte {
            0xA0 => vec![ecu_frame(Self::TX, &[0xA1, 0x0F, 0x8A, 0xFF, 0x4A, 0xFF])],
            0xA8 => vec![ecu_frame(Self::TX, &[0xA8])],
            _ if byte & 0xC0 == 0 => self.on_data(frame),
            _ => Vec::new(),
        }
    }

    fn on_data(&mut self, frame: &Frame) -> Vec<Frame> {
        let op = frame.byte(0) & 0xF0;
        let body = if self.request.is_empty() {
            &frame.data()[3..]
        } else {
            &frame.data()[1..]
        };
        self.request.extend_from_slice(body);

        let mut replies = Vec::new();
        if op == 0x00 || op == 0x10 {
            let next = (frame.byte(0) + 1) & 0x0F;
            replies.push(ecu_frame(Self::TX, &[0xB0 | next]));
        }
        if op == 0x10 || op == 0x30 {
            let request = std::mem::take(&mut self.request);
            replies.extend(self.respond(&request));
        }
        replies
    }

    fn respond(&mut self, request: &[u8]) -> Vec<Frame> {
        let response = match request {
            [0x22, 0xF1, 0x90] => {
                let mut response = vec![0x62, 0xF1, 0x90];
                response.extend_from_slice(b"WVWZZZ1KZAM000001");
                response
            }
            [0x10, session] => vec![0x50, *session],
            [sid, ..] => vec![0x7F, *sid, 0x11],
            [] => return Vec::new(),
        };

        let mut frames = Vec::new();
        if response.len() < 6 {
            let mut data = vec![0x10 | self.next_counter(), 0x00, response.len() as u8];
            data.extend_from_slice(&response);
            frames.push(ecu_frame(Self::TX, &data));
            return frames;
        }
        let (head, tail) = response.split_at(5);
        let mut data = vec![0x20 | self.next_counter(), 0x00, response.len() as u8];
        data.extend_from_slice(head);
        frames.push(ecu_frame(Self::TX, &data));
        let chunks: Vec<&[u8]> = tail.chunks(7).collect();
        for (i, chunk) in chunks.iter().enumerate() {
            let op = if i + 1 == chunks.len() { 0x10 } else { 0x20 };
            let mut data = vec![op | self.next_counter()];
            data.extend_from_slice(chunk);
            frames.push(ecu_frame(Self::TX, &data));
        }
        frames
    }

    fn next_counter(&mut self) -> u8 {
        let counter = self.counter;
        self.counter = (self.counter + 1) & 0x0F;
        counter
    }
}

fn tp20_link() -> MockLink {
    let mut ecu = Tp20Ecu::default();
    MockLink::with_responder(move |frame| ecu.on_frame(frame))
}

#[test]
fn test_tp20_full_stack() {
    let link = tp20_link();
    let table = Arc::new(Mutex::new(FilterTable::new(MockFilterBank::new())));
    let mut session =
        Tp20Session::new(Tp20Config::default(), link.clone(), table.clone(), ManualClock::new()).unwrap();

    let channel = session.connect(0x01, 0x01).unwrap();
    assert_eq!(channel.own_id, 0x740);
    assert_eq!(channel.peer_id, 0x300);
    assert_eq!(channel.wait_time, Duration::from_millis(10));
    assert_eq!(session.state(), SessionState::InSession);
    {
        let table = table.lock();
        let ids: Vec<CanId> = table.entries().iter().map(|e| e.identifier).collect();
        assert_eq!(ids, vec![0x300, 0x740, 0x300, 0x740]);
        assert!(table.entries().iter().all(|e| e.kind == FilterKind::StandardExact));
    }

    let mut client = DiagnosticClient::new(session);
    assert_eq!(client.change_session(0x89).unwrap(), vec![0x89]);
    assert_eq!(client.read_data_by_id(0xF190).unwrap(), b"WVWZZZ1KZAM000001".to_vec());
    assert_eq!(
        client.call(&RequestBuilder::new(0x19).param(0x02)),
        Err(AutomotiveError::NegativeResponse(0x11))
    );

    let mut session = client.into_inner();
    assert!(session.listener_armed());
    session.close_channel(false).unwrap();
    assert_eq!(session.state(), SessionState::Idle);
    assert!(table.lock().entries().is_empty());
}

#[test]
fn test_tp20_peer_disconnect_through_keepalive_thread() {
    let link = tp20_link();
    let session = Arc::new(Mutex::new(
        Tp20Session::new(Tp20Config::default(), link.clone(), NoFilter, ManualClock::new()).unwrap(),
    ));
    session.lock().connect(0x01, 0x01).unwrap();
    link.take_sent();

    let driver = keepalive::spawn(session.clone(), Duration::from_millis(1)).unwrap();
    link.inject(ecu_frame(Tp20Ecu::TX, &[0xA8]));

    let mut closed = false;
    for _ in 0..500 {
        if session.lock().state() == SessionState::Idle {
            closed = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    driver.stop();

    assert!(closed);
    let sent = link.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].data(), &[0xA8]);
}

#[test]
fn test_tp20_foreground_requests_alongside_keepalive() {
    let link = tp20_link();
    let session = Arc::new(Mutex::new(
        Tp20Session::new(Tp20Config::default(), link.clone(), NoFilter, ManualClock::new()).unwrap(),
    ));
    session.lock().connect(0x01, 0x01).unwrap();
    let driver = keepalive::spawn(session.clone(), Duration::from_millis(1)).unwrap();

    for _ in 0..10 {
        let response = session.lock().request_response_client(&[0x10, 0x89]).unwrap();
        assert_eq!(response, vec![0x50, 0x89]);
    }
    drop(driver);

    assert_eq!(session.lock().state(), SessionState::InSession);
}
