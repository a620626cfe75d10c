use super::*;
use crate::data_link::NoFilter;
use crate::physical::mock::MockLink;
use crate::timer::ManualClock;
use crate::transport::isotp::{IsoTpConfig, IsoTpSession};
use crate::types::{Frame, IdFormat};

type Client = DiagnosticClient<IsoTpSession<MockLink, NoFilter, ManualClock>>;

fn ecu_frame(data: &[u8]) -> Frame {
    Frame::new(0x7E8, IdFormat::Standard, data).unwrap()
}

fn client_with<F>(responder: F) -> (Client, MockLink)
where
    F: FnMut(&Frame) -> Vec<Frame> + Send + 'static,
{
    let link = MockLink::with_responder(responder);
    let isotp = IsoTpSession::new(IsoTpConfig::default(), link.clone(), NoFilter, ManualClock::new()).unwrap();
    (DiagnosticClient::new(isotp), link)
}

#[test]
fn test_builder_layout() {
    let request = RequestBuilder::new(0x2E).did(0xF198).params(&[0x01, 0x02]);
    assert_eq!(request.build().unwrap(), vec![0x2E, 0xF1, 0x98, 0x01, 0x02]);
    assert_eq!(request.len(), 5);
}

#[test]
fn test_builder_prepend() {
    let request = RequestBuilder::new(0x31).params(&[0xAA, 0xBB]).prepend(&[0x01, 0xFF, 0x00]);
    assert_eq!(request.build().unwrap(), vec![0x31, 0x01, 0xFF, 0x00, 0xAA, 0xBB]);
}

#[test]
fn test_builder_rejects_oversized_request() {
    let request = RequestBuilder::new(0x36).params(&[0u8; 0xFFF]);
    assert_eq!(request.build(), Err(AutomotiveError::PayloadTooLarge(0x1000)));
}

#[test]
fn test_interpret_positive() {
    let response = DiagnosticResponse::interpret(0x22, &[0x62, 0xF1, 0x90, 0x57]).unwrap();
    assert!(response.is_positive());
    assert_eq!(response.into_result().unwrap(), vec![0xF1, 0x90, 0x57]);
}

#[test]
fn test_interpret_negative() {
    let response = DiagnosticResponse::interpret(0x27, &[0x7F, 0x27, 0x35]).unwrap();
    assert_eq!(
        response,
        DiagnosticResponse::Negative {
            service_id: 0x27,
            nrc: 0x35
        }
    );
    assert_eq!(response.into_result(), Err(AutomotiveError::NegativeResponse(0x35)));
}

#[test]
fn test_interpret_malformed() {
    assert!(DiagnosticResponse::interpret(0x10, &[]).is_err());
    assert!(DiagnosticResponse::interpret(0x10, &[0x7F, 0x10]).is_err());
    assert!(DiagnosticResponse::interpret(0x10, &[0x51, 0x01]).is_err());
}

#[test]
fn test_change_session() {
    let (mut client, link) = client_with(|frame| {
        vec![ecu_frame(&[0x06, 0x50, frame.byte(2), 0x00, 0x32, 0x01, 0xF4])]
    });

    assert_eq!(client.change_session(0x03).unwrap(), vec![0x03, 0x00, 0x32, 0x01, 0xF4]);
    assert_eq!(link.sent()[0].data(), &[0x02, 0x10, 0x03]);
}

#[test]
fn test_read_data_by_id_multi_frame() {
    let (mut client, _link) = client_with(|frame| match frame.byte(0) & 0xF0 {
        0x00 => vec![
            ecu_frame(&[0x10, 0x13, 0x62, 0xF1, 0x90, b'W', b'V', b'W']),
            ecu_frame(&[0x21, b'Z', b'Z', b'Z', b'1', b'K', b'Z', b'A']),
            ecu_frame(&[0x22, b'M', b'0', b'0', b'0', b'0', b'1', 0xCC]),
        ],
        _ => Vec::new(),
    });

    assert_eq!(client.read_data_by_id(0xF190).unwrap(), b"WVWZZZ1KZAM00001".to_vec());
}

#[test]
fn test_response_pending_is_waited_out() {
    let (mut client, _link) = client_with(|frame| match frame.byte(1) {
        0x31 => vec![
            ecu_frame(&[0x03, 0x7F, 0x31, 0x78]),
            ecu_frame(&[0x03, 0x7F, 0x31, 0x78]),
            ecu_frame(&[0x04, 0x71, 0x01, 0xFF, 0x00]),
        ],
        _ => Vec::new(),
    });

    let request = RequestBuilder::new(0x31).params(&[0x01, 0xFF, 0x00]);
    assert_eq!(client.call(&request).unwrap(), vec![0x01, 0xFF, 0x00]);
}

#[test]
fn test_response_pending_limit() {
    let (client, _link) = client_with(|_| vec![ecu_frame(&[0x03, 0x7F, 0x31, 0x78]); 4]);
    let mut client = client.with_max_pending(2);

    let request = RequestBuilder::new(0x31).param(0x01);
    assert!(client.call(&request).unwrap_err().is_timeout());
}

#[test]
fn test_negative_response_surfaces_nrc() {
    let (mut client, _link) = client_with(|_| vec![ecu_frame(&[0x03, 0x7F, 0x3E, 0x12])]);
    assert_eq!(client.tester_present(), Err(AutomotiveError::NegativeResponse(0x12)));
}
