//! Application layer seam.
//!
//! Diagnostic service encoders (UDS, KWP2000) live above this crate. What they
//! need from it is here:
//! - [`RequestBuilder`] assembles a request into an owned buffer
//! - [`DiagnosticResponse`] tells a positive reply from a `0x7F` negative one
//! - [`DiagnosticClient`] runs requests over any [`DiagnosticTransport`]
//!
//! # Examples
//!
//! ```text
//! let link = Can::with_bitrate(port, CanBitrate::Rate500K, CanOptions::NONE);
//! let isotp = IsoTpSession::with_link(IsoTpConfig::default(), link)?;
//! let mut client = DiagnosticClient::new(isotp);
//!
//! client.change_session(0x03)?;
//! let vin = client.read_data_by_id(0xF190)?;
//! ```

use crate::error::{AutomotiveError, Result, TimeoutKind};
use crate::transport::DiagnosticTransport;

pub const NEGATIVE_RESPONSE: u8 = 0x7F;
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;
pub const NRC_RESPONSE_PENDING: u8 = 0x78;

pub const SID_DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
pub const SID_READ_DATA_BY_ID: u8 = 0x22;
pub const SID_TESTER_PRESENT: u8 = 0x3E;

/// Largest request either transport can carry
const MAX_REQUEST_LEN: usize = 0xFFF;

/// Diagnostic request under construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestBuilder {
    service_id: u8,
    params: Vec<u8>,
}

impl RequestBuilder {
    pub fn new(service_id: u8) -> Self {
        Self {
            service_id,
            params: Vec::new(),
        }
    }

    pub fn service_id(&self) -> u8 {
        self.service_id
    }

    pub fn param(mut self, byte: u8) -> Self {
        self.params.push(byte);
        self
    }

    pub fn params(mut self, bytes: &[u8]) -> Self {
        self.params.extend_from_slice(bytes);
        self
    }

    /// Append a big-endian data identifier.
    pub fn did(self, did: u16) -> Self {
        self.params(&did.to_be_bytes())
    }

    /// Put `header` between the service id and the parameters added so far.
    pub fn prepend(mut self, header: &[u8]) -> Self {
        let mut params = Vec::with_capacity(header.len() + self.params.len());
        params.extend_from_slice(header);
        params.extend_from_slice(&self.params);
        self.params = params;
        self
    }

    /// Encoded length including the service id
    pub fn len(&self) -> usize {
        1 + self.params.len()
    }

    pub fn build(&self) -> Result<Vec<u8>> {
        if self.len() > MAX_REQUEST_LEN {
            return Err(AutomotiveError::PayloadTooLarge(self.len()));
        }
        let mut request = Vec::with_capacity(self.len());
        request.push(self.service_id);
        request.extend_from_slice(&self.params);
        Ok(request)
    }
}

/// Decoded first byte of a diagnostic reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticResponse {
    Positive { service_id: u8, data: Vec<u8> },
    Negative { service_id: u8, nrc: u8 },
}

impl DiagnosticResponse {
    /// Interpret `raw` as the reply to a request with `request_sid`.
    pub fn interpret(request_sid: u8, raw: &[u8]) -> Result<Self> {
        let Some(&first) = raw.first() else {
            return Err(AutomotiveError::ProtocolViolation("empty diagnostic response".into()));
        };

        if first == NEGATIVE_RESPONSE {
            if raw.len() < 3 {
                return Err(AutomotiveError::ProtocolViolation("negative response too short".into()));
            }
            return Ok(DiagnosticResponse::Negative {
                service_id: raw[1],
                nrc: raw[2],
            });
        }

        if first != request_sid.wrapping_add(POSITIVE_RESPONSE_OFFSET) {
            return Err(AutomotiveError::ProtocolViolation(format!(
                "response SID {:#04x} does not answer {:#04x}",
                first, request_sid
            )));
        }
        Ok(DiagnosticResponse::Positive {
            service_id: request_sid,
            data: raw[1..].to_vec(),
        })
    }

    pub fn is_positive(&self) -> bool {
        matches!(self, DiagnosticResponse::Positive { .. })
    }

    pub fn is_response_pending(&self) -> bool {
        matches!(
            self,
            DiagnosticResponse::Negative {
                nrc: NRC_RESPONSE_PENDING,
                ..
            }
        )
    }

    /// Positive payload, or the NRC as [`AutomotiveError::NegativeResponse`].
    pub fn into_result(self) -> Result<Vec<u8>> {
        match self {
            DiagnosticResponse::Positive { data, .. } => Ok(data),
            DiagnosticResponse::Negative { nrc, .. } => Err(AutomotiveError::NegativeResponse(nrc)),
        }
    }
}

/// Request/response client over a diagnostic transport
pub struct DiagnosticClient<T: DiagnosticTransport> {
    transport: T,
    max_pending: usize,
}

impl<T: DiagnosticTransport> DiagnosticClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            max_pending: 16,
        }
    }

    /// Response-pending replies tolerated for a single request
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Send `request` and wait out any response-pending replies.
    pub fn request(&mut self, request: &RequestBuilder) -> Result<DiagnosticResponse> {
        let sid = request.service_id();
        let raw = self.transport.request_response_client(&request.build()?)?;
        let mut response = DiagnosticResponse::interpret(sid, &raw)?;

        let mut pending = 0;
        while response.is_response_pending() {
            pending += 1;
            if pending > self.max_pending {
                tracing::warn!(sid, pending, "ECU kept answering response pending");
                return Err(AutomotiveError::Timeout(TimeoutKind::Response));
            }
            tracing::debug!(sid, "response pending");
            let raw = self.transport.read()?;
            response = DiagnosticResponse::interpret(sid, &raw)?;
        }
        Ok(response)
    }

    /// Like [`request`](Self::request) but a negative reply becomes an error.
    pub fn call(&mut self, request: &RequestBuilder) -> Result<Vec<u8>> {
        self.request(request)?.into_result()
    }

    pub fn change_session(&mut self, session: u8) -> Result<Vec<u8>> {
        self.call(&RequestBuilder::new(SID_DIAGNOSTIC_SESSION_CONTROL).param(session))
    }

    pub fn tester_present(&mut self) -> Result<()> {
        self.call(&RequestBuilder::new(SID_TESTER_PRESENT).param(0x00))?;
        Ok(())
    }

    /// Read a data identifier; the echoed DID is stripped from the result.
    pub fn read_data_by_id(&mut self, did: u16) -> Result<Vec<u8>> {
        let data = self.call(&RequestBuilder::new(SID_READ_DATA_BY_ID).did(did))?;
        match data.strip_prefix(&did.to_be_bytes()[..]) {
            Some(value) => Ok(value.to_vec()),
            None => Err(AutomotiveError::ProtocolViolation(format!(
                "reply does not echo DID {:#06x}",
                did
            ))),
        }
    }
}

#[cfg(test)]
mod tests;
