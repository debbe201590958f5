//! SIP message types and parsing

use crate::domain::shared::error::DomainError;
use bytes::Bytes;
use rsip::{Headers, Method, Request, Response, Uri};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Transaction error: {0}")]
    TransactionError(String),

    #[error("Authentication error: {0}")]
    Authentication(String),
}

impl From<SipError> for DomainError {
    fn from(err: SipError) -> Self {
        match err {
            SipError::ParseError(msg) | SipError::InvalidMessage(msg) => DomainError::ProtocolError(msg),
            SipError::TransportError(msg) => DomainError::TransportFailure(msg),
            SipError::TransactionError(msg) => DomainError::Internal(msg),
            SipError::Authentication(msg) => DomainError::AuthFailure(msg),
        }
    }
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::ParseError(err.to_string())
    }
}

/// SIP method types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Info,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Info => "INFO",
        }
    }

    pub fn from_rsip(method: &Method) -> Option<Self> {
        match method {
            Method::Register => Some(SipMethod::Register),
            Method::Invite => Some(SipMethod::Invite),
            Method::Ack => Some(SipMethod::Ack),
            Method::Cancel => Some(SipMethod::Cancel),
            Method::Bye => Some(SipMethod::Bye),
            Method::Options => Some(SipMethod::Options),
            Method::Info => Some(SipMethod::Info),
            _ => None,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "REGISTER" => Some(SipMethod::Register),
            "INVITE" => Some(SipMethod::Invite),
            "ACK" => Some(SipMethod::Ack),
            "CANCEL" => Some(SipMethod::Cancel),
            "BYE" => Some(SipMethod::Bye),
            "OPTIONS" => Some(SipMethod::Options),
            "INFO" => Some(SipMethod::Info),
            _ => None,
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Expand compact header forms (RFC 3261 section 7.3.3)
fn canonical_header_name(name: &str) -> &str {
    match name {
        "v" | "V" => "Via",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "i" | "I" => "Call-ID",
        "m" | "M" => "Contact",
        "l" | "L" => "Content-Length",
        "c" | "C" => "Content-Type",
        other => other,
    }
}

/// All values of the named header, in message order
fn header_values(headers: &Headers, name: &str) -> Vec<String> {
    headers
        .iter()
        .filter_map(|h| {
            // rsip renders every header as "Name: value"
            let line = h.to_string();
            let (key, value) = line.split_once(':')?;
            canonical_header_name(key.trim())
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_string())
        })
        .collect()
}

/// Value of a `;key=value` parameter of a header. Parameters inside a
/// `<...>` URI are skipped, so `<sip:a@b;transport=udp>;tag=x` yields only
/// the `tag` parameter.
pub fn header_param(value: &str, key: &str) -> Option<String> {
    let params = match value.rfind('>') {
        Some(pos) => &value[pos + 1..],
        None => value,
    };

    // First segment is either empty (after '>') or the bare URI
    params
        .split(';')
        .skip(1)
        .map(|p| p.split_once('=').unwrap_or((p, "")))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case(key))
        .map(|(_, v)| v.trim().trim_matches('"').to_string())
}

/// URI part of a name-addr header value (`"Bob" <sip:bob@host>;tag=1` -> `sip:bob@host`)
pub fn header_uri(value: &str) -> String {
    if let (Some(start), Some(end)) = (value.find('<'), value.find('>')) {
        if start < end {
            return value[start + 1..end].to_string();
        }
    }
    value.split(';').next().unwrap_or(value).trim().to_string()
}

/// Header accessors shared by requests and responses
pub trait SipHeaders {
    fn headers(&self) -> &Headers;

    /// First value of the named header
    fn header(&self, name: &str) -> Option<String> {
        header_values(self.headers(), name).into_iter().next()
    }

    fn header_all(&self, name: &str) -> Vec<String> {
        header_values(self.headers(), name)
    }

    fn call_id(&self) -> Option<String> {
        self.header("Call-ID")
    }

    /// CSeq number and method
    fn cseq(&self) -> Option<(u32, SipMethod)> {
        let value = self.header("CSeq")?;
        let mut parts = value.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        let method = SipMethod::parse(parts.next()?)?;
        Some((seq, method))
    }

    /// Branch parameter of the topmost Via
    fn branch(&self) -> Option<String> {
        let via = self.header("Via")?;
        // A header line may carry several comma-separated Via values
        let topmost = via.split(',').next().unwrap_or_default();
        topmost
            .split(';')
            .skip(1)
            .filter_map(|p| p.split_once('='))
            .find(|(k, _)| k.trim().eq_ignore_ascii_case("branch"))
            .map(|(_, v)| v.trim().to_string())
    }

    fn from_tag(&self) -> Option<String> {
        self.header("From").and_then(|v| header_param(&v, "tag"))
    }

    fn to_tag(&self) -> Option<String> {
        self.header("To").and_then(|v| header_param(&v, "tag"))
    }

    fn from_uri(&self) -> Option<String> {
        self.header("From").map(|v| header_uri(&v))
    }

    fn to_uri(&self) -> Option<String> {
        self.header("To").map(|v| header_uri(&v))
    }

    fn contact_uri(&self) -> Option<String> {
        self.header("Contact").map(|v| header_uri(&v))
    }

    fn content_type(&self) -> Option<String> {
        self.header("Content-Type")
    }
}

/// SIP Request wrapper
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub inner: Request,
}

impl SipRequest {
    pub fn new(inner: Request) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let request = rsip::Request::try_from(data)?;
        Ok(Self::new(request))
    }

    pub fn method(&self) -> Option<SipMethod> {
        SipMethod::from_rsip(&self.inner.method)
    }

    /// Method name even for methods this user agent does not implement
    pub fn method_name(&self) -> String {
        self.inner.method.to_string()
    }

    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.inner.body).into_owned()
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

impl SipHeaders for SipRequest {
    fn headers(&self) -> &Headers {
        &self.inner.headers
    }
}

/// SIP Response wrapper
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub inner: Response,
}

impl SipResponse {
    pub fn new(inner: Response) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let response = rsip::Response::try_from(data)?;
        Ok(Self::new(response))
    }

    pub fn status_code(&self) -> u16 {
        self.inner.status_code.clone().into()
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status_code())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code())
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

impl SipHeaders for SipResponse {
    fn headers(&self) -> &Headers {
        &self.inner.headers
    }
}

/// SIP Message (either request or response)
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        if data.starts_with(b"SIP/") {
            return Ok(SipMessage::Response(SipResponse::parse(data)?));
        }

        if let Ok(request) = SipRequest::parse(data) {
            return Ok(SipMessage::Request(request));
        }

        Err(SipError::ParseError(
            "Could not parse as SIP request or response".to_string(),
        ))
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, SipMessage::Response(_))
    }

    pub fn as_request(&self) -> Option<&SipRequest> {
        match self {
            SipMessage::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&SipResponse> {
        match self {
            SipMessage::Response(resp) => Some(resp),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}
