//! SIP message builder utilities

use super::message::{SipError, SipHeaders, SipMethod, SipRequest, SipResponse};
use rsip::{Header, Headers, Response, StatusCode, Version};

pub const USER_AGENT: &str = concat!("yakphone/", env!("CARGO_PKG_VERSION"));
pub const ALLOW: &str = "INVITE, ACK, CANCEL, BYE, OPTIONS, INFO";

/// Fresh RFC 3261 branch parameter
pub fn new_branch() -> String {
    format!("z9hG4bK{}", uuid::Uuid::new_v4().simple())
}

/// Build a response to a received request
pub struct ResponseBuilder {
    status_code: u16,
    to_tag: Option<String>,
    headers: Vec<Header>,
    body: Vec<u8>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            to_tag: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    /// Tag added to the To header when the request carried none
    pub fn to_tag(mut self, tag: impl Into<String>) -> Self {
        self.to_tag = Some(tag.into());
        self
    }

    pub fn contact(self, uri: &str) -> Self {
        self.header("Contact", &format!("<{}>", uri))
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push(Header::Other(name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, content_type: &str, body: Vec<u8>) -> Self {
        self.headers.push(Header::ContentType(content_type.to_string().into()));
        self.body = body;
        self
    }

    pub fn build_for_request(self, request: &SipRequest) -> Result<SipResponse, SipError> {
        let mut headers = Vec::new();

        // Copy essential headers from request
        for header in request.headers().iter() {
            match header {
                Header::Via(_) | Header::From(_) | Header::CallId(_) | Header::CSeq(_) => {
                    headers.push(header.clone());
                }
                Header::To(to) => match (&self.to_tag, request.to_tag()) {
                    (Some(tag), None) => {
                        let line = to.to_string();
                        let value = line.split_once(':').map(|(_, v)| v.trim()).unwrap_or(&line);
                        headers.push(Header::To(format!("{};tag={}", value, tag).into()));
                    }
                    _ => headers.push(header.clone()),
                },
                _ => {}
            }
        }

        headers.extend(self.headers);
        headers.push(Header::Other("User-Agent".to_string(), USER_AGENT.to_string()));
        headers.push(Header::ContentLength(self.body.len().to_string().into()));

        let response = Response {
            status_code: StatusCode::from(self.status_code),
            headers: Headers::from(headers),
            body: self.body,
            version: Version::V2,
        };

        Ok(SipResponse::new(response))
    }
}

/// Build an outgoing request. Rendered as text and validated by parsing it
/// back, so a malformed request never reaches the transport.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    method: SipMethod,
    request_uri: String,
    via_host: String,
    branch: String,
    from: String,
    from_tag: String,
    to: String,
    to_tag: Option<String>,
    call_id: String,
    cseq: u32,
    contact: Option<String>,
    headers: Vec<(String, String)>,
    content_type: Option<String>,
    body: String,
}

impl RequestBuilder {
    pub fn new(method: SipMethod, request_uri: impl Into<String>) -> Self {
        Self {
            method,
            request_uri: request_uri.into(),
            via_host: String::new(),
            branch: new_branch(),
            from: String::new(),
            from_tag: String::new(),
            to: String::new(),
            to_tag: None,
            call_id: String::new(),
            cseq: 1,
            contact: None,
            headers: Vec::new(),
            content_type: None,
            body: String::new(),
        }
    }

    /// Sent-by of the Via header (`ip:port`)
    pub fn via(mut self, host: impl Into<String>) -> Self {
        self.via_host = host.into();
        self
    }

    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    pub fn from(mut self, uri: impl Into<String>, tag: impl Into<String>) -> Self {
        self.from = uri.into();
        self.from_tag = tag.into();
        self
    }

    pub fn to(mut self, uri: impl Into<String>, tag: Option<String>) -> Self {
        self.to = uri.into();
        self.to_tag = tag;
        self
    }

    pub fn call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = call_id.into();
        self
    }

    pub fn cseq(mut self, cseq: u32) -> Self {
        self.cseq = cseq;
        self
    }

    pub fn contact(mut self, uri: impl Into<String>) -> Self {
        self.contact = Some(uri.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, content_type: impl Into<String>, body: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self.body = body.into();
        self
    }

    pub fn branch_id(&self) -> &str {
        &self.branch
    }

    pub fn build(self) -> Result<SipRequest, SipError> {
        if self.via_host.is_empty() || self.from.is_empty() || self.to.is_empty() || self.call_id.is_empty() {
            return Err(SipError::InvalidMessage(format!(
                "{} request is missing mandatory headers",
                self.method
            )));
        }

        let to_tag = self
            .to_tag
            .as_ref()
            .map(|tag| format!(";tag={}", tag))
            .unwrap_or_default();

        let mut msg = format!(
            "{method} {uri} SIP/2.0\r\n\
             Via: SIP/2.0/UDP {via};branch={branch};rport\r\n\
             Max-Forwards: 70\r\n\
             From: <{from}>;tag={from_tag}\r\n\
             To: <{to}>{to_tag}\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: {cseq} {method}\r\n",
            method = self.method,
            uri = self.request_uri,
            via = self.via_host,
            branch = self.branch,
            from = self.from,
            from_tag = self.from_tag,
            to = self.to,
            to_tag = to_tag,
            call_id = self.call_id,
            cseq = self.cseq,
        );

        if let Some(contact) = &self.contact {
            msg.push_str(&format!("Contact: <{}>\r\n", contact));
        }
        for (name, value) in &self.headers {
            msg.push_str(&format!("{}: {}\r\n", name, value));
        }
        msg.push_str(&format!("User-Agent: {}\r\n", USER_AGENT));
        if let Some(content_type) = &self.content_type {
            msg.push_str(&format!("Content-Type: {}\r\n", content_type));
        }
        msg.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));
        msg.push_str(&self.body);

        SipRequest::parse(msg.as_bytes())
    }
}

/// ACK for a non-2xx final response: same branch, Call-ID, From and
/// CSeq number as the INVITE, To taken from the response (RFC 3261 17.1.1.3).
pub fn ack_for_failure(invite: &SipRequest, response: &SipResponse) -> Result<SipRequest, SipError> {
    let (cseq, _) = invite
        .cseq()
        .ok_or_else(|| SipError::InvalidMessage("INVITE without CSeq".to_string()))?;
    let via = invite
        .header("Via")
        .ok_or_else(|| SipError::InvalidMessage("INVITE without Via".to_string()))?;

    let mut msg = format!(
        "ACK {uri} SIP/2.0\r\n\
         Via: {via}\r\n\
         Max-Forwards: 70\r\n\
         From: {from}\r\n\
         To: {to}\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: {cseq} ACK\r\n",
        uri = invite.uri(),
        via = via,
        from = invite.header("From").unwrap_or_default(),
        to = response.header("To").unwrap_or_default(),
        call_id = invite.call_id().unwrap_or_default(),
        cseq = cseq,
    );
    for auth in ["Authorization", "Proxy-Authorization"] {
        if let Some(value) = invite.header(auth) {
            msg.push_str(&format!("{}: {}\r\n", auth, value));
        }
    }
    msg.push_str("Content-Length: 0\r\n\r\n");

    SipRequest::parse(msg.as_bytes())
}

/// CANCEL for a pending INVITE: same branch and Request-URI, CSeq method CANCEL
pub fn cancel_for(invite: &SipRequest) -> Result<SipRequest, SipError> {
    let (cseq, _) = invite
        .cseq()
        .ok_or_else(|| SipError::InvalidMessage("INVITE without CSeq".to_string()))?;
    let via = invite
        .header("Via")
        .ok_or_else(|| SipError::InvalidMessage("INVITE without Via".to_string()))?;

    let msg = format!(
        "CANCEL {uri} SIP/2.0\r\n\
         Via: {via}\r\n\
         Max-Forwards: 70\r\n\
         From: {from}\r\n\
         To: {to}\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: {cseq} CANCEL\r\n\
         User-Agent: {agent}\r\n\
         Content-Length: 0\r\n\r\n",
        uri = invite.uri(),
        via = via,
        from = invite.header("From").unwrap_or_default(),
        to = invite.header("To").unwrap_or_default(),
        call_id = invite.call_id().unwrap_or_default(),
        cseq = cseq,
        agent = USER_AGENT,
    );

    SipRequest::parse(msg.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite() -> SipRequest {
        RequestBuilder::new(SipMethod::Invite, "sip:200@pbx.local")
            .via("10.0.0.5:5060")
            .branch("z9hG4bKinvite1")
            .from("sip:100@pbx.local", "ftag")
            .to("sip:200@pbx.local", None)
            .call_id("call-1@10.0.0.5")
            .cseq(1)
            .contact("sip:100@10.0.0.5:5060")
            .body("application/sdp", "v=0\r\n")
            .build()
            .unwrap()
    }

    #[test]
    fn test_request_builder() {
        let request = invite();
        assert_eq!(request.method(), Some(SipMethod::Invite));
        assert_eq!(request.branch(), Some("z9hG4bKinvite1".to_string()));
        assert_eq!(request.from_tag(), Some("ftag".to_string()));
        assert_eq!(request.to_tag(), None);
        assert_eq!(request.cseq(), Some((1, SipMethod::Invite)));
        assert_eq!(request.content_type(), Some("application/sdp".to_string()));
        assert_eq!(request.body_str(), "v=0\r\n");
    }

    #[test]
    fn test_request_builder_requires_headers() {
        let result = RequestBuilder::new(SipMethod::Bye, "sip:200@pbx.local").build();
        assert!(matches!(result, Err(SipError::InvalidMessage(_))));
    }

    #[test]
    fn test_response_adds_to_tag() {
        let request = invite();
        let response = ResponseBuilder::new(180)
            .to_tag("ttag")
            .build_for_request(&request)
            .unwrap();

        assert_eq!(response.status_code(), 180);
        assert_eq!(response.to_tag(), Some("ttag".to_string()));
        assert_eq!(response.branch(), Some("z9hG4bKinvite1".to_string()));
        assert_eq!(response.call_id(), Some("call-1@10.0.0.5".to_string()));
        assert_eq!(response.cseq(), Some((1, SipMethod::Invite)));
    }

    #[test]
    fn test_cancel_and_ack_reuse_invite_branch() {
        let request = invite();
        let cancel = cancel_for(&request).unwrap();
        assert_eq!(cancel.method(), Some(SipMethod::Cancel));
        assert_eq!(cancel.branch(), request.branch());
        assert_eq!(cancel.cseq(), Some((1, SipMethod::Cancel)));

        let busy = ResponseBuilder::new(486)
            .to_tag("remote")
            .build_for_request(&request)
            .unwrap();
        let ack = ack_for_failure(&request, &busy).unwrap();
        assert_eq!(ack.method(), Some(SipMethod::Ack));
        assert_eq!(ack.branch(), request.branch());
        assert_eq!(ack.to_tag(), Some("remote".to_string()));
        assert_eq!(ack.cseq(), Some((1, SipMethod::Ack)));
    }
}
