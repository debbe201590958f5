//! Softphone wired to an in-memory transport and the real HTTP router

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower::ServiceExt; // For `oneshot`
use yakphone::application::media::NullAudioDevice;
use yakphone::application::{ControlBridge, Engine, EngineConfig, EngineHandle, StatusSnapshot};
use yakphone::config::Settings;
use yakphone::infrastructure::protocols::sip::{
    IncomingMessage, MemoryTransport, OutgoingMessage, ResponseBuilder, SipMessage, SipRequest,
    SipResponse,
};
use yakphone::interface::api::build_router;

pub const SERVER: &str = "10.0.0.1:5060";
pub const LOCAL: &str = "10.0.0.5:5060";
const WAIT: Duration = Duration::from_secs(5);

pub struct TestPhone {
    pub app: Router,
    pub handle: EngineHandle,
    wire: mpsc::UnboundedReceiver<OutgoingMessage>,
    inbound: mpsc::Sender<IncomingMessage>,
}

impl TestPhone {
    /// Start with `extension 100 @ pbx.local`; `overrides` replace settings.
    /// Retransmission timers are long enough to stay out of the way.
    pub fn start(overrides: &[(&str, &str)]) -> Self {
        let mut vars: HashMap<String, String> = [
            ("SIP_SERVER", "pbx.local"),
            ("EXTENSION", "100"),
            ("PASSWORD", "secret"),
            ("T1_MS", "60000"),
            ("T2_MS", "60000"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (key, value) in overrides {
            vars.insert(key.to_string(), value.to_string());
        }

        let settings = Settings::from_vars(vars).unwrap();
        let config =
            EngineConfig::from_settings(&settings, LOCAL.parse().unwrap(), SERVER.parse().unwrap())
                .unwrap();

        let (transport, wire) = MemoryTransport::new(LOCAL.parse().unwrap());
        let (inbound, inbound_rx) = mpsc::channel(32);
        let handle = Engine::spawn(
            config,
            Arc::new(transport),
            inbound_rx,
            Arc::new(NullAudioDevice),
        );

        let prometheus_handle = PrometheusBuilder::new().build_recorder().handle();
        let app = build_router(ControlBridge::new(handle.clone()), prometheus_handle);

        Self {
            app,
            handle,
            wire,
            inbound,
        }
    }

    pub async fn next_message(&mut self) -> SipMessage {
        let message = tokio::time::timeout(WAIT, self.wire.recv())
            .await
            .expect("no SIP message sent")
            .expect("transport closed");
        SipMessage::parse(&message.data).unwrap()
    }

    pub async fn next_request(&mut self) -> SipRequest {
        match self.next_message().await {
            SipMessage::Request(request) => request,
            SipMessage::Response(r) => panic!("expected request, got {}", r.status_code()),
        }
    }

    pub async fn next_response(&mut self) -> SipResponse {
        match self.next_message().await {
            SipMessage::Response(response) => response,
            SipMessage::Request(r) => panic!("expected response, got {}", r.method_name()),
        }
    }

    pub async fn reply(&self, request: &SipRequest, response: ResponseBuilder) {
        let response = response.build_for_request(request).unwrap();
        self.deliver(SipMessage::Response(response)).await;
    }

    pub async fn inject(&self, request: String) {
        let request = SipRequest::parse(request.as_bytes()).unwrap();
        self.deliver(SipMessage::Request(request)).await;
    }

    async fn deliver(&self, message: SipMessage) {
        let source: SocketAddr = SERVER.parse().unwrap();
        self.inbound
            .send(IncomingMessage { message, source })
            .await
            .unwrap();
    }

    /// Accept the initial REGISTER and wait until the engine reports it
    pub async fn register(&mut self) {
        let register = self.next_request().await;
        assert_eq!(register.method_name(), "REGISTER");
        self.reply(&register, ResponseBuilder::ok().to_tag("registrar"))
            .await;
        self.wait_for(|s| s.registered).await;
    }

    pub async fn wait_for(&self, check: impl Fn(&StatusSnapshot) -> bool) -> StatusSnapshot {
        let mut status = self.handle.subscribe();
        tokio::time::timeout(WAIT, async {
            loop {
                let snapshot = status.borrow_and_update().clone();
                if check(&snapshot) {
                    return snapshot;
                }
                status.changed().await.unwrap();
            }
        })
        .await
        .expect("status never matched")
    }

    pub async fn post(&self, path: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method("POST").uri(path);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap();
        self.send(request).await
    }

    pub async fn get(&self, path: &str) -> (StatusCode, Value) {
        let request = Request::builder().uri(path).body(Body::empty()).unwrap();
        self.send(request).await
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap_or(Value::Null)
        };
        (status, json)
    }
}

/// INVITE from extension 300, offering PCMU
pub fn incoming_invite(call_id: &str, branch: &str) -> String {
    let sdp = "v=0\r\n\
               o=- 1 1 IN IP4 10.0.0.9\r\n\
               s=-\r\n\
               c=IN IP4 10.0.0.9\r\n\
               t=0 0\r\n\
               m=audio 30000 RTP/AVP 0\r\n\
               a=rtpmap:0 PCMU/8000\r\n";
    format!(
        "INVITE sip:100@10.0.0.5:5060 SIP/2.0\r\n\
         Via: SIP/2.0/UDP 10.0.0.1:5060;branch={branch}\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:300@pbx.local>;tag=caller\r\n\
         To: <sip:100@pbx.local>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 INVITE\r\n\
         Contact: <sip:300@10.0.0.9:5060>\r\n\
         Content-Type: application/sdp\r\n\
         Content-Length: {len}\r\n\r\n{sdp}",
        len = sdp.len(),
    )
}

/// In-dialog request from extension 300
pub fn from_caller(method: &str, call_id: &str, branch: &str, cseq: u32, to_tag: &str) -> String {
    format!(
        "{method} sip:100@10.0.0.5:5060 SIP/2.0\r\n\
         Via: SIP/2.0/UDP 10.0.0.1:5060;branch={branch}\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:300@pbx.local>;tag=caller\r\n\
         To: <sip:100@pbx.local>;tag={to_tag}\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: {cseq} {method}\r\n\
         Content-Length: 0\r\n\r\n"
    )
}
