//! SIP Digest Authentication, client side (RFC 2617, RFC 3261)

use super::message::{SipError, SipHeaders, SipResponse};
use crate::domain::account::Credentials;
use rand::Rng;
use std::collections::HashMap;
use tracing::debug;

/// Which header carried the challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    /// 401 / WWW-Authenticate, answered with Authorization
    Www,
    /// 407 / Proxy-Authenticate, answered with Proxy-Authorization
    Proxy,
}

impl ChallengeKind {
    pub fn response_header(&self) -> &'static str {
        match self {
            ChallengeKind::Www => "Authorization",
            ChallengeKind::Proxy => "Proxy-Authorization",
        }
    }
}

/// Authentication challenge received from a registrar or proxy
#[derive(Debug, Clone)]
pub struct DigestChallenge {
    pub kind: ChallengeKind,
    pub realm: String,
    pub nonce: String,
    pub algorithm: String,
    pub qop: Option<String>,
    pub opaque: Option<String>,
    /// The server rejected only the nonce, the credentials were fine
    pub stale: bool,
}

impl DigestChallenge {
    /// Extract the challenge from a 401 or 407 response
    pub fn from_response(response: &SipResponse) -> Result<Self, SipError> {
        let (kind, header) = match response.status_code() {
            401 => (ChallengeKind::Www, "WWW-Authenticate"),
            407 => (ChallengeKind::Proxy, "Proxy-Authenticate"),
            code => {
                return Err(SipError::Authentication(format!(
                    "{} is not an authentication challenge",
                    code
                )))
            }
        };

        let value = response.header(header).ok_or_else(|| {
            SipError::Authentication(format!("{} response without {} header", response.status_code(), header))
        })?;

        Self::parse(kind, &value)
    }

    /// Parse a `Digest realm="...", nonce="..."` header value
    pub fn parse(kind: ChallengeKind, value: &str) -> Result<Self, SipError> {
        let params = parse_digest_params(value)?;

        let realm = params
            .get("realm")
            .ok_or_else(|| SipError::Authentication("Missing realm in challenge".to_string()))?
            .to_string();
        let nonce = params
            .get("nonce")
            .ok_or_else(|| SipError::Authentication("Missing nonce in challenge".to_string()))?
            .to_string();

        let algorithm = params
            .get("algorithm")
            .cloned()
            .unwrap_or_else(|| "MD5".to_string());
        if !algorithm.eq_ignore_ascii_case("MD5") {
            return Err(SipError::Authentication(format!(
                "Unsupported digest algorithm: {}",
                algorithm
            )));
        }

        // Only "auth" protection is supported; "auth-int" alone is refused
        let qop = match params.get("qop") {
            Some(offered) => {
                if offered.split(',').any(|q| q.trim().eq_ignore_ascii_case("auth")) {
                    Some("auth".to_string())
                } else {
                    return Err(SipError::Authentication(format!(
                        "Unsupported qop: {}",
                        offered
                    )));
                }
            }
            None => None,
        };

        Ok(Self {
            kind,
            realm,
            nonce,
            algorithm,
            qop,
            opaque: params.get("opaque").cloned(),
            stale: params
                .get("stale")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }

    /// Build the Authorization / Proxy-Authorization header value
    pub fn authorize(&self, credentials: &Credentials, method: &str, uri: &str) -> String {
        let cnonce = self.qop.as_ref().map(|_| generate_cnonce());
        let nc = "00000001";

        let response = calculate_response(
            &credentials.username,
            &credentials.password,
            &self.realm,
            &self.nonce,
            method,
            uri,
            self.qop.as_deref(),
            Some(nc),
            cnonce.as_deref(),
        );

        let mut value = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm={}"#,
            credentials.username, self.realm, self.nonce, uri, response, self.algorithm
        );
        if let (Some(qop), Some(cnonce)) = (&self.qop, &cnonce) {
            value.push_str(&format!(r#", qop={}, nc={}, cnonce="{}""#, qop, nc, cnonce));
        }
        if let Some(opaque) = &self.opaque {
            value.push_str(&format!(r#", opaque="{}""#, opaque));
        }

        debug!("Answering {} challenge for realm {}", method, self.realm);
        value
    }
}

/// Parsed Authorization header
#[derive(Debug, Clone)]
pub struct AuthorizationHeader {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub qop: Option<String>,
    pub nc: Option<String>,
    pub cnonce: Option<String>,
    pub opaque: Option<String>,
}

impl AuthorizationHeader {
    pub fn parse(value: &str) -> Result<Self, SipError> {
        let params = parse_digest_params(value)?;
        let required = |key: &str| {
            params.get(key).cloned().ok_or_else(|| {
                SipError::Authentication(format!("Missing {} in Authorization", key))
            })
        };

        Ok(Self {
            username: required("username")?,
            realm: required("realm")?,
            nonce: required("nonce")?,
            uri: required("uri")?,
            response: required("response")?,
            qop: params.get("qop").cloned(),
            nc: params.get("nc").cloned(),
            cnonce: params.get("cnonce").cloned(),
            opaque: params.get("opaque").cloned(),
        })
    }

    /// Check the response against a password
    pub fn verify(&self, password: &str, method: &str) -> bool {
        let expected = calculate_response(
            &self.username,
            password,
            &self.realm,
            &self.nonce,
            method,
            &self.uri,
            self.qop.as_deref(),
            self.nc.as_deref(),
            self.cnonce.as_deref(),
        );
        expected == self.response
    }
}

/// Parse Digest authentication parameters. Commas inside quoted values
/// (`qop="auth,auth-int"`) do not split parameters.
fn parse_digest_params(value: &str) -> Result<HashMap<String, String>, SipError> {
    let digest_str = value
        .trim()
        .strip_prefix("Digest")
        .ok_or_else(|| SipError::Authentication(format!("Not a Digest header: {}", value)))?
        .trim();

    let mut params = HashMap::new();
    let mut current = String::new();
    let mut in_quotes = false;

    let mut flush = |part: &str| {
        if let Some((key, val)) = part.split_once('=') {
            params.insert(
                key.trim().to_ascii_lowercase(),
                val.trim().trim_matches('"').to_string(),
            );
        }
    };

    for c in digest_str.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => {
                flush(&current);
                current.clear();
            }
            _ => current.push(c),
        }
    }
    flush(&current);

    Ok(params)
}

fn generate_cnonce() -> String {
    let mut rng = rand::thread_rng();
    let random_bytes: Vec<u8> = (0..8).map(|_| rng.gen()).collect();
    hex::encode(random_bytes)
}

/// Calculate digest response
#[allow(clippy::too_many_arguments)]
pub fn calculate_response(
    username: &str,
    password: &str,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
    qop: Option<&str>,
    nc: Option<&str>,
    cnonce: Option<&str>,
) -> String {
    // HA1 = MD5(username:realm:password)
    let ha1 = {
        let digest = md5::compute(format!("{}:{}:{}", username, realm, password));
        format!("{:x}", digest)
    };

    // HA2 = MD5(method:uri)
    let ha2 = {
        let digest = md5::compute(format!("{}:{}", method, uri));
        format!("{:x}", digest)
    };

    // Response = MD5(HA1:nonce:HA2) or MD5(HA1:nonce:nc:cnonce:qop:HA2)
    if let Some(qop_value) = qop {
        let nc_value = nc.unwrap_or("00000001");
        let cnonce_value = cnonce.unwrap_or("");
        let digest = md5::compute(format!(
            "{}:{}:{}:{}:{}:{}",
            ha1, nonce, nc_value, cnonce_value, qop_value, ha2
        ));
        format!("{:x}", digest)
    } else {
        let digest = md5::compute(format!("{}:{}:{}", ha1, nonce, ha2));
        format!("{:x}", digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_challenge_with_quoted_qop() {
        let value = r#"Digest realm="asterisk", nonce="1a2b3c", algorithm=MD5, qop="auth,auth-int", opaque="xyz""#;
        let challenge = DigestChallenge::parse(ChallengeKind::Www, value).unwrap();

        assert_eq!(challenge.realm, "asterisk");
        assert_eq!(challenge.nonce, "1a2b3c");
        assert_eq!(challenge.qop.as_deref(), Some("auth"));
        assert_eq!(challenge.opaque.as_deref(), Some("xyz"));
        assert!(!challenge.stale);
    }

    #[test]
    fn test_parse_stale_flag() {
        let value = r#"Digest realm="pbx", nonce="fresh", stale=TRUE"#;
        let challenge = DigestChallenge::parse(ChallengeKind::Www, value).unwrap();
        assert!(challenge.stale);

        let value = r#"Digest realm="pbx", nonce="fresh", stale="false""#;
        let challenge = DigestChallenge::parse(ChallengeKind::Www, value).unwrap();
        assert!(!challenge.stale);
    }

    #[test]
    fn test_rejects_unsupported_challenges() {
        let sha = r#"Digest realm="x", nonce="n", algorithm=SHA-256"#;
        assert!(DigestChallenge::parse(ChallengeKind::Www, sha).is_err());

        let basic = r#"Basic realm="x""#;
        assert!(DigestChallenge::parse(ChallengeKind::Www, basic).is_err());

        let no_nonce = r#"Digest realm="x""#;
        assert!(DigestChallenge::parse(ChallengeKind::Proxy, no_nonce).is_err());
    }

    #[test]
    fn test_authorize_round_trips_through_verify() {
        let credentials = Credentials::new("100", "secret");
        let challenge = DigestChallenge::parse(
            ChallengeKind::Proxy,
            r#"Digest realm="pbx", nonce="abc", qop="auth""#,
        )
        .unwrap();

        let value = challenge.authorize(&credentials, "INVITE", "sip:200@pbx");
        let auth = AuthorizationHeader::parse(&value).unwrap();

        assert_eq!(auth.username, "100");
        assert_eq!(auth.uri, "sip:200@pbx");
        assert!(auth.cnonce.is_some());
        assert!(auth.verify("secret", "INVITE"));
        assert!(!auth.verify("wrong", "INVITE"));
        assert!(!auth.verify("secret", "REGISTER"));
    }

    #[test]
    fn test_calculate_response_rfc2617_vector() {
        // Example from RFC 2617 section 3.5
        let response = calculate_response(
            "Mufasa",
            "Circle Of Life",
            "testrealm@host.com",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            "GET",
            "/dir/index.html",
            Some("auth"),
            Some("00000001"),
            Some("0a4f113b"),
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }
}
