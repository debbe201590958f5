//! Minimal SDP (Session Description Protocol) for a single audio stream

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Payload types offered, in preference order
const OFFERED_FORMATS: &[(&str, &str)] = &[
    ("0", "PCMU/8000"),
    ("8", "PCMA/8000"),
    ("101", "telephone-event/8000"),
];

/// Simple SDP session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpSession {
    pub version: u32,
    pub origin: SdpOrigin,
    pub session_name: String,
    pub connection: Option<SdpConnection>,
    pub media: Vec<SdpMedia>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpOrigin {
    pub username: String,
    pub session_id: String,
    pub session_version: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpConnection {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpMedia {
    pub media_type: String,
    pub port: u16,
    pub protocol: String,
    pub formats: Vec<String>,
    pub rtpmap: Vec<(String, String)>,
    /// Media-level `c=` line, overrides the session-level one
    pub connection: Option<SdpConnection>,
}

fn address_type(address: &str) -> &'static str {
    if address.contains(':') {
        "IP6"
    } else {
        "IP4"
    }
}

impl SdpSession {
    /// Create the audio offer sent with an INVITE (or the answer to an
    /// INVITE without an offer)
    pub fn create_audio_session(local_ip: IpAddr, local_port: u16) -> Self {
        Self::with_formats(local_ip, local_port, OFFERED_FORMATS)
    }

    fn with_formats(local_ip: IpAddr, local_port: u16, formats: &[(&str, &str)]) -> Self {
        Self {
            version: 0,
            origin: SdpOrigin {
                username: "yakphone".to_string(),
                session_id: chrono::Utc::now().timestamp().to_string(),
                session_version: "1".to_string(),
                address: local_ip.to_string(),
            },
            session_name: "yakphone".to_string(),
            connection: Some(SdpConnection {
                address: local_ip.to_string(),
            }),
            media: vec![SdpMedia {
                media_type: "audio".to_string(),
                port: local_port,
                protocol: "RTP/AVP".to_string(),
                formats: formats.iter().map(|(pt, _)| pt.to_string()).collect(),
                rtpmap: formats
                    .iter()
                    .map(|(pt, enc)| (pt.to_string(), enc.to_string()))
                    .collect(),
                connection: None,
            }],
        }
    }

    /// Answer an offer with the formats both sides support. `None` when
    /// there is no audio stream or no common codec.
    pub fn answer(offer: &SdpSession, local_ip: IpAddr, local_port: u16) -> Option<Self> {
        let audio = offer.audio_media()?;
        let common: Vec<(&str, &str)> = OFFERED_FORMATS
            .iter()
            .copied()
            .filter(|(pt, _)| audio.formats.iter().any(|f| f == pt))
            .collect();

        // telephone-event alone is not a codec
        if !common.iter().any(|(pt, _)| *pt != "101") {
            return None;
        }

        Some(Self::with_formats(local_ip, local_port, &common))
    }

    /// Parse SDP from string
    pub fn parse(sdp_body: &str) -> Option<Self> {
        let mut version = 0;
        let mut origin: Option<SdpOrigin> = None;
        let mut session_name = String::new();
        let mut connection: Option<SdpConnection> = None;
        let mut media: Vec<SdpMedia> = Vec::new();

        for line in sdp_body.lines() {
            let line = line.trim();
            let Some((field, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();

            match field {
                "v" => version = value.parse().unwrap_or(0),
                "o" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 6 {
                        origin = Some(SdpOrigin {
                            username: parts[0].to_string(),
                            session_id: parts[1].to_string(),
                            session_version: parts[2].to_string(),
                            address: parts[5].to_string(),
                        });
                    }
                }
                "s" => session_name = value.to_string(),
                "c" => {
                    if let Some(address) = value.split_whitespace().nth(2) {
                        let conn = SdpConnection {
                            address: address.to_string(),
                        };
                        match media.last_mut() {
                            Some(current) => current.connection = Some(conn),
                            None => connection = Some(conn),
                        }
                    }
                }
                "m" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 4 {
                        media.push(SdpMedia {
                            media_type: parts[0].to_string(),
                            port: parts[1].parse().unwrap_or(0),
                            protocol: parts[2].to_string(),
                            formats: parts[3..].iter().map(|s| s.to_string()).collect(),
                            rtpmap: Vec::new(),
                            connection: None,
                        });
                    }
                }
                "a" => {
                    if let (Some(current), Some(rtpmap)) =
                        (media.last_mut(), value.strip_prefix("rtpmap:"))
                    {
                        if let Some((pt, encoding)) = rtpmap.split_once(' ') {
                            current.rtpmap.push((pt.to_string(), encoding.to_string()));
                        }
                    }
                }
                _ => {}
            }
        }

        Some(Self {
            version,
            origin: origin?,
            session_name,
            connection,
            media,
        })
    }

    /// Get media description for audio
    pub fn audio_media(&self) -> Option<&SdpMedia> {
        self.media.iter().find(|m| m.media_type == "audio")
    }

    /// Where the remote side expects our RTP
    pub fn audio_addr(&self) -> Option<SocketAddr> {
        let audio = self.audio_media()?;
        let conn = audio.connection.as_ref().or(self.connection.as_ref())?;
        let ip: IpAddr = conn.address.parse().ok()?;
        Some(SocketAddr::new(ip, audio.port))
    }
}

impl fmt::Display for SdpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v={}\r\n", self.version)?;
        write!(
            f,
            "o={} {} {} IN {} {}\r\n",
            self.origin.username,
            self.origin.session_id,
            self.origin.session_version,
            address_type(&self.origin.address),
            self.origin.address
        )?;
        write!(f, "s={}\r\n", self.session_name)?;
        if let Some(conn) = &self.connection {
            write!(f, "c=IN {} {}\r\n", address_type(&conn.address), conn.address)?;
        }
        write!(f, "t=0 0\r\n")?;

        for media in &self.media {
            write!(
                f,
                "m={} {} {} {}\r\n",
                media.media_type,
                media.port,
                media.protocol,
                media.formats.join(" ")
            )?;
            if let Some(conn) = &media.connection {
                write!(f, "c=IN {} {}\r\n", address_type(&conn.address), conn.address)?;
            }
            for (pt, encoding) in &media.rtpmap {
                write!(f, "a=rtpmap:{} {}\r\n", pt, encoding)?;
            }
            if media.rtpmap.iter().any(|(_, enc)| enc.starts_with("telephone-event")) {
                write!(f, "a=fmtp:101 0-16\r\n")?;
            }
            write!(f, "a=sendrecv\r\n")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_sdp() {
        let local_ip: IpAddr = "192.168.1.100".parse().unwrap();
        let sdp = SdpSession::create_audio_session(local_ip, 4000).to_string();

        assert!(sdp.starts_with("v=0\r\n"));
        assert!(sdp.contains("c=IN IP4 192.168.1.100\r\n"));
        assert!(sdp.contains("m=audio 4000 RTP/AVP 0 8 101\r\n"));
        assert!(sdp.contains("a=rtpmap:101 telephone-event/8000\r\n"));
    }

    #[test]
    fn test_parse_sdp_with_media_connection() {
        let sdp_str = "v=0\r\n\
                       o=pbx 123456 7890 IN IP4 192.168.1.1\r\n\
                       s=Asterisk\r\n\
                       c=IN IP4 192.168.1.1\r\n\
                       t=0 0\r\n\
                       m=audio 10000 RTP/AVP 8 101\r\n\
                       c=IN IP4 192.168.1.50\r\n\
                       a=rtpmap:8 PCMA/8000\r\n";

        let sdp = SdpSession::parse(sdp_str).unwrap();
        assert_eq!(sdp.session_name, "Asterisk");
        let audio = sdp.audio_media().unwrap();
        assert_eq!(audio.formats, vec!["8", "101"]);
        assert_eq!(audio.rtpmap, vec![("8".to_string(), "PCMA/8000".to_string())]);
        assert_eq!(sdp.audio_addr(), Some("192.168.1.50:10000".parse().unwrap()));
    }

    #[test]
    fn test_answer_keeps_common_codecs() {
        let offer = SdpSession::parse(
            "v=0\r\no=a 1 1 IN IP4 10.0.0.1\r\ns=-\r\nc=IN IP4 10.0.0.1\r\nt=0 0\r\nm=audio 5000 RTP/AVP 8 18 101\r\n",
        )
        .unwrap();

        let answer = SdpSession::answer(&offer, "10.0.0.5".parse().unwrap(), 4000).unwrap();
        assert_eq!(answer.audio_media().unwrap().formats, vec!["8", "101"]);

        let video_only = SdpSession::parse(
            "v=0\r\no=a 1 1 IN IP4 10.0.0.1\r\ns=-\r\nc=IN IP4 10.0.0.1\r\nt=0 0\r\nm=video 5000 RTP/AVP 96\r\n",
        )
        .unwrap();
        assert!(SdpSession::answer(&video_only, "10.0.0.5".parse().unwrap(), 4000).is_none());
    }
}
