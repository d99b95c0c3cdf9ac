//! Minimal session description used by the loopback connection.
//!
//! Only what negotiation needs is modelled: ICE credentials, and per
//! media section the kind, mid and direction.
//!
//! ```text
//! v=0
//! o=- 4611731400430051336 2 IN IP4 127.0.0.1
//! s=-
//! t=0 0
//! a=ice-ufrag:Xk3v9QaP
//! m=audio 9 UDP/TLS/RTP/SAVPF 111
//! a=mid:0
//! a=sendonly
//! ```

use murmur_common::NegotiationError;

use crate::media::Direction;
use crate::protocol::MediaKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MediaSection {
    pub kind: MediaKind,
    pub mid: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SessionSdp {
    pub session_id: u64,
    pub version: u64,
    pub ice_ufrag: String,
    pub sections: Vec<MediaSection>,
}

impl SessionSdp {
    pub fn write(&self) -> String {
        let mut out = format!(
            "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=ice-ufrag:{}\r\n",
            self.session_id, self.version, self.ice_ufrag
        );
        for section in &self.sections {
            let payload = match section.kind {
                MediaKind::Audio => 111,
                MediaKind::Video => 96,
            };
            out.push_str(&format!(
                "m={} 9 UDP/TLS/RTP/SAVPF {payload}\r\na=mid:{}\r\na={}\r\n",
                section.kind.as_sdp(),
                section.mid,
                section.direction.as_sdp()
            ));
        }
        out
    }

    pub fn parse(text: &str) -> Result<Self, NegotiationError> {
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
        if lines.next() != Some("v=0") {
            return Err(NegotiationError::InvalidSdp("missing v=0 line".into()));
        }

        let mut session_id = 0;
        let mut version = 0;
        let mut ice_ufrag = None;
        let mut sections: Vec<PartialSection> = Vec::new();

        for line in lines {
            if let Some(origin) = line.strip_prefix("o=") {
                let fields: Vec<&str> = origin.split_whitespace().collect();
                session_id = fields.get(1).and_then(|v| v.parse().ok()).unwrap_or(0);
                version = fields.get(2).and_then(|v| v.parse().ok()).unwrap_or(0);
            } else if let Some(media) = line.strip_prefix("m=") {
                let token = media.split_whitespace().next().unwrap_or_default();
                let kind = MediaKind::from_sdp(token).ok_or_else(|| {
                    NegotiationError::InvalidSdp(format!("unsupported media type {token:?}"))
                })?;
                sections.push(PartialSection {
                    kind,
                    mid: None,
                    direction: Direction::SendRecv,
                });
            } else if let Some(ufrag) = line.strip_prefix("a=ice-ufrag:") {
                ice_ufrag = Some(ufrag.to_string());
            } else if let Some(mid) = line.strip_prefix("a=mid:") {
                let section = sections.last_mut().ok_or_else(|| {
                    NegotiationError::InvalidSdp("a=mid outside a media section".into())
                })?;
                section.mid = Some(mid.to_string());
            } else if let Some(attr) = line.strip_prefix("a=") {
                if let (Some(direction), Some(section)) =
                    (Direction::from_sdp(attr), sections.last_mut())
                {
                    section.direction = direction;
                }
            }
        }

        let ice_ufrag =
            ice_ufrag.ok_or_else(|| NegotiationError::InvalidSdp("missing a=ice-ufrag".into()))?;
        let sections = sections
            .into_iter()
            .enumerate()
            .map(|(index, s)| {
                let mid = s.mid.ok_or_else(|| {
                    NegotiationError::InvalidSdp(format!("media section {index} has no mid"))
                })?;
                Ok(MediaSection {
                    kind: s.kind,
                    mid,
                    direction: s.direction,
                })
            })
            .collect::<Result<Vec<_>, NegotiationError>>()?;

        Ok(Self {
            session_id,
            version,
            ice_ufrag,
            sections,
        })
    }
}

struct PartialSection {
    kind: MediaKind,
    mid: Option<String>,
    direction: Direction,
}

/// ICE username fragment of a description, if it parses.
pub fn ice_ufrag(sdp: &str) -> Option<String> {
    SessionSdp::parse(sdp).ok().map(|s| s.ice_ufrag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_what_it_writes() {
        let sdp = SessionSdp {
            session_id: 42,
            version: 3,
            ice_ufrag: "abcd".into(),
            sections: vec![
                MediaSection {
                    kind: MediaKind::Audio,
                    mid: "0".into(),
                    direction: Direction::SendOnly,
                },
                MediaSection {
                    kind: MediaKind::Video,
                    mid: "1".into(),
                    direction: Direction::Inactive,
                },
            ],
        };
        assert_eq!(SessionSdp::parse(&sdp.write()).unwrap(), sdp);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            SessionSdp::parse("not an sdp"),
            Err(NegotiationError::InvalidSdp(_))
        ));
    }

    #[test]
    fn rejects_section_without_mid() {
        let text = "v=0\na=ice-ufrag:x\nm=audio 9 UDP/TLS/RTP/SAVPF 111\na=sendonly\n";
        let err = SessionSdp::parse(text).unwrap_err();
        assert!(err.to_string().contains("no mid"));
    }

    #[test]
    fn rejects_unknown_media() {
        let text = "v=0\na=ice-ufrag:x\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\na=mid:0\n";
        assert!(SessionSdp::parse(text).is_err());
    }
}
