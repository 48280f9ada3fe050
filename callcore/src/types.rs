use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a user on the signaling network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Unique token for a single call attempt.
///
/// Generated ids are 16 random bytes rendered as upper-case hex, e.g.
/// `AC90CFD09DF712D981142B172706F9F2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode_upper(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Media kind negotiated for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Voice,
    Video,
}

impl CallKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Voice => "voice",
            Self::Video => "video",
        }
    }

    pub fn has_video(&self) -> bool {
        *self == Self::Video
    }

    /// Infers the kind from a session description: any `m=video` line makes it
    /// a video call.
    pub fn from_sdp(sdp: &str) -> Self {
        if sdp.lines().any(|l| l.trim_start().starts_with("m=video")) {
            Self::Video
        } else {
            Self::Voice
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CallKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "voice" | "audio" => Ok(Self::Voice),
            "video" => Ok(Self::Video),
            _ => Err(()),
        }
    }
}

/// Which side of the offer/answer exchange the local user plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallRole {
    Caller,
    Callee,
}

/// Immutable description of a call, fixed when the call is first seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallIdentity {
    pub call_id: CallId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    pub kind: CallKind,
    pub created_at: DateTime<Utc>,
}

impl CallIdentity {
    pub fn new_outgoing(caller_id: UserId, callee_id: UserId, kind: CallKind) -> Self {
        Self {
            call_id: CallId::generate(),
            caller_id,
            callee_id,
            kind,
            created_at: Utc::now(),
        }
    }

    pub fn new_incoming(
        call_id: CallId,
        caller_id: UserId,
        callee_id: UserId,
        kind: CallKind,
    ) -> Self {
        Self {
            call_id,
            caller_id,
            callee_id,
            kind,
            created_at: Utc::now(),
        }
    }

    /// The other party, seen from `role`.
    pub fn peer(&self, role: CallRole) -> &UserId {
        match role {
            CallRole::Caller => &self.callee_id,
            CallRole::Callee => &self.caller_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_call_ids_are_hex_and_unique() {
        let a = CallId::generate();
        let b = CallId::generate();
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a.as_str(), a.as_str().to_uppercase());
        assert_ne!(a, b);
    }

    #[test]
    fn test_kind_from_sdp() {
        let voice = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n";
        let video = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n";
        assert_eq!(CallKind::from_sdp(voice), CallKind::Voice);
        assert_eq!(CallKind::from_sdp(video), CallKind::Video);
        assert_eq!(CallKind::from_sdp(""), CallKind::Voice);
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("voice".parse(), Ok(CallKind::Voice));
        assert_eq!("Audio".parse(), Ok(CallKind::Voice));
        assert_eq!("VIDEO".parse(), Ok(CallKind::Video));
        assert!("fax".parse::<CallKind>().is_err());
    }

    #[test]
    fn test_peer_depends_on_role() {
        let identity = CallIdentity::new_outgoing("grower".into(), "advisor".into(), CallKind::Voice);
        assert_eq!(identity.peer(CallRole::Caller).as_str(), "advisor");
        assert_eq!(identity.peer(CallRole::Callee).as_str(), "grower");
    }
}
