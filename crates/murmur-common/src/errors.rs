use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ParseError(String),

    #[error("config validation error: {0}")]
    ValidationError(String),
}

/// Failures reported by the device-capture collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("capture device not found: {0}")]
    NotFound(String),

    #[error("capture permission denied")]
    PermissionDenied,

    #[error("capture cancelled by user")]
    Cancelled,

    #[error("capture failed: {0}")]
    Other(String),
}

impl DeviceError {
    /// The user declined or dismissed the prompt. Callers treat these as a
    /// no-op rather than a failure.
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::PermissionDenied | Self::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NegotiationError {
    #[error("invalid session description: {0}")]
    InvalidSdp(String),

    #[error("operation not valid in signaling state {0}")]
    InvalidState(String),

    #[error("connection is closed")]
    Closed,

    #[error("peer connection error: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("signaling channel closed")]
    ChannelClosed,

    #[error("failed to encode signaling message: {0}")]
    Serialize(String),
}

#[derive(Debug, thiserror::Error)]
pub enum MurmurError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("not connected to a voice channel")]
    NotConnected,

    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = ConfigError::FileNotFound(PathBuf::from("/tmp/missing.toml"));
        assert_eq!(err.to_string(), "config file not found: /tmp/missing.toml");

        let err = ConfigError::ValidationError("vad.attack_frames = 0".into());
        assert_eq!(
            err.to_string(),
            "config validation error: vad.attack_frames = 0"
        );
    }

    #[test]
    fn silent_device_errors() {
        assert!(DeviceError::PermissionDenied.is_silent());
        assert!(DeviceError::Cancelled.is_silent());
        assert!(!DeviceError::NotFound("camera".into()).is_silent());
        assert!(!DeviceError::Other("busy".into()).is_silent());
    }

    #[test]
    fn murmur_error_from_device() {
        let err: MurmurError = DeviceError::NotFound("microphone".into()).into();
        assert!(matches!(err, MurmurError::Device(_)));
        assert_eq!(err.to_string(), "capture device not found: microphone");
    }

    #[test]
    fn murmur_error_from_negotiation() {
        let err: MurmurError = NegotiationError::InvalidSdp("missing v=0".into()).into();
        assert!(matches!(err, MurmurError::Negotiation(_)));
        assert!(err.to_string().contains("missing v=0"));
    }

    #[test]
    fn not_connected_display() {
        assert_eq!(
            MurmurError::NotConnected.to_string(),
            "not connected to a voice channel"
        );
    }
}
