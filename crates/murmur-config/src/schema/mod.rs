//! Configuration schema types.
//!
//! All structs use `serde(default)` so partial configs work correctly.

mod logging;
mod negotiation;
mod vad;
mod voice;

pub use logging::*;
pub use negotiation::*;
pub use vad::*;
pub use voice::*;

use serde::{Deserialize, Serialize};

/// Current config schema version.
pub const CONFIG_SCHEMA_VERSION: u32 = 1;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MurmurConfig {
    pub voice: VoiceConfig,
    pub negotiation: NegotiationConfig,
    pub vad: VadConfig,
    pub logging: LoggingConfig,
}
