//! Full configuration validation.
//!
//! Checks every numeric range and collects all problems into a single
//! `ConfigError`.

mod helpers;


use crate::schema::MurmurConfig;
use helpers::check_range;
use murmur_common::ConfigError;

/// Run all validations on a config, collecting all errors.
pub fn validate(config: &MurmurConfig) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();

    validate_voice(&mut errors, config);
    validate_negotiation(&mut errors, config);
    validate_vad(&mut errors, config);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(errors.join("; ")))
    }
}

fn validate_voice(errors: &mut Vec<String>, config: &MurmurConfig) {
    let v = &config.voice;
    check_range(errors, "voice.event_capacity", v.event_capacity, 16..=65536);
    check_range(
        errors,
        "voice.signal_queue_capacity",
        v.signal_queue_capacity,
        16..=65536,
    );
}

fn validate_negotiation(errors: &mut Vec<String>, config: &MurmurConfig) {
    let n = &config.negotiation;
    check_range(
        errors,
        "negotiation.ice_restart_max_attempts",
        n.ice_restart_max_attempts,
        0..=20,
    );
    check_range(
        errors,
        "negotiation.ice_restart_backoff_ms",
        n.ice_restart_backoff_ms,
        50..=60_000,
    );
    check_range(
        errors,
        "negotiation.offer_timeout_ms",
        n.offer_timeout_ms,
        100..=300_000,
    );
    if n.ice_restart_max_backoff_ms < n.ice_restart_backoff_ms {
        errors.push(format!(
            "negotiation.ice_restart_max_backoff_ms = {} is below ice_restart_backoff_ms = {}",
            n.ice_restart_max_backoff_ms, n.ice_restart_backoff_ms
        ));
    }
}

fn validate_vad(errors: &mut Vec<String>, config: &MurmurConfig) {
    let vad = &config.vad;
    check_range(errors, "vad.threshold", vad.threshold, 0.0..=1.0);
    check_range(errors, "vad.attack_frames", vad.attack_frames, 1..=100);
    check_range(errors, "vad.release_frames", vad.release_frames, 1..=500);
}
