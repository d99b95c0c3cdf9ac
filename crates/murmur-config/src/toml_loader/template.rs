//! Default TOML config template with inline documentation comments.

pub(crate) fn default_config_toml() -> &'static str {
    r##"# Murmur Configuration
# Schema version 1
# Only override what you want to change -- missing fields use defaults.

[voice]
# event_capacity = 256          # 16-65536
# signal_queue_capacity = 256   # 16-65536
# auto_enable_microphone = false

[negotiation]
# polite = true                      # force the collision role; unset: greater user id is polite
# offer_timeout_ms = 10000           # 100-300000, resend an unanswered offer
# ice_restart_max_attempts = 5       # 0-20
# ice_restart_backoff_ms = 500       # 50-60000
# ice_restart_max_backoff_ms = 8000  # >= ice_restart_backoff_ms

[vad]
# threshold = 0.02      # 0.0-1.0 (RMS)
# attack_frames = 3     # 1-100
# release_frames = 25   # 1-500

[logging]
# level = "info"        # trace | debug | info | warn | error
"##
}
