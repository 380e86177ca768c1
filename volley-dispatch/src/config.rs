use serde::{Deserialize, Serialize};

pub use crate::{relay::RelayPolicy, throttle::ThrottleConfig};

/// SMTP connection knobs applied to every relay of a job
pub type SmtpTransportConfig = volley_smtp::PoolConfig;

/// Engine configuration
///
/// ```ron
/// (
///     throttle: (base_delay_ms: 200, jitter_ms: 800),
///     relays: (failure_threshold: 3),
///     smtp: (max_connections: 5, require_tls: true),
/// )
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub throttle: ThrottleConfig,

    #[serde(default)]
    pub relays: RelayPolicy,

    #[serde(default)]
    pub smtp: SmtpTransportConfig,

    /// Buffered events per subscriber before the oldest are dropped
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            throttle: ThrottleConfig::default(),
            relays: RelayPolicy::default(),
            smtp: SmtpTransportConfig::default(),
            event_capacity: default_event_capacity(),
        }
    }
}

const fn default_event_capacity() -> usize {
    1024
}
