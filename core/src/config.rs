//! Environment-level tuning. Everything here degrades to a default with a
//! warning on bad input; configuration can never make a turn fail.

use std::time::Duration;

use relay_protocol::ProviderKind;
use tracing::warn;

use crate::buffer::BufferParams;
use crate::providers;

/// Buffer tuning from `RELAY_BUFFER_PARTIAL_DELAY_MS`,
/// `RELAY_BUFFER_MAX_WAIT_MS` and `RELAY_BUFFER_MIN_SIZE`.
pub fn buffer_params() -> BufferParams {
    let defaults = BufferParams::default();
    BufferParams {
        partial_delay: env_millis("RELAY_BUFFER_PARTIAL_DELAY_MS")
            .unwrap_or(defaults.partial_delay),
        max_wait_time: env_millis("RELAY_BUFFER_MAX_WAIT_MS").unwrap_or(defaults.max_wait_time),
        min_buffer_size: env_usize("RELAY_BUFFER_MIN_SIZE").unwrap_or(defaults.min_buffer_size),
    }
}

/// Per-provider first-output timeout, overridable via
/// `RELAY_<PROVIDER>_TIMEOUT_MS`.
pub fn first_output_timeout(kind: ProviderKind) -> Duration {
    let profile = providers::profile(kind);
    let var = format!("RELAY_{}_TIMEOUT_MS", kind.as_str().to_uppercase());
    env_millis(&var).unwrap_or(profile.first_output_timeout)
}

fn env_millis(var: &str) -> Option<Duration> {
    let raw = std::env::var(var).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Some(Duration::from_millis(ms)),
        _ => {
            warn!(var, value = %raw, "ignoring invalid duration override");
            None
        }
    }
}

fn env_usize(var: &str) -> Option<usize> {
    let raw = std::env::var(var).ok()?;
    match raw.trim().parse::<usize>() {
        Ok(n) => Some(n),
        Err(_) => {
            warn!(var, value = %raw, "ignoring invalid size override");
            None
        }
    }
}
