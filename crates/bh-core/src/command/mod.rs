//! Streaming command channel clients, one per feed kind.

mod client;

pub use client::{CommandClient, CommandHandler};

use std::time::Duration;

use bh_types::RetrySchedule;

/// Build the retry schedule from `BH_COMMAND_RETRY_*` environment variables,
/// falling back to the built-in defaults (20 attempts, 100ms base, 50ms
/// step).
pub fn schedule_from_env() -> RetrySchedule {
    let defaults = RetrySchedule::default();
    let max_attempts = std::env::var("BH_COMMAND_RETRY_MAX")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(defaults.max_attempts);
    let base = std::env::var("BH_COMMAND_RETRY_BASE_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(defaults.base);
    let step = std::env::var("BH_COMMAND_RETRY_STEP_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(defaults.step);
    RetrySchedule {
        max_attempts,
        base,
        step,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_defaults_without_env() {
        std::env::remove_var("BH_COMMAND_RETRY_MAX");
        std::env::remove_var("BH_COMMAND_RETRY_BASE_MS");
        std::env::remove_var("BH_COMMAND_RETRY_STEP_MS");
        assert_eq!(schedule_from_env(), RetrySchedule::default());
    }
}
