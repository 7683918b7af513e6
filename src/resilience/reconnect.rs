//! Bounded reconnect loop.
//!
//! # Responsibilities
//! - Re-establish a lost inbound-originated session
//! - Sleep `min(attempts * 2s, max_delay)` before each attempt
//! - Give up after `max_attempts`, reporting the last error
//!
//! # Design Decisions
//! - A bounded loop rather than recursion; same terminal-attempt semantics
//! - `max_attempts <= 0` is an explicit operator choice to disable retries
//! - Backoff sleeps are cancelled by the manager's shutdown signal

use std::future::Future;
use std::time::Duration;

use super::backoff::reconnect_delay;
use crate::config::ReconnectConfig;
use crate::lifecycle::ShutdownSignal;
use crate::observability::metrics;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconnectError {
    #[error("No retry attempt")]
    NoRetryConfigured,

    #[error("Exhausted all retry attempts [{attempts}] with err: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    #[error("reconnect cancelled by shutdown")]
    Cancelled,
}

/// Progress of one reconnect episode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    pub attempts: u32,
    pub max_attempts: i32,
    pub max_delay: Duration,
}

impl RetryState {
    pub fn new(max_attempts: i32, max_delay: Duration) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            max_delay,
        }
    }
}

impl From<&ReconnectConfig> for RetryState {
    fn from(config: &ReconnectConfig) -> Self {
        Self::new(config.attempts, Duration::from_secs(config.max_delay_secs))
    }
}

/// Call `establish` until it succeeds or the attempts run out.
pub async fn retry_connect<T, E, F, Fut>(
    mut establish: F,
    state: &mut RetryState,
    mut shutdown: ShutdownSignal,
) -> Result<T, ReconnectError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    if state.max_attempts <= 0 {
        return Err(ReconnectError::NoRetryConfigured);
    }
    let max_attempts = state.max_attempts.unsigned_abs();

    while state.attempts < max_attempts {
        let delay = reconnect_delay(state.attempts, state.max_delay);
        tracing::info!(
            attempt = state.attempts + 1,
            max_attempts,
            delay = ?delay,
            "Reconnecting"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.recv() => return Err(ReconnectError::Cancelled),
        }
        state.attempts += 1;

        match establish().await {
            Ok(value) => {
                metrics::record_reconnect_attempt(true);
                tracing::info!(attempt = state.attempts, "Reconnected");
                return Ok(value);
            }
            Err(e) => {
                metrics::record_reconnect_attempt(false);
                tracing::warn!(attempt = state.attempts, error = %e, "Reconnect attempt failed");
                if state.attempts == max_attempts {
                    return Err(ReconnectError::RetryExhausted {
                        attempts: state.attempts,
                        last_error: e.to_string(),
                    });
                }
            }
        }
    }

    Err(ReconnectError::RetryExhausted {
        attempts: state.attempts,
        last_error: "no attempts left".into(),
    })
}
