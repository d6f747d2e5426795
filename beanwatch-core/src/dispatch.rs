//! Event fan-out to notification channels.
//!
//! The dispatcher sends each confirmed event to every registered channel
//! that accepts its kind. Channels are independent: one channel failing,
//! retrying, or rate-limiting never blocks delivery to the others, and no
//! dispatch failure ever halts the poll loop or blocks cursor
//! advancement. Failures surface through logs only, never through the
//! channels themselves.

use crate::stream::{CandidateEvent, EventKind};
use async_trait::async_trait;
use compact_str::CompactString;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Failure modes a channel send can report.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Transient failure (rate limit, network blip); worth retrying.
    #[error("retriable channel failure: {0}")]
    Retriable(String),

    /// The send can never succeed (bad credentials, deleted webhook).
    #[error("permanent channel failure: {0}")]
    Permanent(String),
}

/// One independent notification output target.
///
/// Concrete implementations are thin adapters over chat-platform HTTP
/// APIs; the engine only sees this capability surface.
#[async_trait]
pub trait NotifyChannel: Send + Sync {
    fn id(&self) -> &str;

    /// Whether this channel can express events of the given kind.
    fn accepts(&self, kind: EventKind) -> bool;

    async fn send(&self, text: &str) -> Result<(), ChannelError>;
}

/// Bounded exponential backoff for retriable channel failures.
///
/// Delay before attempt `n + 1` is `base * 2^n`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn delay(&self, failed_attempts: u32) -> Duration {
        let exp = failed_attempts.min(30);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(64),
        }
    }
}

/// Terminal outcome of delivering one event to one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    /// The channel does not accept this event kind. Not a failure.
    Skipped,
    /// Permanent failure, or the retry budget ran out.
    Failed(String),
}

/// Per-(event, channel) delivery record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchResult {
    pub channel: CompactString,
    pub outcome: DispatchOutcome,
    pub attempts: u32,
}

/// Fans events out to the registered channels.
pub struct Dispatcher {
    channels: Vec<Arc<dyn NotifyChannel>>,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(channels: Vec<Arc<dyn NotifyChannel>>, retry: RetryPolicy) -> Self {
        Self { channels, retry }
    }

    /// Deliver `event` to every capable channel concurrently.
    ///
    /// Always returns one result per registered channel; never errors.
    pub async fn dispatch(&self, event: &CandidateEvent) -> Vec<DispatchResult> {
        let text = event.render();
        let sends = self
            .channels
            .iter()
            .map(|channel| self.send_with_retry(channel.as_ref(), event, &text));
        join_all(sends).await
    }

    async fn send_with_retry(
        &self,
        channel: &dyn NotifyChannel,
        event: &CandidateEvent,
        text: &str,
    ) -> DispatchResult {
        if !channel.accepts(event.kind) {
            return DispatchResult {
                channel: channel.id().into(),
                outcome: DispatchOutcome::Skipped,
                attempts: 0,
            };
        }

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match channel.send(text).await {
                Ok(()) => {
                    debug!(
                        channel = channel.id(),
                        kind = %event.kind,
                        record = %event.source_record_id,
                        attempts,
                        "Notification delivered"
                    );
                    return DispatchResult {
                        channel: channel.id().into(),
                        outcome: DispatchOutcome::Delivered,
                        attempts,
                    };
                }
                Err(ChannelError::Permanent(reason)) => {
                    warn!(
                        channel = channel.id(),
                        kind = %event.kind,
                        record = %event.source_record_id,
                        attempts,
                        reason = %reason,
                        "Notification permanently failed"
                    );
                    return DispatchResult {
                        channel: channel.id().into(),
                        outcome: DispatchOutcome::Failed(reason),
                        attempts,
                    };
                }
                Err(ChannelError::Retriable(reason)) => {
                    if attempts >= self.retry.max_attempts {
                        warn!(
                            channel = channel.id(),
                            kind = %event.kind,
                            record = %event.source_record_id,
                            attempts,
                            reason = %reason,
                            "Notification retries exhausted"
                        );
                        return DispatchResult {
                            channel: channel.id().into(),
                            outcome: DispatchOutcome::Failed(format!(
                                "retries exhausted: {reason}"
                            )),
                            attempts,
                        };
                    }
                    let delay = self.retry.delay(attempts - 1);
                    warn!(
                        channel = channel.id(),
                        kind = %event.kind,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Notification send failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
