//! Cross-context messages and bounded delivery retry.

use serde::{Deserialize, Serialize};

use crate::tracker::Millis;

/// Messages exchanged between the page, the settings surface and the
/// background context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    UpdateState { enabled: bool },
    UpdatePassive { passive: bool },
    UpdateReferral {
        #[serde(rename = "referralId")]
        referral_id: String,
    },
    /// Ask the background to reload the sender's tab
    ReloadPage,
}

impl Message {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Error type for message delivery.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The receiving context is not ready (yet)
    #[error("Receiving end does not exist")]
    Unavailable,
    #[error("Message rejected: {0}")]
    Rejected(String),
}

/// One-way channel to the background context.
pub trait MessageChannel {
    fn send(&mut self, message: &Message) -> Result<(), ChannelError>;
}

/// Bounded retry with fixed backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: Millis,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, backoff_ms: 100 }
    }
}

/// User-visible recovery once delivery gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    FullReload,
}

/// Delivery state after a dispatch or poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Delivered,
    RetryAt(Millis),
    GaveUp(Recovery),
    /// Nothing queued
    Idle,
}

#[derive(Debug, Clone)]
struct Pending {
    message: Message,
    attempts: u32,
    retry_at: Millis,
}

/// Holds at most one undelivered message and retries it on a fixed backoff.
///
/// A newer dispatch replaces a queued one.
#[derive(Debug, Clone)]
pub struct Outbox {
    policy: RetryPolicy,
    pending: Option<Pending>,
}

impl Outbox {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, pending: None }
    }

    /// Send `message` now, queueing a retry on failure.
    pub fn dispatch<C: MessageChannel + ?Sized>(&mut self, channel: &mut C, message: Message, now: Millis) -> Dispatch {
        self.pending = Some(Pending { message, attempts: 0, retry_at: now });
        self.attempt(channel, now)
    }

    /// Retry the queued message if its backoff has elapsed.
    pub fn poll<C: MessageChannel + ?Sized>(&mut self, channel: &mut C, now: Millis) -> Dispatch {
        let Some(retry_at) = self.next_retry() else {
            return Dispatch::Idle;
        };
        if now < retry_at {
            return Dispatch::RetryAt(retry_at);
        }
        self.attempt(channel, now)
    }

    fn attempt<C: MessageChannel + ?Sized>(&mut self, channel: &mut C, now: Millis) -> Dispatch {
        let Some(mut pending) = self.pending.take() else {
            return Dispatch::Idle;
        };
        pending.attempts += 1;

        match channel.send(&pending.message) {
            Ok(()) => Dispatch::Delivered,
            Err(ChannelError::Unavailable) if pending.attempts < self.policy.max_attempts => {
                pending.retry_at = now + self.policy.backoff_ms;
                log::debug!(
                    "background not ready, retry {}/{} at {}",
                    pending.attempts,
                    self.policy.max_attempts,
                    pending.retry_at
                );
                let at = pending.retry_at;
                self.pending = Some(pending);
                Dispatch::RetryAt(at)
            }
            Err(e) => {
                log::warn!(
                    "giving up on {:?} after {} attempt(s): {e}",
                    pending.message,
                    pending.attempts
                );
                Dispatch::GaveUp(Recovery::FullReload)
            }
        }
    }

    pub fn next_retry(&self) -> Option<Millis> {
        self.pending.as_ref().map(|p| p.retry_at)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_none()
    }
}
