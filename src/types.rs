use std::time::Duration;

/// Conditional-request tokens echoed back on the next poll.
///
/// A 2xx response replaces both tokens (a missing header clears its token);
/// a 304 response merges, keeping any token it does not carry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConditionalTokens {
    /// Last observed `Last-Modified`, sent as `If-Modified-Since`.
    pub last_modified: Option<String>,
    /// Last observed `Etag`, sent as `If-None-Match`.
    pub etag: Option<String>,
}

impl ConditionalTokens {
    pub fn is_empty(&self) -> bool {
        self.last_modified.is_none() && self.etag.is_none()
    }
}

/// Why a subscription's poll loop ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The client was closed.
    Shutdown,
    /// [`Subscription::unsubscribe`](crate::Subscription::unsubscribe) was called.
    Unsubscribed,
    /// The message handler failed; no further messages are delivered on this channel.
    HandlerFailed(String),
    /// `max_poll_retries` consecutive polls failed.
    RetriesExhausted { failures: usize },
    /// The poll task itself was aborted or panicked.
    Aborted(String),
}

/// States of one channel's long-poll cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollState {
    /// Constructed, no request issued yet.
    Idle,
    /// A poll request is in flight.
    Polling,
    /// Waiting before the next poll.
    Scheduled { delay: Duration },
    /// Terminal.
    Stopped(StopReason),
}

impl PollState {
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped(_))
    }
}
