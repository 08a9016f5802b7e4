use std::time::Duration;

use serde::Deserialize;

use crate::{PushMqError, Result};

/// Placeholder replaced with the channel name in URL templates.
pub const CHANNEL_PLACEHOLDER: &str = "$1";

/// Configures endpoints, timeouts and retry behavior.
///
/// All durations are in milliseconds. A timeout of `0` disables the timeout.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Write endpoint; the first `$1` is replaced with the channel name.
    pub publish_url_template: String,
    /// Long-poll read endpoint; the first `$1` is replaced with the channel name.
    pub subscribe_url_template: String,
    /// Per-request timeout for publish (and delete) requests.
    pub publish_timeout_ms: u64,
    /// Delay before resubmitting a failed publish. `0` disables retry.
    pub publish_retry_delay_ms: u64,
    /// Per-request timeout for long-poll requests. Should exceed the server hold time.
    pub poll_timeout_ms: u64,
    /// Delay before the next poll after a successful response.
    pub poll_delay_ms: u64,
    /// Delay before the next poll after a failed response.
    pub poll_retry_delay_ms: u64,
    /// Emits per-request debug events.
    pub debug_logging: bool,
    /// Maximum number of publish resubmissions. `None` retries until closed.
    pub max_publish_retries: Option<usize>,
    /// Maximum number of consecutive failed polls. `None` retries until closed.
    pub max_poll_retries: Option<usize>,
    /// Appends a `_=<millis>` query parameter so no intermediary cache answers a poll.
    pub cache_bust: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            publish_url_template: "/publish?id=$1".to_owned(),
            subscribe_url_template: "/activity?id=$1".to_owned(),
            publish_timeout_ms: 5_000,
            publish_retry_delay_ms: 3_000,
            poll_timeout_ms: 60_000,
            poll_delay_ms: 1_000,
            poll_retry_delay_ms: 5_000,
            debug_logging: false,
            max_publish_retries: None,
            max_poll_retries: None,
            cache_bust: true,
        }
    }
}

impl ClientOptions {
    /// Loads options from `PUSHMQ_*` environment variables, falling back to
    /// defaults for anything unset.
    ///
    /// Reads:
    /// - `PUSHMQ_PUBLISH_URL`, `PUSHMQ_SUBSCRIBE_URL` — URL templates
    /// - `PUSHMQ_PUBLISH_TIMEOUT_MS`, `PUSHMQ_PUBLISH_RETRY_MS`
    /// - `PUSHMQ_POLL_TIMEOUT_MS`, `PUSHMQ_POLL_DELAY_MS`, `PUSHMQ_POLL_RETRY_MS`
    /// - `PUSHMQ_DEBUG` — `1`/`true`/`yes`/`on` or `0`/`false`/`no`/`off`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Parses options from a JSON object. Missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)
            .map_err(|err| PushMqError::Config(format!("invalid options JSON: {err}")))?;
        options.validate()?;
        Ok(options)
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options = Self::default();

        if let Some(value) = lookup("PUSHMQ_PUBLISH_URL") {
            options.publish_url_template = value;
        }
        if let Some(value) = lookup("PUSHMQ_SUBSCRIBE_URL") {
            options.subscribe_url_template = value;
        }

        let millis = [
            ("PUSHMQ_PUBLISH_TIMEOUT_MS", &mut options.publish_timeout_ms),
            ("PUSHMQ_PUBLISH_RETRY_MS", &mut options.publish_retry_delay_ms),
            ("PUSHMQ_POLL_TIMEOUT_MS", &mut options.poll_timeout_ms),
            ("PUSHMQ_POLL_DELAY_MS", &mut options.poll_delay_ms),
            ("PUSHMQ_POLL_RETRY_MS", &mut options.poll_retry_delay_ms),
        ];
        for (key, slot) in millis {
            if let Some(value) = lookup(key) {
                *slot = value.trim().parse().map_err(|_| {
                    PushMqError::Config(format!("{key} must be a number of milliseconds, got '{value}'"))
                })?;
            }
        }

        if let Some(value) = lookup("PUSHMQ_DEBUG") {
            options.debug_logging = parse_flag("PUSHMQ_DEBUG", &value)?;
        }

        options.validate()?;
        Ok(options)
    }

    /// Checks that both URL templates are usable.
    pub fn validate(&self) -> Result<()> {
        if self.publish_url_template.trim().is_empty() {
            return Err(PushMqError::Config(
                "publish_url_template must not be empty".to_owned(),
            ));
        }
        if self.subscribe_url_template.trim().is_empty() {
            return Err(PushMqError::Config(
                "subscribe_url_template must not be empty".to_owned(),
            ));
        }
        Ok(())
    }

    /// Write endpoint for `channel`.
    pub fn publish_url(&self, channel: &str) -> String {
        channel_url(&self.publish_url_template, channel)
    }

    /// Long-poll endpoint for `channel`, without cache busting.
    pub fn subscribe_url(&self, channel: &str) -> String {
        channel_url(&self.subscribe_url_template, channel)
    }

    pub(crate) fn publish_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.publish_timeout_ms)
    }

    pub(crate) fn poll_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.poll_timeout_ms)
    }
}

/// Substitutes the first `$1` in `template` with `channel`, verbatim.
///
/// Example: `("/publish?id=$1", "news")` → `"/publish?id=news"`
pub fn channel_url(template: &str, channel: &str) -> String {
    template.replacen(CHANNEL_PLACEHOLDER, channel, 1)
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(PushMqError::Config(format!(
            "{key} must be a boolean, got '{other}'"
        ))),
    }
}
