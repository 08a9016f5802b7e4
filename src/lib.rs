//! `pushmq-http` is a pub/sub client that runs entirely on plain HTTP
//! request/response exchanges.
//!
//! - [`PushMqClient::publish`] posts a message to a channel and resubmits it
//!   on failure until it is delivered or the client is closed.
//! - [`PushMqClient::subscribe`] long-polls a channel, echoing `Last-Modified`
//!   and `Etag` back as conditional headers, and hands every message to a
//!   [`MessageHandler`].
//! - [`PushMqClient::close`] stops all retries and polls.
//!
//! The network is reached through the [`HttpTransport`] trait;
//! [`ReqwestTransport`] is the default implementation.

#![cfg_attr(not(feature = "tracing"), deny(unused_variables))]

#[cfg(feature = "tracing")]
macro_rules! debug_event {
    ($enabled:expr, $($arg:tt)+) => {{
        if $enabled {
            tracing::debug!($($arg)+);
        }
    }};
}

#[cfg(not(feature = "tracing"))]
macro_rules! debug_event {
    ($enabled:expr, $($arg:tt)+) => {{
        let _ = $enabled;
    }};
}

#[cfg(feature = "tracing")]
macro_rules! error_event {
    ($($arg:tt)+) => {{
        tracing::error!($($arg)+);
    }};
}

#[cfg(not(feature = "tracing"))]
macro_rules! error_event {
    ($($arg:tt)+) => {{}};
}

mod client;
mod error;
mod handler;
mod options;
mod session;
mod transport;
mod types;

#[cfg(test)]
mod testing;

pub use client::{PushMqClient, Subscription};
pub use error::PushMqError;
pub use handler::{HandlerError, MessageHandler};
pub use options::{channel_url, ClientOptions, CHANNEL_PLACEHOLDER};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Method, ReqwestTransport};
pub use types::{ConditionalTokens, PollState, StopReason};

pub type Result<T> = std::result::Result<T, PushMqError>;
