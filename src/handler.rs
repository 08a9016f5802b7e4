use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, PoisonError},
};

use crate::{PushMqError, Result};

/// Boxed error returned by message handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Receives messages delivered by long-poll subscriptions.
///
/// An `Err` (or a panic) is terminal for the channel that delivered the
/// message: its poll loop stops and nothing else is affected.
///
/// Any `Fn(&str, &str) -> Result<(), E>` closure is a handler:
///
/// ```
/// use pushmq_http::MessageHandler;
///
/// fn assert_handler<H: MessageHandler>(_: H) {}
///
/// assert_handler(|channel: &str, payload: &str| {
///     println!("{channel}: {payload}");
///     Ok::<(), std::io::Error>(())
/// });
/// ```
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, channel: &str, payload: &str) -> std::result::Result<(), HandlerError>;
}

impl<F, E> MessageHandler for F
where
    F: Fn(&str, &str) -> std::result::Result<(), E> + Send + Sync + 'static,
    E: Into<HandlerError>,
{
    fn on_message(&self, channel: &str, payload: &str) -> std::result::Result<(), HandlerError> {
        self(channel, payload).map_err(Into::into)
    }
}

/// Serializes handler invocations and converts failures into
/// [`PushMqError::Handler`].
#[derive(Clone)]
pub(crate) struct Dispatcher {
    handler: Arc<dyn MessageHandler>,
    lock: Arc<Mutex<()>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub(crate) fn new<H: MessageHandler>(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub(crate) fn deliver(&self, channel: &str, payload: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        match panic::catch_unwind(AssertUnwindSafe(|| self.handler.on_message(channel, payload))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(PushMqError::Handler(err.to_string())),
            Err(panic) => Err(PushMqError::Handler(panic_message(&*panic))),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_owned()
    }
}
