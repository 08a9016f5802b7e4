use std::{fmt, sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;

use crate::{
    handler::Dispatcher, session::ChannelSession, ClientOptions, HttpRequest, HttpTransport,
    MessageHandler, Method, PushMqError, ReqwestTransport, Result, StopReason,
};

#[derive(Clone)]
/// Pub/sub client over HTTP publish and long-poll endpoints.
///
/// Cloning is cheap; clones share the transport, the handler and the
/// connected state, so closing one clone closes them all.
pub struct PushMqClient {
    transport: Arc<dyn HttpTransport>,
    options: Arc<ClientOptions>,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
}

impl fmt::Debug for PushMqClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushMqClient")
            .field("options", &self.options)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl PushMqClient {
    /// Creates a client that talks to `base_url` through [`ReqwestTransport`].
    ///
    /// Relative URL templates (the default `/publish?id=$1` and
    /// `/activity?id=$1`) are resolved against `base_url`.
    pub fn new<H: MessageHandler>(base_url: impl Into<String>, handler: H) -> Self {
        Self::with_transport(ReqwestTransport::new(base_url), handler)
    }

    /// Creates a client on top of a custom transport.
    pub fn with_transport<T, H>(transport: T, handler: H) -> Self
    where
        T: HttpTransport,
        H: MessageHandler,
    {
        Self {
            transport: Arc::new(transport),
            options: Arc::new(ClientOptions::default()),
            dispatcher: Dispatcher::new(handler),
            shutdown: CancellationToken::new(),
        }
    }

    /// Creates a client from environment variables.
    ///
    /// Reads `PUSHMQ_BASE_URL` (required) plus every variable understood by
    /// [`ClientOptions::from_env`].
    ///
    /// # Example
    ///
    /// ```no_run
    /// use pushmq_http::PushMqClient;
    ///
    /// let client = PushMqClient::from_env(|channel: &str, payload: &str| {
    ///     println!("{channel}: {payload}");
    ///     Ok::<(), std::io::Error>(())
    /// })
    /// .expect("missing PUSHMQ_BASE_URL");
    /// ```
    pub fn from_env<H: MessageHandler>(handler: H) -> Result<Self> {
        let base_url = std::env::var("PUSHMQ_BASE_URL").map_err(|_| {
            PushMqError::Config("missing PUSHMQ_BASE_URL environment variable".to_owned())
        })?;
        if base_url.trim().is_empty() {
            return Err(PushMqError::Config(
                "PUSHMQ_BASE_URL is set but empty".to_owned(),
            ));
        }
        let options = ClientOptions::from_env()?;
        Ok(Self::new(base_url, handler).with_options(options))
    }

    /// Applies endpoint, timeout and retry options.
    ///
    /// Options are fixed for everything started afterwards; call this before
    /// publishing or subscribing.
    pub fn with_options(mut self, opts: ClientOptions) -> Self {
        self.options = Arc::new(opts);
        self
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// `false` once [`close`](Self::close) or [`shutdown_all`](Self::shutdown_all)
    /// has been called. Never becomes `true` again.
    pub fn is_connected(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Publishes `message` to `channel` in the background and returns at once.
    ///
    /// Failed attempts are resubmitted every `publish_retry_delay_ms` until one
    /// succeeds or the client is closed; see [`send`](Self::send). Each attempt
    /// is an independent request, so a retried message may be stored twice,
    /// and separate `publish` calls may land out of order.
    ///
    /// The returned handle can be dropped; awaiting it yields the final outcome.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn publish(
        &self,
        channel: impl Into<String>,
        message: impl Into<String>,
    ) -> JoinHandle<Result<()>> {
        let client = self.clone();
        let channel = channel.into();
        let message = message.into();
        tokio::spawn(async move { client.send(&channel, &message).await })
    }

    /// Publishes `message` and waits for the retry policy to finish.
    ///
    /// Resolves `Ok(())` once a write is accepted with a 2xx status. Otherwise
    /// resolves with:
    /// - the last transport error, when retry is disabled
    ///   (`publish_retry_delay_ms == 0`) or the client was already closed when
    ///   the attempt failed;
    /// - [`PushMqError::Closed`], when the client is closed during a retry wait;
    /// - [`PushMqError::RetriesExhausted`], when `max_publish_retries` is reached.
    ///
    /// With the default options a persistently failing endpoint is retried
    /// until the client is closed.
    pub async fn send(&self, channel: &str, message: &str) -> Result<()> {
        let request = HttpRequest::new(Method::Post, self.options.publish_url(channel))
            .header("Content-Type", "text/plain")
            .body(message)
            .timeout(self.options.publish_timeout());
        let debug = self.options.debug_logging;
        let mut retries = 0usize;

        loop {
            let err = match self.execute(request.clone()).await {
                Ok(()) => {
                    debug_event!(debug, channel, payload = message, "published");
                    return Ok(());
                }
                Err(err) => err,
            };

            if !self.is_connected() {
                return Err(err);
            }
            debug_event!(debug, channel, status = ?err.status(), error = %err, retries, "publish failed");

            let delay_ms = self.options.publish_retry_delay_ms;
            if delay_ms == 0 {
                return Err(err);
            }
            if let Some(max) = self.options.max_publish_retries {
                if retries >= max {
                    return Err(PushMqError::RetriesExhausted {
                        attempts: retries + 1,
                    });
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(PushMqError::Closed),
                _ = sleep(Duration::from_millis(delay_ms)) => {}
            }
            retries += 1;
        }
    }

    /// Starts long-polling `channel` and returns at once.
    ///
    /// Every message is handed to the client's [`MessageHandler`]. The loop
    /// runs until the client is closed, the subscription is cancelled, or the
    /// handler fails. Dropping the returned [`Subscription`] leaves the loop
    /// running.
    ///
    /// Subscribing to the same channel twice starts two independent loops.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn subscribe(&self, channel: impl Into<String>) -> Subscription {
        let channel = channel.into();
        debug_event!(self.options.debug_logging, channel = %channel, "subscribing");

        let cancel = self.shutdown.child_token();
        let session = ChannelSession::new(
            channel.clone(),
            self.transport.clone(),
            self.options.clone(),
            self.dispatcher.clone(),
            self.shutdown.clone(),
            cancel.clone(),
        );
        let task = tokio::spawn(session.run());

        Subscription {
            channel,
            cancel,
            task,
        }
    }

    /// Closes the client and optionally deletes `channel`'s queue on the server.
    ///
    /// Closing is client-wide, not per channel: every subscription stops and no
    /// publish is retried any more, whatever `channel` is passed. Requests
    /// already in flight still complete, but their results are dropped. Use
    /// [`Subscription::unsubscribe`] to stop a single channel.
    ///
    /// With `delete_queue`, one DELETE is sent to the publish URL of `channel`;
    /// its outcome is not retried.
    ///
    /// # Panics
    ///
    /// Panics when `delete_queue` is set and this is called outside a Tokio
    /// runtime.
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    pub fn close(&self, channel: &str, delete_queue: bool) {
        self.shutdown_all();

        if delete_queue {
            let request = HttpRequest::new(Method::Delete, self.options.publish_url(channel))
                .timeout(self.options.publish_timeout());
            let client = self.clone();
            let channel = channel.to_owned();
            tokio::spawn(async move {
                let outcome = client.execute(request).await;
                debug_event!(
                    client.options.debug_logging,
                    channel = %channel,
                    ok = outcome.is_ok(),
                    "queue delete finished"
                );
            });
        }
        debug_event!(self.options.debug_logging, channel, delete_queue, "closed");
    }

    /// Stops every subscription and publish retry of this client. Idempotent.
    pub fn shutdown_all(&self) {
        self.shutdown.cancel();
    }

    async fn execute(&self, request: HttpRequest) -> Result<()> {
        self.transport.send(request).await?.error_for_status()?;
        Ok(())
    }
}

/// Handle to one channel's long-poll loop.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    cancel: CancellationToken,
    task: JoinHandle<StopReason>,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Stops this subscription only. A poll already in flight completes, but
    /// its message is not delivered.
    pub fn unsubscribe(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the loop to end and reports why it did.
    pub async fn stopped(self) -> StopReason {
        match self.task.await {
            Ok(reason) => reason,
            Err(err) => StopReason::Aborted(err.to_string()),
        }
    }
}
