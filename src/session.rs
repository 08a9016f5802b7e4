//! Long-poll state machine for a single subscribed channel.
//!
//! A session cycles `Idle → Polling → Scheduled → Polling → ...` until it
//! reaches `Stopped`. Conditional tokens only advance after a response has
//! been delivered; failed polls retry with the tokens they were sent with.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{
    handler::Dispatcher, ClientOptions, ConditionalTokens, HttpRequest, HttpResponse,
    HttpTransport, Method, PollState, PushMqError, Result, StopReason,
};

const CACHE_CONTROL: &str = "Cache-Control";
const IF_MODIFIED_SINCE: &str = "If-Modified-Since";
const IF_NONE_MATCH: &str = "If-None-Match";
const LAST_MODIFIED: &str = "Last-Modified";
const ETAG: &str = "Etag";

pub(crate) struct ChannelSession {
    channel: String,
    transport: Arc<dyn HttpTransport>,
    options: Arc<ClientOptions>,
    dispatcher: Dispatcher,
    /// Client-wide liveness; cancelled by `close`.
    shutdown: CancellationToken,
    /// Child of `shutdown`; also cancelled by `Subscription::unsubscribe`.
    cancel: CancellationToken,
    tokens: ConditionalTokens,
    state: PollState,
    consecutive_failures: usize,
}

impl ChannelSession {
    pub(crate) fn new(
        channel: String,
        transport: Arc<dyn HttpTransport>,
        options: Arc<ClientOptions>,
        dispatcher: Dispatcher,
        shutdown: CancellationToken,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            channel,
            transport,
            options,
            dispatcher,
            shutdown,
            cancel,
            tokens: ConditionalTokens::default(),
            state: PollState::Idle,
            consecutive_failures: 0,
        }
    }

    /// Drives the session until it stops.
    pub(crate) async fn run(mut self) -> StopReason {
        loop {
            let state = std::mem::replace(&mut self.state, PollState::Polling);
            self.state = match state {
                PollState::Idle => match self.liveness() {
                    Some(reason) => PollState::Stopped(reason),
                    None => PollState::Polling,
                },
                PollState::Polling => {
                    let outcome = self.poll_once().await;
                    self.on_response(outcome)
                }
                PollState::Scheduled { delay } => self.wait(delay).await,
                PollState::Stopped(reason) => {
                    debug_event!(
                        self.options.debug_logging,
                        channel = %self.channel,
                        reason = ?reason,
                        "subscription stopped"
                    );
                    return reason;
                }
            };
        }
    }

    fn liveness(&self) -> Option<StopReason> {
        if self.shutdown.is_cancelled() {
            Some(StopReason::Shutdown)
        } else if self.cancel.is_cancelled() {
            Some(StopReason::Unsubscribed)
        } else {
            None
        }
    }

    pub(crate) fn request(&self) -> HttpRequest {
        let mut url = self.options.subscribe_url(&self.channel);
        if self.options.cache_bust {
            append_cache_buster(&mut url);
        }

        let mut request = HttpRequest::new(Method::Get, url)
            .header(CACHE_CONTROL, "max-age=0")
            .timeout(self.options.poll_timeout());
        if let Some(last_modified) = &self.tokens.last_modified {
            request = request.header(IF_MODIFIED_SINCE, last_modified.as_str());
        }
        if let Some(etag) = &self.tokens.etag {
            request = request.header(IF_NONE_MATCH, etag.as_str());
        }
        request
    }

    async fn poll_once(&self) -> Result<HttpResponse> {
        let response = self.transport.send(self.request()).await?;
        if response.is_not_modified() {
            return Ok(response);
        }
        response.error_for_status()
    }

    /// Applies one poll outcome and returns the next state.
    pub(crate) fn on_response(&mut self, outcome: Result<HttpResponse>) -> PollState {
        match outcome {
            Ok(response) => self.on_success(response),
            Err(err) => self.on_failure(err),
        }
    }

    fn on_success(&mut self, response: HttpResponse) -> PollState {
        // The response may land after close() while the request was in flight.
        if let Some(reason) = self.liveness() {
            debug_event!(
                self.options.debug_logging,
                channel = %self.channel,
                payload = %response.body,
                "poll response dropped, subscription no longer live"
            );
            return PollState::Stopped(reason);
        }
        self.consecutive_failures = 0;

        if response.is_not_modified() {
            debug_event!(self.options.debug_logging, channel = %self.channel, "poll not modified");
            if let Some(last_modified) = response.header(LAST_MODIFIED) {
                self.tokens.last_modified = Some(last_modified.to_owned());
            }
            if let Some(etag) = response.header(ETAG) {
                self.tokens.etag = Some(etag.to_owned());
            }
            return self.schedule(self.options.poll_delay_ms);
        }

        debug_event!(
            self.options.debug_logging,
            channel = %self.channel,
            payload = %response.body,
            "poll received"
        );
        if let Err(err) = self.dispatcher.deliver(&self.channel, &response.body) {
            error_event!(channel = %self.channel, error = %err, "message handler failed, stopping subscription");
            let message = match err {
                PushMqError::Handler(message) => message,
                other => other.to_string(),
            };
            return PollState::Stopped(StopReason::HandlerFailed(message));
        }

        self.tokens = ConditionalTokens {
            last_modified: response.header(LAST_MODIFIED).map(str::to_owned),
            etag: response.header(ETAG).map(str::to_owned),
        };
        self.schedule(self.options.poll_delay_ms)
    }

    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    fn on_failure(&mut self, err: PushMqError) -> PollState {
        if let Some(reason) = self.liveness() {
            return PollState::Stopped(reason);
        }
        self.consecutive_failures += 1;
        debug_event!(
            self.options.debug_logging,
            channel = %self.channel,
            status = ?err.status(),
            error = %err,
            failures = self.consecutive_failures,
            "poll failed"
        );

        if let Some(max) = self.options.max_poll_retries {
            if self.consecutive_failures > max {
                return PollState::Stopped(StopReason::RetriesExhausted {
                    failures: self.consecutive_failures,
                });
            }
        }
        self.schedule(self.options.poll_retry_delay_ms)
    }

    fn schedule(&self, delay_ms: u64) -> PollState {
        PollState::Scheduled {
            delay: Duration::from_millis(delay_ms),
        }
    }

    async fn wait(&self, delay: Duration) -> PollState {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = sleep(delay) => {}
        }
        match self.liveness() {
            Some(reason) => PollState::Stopped(reason),
            None => PollState::Polling,
        }
    }

    #[cfg(test)]
    pub(crate) fn tokens(&self) -> &ConditionalTokens {
        &self.tokens
    }
}

fn append_cache_buster(url: &mut String) {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis());
    let separator = if url.contains('?') { '&' } else { '?' };
    url.push(separator);
    url.push_str("_=");
    url.push_str(&millis.to_string());
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use tokio_util::sync::CancellationToken;

    use super::ChannelSession;
    use crate::{
        handler::Dispatcher,
        testing::{ScriptedTransport, Step},
        ClientOptions, ConditionalTokens, HttpResponse, Method, PollState, PushMqError,
        StopReason,
    };

    type Log = Arc<Mutex<Vec<(String, String)>>>;

    fn recording_dispatcher() -> (Dispatcher, Log) {
        let log: Log = Arc::default();
        let sink = log.clone();
        let dispatcher = Dispatcher::new(move |channel: &str, payload: &str| {
            sink.lock()
                .expect("log mutex must not be poisoned")
                .push((channel.to_owned(), payload.to_owned()));
            Ok::<(), std::io::Error>(())
        });
        (dispatcher, log)
    }

    fn session_with(
        options: ClientOptions,
        dispatcher: Dispatcher,
    ) -> (ChannelSession, Arc<ScriptedTransport>, CancellationToken) {
        let transport = ScriptedTransport::new();
        let shutdown = CancellationToken::new();
        let session = ChannelSession::new(
            "news".to_owned(),
            transport.clone(),
            Arc::new(options),
            dispatcher,
            shutdown.clone(),
            shutdown.child_token(),
        );
        (session, transport, shutdown)
    }

    fn options() -> ClientOptions {
        ClientOptions {
            cache_bust: false,
            ..ClientOptions::default()
        }
    }

    fn tagged(body: &str, last_modified: &str, etag: &str) -> HttpResponse {
        HttpResponse::new(200, body)
            .with_header("Last-Modified", last_modified)
            .with_header("ETag", etag)
    }

    #[test]
    fn first_request_is_unconditional() {
        let (dispatcher, _) = recording_dispatcher();
        let (session, _, _) = session_with(options(), dispatcher);
        let request = session.request();

        assert_eq!(request.method, Method::Get);
        assert_eq!(request.url, "/activity?id=news");
        assert_eq!(request.header_value("Cache-Control"), Some("max-age=0"));
        assert_eq!(request.header_value("If-Modified-Since"), None);
        assert_eq!(request.header_value("If-None-Match"), None);
        assert_eq!(request.timeout, Some(Duration::from_millis(60_000)));
    }

    #[test]
    fn success_delivers_and_advances_tokens() {
        let (dispatcher, log) = recording_dispatcher();
        let (mut session, _, _) = session_with(options(), dispatcher);

        let next = session.on_response(Ok(tagged("hello", "T1", "\"e1\"")));

        assert_eq!(
            next,
            PollState::Scheduled {
                delay: Duration::from_millis(1_000)
            }
        );
        assert_eq!(
            *log.lock().expect("log mutex must not be poisoned"),
            vec![("news".to_owned(), "hello".to_owned())]
        );
        let request = session.request();
        assert_eq!(request.header_value("If-Modified-Since"), Some("T1"));
        assert_eq!(request.header_value("If-None-Match"), Some("\"e1\""));
    }

    #[test]
    fn success_without_headers_resets_tokens() {
        let (dispatcher, _) = recording_dispatcher();
        let (mut session, _, _) = session_with(options(), dispatcher);

        session.on_response(Ok(tagged("a", "T1", "\"e1\"")));
        session.on_response(Ok(HttpResponse::new(200, "b")));

        assert!(session.tokens().is_empty());
    }

    #[test]
    fn failure_keeps_tokens_and_uses_retry_delay() {
        let (dispatcher, log) = recording_dispatcher();
        let (mut session, _, _) = session_with(options(), dispatcher);
        session.on_response(Ok(tagged("a", "T1", "\"e1\"")));
        let before = session.request();

        for failure in [
            PushMqError::Timeout { timeout_ms: 60_000 },
            PushMqError::Http {
                status: 502,
                body: "bad gateway".to_owned(),
            },
            PushMqError::Network("reset".to_owned()),
        ] {
            let next = session.on_response(Err(failure));
            assert_eq!(
                next,
                PollState::Scheduled {
                    delay: Duration::from_millis(5_000)
                }
            );
            assert_eq!(session.request(), before);
        }
        assert_eq!(log.lock().expect("log mutex must not be poisoned").len(), 1);
    }

    #[test]
    fn not_modified_keeps_missing_tokens_and_skips_delivery() {
        let (dispatcher, log) = recording_dispatcher();
        let (mut session, _, _) = session_with(options(), dispatcher);
        session.on_response(Ok(tagged("a", "T1", "\"e1\"")));

        let next = session.on_response(Ok(
            HttpResponse::new(304, "").with_header("Etag", "\"e2\"")
        ));

        assert!(matches!(next, PollState::Scheduled { .. }));
        assert_eq!(
            *session.tokens(),
            ConditionalTokens {
                last_modified: Some("T1".to_owned()),
                etag: Some("\"e2\"".to_owned()),
            }
        );
        assert_eq!(log.lock().expect("log mutex must not be poisoned").len(), 1);
    }

    #[test]
    fn handler_failure_stops_without_advancing_tokens() {
        let dispatcher = Dispatcher::new(|_: &str, _: &str| Err::<(), _>("cannot parse"));
        let (mut session, _, shutdown) = session_with(options(), dispatcher);

        let next = session.on_response(Ok(tagged("a", "T1", "\"e1\"")));

        assert_eq!(
            next,
            PollState::Stopped(StopReason::HandlerFailed("cannot parse".to_owned()))
        );
        assert!(session.tokens().is_empty());
        assert!(!shutdown.is_cancelled());
    }

    #[test]
    fn responses_after_close_are_dropped() {
        let (dispatcher, log) = recording_dispatcher();
        let (mut session, _, shutdown) = session_with(options(), dispatcher);
        shutdown.cancel();

        assert_eq!(
            session.on_response(Ok(HttpResponse::new(200, "late"))),
            PollState::Stopped(StopReason::Shutdown)
        );
        assert_eq!(
            session.on_response(Err(PushMqError::Network("late".to_owned()))),
            PollState::Stopped(StopReason::Shutdown)
        );
        assert!(log.lock().expect("log mutex must not be poisoned").is_empty());
    }

    #[test]
    fn consecutive_failure_cap_stops_and_success_resets_it() {
        let (dispatcher, _) = recording_dispatcher();
        let (mut session, _, _) = session_with(
            ClientOptions {
                max_poll_retries: Some(1),
                ..options()
            },
            dispatcher,
        );
        let failure = || Err(PushMqError::Network("down".to_owned()));

        assert!(matches!(session.on_response(failure()), PollState::Scheduled { .. }));
        assert!(matches!(
            session.on_response(Ok(HttpResponse::new(200, "x"))),
            PollState::Scheduled { .. }
        ));
        assert!(matches!(session.on_response(failure()), PollState::Scheduled { .. }));
        assert_eq!(
            session.on_response(failure()),
            PollState::Stopped(StopReason::RetriesExhausted { failures: 2 })
        );
    }

    #[test]
    fn cache_buster_is_appended_to_query() {
        let (dispatcher, _) = recording_dispatcher();
        let (session, _, _) = session_with(ClientOptions::default(), dispatcher);

        let url = session.request().url;
        assert!(url.starts_with("/activity?id=news&_="), "unexpected url {url}");
    }

    #[tokio::test(start_paused = true)]
    async fn run_retries_timeout_with_identical_headers() {
        let (dispatcher, log) = recording_dispatcher();
        let (session, transport, shutdown) = session_with(options(), dispatcher);
        transport.script(
            Method::Get,
            [
                Step::response(tagged("hello", "T1", "\"e1\"")),
                Step::timeout(),
            ],
        );

        let task = tokio::spawn(session.run());
        tokio::time::sleep(Duration::from_millis(7_000)).await;

        let polls = transport.requests(Method::Get);
        assert_eq!(polls.len(), 3);
        assert_eq!(polls[1].request.header_value("If-Modified-Since"), Some("T1"));
        assert_eq!(polls[2].request, polls[1].request);
        let retry_gap = polls[2].at - polls[1].at;
        assert!(retry_gap >= Duration::from_millis(5_000));
        assert!(retry_gap < Duration::from_millis(5_050));
        assert_eq!(log.lock().expect("log mutex must not be poisoned").len(), 1);

        shutdown.cancel();
        // The third poll hangs; the loop only notices close when it completes.
        assert!(!task.is_finished());
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_wait_stops_without_polling() {
        let (dispatcher, _) = recording_dispatcher();
        let (session, transport, shutdown) = session_with(options(), dispatcher);
        transport.script(Method::Get, [Step::network()]);

        let task = tokio::spawn(session.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();

        let reason = task.await.expect("session task must not panic");
        assert_eq!(reason, StopReason::Shutdown);
        assert_eq!(transport.count(Method::Get), 1);
    }
}
