//! Scripted in-memory transport for unit tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::{future::BoxFuture, FutureExt};
use tokio::time::Instant;

use crate::{HttpRequest, HttpResponse, HttpTransport, Method, PushMqError, Result};

pub(crate) enum Step {
    Reply(Result<HttpResponse>),
    After(Duration, Result<HttpResponse>),
}

impl Step {
    pub(crate) fn ok(body: &str) -> Self {
        Self::Reply(Ok(HttpResponse::new(200, body)))
    }

    pub(crate) fn response(response: HttpResponse) -> Self {
        Self::Reply(Ok(response))
    }

    pub(crate) fn status(status: u16) -> Self {
        Self::Reply(Ok(HttpResponse::new(status, "")))
    }

    pub(crate) fn network() -> Self {
        Self::Reply(Err(PushMqError::Network("connection refused".to_owned())))
    }

    pub(crate) fn timeout() -> Self {
        Self::Reply(Err(PushMqError::Timeout { timeout_ms: 60_000 }))
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Recorded {
    pub at: Instant,
    pub request: HttpRequest,
}

/// Replies from a per-method script; once a script runs dry the request
/// hangs forever, like a long-poll the server never answers.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    scripts: Mutex<HashMap<Method, VecDeque<Step>>>,
    requests: Mutex<Vec<Recorded>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn script(&self, method: Method, steps: impl IntoIterator<Item = Step>) {
        self.scripts
            .lock()
            .expect("script mutex must not be poisoned")
            .entry(method)
            .or_default()
            .extend(steps);
    }

    pub(crate) fn requests(&self, method: Method) -> Vec<Recorded> {
        self.requests
            .lock()
            .expect("request log mutex must not be poisoned")
            .iter()
            .filter(|recorded| recorded.request.method == method)
            .cloned()
            .collect()
    }

    pub(crate) fn count(&self, method: Method) -> usize {
        self.requests(method).len()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl HttpTransport for ScriptedTransport {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>> {
        let method = request.method;
        self.requests
            .lock()
            .expect("request log mutex must not be poisoned")
            .push(Recorded {
                at: Instant::now(),
                request,
            });
        let step = self
            .scripts
            .lock()
            .expect("script mutex must not be poisoned")
            .get_mut(&method)
            .and_then(VecDeque::pop_front);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        async move {
            let result = match step {
                Some(Step::Reply(result)) => result,
                Some(Step::After(delay, result)) => {
                    tokio::time::sleep(delay).await;
                    result
                }
                None => futures::future::pending().await,
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
        .boxed()
    }
}

/// Lets spawned tasks run until every one of them is parked.
pub(crate) async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}
