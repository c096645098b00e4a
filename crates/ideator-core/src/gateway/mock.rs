//! Scripted chat backend for tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{ChatBackend, CompletionRequest, GatewayError};

/// A configurable reply for [`MockLlm`].
#[derive(Clone, Debug)]
pub enum MockReply {
    /// Return this completion text.
    Text(String),
    /// Fail with this gateway error.
    Error(GatewayError),
}

impl MockReply {
    pub fn text(s: impl Into<String>) -> Self {
        MockReply::Text(s.into())
    }
}

/// A hand-rolled mock implementing [`ChatBackend`].
///
/// Supports:
/// - A fixed reply (used for every call), **or**
/// - A sequence of replies (one per call, repeating the last if exhausted).
/// - A responder closure that picks a reply from the request.
/// - Optional per-call latency.
/// - Call counting and request capture.
pub struct MockLlm {
    /// Reversed so the next reply can be popped cheaply.
    replies: Mutex<Vec<MockReply>>,
    fallback: MockReply,
    responder: Option<Box<dyn Fn(&CompletionRequest) -> MockReply + Send + Sync>>,
    delay: Option<Duration>,
    call_count: AtomicUsize,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockLlm {
    /// Create a mock that always returns `reply`.
    pub fn new(reply: MockReply) -> Self {
        Self {
            replies: Mutex::new(Vec::new()),
            fallback: reply,
            responder: None,
            delay: None,
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Create a mock that returns replies in order, repeating the last one.
    ///
    /// An empty sequence behaves like a mock that always returns an empty
    /// completion.
    pub fn with_sequence(mut replies: Vec<MockReply>) -> Self {
        let fallback = replies
            .last()
            .cloned()
            .unwrap_or_else(|| MockReply::text(""));
        replies.reverse();
        Self {
            replies: Mutex::new(replies),
            ..Self::new(fallback)
        }
    }

    /// Create a mock that computes each reply from the request.
    ///
    /// Useful when independent calls may arrive in any order.
    pub fn with_responder(
        responder: impl Fn(&CompletionRequest) -> MockReply + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Some(Box::new(responder)),
            ..Self::new(MockReply::text(""))
        }
    }

    /// Set simulated latency per call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// How many times `complete()` has been called.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn next_reply(&self, request: &CompletionRequest) -> MockReply {
        if let Some(responder) = &self.responder {
            return responder(request);
        }
        match self.replies.lock() {
            Ok(mut seq) => seq.pop().unwrap_or_else(|| self.fallback.clone()),
            Err(_) => self.fallback.clone(),
        }
    }
}

impl ChatBackend for MockLlm {
    fn name(&self) -> &str {
        "mock"
    }

    fn complete<'a>(
        &'a self,
        request: &'a CompletionRequest,
        _timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<String, GatewayError>> + Send + 'a>> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut captured) = self.requests.lock() {
            captured.push(request.clone());
        }
        let reply = self.next_reply(request);
        let delay = self.delay;

        Box::pin(async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            match reply {
                MockReply::Text(text) => Ok(text),
                MockReply::Error(err) => Err(err),
            }
        })
    }
}
