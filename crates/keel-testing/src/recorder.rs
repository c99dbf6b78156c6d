//! Handlers that record how they were called.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use keel_core::{Body, Handler, HandlerContext, HandlerError, HandlerResult, Reason};
use serde_json::Value;

/// One recorded handler call.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub handler: String,
    pub reason: Reason,
    pub retry: u32,
    pub body: Body,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

#[derive(Debug, Clone)]
enum Behaviour {
    Succeed(Option<Value>),
    FailTemporarily { times: u32, delay: Option<Duration> },
    FailPermanently(String),
    FailUnexpectedly(String),
    Sleep(Duration),
}

/// Shared log of handler calls, and a factory of handlers writing to it.
///
/// ```ignore
/// let recorder = HandlerRecorder::new();
/// let registry = Registry::builder()
///     .with_handler(HandlerDescriptor::on_create("create", recorder.succeed()))
///     .build()?;
/// // ... run the reactor ...
/// assert_eq!(recorder.calls("create"), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct HandlerRecorder {
    invocations: Arc<Mutex<Vec<Invocation>>>,
}

impl HandlerRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    /// Number of calls of one handler.
    pub fn calls(&self, handler: &str) -> usize {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.handler == handler)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }

    /// Handler ids in call order.
    pub fn order(&self) -> Vec<String> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .map(|i| i.handler.clone())
            .collect()
    }

    pub fn last(&self, handler: &str) -> Option<Invocation> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|i| i.handler == handler)
            .cloned()
    }

    pub fn clear(&self) {
        self.invocations.lock().unwrap().clear();
    }

    pub fn succeed(&self) -> RecordingHandler {
        self.handler(Behaviour::Succeed(None))
    }

    /// Succeed with a result to be stored under `status.<id>`.
    pub fn returning(&self, value: Value) -> RecordingHandler {
        self.handler(Behaviour::Succeed(Some(value)))
    }

    /// Fail temporarily for the first `times` calls, then succeed.
    pub fn fail_temporarily(&self, times: u32, delay: Duration) -> RecordingHandler {
        self.handler(Behaviour::FailTemporarily {
            times,
            delay: Some(delay),
        })
    }

    /// Like [`Self::fail_temporarily`], leaving the delay to the backoff.
    pub fn fail_with_backoff(&self, times: u32) -> RecordingHandler {
        self.handler(Behaviour::FailTemporarily { times, delay: None })
    }

    pub fn fail_permanently(&self, message: impl Into<String>) -> RecordingHandler {
        self.handler(Behaviour::FailPermanently(message.into()))
    }

    /// Always fail with an unclassified error.
    pub fn fail_unexpectedly(&self, message: impl Into<String>) -> RecordingHandler {
        self.handler(Behaviour::FailUnexpectedly(message.into()))
    }

    /// Sleep, then succeed. For timeout tests.
    pub fn sleep(&self, duration: Duration) -> RecordingHandler {
        self.handler(Behaviour::Sleep(duration))
    }

    fn handler(&self, behaviour: Behaviour) -> RecordingHandler {
        RecordingHandler {
            recorder: self.clone(),
            behaviour,
        }
    }

    fn record(&self, ctx: &HandlerContext) {
        self.invocations.lock().unwrap().push(Invocation {
            handler: ctx.handler_id.to_string(),
            reason: ctx.reason(),
            retry: ctx.retry,
            body: ctx.body().clone(),
            old: ctx.old().cloned(),
            new: ctx.new().cloned(),
        });
    }
}

/// A handler produced by [`HandlerRecorder`].
#[derive(Debug, Clone)]
pub struct RecordingHandler {
    recorder: HandlerRecorder,
    behaviour: Behaviour,
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn handle(&self, ctx: HandlerContext) -> HandlerResult {
        self.recorder.record(&ctx);
        match &self.behaviour {
            Behaviour::Succeed(value) => Ok(value.clone()),
            Behaviour::FailTemporarily { times, delay } if ctx.retry < *times => Err(HandlerError::Temporary {
                message: format!("attempt {} of {}", ctx.retry + 1, times + 1),
                delay: *delay,
            }),
            Behaviour::FailTemporarily { .. } => Ok(None),
            Behaviour::FailPermanently(message) => Err(HandlerError::permanent(message.clone())),
            Behaviour::FailUnexpectedly(message) => Err(anyhow::anyhow!("{message}").into()),
            Behaviour::Sleep(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(None)
            }
        }
    }
}
