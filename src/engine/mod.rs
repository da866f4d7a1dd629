//! Inference backends.
//!
//! - [`classifier`]: Splits raw decode text into reasoning and answer events
//! - [`stub`]: Deterministic backend with simulated latency
//! - `llama`: llama.cpp backend (`real-engine` feature)
//!
//! A backend owns the model weights while loaded and produces one
//! [`InferenceStream`] per request. The stream is a bounded channel fed by a
//! worker task; dropping or cancelling it tells the worker to stop.

pub mod classifier;
#[cfg(feature = "real-engine")]
pub mod llama;
pub mod stub;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::protocol::{ErrorEvent, ErrorKind, InferenceConfig, InferenceEvent, ModelSpec};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("No model loaded")]
    NotLoaded,

    #[error("Failed to load model from {path}: {reason}")]
    LoadFailed { path: String, reason: String },

    #[error("Context creation failed: {0}")]
    ContextFailed(String),

    #[error("Tokenization failed: {0}")]
    TokenizeFailed(String),

    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    #[error("Embedding extraction failed: {0}")]
    EmbeddingFailed(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Backend stream ended before completion")]
    StreamEnded,

    #[error("Backend initialization failed: {0}")]
    InitFailed(String),
}

impl From<EngineError> for ErrorEvent {
    fn from(err: EngineError) -> Self {
        Self {
            kind: ErrorKind::Engine,
            message: err.to_string(),
        }
    }
}

/// One item of a backend's event stream.
pub type EventResult = Result<InferenceEvent, EngineError>;

/// Shared cancellation signal between a stream and its worker.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Producer half handed to a backend worker.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<EventResult>,
    cancel: CancelFlag,
}

impl EventSink {
    /// Whether the consumer has gone away or asked to stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// Send from async code. Returns false once the consumer is gone.
    pub async fn send(&self, item: EventResult) -> bool {
        if self.is_cancelled() {
            return false;
        }
        self.tx.send(item).await.is_ok()
    }

    /// Send from a blocking worker thread. Returns false once the consumer is gone.
    pub fn blocking_send(&self, item: EventResult) -> bool {
        if self.is_cancelled() {
            return false;
        }
        self.tx.blocking_send(item).is_ok()
    }

    /// Wait `delay` for simulated work. Wakes early and returns false once
    /// the consumer is gone.
    pub async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => !self.is_cancelled(),
            _ = self.tx.closed() => false,
        }
    }

    /// Run `work` over consecutive chunks of `items`, passing each chunk's
    /// starting index. Returns `Cancelled` before any chunk once the consumer
    /// is gone.
    pub fn for_each_chunk<T, F>(
        &self,
        items: &[T],
        size: usize,
        mut work: F,
    ) -> Result<(), EngineError>
    where
        F: FnMut(usize, &[T]) -> Result<(), EngineError>,
    {
        let size = size.max(1);
        for (index, chunk) in items.chunks(size).enumerate() {
            if self.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            work(index * size, chunk)?;
        }
        Ok(())
    }
}

/// The consumer side of a single inference call.
#[derive(Debug)]
pub struct InferenceStream {
    events: mpsc::Receiver<EventResult>,
    cancel: CancelFlag,
    worker: Option<JoinHandle<()>>,
}

impl InferenceStream {
    /// Run `work` as an async task feeding a new stream.
    pub fn spawn<F, Fut>(buffer: usize, work: F) -> Self
    where
        F: FnOnce(EventSink) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (sink, events, cancel) = channel(buffer);
        let worker = tokio::spawn(work(sink));
        Self {
            events,
            cancel,
            worker: Some(worker),
        }
    }

    /// Run `work` on the blocking pool feeding a new stream.
    pub fn spawn_blocking<F>(buffer: usize, work: F) -> Self
    where
        F: FnOnce(EventSink) + Send + 'static,
    {
        let (sink, events, cancel) = channel(buffer);
        let worker = tokio::task::spawn_blocking(move || work(sink));
        Self {
            events,
            cancel,
            worker: Some(worker),
        }
    }

    /// Next event, or None once the worker has finished and the buffer is empty.
    pub async fn next(&mut self) -> Option<EventResult> {
        self.events.recv().await
    }

    /// Stop the worker and wait at most `grace` for it to release its state.
    ///
    /// Returns false if the worker had to be abandoned. Async workers are
    /// aborted; blocking workers notice the flag at their next step.
    pub async fn cancel(mut self, grace: Duration) -> bool {
        self.cancel.cancel();
        self.events.close();
        while self.events.try_recv().is_ok() {}

        let Some(mut worker) = self.worker.take() else {
            return true;
        };

        match tokio::time::timeout(grace, &mut worker).await {
            Ok(_) => {
                debug!("Backend worker stopped after cancellation");
                true
            }
            Err(_) => {
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    "Backend worker ignored cancellation, tearing it down"
                );
                worker.abort();
                false
            }
        }
    }
}

impl Drop for InferenceStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn channel(buffer: usize) -> (EventSink, mpsc::Receiver<EventResult>, CancelFlag) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let cancel = CancelFlag::default();
    let sink = EventSink {
        tx,
        cancel: cancel.clone(),
    };
    (sink, rx, cancel)
}

/// The capability every backend provides.
///
/// Calls are exclusive: the orchestrator never issues `load`, `infer` or
/// `unload` while another call on the same backend is outstanding.
#[async_trait]
pub trait EngineBackend: Send {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// The model currently held, if any.
    fn loaded_model(&self) -> Option<&ModelSpec>;

    fn is_loaded(&self) -> bool {
        self.loaded_model().is_some()
    }

    /// Load a model. On failure nothing stays resident.
    async fn load(&mut self, spec: ModelSpec) -> Result<(), EngineError>;

    /// Release the model. Idempotent.
    async fn unload(&mut self) -> Result<(), EngineError>;

    /// Start generation. The stream begins with ProcessStart and ends with
    /// Complete or an error.
    async fn infer(
        &mut self,
        prompt: &str,
        config: InferenceConfig,
    ) -> Result<InferenceStream, EngineError>;

    /// Compute an embedding: ProcessStart, Embedding, Complete.
    async fn embed(
        &mut self,
        input: &str,
        config: InferenceConfig,
    ) -> Result<InferenceStream, EngineError>;
}

/// The backends this build can run, chosen at compile time.
pub enum Backend {
    Stub(stub::StubBackend),
    #[cfg(feature = "real-engine")]
    Llama(llama::LlamaEngine),
}

impl Backend {
    /// The backend selected by the `real-engine` feature.
    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        #[cfg(feature = "real-engine")]
        let backend = Backend::Llama(llama::LlamaEngine::new(config.clone())?);

        #[cfg(not(feature = "real-engine"))]
        let backend = Backend::Stub(stub::StubBackend::new(config));

        Ok(backend)
    }
}

#[async_trait]
impl EngineBackend for Backend {
    fn name(&self) -> &'static str {
        match self {
            Backend::Stub(b) => b.name(),
            #[cfg(feature = "real-engine")]
            Backend::Llama(b) => b.name(),
        }
    }

    fn loaded_model(&self) -> Option<&ModelSpec> {
        match self {
            Backend::Stub(b) => b.loaded_model(),
            #[cfg(feature = "real-engine")]
            Backend::Llama(b) => b.loaded_model(),
        }
    }

    async fn load(&mut self, spec: ModelSpec) -> Result<(), EngineError> {
        match self {
            Backend::Stub(b) => b.load(spec).await,
            #[cfg(feature = "real-engine")]
            Backend::Llama(b) => b.load(spec).await,
        }
    }

    async fn unload(&mut self) -> Result<(), EngineError> {
        match self {
            Backend::Stub(b) => b.unload().await,
            #[cfg(feature = "real-engine")]
            Backend::Llama(b) => b.unload().await,
        }
    }

    async fn infer(
        &mut self,
        prompt: &str,
        config: InferenceConfig,
    ) -> Result<InferenceStream, EngineError> {
        match self {
            Backend::Stub(b) => b.infer(prompt, config).await,
            #[cfg(feature = "real-engine")]
            Backend::Llama(b) => b.infer(prompt, config).await,
        }
    }

    async fn embed(
        &mut self,
        input: &str,
        config: InferenceConfig,
    ) -> Result<InferenceStream, EngineError> {
        match self {
            Backend::Stub(b) => b.embed(input, config).await,
            #[cfg(feature = "real-engine")]
            Backend::Llama(b) => b.embed(input, config).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dropped_stream_stops_worker() {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let stream = InferenceStream::spawn(1, |sink| async move {
            let mut sent = 0;
            while sink.send(Ok(InferenceEvent::Content("x".into()))).await {
                sent += 1;
            }
            let _ = done_tx.send(sent);
        });

        drop(stream);
        let sent = tokio::time::timeout(Duration::from_secs(1), done_rx)
            .await
            .unwrap()
            .unwrap();
        assert!(sent <= 1);
    }

    #[tokio::test]
    async fn test_cancel_waits_for_cooperative_worker() {
        let stream = InferenceStream::spawn(4, |sink| async move {
            while !sink.is_cancelled() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        assert!(stream.cancel(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_cancel_aborts_stuck_worker() {
        let stream = InferenceStream::spawn(4, |_sink| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        assert!(!stream.cancel(Duration::from_millis(20)).await);
    }

    #[test]
    fn test_chunks_stop_once_cancelled() {
        let (sink, _events, cancel) = channel(1);
        let tokens: Vec<u32> = (0..10).collect();

        let mut starts = Vec::new();
        let result = sink.for_each_chunk(&tokens, 4, |start, chunk| {
            starts.push((start, chunk.len()));
            cancel.cancel();
            Ok(())
        });
        assert_eq!(result, Err(EngineError::Cancelled));
        assert_eq!(starts, vec![(0, 4)]);
    }

    #[test]
    fn test_chunks_cover_all_items() {
        let (sink, _events, _cancel) = channel(1);
        let tokens: Vec<u32> = (0..10).collect();

        let mut seen = Vec::new();
        sink.for_each_chunk(&tokens, 4, |start, chunk| {
            seen.push((start, chunk.to_vec()));
            Ok(())
        })
        .unwrap();
        assert_eq!(
            seen,
            vec![(0, vec![0, 1, 2, 3]), (4, vec![4, 5, 6, 7]), (8, vec![8, 9])]
        );
    }

    #[test]
    fn test_chunks_skipped_after_consumer_drops() {
        let (sink, events, _cancel) = channel(1);
        drop(events);

        let mut calls = 0;
        let result = sink.for_each_chunk(&[1u32, 2, 3], 1, |_, _| {
            calls += 1;
            Ok(())
        });
        assert_eq!(result, Err(EngineError::Cancelled));
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn test_blocking_worker_feeds_stream() {
        let mut stream = InferenceStream::spawn_blocking(2, |sink| {
            sink.blocking_send(Ok(InferenceEvent::ProcessStart));
            sink.blocking_send(Ok(InferenceEvent::Complete));
        });
        assert_eq!(stream.next().await, Some(Ok(InferenceEvent::ProcessStart)));
        assert_eq!(stream.next().await, Some(Ok(InferenceEvent::Complete)));
        assert_eq!(stream.next().await, None);
    }
}
