//! Deterministic backend for tests and model-less development.
//!
//! Simulates load and token latency, answers every prompt with a fixed
//! template and produces a fixed-size embedding derived from the input.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::engine::{EngineBackend, EngineError, InferenceStream};
use crate::protocol::{InferenceConfig, InferenceEvent, ModelSpec, ThoughtEvent};

pub const STUB_REPLY_PREFIX: &str = "Stub reply: ";
pub const STUB_THOUGHT: &str = "Considering the request.";
pub const STUB_EMBEDDING_DIM: usize = 384;

pub struct StubBackend {
    model: Option<ModelSpec>,
    load_delay: Duration,
    token_delay: Duration,
    event_buffer: usize,
}

impl StubBackend {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            model: None,
            load_delay: Duration::from_millis(config.stub_load_delay_ms),
            token_delay: Duration::from_millis(config.stub_token_delay_ms),
            event_buffer: config.event_buffer,
        }
    }

    pub fn with_delays(load_delay: Duration, token_delay: Duration) -> Self {
        Self {
            model: None,
            load_delay,
            token_delay,
            event_buffer: EngineConfig::default().event_buffer,
        }
    }
}

/// The stub's answer for a prompt.
pub fn stub_reply(prompt: &str) -> String {
    format!("{STUB_REPLY_PREFIX}{prompt}")
}

/// The stub's embedding for an input. Unit length, stable across runs.
pub fn stub_embedding(input: &str) -> Vec<f32> {
    let phase = input.bytes().map(u32::from).sum::<u32>() as f32 * 1e-3;
    let raw: Vec<f32> = (0..STUB_EMBEDDING_DIM)
        .map(|i| (i as f32 * 0.37 + phase).sin())
        .collect();
    let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return raw;
    }
    raw.into_iter().map(|v| v / norm).collect()
}

#[async_trait]
impl EngineBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn loaded_model(&self) -> Option<&ModelSpec> {
        self.model.as_ref()
    }

    async fn load(&mut self, spec: ModelSpec) -> Result<(), EngineError> {
        tokio::time::sleep(self.load_delay).await;
        info!(model = %spec.id, quant = %spec.quantization, "Stub model loaded");
        self.model = Some(spec);
        Ok(())
    }

    async fn unload(&mut self) -> Result<(), EngineError> {
        if let Some(spec) = self.model.take() {
            info!(model = %spec.id, "Stub model unloaded");
        }
        Ok(())
    }

    async fn infer(
        &mut self,
        prompt: &str,
        config: InferenceConfig,
    ) -> Result<InferenceStream, EngineError> {
        if self.model.is_none() {
            return Err(EngineError::NotLoaded);
        }

        let reply = stub_reply(prompt);
        let delay = self.token_delay;
        debug!(prompt_len = prompt.len(), "Stub inference started");

        Ok(InferenceStream::spawn(self.event_buffer, move |sink| async move {
            if !sink.send(Ok(InferenceEvent::ProcessStart)).await {
                return;
            }
            if !sink.pause(delay).await {
                return;
            }

            if config.show_thinking {
                let thought = [
                    ThoughtEvent::Start,
                    ThoughtEvent::Delta(STUB_THOUGHT.to_string()),
                    ThoughtEvent::Stop,
                ];
                for event in thought {
                    if !sink.send(Ok(InferenceEvent::Thought(event))).await {
                        return;
                    }
                }
                if !sink.pause(delay).await {
                    return;
                }
            }

            if !sink.send(Ok(InferenceEvent::Content(reply))).await {
                return;
            }
            sink.send(Ok(InferenceEvent::Complete)).await;
        }))
    }

    async fn embed(
        &mut self,
        input: &str,
        _config: InferenceConfig,
    ) -> Result<InferenceStream, EngineError> {
        if self.model.is_none() {
            return Err(EngineError::NotLoaded);
        }

        let vector = stub_embedding(input);
        let delay = self.token_delay;

        Ok(InferenceStream::spawn(self.event_buffer, move |sink| async move {
            if !sink.send(Ok(InferenceEvent::ProcessStart)).await {
                return;
            }
            if !sink.pause(delay).await {
                return;
            }
            if !sink.send(Ok(InferenceEvent::Embedding(vector))).await {
                return;
            }
            sink.send(Ok(InferenceEvent::Complete)).await;
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec() -> ModelSpec {
        ModelSpec {
            id: "stub".to_string(),
            path: PathBuf::from("stub"),
            quantization: "none".to_string(),
            context_size: 2048,
        }
    }

    fn fast() -> StubBackend {
        StubBackend::with_delays(Duration::from_millis(1), Duration::from_millis(1))
    }

    async fn collect(mut stream: InferenceStream) -> Vec<InferenceEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event.unwrap());
        }
        events
    }

    #[tokio::test]
    async fn test_infer_before_load_fails() {
        let mut backend = fast();
        let err = backend
            .infer("hi", InferenceConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::NotLoaded);
        assert!(matches!(
            backend.embed("hi", InferenceConfig::default()).await,
            Err(EngineError::NotLoaded)
        ));
    }

    #[tokio::test]
    async fn test_infer_sequence() {
        let mut backend = fast();
        backend.load(spec()).await.unwrap();
        assert!(backend.is_loaded());

        let stream = backend
            .infer("hello", InferenceConfig::default())
            .await
            .unwrap();
        assert_eq!(
            collect(stream).await,
            vec![
                InferenceEvent::ProcessStart,
                InferenceEvent::Content("Stub reply: hello".into()),
                InferenceEvent::Complete,
            ]
        );
    }

    #[tokio::test]
    async fn test_infer_with_thinking() {
        let mut backend = fast();
        backend.load(spec()).await.unwrap();

        let config = InferenceConfig {
            show_thinking: true,
            ..Default::default()
        };
        let events = collect(backend.infer("q", config).await.unwrap()).await;
        assert_eq!(events.len(), 6);
        assert_eq!(events[1], InferenceEvent::Thought(ThoughtEvent::Start));
        assert_eq!(events[3], InferenceEvent::Thought(ThoughtEvent::Stop));
    }

    #[tokio::test]
    async fn test_embedding_is_deterministic() {
        let mut backend = fast();
        backend.load(spec()).await.unwrap();

        let a = collect(backend.embed("text", InferenceConfig::default()).await.unwrap()).await;
        let b = collect(backend.embed("text", InferenceConfig::default()).await.unwrap()).await;
        assert_eq!(a, b);
        match &a[1] {
            InferenceEvent::Embedding(v) => assert_eq!(v.len(), STUB_EMBEDDING_DIM),
            other => panic!("expected embedding, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_interrupts_token_delay() {
        let mut backend = StubBackend::with_delays(Duration::ZERO, Duration::from_secs(30));
        backend.load(spec()).await.unwrap();
        let mut stream = backend
            .infer("slow", InferenceConfig::default())
            .await
            .unwrap();
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            InferenceEvent::ProcessStart
        );
        assert!(stream.cancel(Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn test_unload_is_idempotent() {
        let mut backend = fast();
        backend.load(spec()).await.unwrap();
        backend.unload().await.unwrap();
        backend.unload().await.unwrap();
        assert!(backend.loaded_model().is_none());
    }
}
