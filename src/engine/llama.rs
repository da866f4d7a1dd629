//! llama.cpp backend.
//!
//! Weights are loaded once per model and shared behind an `Arc`. Each request
//! gets its own context on the blocking pool, so a cancelled or failed
//! request never leaves decode state behind.

use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::engine::classifier::{is_visible, OutputClassifier};
use crate::engine::{EngineBackend, EngineError, EventSink, InferenceStream};
use crate::protocol::{InferenceConfig, InferenceEvent, ModelSpec};

/// Seed used when a request does not pick one.
const DEFAULT_SEED: u32 = 1234;

/// llama.cpp may only be initialized once per process.
static LLAMA_BACKEND: Mutex<Option<Arc<LlamaBackend>>> = Mutex::new(None);

fn shared_backend() -> Result<Arc<LlamaBackend>, EngineError> {
    let mut slot = LLAMA_BACKEND
        .lock()
        .map_err(|_| EngineError::InitFailed("backend lock poisoned".to_string()))?;
    if let Some(backend) = slot.as_ref() {
        return Ok(backend.clone());
    }
    let backend =
        Arc::new(LlamaBackend::init().map_err(|e| EngineError::InitFailed(e.to_string()))?);
    *slot = Some(backend.clone());
    Ok(backend)
}

pub struct LlamaEngine {
    config: EngineConfig,
    backend: Arc<LlamaBackend>,
    model: Option<Arc<LlamaModel>>,
    spec: Option<ModelSpec>,
}

impl LlamaEngine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Ok(Self {
            config,
            backend: shared_backend()?,
            model: None,
            spec: None,
        })
    }

    fn job(&self, text: &str, request: InferenceConfig) -> Result<Job, EngineError> {
        let model = self.model.clone().ok_or(EngineError::NotLoaded)?;
        let model_ctx = self
            .spec
            .as_ref()
            .map(|s| s.context_size)
            .unwrap_or(self.config.context_size);
        let default_ctx = model_ctx.min(self.config.context_size).max(1);
        Ok(Job {
            backend: self.backend.clone(),
            model,
            text: text.to_string(),
            n_ctx: request.context_size.unwrap_or(default_ctx),
            batch_size: self.config.batch_size.max(1),
            threads: self.config.threads,
            think_start: self.config.think_start.clone(),
            think_end: self.config.think_end.clone(),
            request,
        })
    }
}

/// Everything a blocking worker needs, owned.
struct Job {
    backend: Arc<LlamaBackend>,
    model: Arc<LlamaModel>,
    text: String,
    n_ctx: u32,
    batch_size: u32,
    threads: Option<i32>,
    think_start: String,
    think_end: String,
    request: InferenceConfig,
}

impl Job {
    fn context_params(&self, n_batch: u32) -> LlamaContextParams {
        let params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(self.n_ctx))
            .with_n_batch(n_batch);
        match self.threads {
            Some(t) => params.with_n_threads(t).with_n_threads_batch(t),
            None => params,
        }
    }

    fn tokenize(&self) -> Result<Vec<LlamaToken>, EngineError> {
        let tokens = self
            .model
            .str_to_token(&self.text, AddBos::Always)
            .map_err(|e| EngineError::TokenizeFailed(e.to_string()))?;
        if tokens.len() >= self.n_ctx as usize {
            return Err(EngineError::TokenizeFailed(format!(
                "input of {} tokens does not fit a {}-token context",
                tokens.len(),
                self.n_ctx
            )));
        }
        Ok(tokens)
    }
}

#[async_trait]
impl EngineBackend for LlamaEngine {
    fn name(&self) -> &'static str {
        "llama.cpp"
    }

    fn loaded_model(&self) -> Option<&ModelSpec> {
        self.spec.as_ref()
    }

    async fn load(&mut self, spec: ModelSpec) -> Result<(), EngineError> {
        self.unload().await?;

        let backend = self.backend.clone();
        let path: PathBuf = spec.path.clone();
        let n_gpu_layers = self.config.n_gpu_layers;
        let load_failed = |reason: String| EngineError::LoadFailed {
            path: spec.path.display().to_string(),
            reason,
        };

        info!(model = %spec.id, path = %spec.path.display(), n_gpu_layers, "Loading weights");
        let model = tokio::task::spawn_blocking(move || {
            let params = LlamaModelParams::default().with_n_gpu_layers(n_gpu_layers);
            LlamaModel::load_from_file(&backend, path, &params)
        })
        .await
        .map_err(|e| load_failed(e.to_string()))?
        .map_err(|e| load_failed(e.to_string()))?;

        self.model = Some(Arc::new(model));
        self.spec = Some(spec);
        Ok(())
    }

    async fn unload(&mut self) -> Result<(), EngineError> {
        if let Some(spec) = self.spec.take() {
            info!(model = %spec.id, "Releasing weights");
        }
        self.model = None;
        Ok(())
    }

    async fn infer(
        &mut self,
        prompt: &str,
        config: InferenceConfig,
    ) -> Result<InferenceStream, EngineError> {
        let job = self.job(prompt, config)?;
        Ok(InferenceStream::spawn_blocking(
            self.config.event_buffer,
            move |sink| {
                if !sink.blocking_send(Ok(InferenceEvent::ProcessStart)) {
                    return;
                }
                match generate(&job, &sink) {
                    Ok(()) => {}
                    Err(EngineError::Cancelled) => debug!("Generation cancelled"),
                    Err(e) => {
                        warn!(error = %e, "Generation failed");
                        sink.blocking_send(Err(e));
                    }
                }
            },
        ))
    }

    async fn embed(
        &mut self,
        input: &str,
        config: InferenceConfig,
    ) -> Result<InferenceStream, EngineError> {
        let job = self.job(input, config)?;
        Ok(InferenceStream::spawn_blocking(
            self.config.event_buffer,
            move |sink| {
                if !sink.blocking_send(Ok(InferenceEvent::ProcessStart)) {
                    return;
                }
                match embed(&job, &sink) {
                    Ok(vector) => {
                        if sink.blocking_send(Ok(InferenceEvent::Embedding(vector))) {
                            sink.blocking_send(Ok(InferenceEvent::Complete));
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Embedding failed");
                        sink.blocking_send(Err(e));
                    }
                }
            },
        ))
    }
}

fn decode_failed(e: impl std::fmt::Display) -> EngineError {
    EngineError::DecodeFailed(e.to_string())
}

/// Feed the prompt in `batch_size` chunks; logits only for the final token.
/// Stops between chunks once the sink is cancelled.
fn prefill(
    ctx: &mut LlamaContext<'_>,
    batch: &mut LlamaBatch,
    tokens: &[LlamaToken],
    batch_size: usize,
    sink: &EventSink,
) -> Result<(), EngineError> {
    let last = tokens.len().saturating_sub(1);
    sink.for_each_chunk(tokens, batch_size, |start, chunk| {
        batch.clear();
        for (offset, token) in chunk.iter().enumerate() {
            let pos = start + offset;
            batch
                .add(*token, pos as i32, &[0], pos == last)
                .map_err(decode_failed)?;
        }
        ctx.decode(batch).map_err(decode_failed)
    })
}

fn generate(job: &Job, sink: &EventSink) -> Result<(), EngineError> {
    let mut ctx = job
        .model
        .new_context(&job.backend, job.context_params(job.batch_size))
        .map_err(|e| EngineError::ContextFailed(e.to_string()))?;
    let tokens = job.tokenize()?;
    if sink.is_cancelled() {
        return Err(EngineError::Cancelled);
    }
    let mut batch = LlamaBatch::new(job.batch_size as usize, 1);
    prefill(&mut ctx, &mut batch, &tokens, job.batch_size as usize, sink)?;

    let mut sampler = if job.request.temperature <= 0.0 {
        LlamaSampler::greedy()
    } else {
        LlamaSampler::chain_simple([
            LlamaSampler::temp(job.request.temperature),
            LlamaSampler::dist(job.request.seed.unwrap_or(DEFAULT_SEED)),
        ])
    };

    let mut classifier = OutputClassifier::new(&job.think_start, &job.think_end);
    let show_thinking = job.request.show_thinking;
    let emit = |events: Vec<InferenceEvent>| -> Result<(), EngineError> {
        for event in events {
            if is_visible(&event, show_thinking) && !sink.blocking_send(Ok(event)) {
                return Err(EngineError::Cancelled);
            }
        }
        Ok(())
    };

    let mut pos = tokens.len() as i32;
    let mut undecoded: Vec<u8> = Vec::new();
    let mut generated = 0usize;

    while generated < job.request.max_tokens {
        if sink.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let token = sampler.sample(&ctx, batch.n_tokens() - 1);
        if job.model.is_eog_token(token) {
            break;
        }
        generated += 1;

        let bytes = job
            .model
            .token_to_bytes(token, Special::Tokenize)
            .map_err(decode_failed)?;
        undecoded.extend_from_slice(&bytes);
        let text = take_utf8(&mut undecoded);
        if !text.is_empty() {
            emit(classifier.push(&text))?;
        }

        if pos as u32 + 1 >= job.n_ctx {
            debug!(generated, "Context window exhausted");
            break;
        }
        batch.clear();
        batch.add(token, pos, &[0], true).map_err(decode_failed)?;
        pos += 1;
        ctx.decode(&mut batch).map_err(decode_failed)?;
    }

    if !undecoded.is_empty() {
        let rest = String::from_utf8_lossy(&undecoded).into_owned();
        emit(classifier.push(&rest))?;
    }
    emit(classifier.finish())?;

    debug!(prompt_tokens = tokens.len(), generated, "Generation finished");
    if !sink.blocking_send(Ok(InferenceEvent::Complete)) {
        return Err(EngineError::Cancelled);
    }
    Ok(())
}

fn embed(job: &Job, sink: &EventSink) -> Result<Vec<f32>, EngineError> {
    let tokens = job.tokenize()?;
    if sink.is_cancelled() {
        return Err(EngineError::Cancelled);
    }
    let params = job.context_params(job.n_ctx).with_embeddings(true);
    let mut ctx = job
        .model
        .new_context(&job.backend, params)
        .map_err(|e| EngineError::ContextFailed(e.to_string()))?;

    let mut batch = LlamaBatch::new(tokens.len(), 1);
    let last = tokens.len().saturating_sub(1);
    for (i, token) in tokens.iter().enumerate() {
        batch
            .add(*token, i as i32, &[0], i == last)
            .map_err(decode_failed)?;
    }
    ctx.decode(&mut batch).map_err(decode_failed)?;

    ctx.embeddings_seq_ith(0)
        .map(|v| v.to_vec())
        .map_err(|e| EngineError::EmbeddingFailed(e.to_string()))
}

/// Drain the longest valid UTF-8 prefix, keeping an incomplete trailing
/// sequence for the next token. Invalid bytes are replaced.
fn take_utf8(buf: &mut Vec<u8>) -> String {
    match std::str::from_utf8(buf) {
        Ok(s) => {
            let text = s.to_string();
            buf.clear();
            text
        }
        Err(e) => {
            let (valid, keep_from) = match e.error_len() {
                Some(bad) => (e.valid_up_to(), e.valid_up_to() + bad),
                None => (e.valid_up_to(), e.valid_up_to()),
            };
            let mut text = String::from_utf8_lossy(&buf[..valid]).into_owned();
            if keep_from > valid {
                text.push(char::REPLACEMENT_CHARACTER);
            }
            buf.drain(..keep_from);
            if e.error_len().is_some() && !buf.is_empty() {
                text.push_str(&take_utf8(buf));
            }
            text
        }
    }
}

#[cfg(test)]
mod tests {
    use super::take_utf8;

    #[test]
    fn test_split_multibyte_is_held() {
        let bytes = "日".as_bytes();
        let mut buf = bytes[..2].to_vec();
        assert_eq!(take_utf8(&mut buf), "");
        buf.extend_from_slice(&bytes[2..]);
        assert_eq!(take_utf8(&mut buf), "日");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_invalid_bytes_are_replaced() {
        let mut buf = vec![b'a', 0xff, b'b'];
        assert_eq!(take_utf8(&mut buf), "a\u{fffd}b");
    }
}
