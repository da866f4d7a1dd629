//! SSE (Server-Sent Events) streaming for token-by-token responses.
//!
//! Converts a request's response stream into an SSE stream compatible with
//! the OpenAI streaming format. Reasoning deltas travel as
//! `reasoning_content`.

use axum::response::sse::Event;
use futures::stream::Stream;
use serde::Serialize;
use tokio_stream::StreamExt;

use crate::orchestrator::client::ResponseStream;
use crate::protocol::{InferenceEvent, OutputBody, ThoughtEvent};

/// Streaming chat completion chunk (OpenAI-compatible).
#[derive(Debug, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Serialize)]
pub struct ChunkChoice {
    pub index: usize,
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

/// Map one output to a chunk delta and finish reason. None = nothing to send.
fn to_delta(body: OutputBody) -> Option<(ChunkDelta, Option<String>)> {
    match body {
        OutputBody::Event(InferenceEvent::Content(text)) => Some((
            ChunkDelta {
                content: Some(text),
                ..Default::default()
            },
            None,
        )),
        OutputBody::Event(InferenceEvent::Thought(ThoughtEvent::Delta(text))) => Some((
            ChunkDelta {
                reasoning_content: Some(text),
                ..Default::default()
            },
            None,
        )),
        OutputBody::Event(InferenceEvent::Complete) => {
            Some((ChunkDelta::default(), Some("stop".to_string())))
        }
        OutputBody::Error(e) => Some((
            ChunkDelta {
                content: Some(format!("[Error: {}]", e.message)),
                ..Default::default()
            },
            Some("error".to_string()),
        )),
        _ => None,
    }
}

/// Convert a response stream into an SSE stream.
pub fn response_to_sse_stream(
    response: ResponseStream,
    model: String,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    let request_id = response.id().to_string();
    let created = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mut first = true;

    response
        .filter_map(to_delta)
        .map(move |(mut delta, finish_reason)| {
            // First chunk includes the role.
            if first {
                delta.role = Some("assistant".to_string());
                first = false;
            }

            let chunk = ChatCompletionChunk {
                id: format!("chatcmpl-{request_id}"),
                object: "chat.completion.chunk".to_string(),
                created,
                model: model.clone(),
                choices: vec![ChunkChoice {
                    index: 0,
                    delta,
                    finish_reason,
                }],
            };

            let data = serde_json::to_string(&chunk).unwrap_or_default();
            Ok(Event::default().data(data))
        })
        // Append the [DONE] sentinel after all events.
        .chain(tokio_stream::once(Ok(Event::default().data("[DONE]"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ErrorEvent, ErrorKind};

    #[test]
    fn test_delta_mapping() {
        let content = OutputBody::Event(InferenceEvent::Content("hi".into()));
        let (delta, finish) = to_delta(content).unwrap();
        assert_eq!(delta.content.as_deref(), Some("hi"));
        assert!(finish.is_none());

        let (delta, _) = to_delta(OutputBody::Event(InferenceEvent::Thought(ThoughtEvent::Delta(
            "hmm".into(),
        ))))
        .unwrap();
        assert_eq!(delta.reasoning_content.as_deref(), Some("hmm"));

        let (_, finish) = to_delta(OutputBody::Event(InferenceEvent::Complete)).unwrap();
        assert_eq!(finish.as_deref(), Some("stop"));

        let (delta, finish) = to_delta(OutputBody::Error(ErrorEvent {
            kind: ErrorKind::Engine,
            message: "boom".into(),
        }))
        .unwrap();
        assert_eq!(delta.content.as_deref(), Some("[Error: boom]"));
        assert_eq!(finish.as_deref(), Some("error"));
    }

    #[test]
    fn test_markers_are_skipped() {
        assert!(to_delta(OutputBody::Event(InferenceEvent::ProcessStart)).is_none());
        let start = OutputBody::Event(InferenceEvent::Thought(ThoughtEvent::Start));
        assert!(to_delta(start).is_none());
    }
}
