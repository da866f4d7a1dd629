//! WebSocket bridge at `/v1/ws`.
//!
//! Each text frame carries one JSON [`Request`]. Every output for it comes
//! back as a JSON [`Output`] tagged with the caller's id, or with a generated
//! id when the caller sent none. Engine state changes are pushed untagged.
//! `Cancel` targets are the caller's ids. Closing the socket cancels whatever
//! the connection still has outstanding.

use std::collections::HashMap;
use std::future;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::orchestrator::client::{OrchestratorClient, ResponseStream};
use crate::protocol::{Command, ErrorEvent, ErrorKind, Output, OutputBody, Request};
use crate::server::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let client = state.client.clone();
    ws.on_upgrade(move |socket| session(socket, client))
}

async fn session(socket: WebSocket, client: OrchestratorClient) {
    let (mut sink, stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Output>();

    let writer = tokio::spawn(async move {
        while let Some(output) = rx.recv().await {
            match serde_json::to_string(&output) {
                Ok(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Could not encode output"),
            }
        }
    });

    let frames = stream
        .take_while(|frame| future::ready(matches!(frame, Ok(m) if !is_close(m))))
        .filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(text.as_str().to_owned()),
                _ => None,
            })
        });

    bridge(client, frames, tx).await;
    if writer.await.is_err() {
        debug!("WebSocket writer ended abnormally");
    }
}

fn is_close(message: &Message) -> bool {
    matches!(message, Message::Close(_))
}

/// Serve one connection until `frames` ends or nobody reads `outputs`.
async fn bridge<S>(client: OrchestratorClient, frames: S, outputs: mpsc::UnboundedSender<Output>)
where
    S: Stream<Item = String>,
{
    tokio::pin!(frames);
    let mut states = client.subscribe_state();
    let mut forwards: JoinSet<String> = JoinSet::new();
    // Caller id to client correlation id, for requests still streaming.
    let mut ids: HashMap<String, String> = HashMap::new();

    debug!("WebSocket session opened");
    loop {
        tokio::select! {
            frame = frames.next() => {
                let Some(text) = frame else {
                    break;
                };
                dispatch(&client, &text, &mut ids, &mut forwards, &outputs).await;
            }
            Ok(()) = states.changed() => {
                let state = *states.borrow_and_update();
                let output = Output {
                    id: None,
                    body: OutputBody::State(state),
                };
                if outputs.send(output).is_err() {
                    break;
                }
            }
            Some(done) = forwards.join_next(), if !forwards.is_empty() => {
                if let Ok(tag) = done {
                    ids.remove(&tag);
                }
            }
        }
    }
    debug!(outstanding = forwards.len(), "WebSocket session closed");
}

async fn dispatch(
    client: &OrchestratorClient,
    text: &str,
    ids: &mut HashMap<String, String>,
    forwards: &mut JoinSet<String>,
    outputs: &mpsc::UnboundedSender<Output>,
) {
    let reject = |id: Option<String>, message: String| {
        let body = OutputBody::Error(ErrorEvent {
            kind: ErrorKind::Protocol,
            message,
        });
        let _ = outputs.send(Output { id, body });
    };

    let Request { id, command } = match serde_json::from_str::<Request>(text) {
        Ok(request) => request,
        Err(e) => return reject(None, format!("Malformed request: {e}")),
    };

    let command = match command {
        Command::Stop => return reject(id, "Stop is not accepted over WebSocket".to_string()),
        Command::Cancel { target } => Command::Cancel {
            target: ids.get(&target).cloned().unwrap_or(target),
        },
        other => other,
    };

    match client.submit(command).await {
        Ok(response) => {
            let tag = id.unwrap_or_else(|| response.id().to_string());
            ids.insert(tag.clone(), response.id().to_string());
            forwards.spawn(forward(response, tag, outputs.clone()));
        }
        Err(e) => {
            let body = OutputBody::Error(ErrorEvent {
                kind: ErrorKind::Engine,
                message: e.to_string(),
            });
            let _ = outputs.send(Output { id, body });
        }
    }
}

async fn forward(
    mut response: ResponseStream,
    tag: String,
    outputs: mpsc::UnboundedSender<Output>,
) -> String {
    while let Some(body) = response.next().await {
        let output = Output {
            id: Some(tag.clone()),
            body,
        };
        if outputs.send(output).is_err() {
            break;
        }
    }
    tag
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::time::timeout;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    use crate::asset::registry::ModelRegistry;
    use crate::config::{CortexStrategy, OrchestratorConfig, RegistryConfig};
    use crate::engine::stub::StubBackend;
    use crate::metrics::Metrics;
    use crate::orchestrator::Orchestrator;
    use crate::protocol::{EngineState, InferenceConfig, InferenceEvent};

    struct Session {
        frames: mpsc::UnboundedSender<String>,
        outputs: mpsc::UnboundedReceiver<Output>,
        metrics: Arc<Metrics>,
    }

    impl Session {
        fn open(token_delay: Duration) -> Self {
            let metrics = Arc::new(Metrics::new().unwrap());
            let orchestrator = Orchestrator::new(
                StubBackend::with_delays(Duration::from_millis(5), token_delay),
                ModelRegistry::new(&RegistryConfig::default()).unwrap(),
                OrchestratorConfig::default(),
                metrics.clone(),
            )
            .with_strategy(CortexStrategy::KeepAlive);
            let (client, _engine) = OrchestratorClient::spawn(orchestrator);

            let (frames, frame_rx) = mpsc::unbounded_channel();
            let (out_tx, outputs) = mpsc::unbounded_channel();
            tokio::spawn(bridge(
                client,
                UnboundedReceiverStream::new(frame_rx),
                out_tx,
            ));
            Self {
                frames,
                outputs,
                metrics,
            }
        }

        fn send(&self, id: Option<&str>, command: Command) {
            let request = Request {
                id: id.map(str::to_string),
                command,
            };
            self.frames
                .send(serde_json::to_string(&request).unwrap())
                .unwrap();
        }

        async fn next(&mut self) -> Output {
            timeout(Duration::from_secs(5), self.outputs.recv())
                .await
                .expect("timed out waiting for output")
                .expect("session closed")
        }

        async fn until_terminal(&mut self, id: &str) -> Vec<Output> {
            self.until_all(&[id]).await
        }

        /// Outputs up to the terminal output of every id in `ids`.
        async fn until_all(&mut self, ids: &[&str]) -> Vec<Output> {
            let mut seen: Vec<Output> = Vec::new();
            let done = |seen: &[Output], id: &str| {
                seen.iter()
                    .any(|o| o.id.as_deref() == Some(id) && o.body.is_terminal())
            };
            while !ids.iter().all(|id| done(&seen, *id)) {
                seen.push(self.next().await);
            }
            seen
        }
    }

    fn infer(prompt: &str) -> Command {
        Command::Infer {
            model: Some("stub".into()),
            prompt: prompt.to_string(),
            config: InferenceConfig::default(),
        }
    }

    fn protocol_error(output: &Output) -> bool {
        matches!(&output.body, OutputBody::Error(e) if e.kind == ErrorKind::Protocol)
    }

    #[tokio::test]
    async fn test_outputs_carry_caller_id() {
        let mut session = Session::open(Duration::from_millis(5));
        session.send(Some("w1"), infer("over the socket"));

        let out = session.until_terminal("w1").await;
        let tagged: Vec<&OutputBody> = out
            .iter()
            .filter(|o| o.id.as_deref() == Some("w1"))
            .map(|o| &o.body)
            .collect();
        assert!(tagged.contains(&&OutputBody::Event(InferenceEvent::Content(
            "Stub reply: over the socket".into()
        ))));
        assert_eq!(
            tagged.last(),
            Some(&&OutputBody::Event(InferenceEvent::Complete))
        );

        // State changes arrive untagged, and the engine settles on Loaded.
        let mut states: Vec<EngineState> = out
            .iter()
            .filter_map(|o| match (&o.id, &o.body) {
                (None, OutputBody::State(s)) => Some(*s),
                _ => None,
            })
            .collect();
        while states.last() != Some(&EngineState::Loaded) {
            let o = session.next().await;
            if let (None, OutputBody::State(s)) = (&o.id, &o.body) {
                states.push(*s);
            }
        }
    }

    #[tokio::test]
    async fn test_untagged_request_gets_generated_id() {
        let mut session = Session::open(Duration::from_millis(5));
        session.send(None, Command::ListModels);

        let out = session.next().await;
        assert!(out.id.is_some());
        assert!(matches!(out.body, OutputBody::Models(_)));
    }

    #[tokio::test]
    async fn test_malformed_frame_and_stop_are_rejected() {
        let mut session = Session::open(Duration::from_millis(5));

        session.frames.send("{ not json".to_string()).unwrap();
        let out = session.next().await;
        assert!(out.id.is_none());
        assert!(protocol_error(&out));

        session.send(Some("halt"), Command::Stop);
        let out = session.next().await;
        assert_eq!(out.id.as_deref(), Some("halt"));
        assert!(protocol_error(&out));

        // The orchestrator is still serving.
        session.send(Some("after"), Command::ListModels);
        let out = session.until_terminal("after").await;
        assert!(matches!(
            out.last().map(|o| &o.body),
            Some(OutputBody::Models(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_uses_caller_ids() {
        let mut session = Session::open(Duration::from_millis(500));
        session.send(Some("long"), infer("take your time"));
        loop {
            let out = session.next().await;
            if out.body == OutputBody::Event(InferenceEvent::ProcessStart) {
                break;
            }
        }

        session.send(
            Some("c"),
            Command::Cancel {
                target: "long".into(),
            },
        );
        let out = session.until_all(&["long", "c"]).await;
        let body = |id: &str| {
            out.iter()
                .rev()
                .find(|o| o.id.as_deref() == Some(id))
                .map(|o| o.body.clone())
        };
        assert!(matches!(
            body("long"),
            Some(OutputBody::Error(e)) if e.message.contains("cancelled")
        ));
        assert_eq!(body("c"), Some(OutputBody::Ack));
    }

    #[tokio::test]
    async fn test_closing_connection_cancels_outstanding_request() {
        let mut session = Session::open(Duration::from_millis(500));
        session.send(Some("orphan"), infer("nobody waits"));
        loop {
            let out = session.next().await;
            if out.body == OutputBody::Event(InferenceEvent::ProcessStart) {
                break;
            }
        }

        let Session { frames, metrics, .. } = session;
        drop(frames);

        timeout(Duration::from_secs(2), async {
            while metrics.cancellations.get() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("outstanding request was not cancelled");
    }
}
