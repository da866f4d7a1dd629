//! Multi-caller handle on a running orchestrator.
//!
//! The orchestrator speaks one command queue and one output queue. The client
//! gives every submitted command a fresh correlation id and a private response
//! channel, and a router task fans outputs back out by id. State transitions
//! are published on a `watch` channel. A caller that drops its response
//! before the terminal output gets its request cancelled.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::Stream;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::asset::AssetAuthority;
use crate::engine::EngineBackend;
use crate::orchestrator::{Canceller, Orchestrator};
use crate::protocol::{Command, EngineState, ErrorEvent, ModelSpec, Output, OutputBody, Request};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("Orchestrator is not running")]
    Closed,

    #[error("Response ended without a terminal output")]
    Incomplete,

    #[error("{:?} error: {}", .0.kind, .0.message)]
    Failed(ErrorEvent),

    #[error("Unexpected reply: {0}")]
    Unexpected(String),
}

type Routes = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<OutputBody>>>>;

fn lock(routes: &Routes) -> MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<OutputBody>>> {
    routes.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cloneable handle for submitting commands.
#[derive(Clone)]
pub struct OrchestratorClient {
    commands: mpsc::Sender<Request>,
    canceller: Canceller,
    routes: Routes,
    state: watch::Receiver<EngineState>,
}

impl OrchestratorClient {
    /// Start `orchestrator` and its output router. The returned handle
    /// resolves once the orchestrator has exited.
    pub fn spawn<B, A>(orchestrator: Orchestrator<B, A>) -> (Self, JoinHandle<()>)
    where
        B: EngineBackend + 'static,
        A: AssetAuthority + 'static,
    {
        let (state_tx, state_rx) = watch::channel(orchestrator.state());
        let canceller = orchestrator.canceller();
        let (commands, outputs, engine) = orchestrator.spawn();
        let routes = Routes::default();

        tokio::spawn(route_outputs(
            outputs,
            routes.clone(),
            state_tx,
            canceller.clone(),
        ));

        (
            Self {
                commands,
                canceller,
                routes,
                state: state_rx,
            },
            engine,
        )
    }

    /// Submit a command and get its response stream.
    pub async fn submit(&self, command: Command) -> Result<ResponseStream, ClientError> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.routes).insert(id.clone(), tx);

        debug!(request = %id, command = command.name(), "Submitting");
        if self
            .commands
            .send(Request::with_id(id.clone(), command))
            .await
            .is_err()
        {
            lock(&self.routes).remove(&id);
            return Err(ClientError::Closed);
        }

        Ok(ResponseStream {
            id,
            rx,
            routes: self.routes.clone(),
            canceller: self.canceller.clone(),
            finished: false,
        })
    }

    pub async fn load_model(&self, model: &str) -> Result<ModelSpec, ClientError> {
        match self
            .submit(Command::LoadModel(model.to_string()))
            .await?
            .terminal()
            .await?
        {
            OutputBody::Loaded(spec) => Ok(spec),
            other => Err(ClientError::Unexpected(format!("{other:?}"))),
        }
    }

    pub async fn list_models(&self) -> Result<Vec<String>, ClientError> {
        match self.submit(Command::ListModels).await?.terminal().await? {
            OutputBody::Models(names) => Ok(names),
            other => Err(ClientError::Unexpected(format!("{other:?}"))),
        }
    }

    /// Cancel a request by its correlation id.
    pub async fn cancel(&self, target: &str) -> Result<(), ClientError> {
        self.acked(Command::Cancel {
            target: target.to_string(),
        })
        .await
    }

    pub async fn reset(&self) -> Result<(), ClientError> {
        self.acked(Command::Reset).await
    }

    /// Stop the orchestrator. Queued requests are rejected.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.acked(Command::Stop).await
    }

    async fn acked(&self, command: Command) -> Result<(), ClientError> {
        match self.submit(command).await?.terminal().await? {
            OutputBody::Ack => Ok(()),
            other => Err(ClientError::Unexpected(format!("{other:?}"))),
        }
    }

    /// Last published engine state.
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.state.clone()
    }
}

/// Outputs for one request, ending after its terminal output. Dropping it
/// earlier cancels the request.
pub struct ResponseStream {
    id: String,
    rx: mpsc::UnboundedReceiver<OutputBody>,
    routes: Routes,
    canceller: Canceller,
    finished: bool,
}

impl ResponseStream {
    /// Correlation id of the request.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn next(&mut self) -> Option<OutputBody> {
        std::future::poll_fn(|cx| self.poll_body(cx)).await
    }

    fn poll_body(&mut self, cx: &mut Context<'_>) -> Poll<Option<OutputBody>> {
        let polled = self.rx.poll_recv(cx);
        match &polled {
            Poll::Ready(Some(body)) if body.is_terminal() => self.finished = true,
            Poll::Ready(None) => self.finished = true,
            _ => {}
        }
        polled
    }

    /// Every output up to and including the terminal one.
    pub async fn collect(mut self) -> Vec<OutputBody> {
        let mut bodies = Vec::new();
        while let Some(body) = self.next().await {
            bodies.push(body);
        }
        bodies
    }

    /// Skip to the terminal output. Error outputs become `ClientError::Failed`.
    pub async fn terminal(mut self) -> Result<OutputBody, ClientError> {
        while let Some(body) = self.next().await {
            if body.is_terminal() {
                return match body {
                    OutputBody::Error(e) => Err(ClientError::Failed(e)),
                    other => Ok(other),
                };
            }
        }
        Err(ClientError::Incomplete)
    }
}

impl Stream for ResponseStream {
    type Item = OutputBody;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<OutputBody>> {
        self.get_mut().poll_body(cx)
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        lock(&self.routes).remove(&self.id);
        if !self.finished {
            debug!(request = %self.id, "Response dropped early, cancelling request");
            if !self.canceller.cancel(self.id.clone()) {
                debug!("Orchestrator gone before cancellation");
            }
        }
    }
}

async fn route_outputs(
    mut outputs: mpsc::Receiver<Output>,
    routes: Routes,
    state: watch::Sender<EngineState>,
    canceller: Canceller,
) {
    while let Some(Output { id, body }) = outputs.recv().await {
        let Some(id) = id else {
            match body {
                OutputBody::State(s) => {
                    state.send_replace(s);
                }
                other => debug!(body = ?other, "Uncorrelated output"),
            }
            continue;
        };

        let terminal = body.is_terminal();
        let mut table = lock(&routes);
        let Some(tx) = table.get(&id) else {
            // Dropped before the orchestrator took it off the command queue.
            if !terminal {
                debug!(request = %id, "No listener for output, cancelling request");
                canceller.cancel(id);
            }
            continue;
        };
        if tx.send(body).is_err() || terminal {
            table.remove(&id);
        }
    }

    lock(&routes).clear();
    debug!("Output router finished");
}
