//! The orchestrator: sole owner of one engine backend.
//!
//! - [`client`]: Spawns the loop and demultiplexes its outputs per request
//!
//! A single task drains the command queue, resolves models through an
//! [`AssetAuthority`], drives the backend through its lifecycle and relays
//! every backend event, tagged with the request's correlation id, to the
//! output queue. Requests are served one at a time in arrival order; commands
//! that arrive while a request is in flight wait in a FIFO, except Stop and
//! Cancel which act on the in-flight request immediately.
//!
//! The hibernation deadline is just another branch of the same `select!`, so
//! an idle unload always finishes before the next command is looked at.
//! Cancellations also have an unbounded side channel ([`Canceller`]) that is
//! read even while the command queue is full.

pub mod client;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::asset::registry::ModelRegistry;
use crate::asset::{AssetAuthority, AssetError, AssetProgress};
use crate::config::{CortexStrategy, OrchestratorConfig};
use crate::engine::classifier::is_visible;
use crate::engine::{Backend, EngineBackend, EngineError, EventResult, InferenceStream};
use crate::metrics::Metrics;
use crate::protocol::{
    AssetEvent, Command, EngineState, ErrorEvent, InferenceConfig, InferenceEvent, ModelSpec,
    Output, OutputBody, ProtocolError, Request,
};

/// Why the event loop stopped.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("Stopped on request")]
    Stopped,

    #[error("Command queue closed")]
    InputClosed,

    #[error("Output queue closed")]
    OutputClosed,
}

type Step<T = ()> = Result<T, OrchestratorError>;

enum Work {
    Infer(String),
    Embed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayOutcome {
    Completed,
    Failed,
    Cancelled,
}

enum Wake {
    Command(Request),
    Cancel(String),
    Hibernate,
    Closed,
}

/// What a command arriving mid-request does.
enum Interrupt {
    Stop,
    CancelCurrent,
    CancelQueued(String),
    Queue,
}

enum Relayed {
    Event(Option<EventResult>),
    Command(Option<Request>),
    Cancel(String),
}

/// Cancels requests by correlation id without going through the command
/// queue, so delivery never depends on queue capacity. Only the in-flight
/// request and requests already taken off the command queue are affected.
#[derive(Debug, Clone)]
pub struct Canceller(mpsc::UnboundedSender<String>);

impl Canceller {
    /// Returns false once the orchestrator is gone.
    pub fn cancel(&self, target: impl Into<String>) -> bool {
        self.0.send(target.into()).is_ok()
    }
}

/// Sending half of the output queue.
struct Outbox {
    tx: mpsc::Sender<Output>,
    metrics: Arc<Metrics>,
}

impl Outbox {
    async fn send(&self, id: &Option<String>, body: OutputBody) -> Step {
        self.tx
            .send(Output {
                id: id.clone(),
                body,
            })
            .await
            .map_err(|_| OrchestratorError::OutputClosed)
    }

    async fn error(&self, id: &Option<String>, event: ErrorEvent) -> Step {
        warn!(request = ?id, kind = ?event.kind, message = %event.message, "Request failed");
        self.metrics.record_error(event.kind);
        self.send(id, OutputBody::Error(event)).await
    }
}

pub struct Orchestrator<B = Backend, A = ModelRegistry> {
    backend: B,
    assets: A,
    config: OrchestratorConfig,
    strategy: CortexStrategy,
    metrics: Arc<Metrics>,
    state: EngineState,
    /// Last model that loaded successfully. Cleared by Reset.
    last_model: Option<String>,
    hibernate_at: Option<Instant>,
    pending: VecDeque<Request>,
    inbound_open: bool,
    cancel_tx: mpsc::UnboundedSender<String>,
    cancel_rx: mpsc::UnboundedReceiver<String>,
}

impl<B, A> Orchestrator<B, A>
where
    B: EngineBackend + 'static,
    A: AssetAuthority + 'static,
{
    pub fn new(backend: B, assets: A, config: OrchestratorConfig, metrics: Arc<Metrics>) -> Self {
        let strategy = config.strategy();
        let (cancel_tx, cancel_rx) = mpsc::unbounded_channel();
        Self {
            backend,
            assets,
            config,
            strategy,
            metrics,
            state: EngineState::Unloaded,
            last_model: None,
            hibernate_at: None,
            pending: VecDeque::new(),
            inbound_open: true,
            cancel_tx,
            cancel_rx,
        }
    }

    /// Override the lifecycle policy derived from the config.
    pub fn with_strategy(mut self, strategy: CortexStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Handle for cancelling requests out of band.
    pub fn canceller(&self) -> Canceller {
        Canceller(self.cancel_tx.clone())
    }

    /// Run on a new task with queues of the configured capacity.
    pub fn spawn(self) -> (mpsc::Sender<Request>, mpsc::Receiver<Output>, JoinHandle<()>) {
        let capacity = self.config.queue_capacity.max(1);
        let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let handle = tokio::spawn(self.run(cmd_rx, out_tx));
        (cmd_tx, out_rx, handle)
    }

    /// Serve commands until Stop, until every command sender is gone, or
    /// until nobody reads the outputs. The model is unloaded on the way out.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Request>,
        outputs: mpsc::Sender<Output>,
    ) {
        let out = Outbox {
            tx: outputs,
            metrics: self.metrics.clone(),
        };
        self.metrics.set_state(self.state);
        info!(
            backend = self.backend.name(),
            strategy = %self.strategy,
            "Orchestrator started"
        );

        let reason = loop {
            if let Err(reason) = self.step(&mut commands, &out).await {
                break reason;
            }
        };

        match reason {
            OrchestratorError::Stopped => info!("Orchestrator stopped"),
            OrchestratorError::InputClosed => {
                info!("Command queue closed, shutting down");
                if self.unload(&out).await.is_err() {
                    debug!("Output queue closed during shutdown");
                }
            }
            OrchestratorError::OutputClosed => {
                warn!("Output queue closed, shutting down");
                self.hibernate_at = None;
                if let Err(e) = self.backend.unload().await {
                    warn!(error = %e, "Unload during shutdown failed");
                }
                self.state = EngineState::Unloaded;
                self.metrics.set_state(self.state);
            }
        }
    }

    async fn step(&mut self, commands: &mut mpsc::Receiver<Request>, out: &Outbox) -> Step {
        let request = match self.pending.pop_front() {
            Some(request) => request,
            None => match self.wait(commands).await {
                Wake::Command(request) => request,
                Wake::Cancel(target) => return self.cancel_queued(&target, out).await,
                Wake::Hibernate => return self.hibernate(out).await,
                Wake::Closed => return Err(OrchestratorError::InputClosed),
            },
        };

        self.hibernate_at = None;
        self.handle(request, commands, out).await?;
        self.arm_idle_timer();
        Ok(())
    }

    /// Next command or the hibernation deadline, whichever comes first.
    /// A ready command wins over an expired deadline.
    async fn wait(&mut self, commands: &mut mpsc::Receiver<Request>) -> Wake {
        if !self.inbound_open {
            return Wake::Closed;
        }
        let deadline = self.hibernate_at;
        let idle = sleep_until(deadline.unwrap_or_else(Instant::now));
        let wake = tokio::select! {
            biased;
            cmd = commands.recv() => match cmd {
                Some(request) => Wake::Command(request),
                None => Wake::Closed,
            },
            Some(target) = self.cancel_rx.recv() => Wake::Cancel(target),
            _ = idle, if deadline.is_some() => Wake::Hibernate,
        };
        if matches!(wake, Wake::Closed) {
            self.inbound_open = false;
        }
        wake
    }

    fn arm_idle_timer(&mut self) {
        self.hibernate_at = match self.strategy {
            CortexStrategy::HibernateAfter(idle) if self.state == EngineState::Loaded => {
                Some(Instant::now() + idle)
            }
            _ => None,
        };
    }

    async fn hibernate(&mut self, out: &Outbox) -> Step {
        self.hibernate_at = None;
        if !self.backend.is_loaded() {
            return Ok(());
        }
        info!(
            model = ?self.backend.loaded_model().map(|s| s.id.as_str()),
            strategy = %self.strategy,
            "Idle window elapsed, hibernating"
        );
        self.metrics.hibernations.inc();
        self.unload(out).await
    }

    async fn handle(
        &mut self,
        request: Request,
        commands: &mut mpsc::Receiver<Request>,
        out: &Outbox,
    ) -> Step {
        let Request { id, command } = request;
        self.metrics
            .commands
            .with_label_values(&[command.name()])
            .inc();
        debug!(
            request = ?id,
            command = command.name(),
            state = %self.state,
            "Handling command"
        );

        if let Err(e) = command.validate() {
            return out.error(&id, e.into()).await;
        }

        match command {
            Command::LoadModel(model) => {
                if let Some(spec) = self.ensure_loaded(&id, &model, out).await? {
                    out.send(&id, OutputBody::Loaded(spec)).await?;
                }
                Ok(())
            }
            Command::Infer {
                model,
                prompt,
                config,
            } => {
                self.execute(&id, model, Work::Infer(prompt), config, commands, out)
                    .await
            }
            Command::Embed {
                model,
                input,
                config,
            } => {
                self.execute(&id, model, Work::Embed(input), config, commands, out)
                    .await
            }
            Command::ListModels => match self.assets.list_models().await {
                Ok(names) => out.send(&id, OutputBody::Models(names)).await,
                Err(e) => out.error(&id, e.into()).await,
            },
            Command::Reset => {
                self.unload(out).await?;
                self.last_model = None;
                out.send(&id, OutputBody::Ack).await
            }
            Command::Cancel { target } => {
                self.cancel_queued(&target, out).await?;
                out.send(&id, OutputBody::Ack).await
            }
            Command::Stop => self.stop(&id, commands, out).await,
        }
    }

    /// Model for a request that may not name one.
    fn choose_model(&self, requested: Option<String>) -> Option<String> {
        requested
            .filter(|m| !m.trim().is_empty())
            .or_else(|| self.backend.loaded_model().map(|s| s.id.clone()))
            .or_else(|| self.last_model.clone())
            .or_else(|| self.config.default_model.clone())
    }

    /// Make `model_id` the resident model. Returns None after reporting a
    /// failure to the caller.
    async fn ensure_loaded(
        &mut self,
        id: &Option<String>,
        model_id: &str,
        out: &Outbox,
    ) -> Step<Option<ModelSpec>> {
        if let Some(resident) = self.backend.loaded_model() {
            if resident.id == model_id {
                let spec = resident.clone();
                debug!(model = model_id, "Reusing resident model");
                self.last_model = Some(spec.id.clone());
                return Ok(Some(spec));
            }
        }

        out.send(id, OutputBody::Asset(AssetEvent::Started(model_id.to_string())))
            .await?;
        let limit = self.config.asset_timeout();
        let spec = match lookup(&self.assets, limit, id, model_id, out).await? {
            Ok(spec) => spec,
            Err(e) => {
                self.metrics.load_failures.inc();
                out.send(id, OutputBody::Asset(AssetEvent::Error(e.to_string())))
                    .await?;
                out.error(id, e.into()).await?;
                return Ok(None);
            }
        };
        out.send(
            id,
            OutputBody::Asset(AssetEvent::Complete(spec.path.display().to_string())),
        )
        .await?;

        if self.backend.is_loaded() {
            self.unload(out).await?;
        }
        self.set_state(EngineState::Loading, out).await?;

        info!(
            model = %spec.id,
            path = %spec.path.display(),
            quant = %spec.quantization,
            context = spec.context_size,
            "Loading model"
        );
        let started = std::time::Instant::now();
        match self.backend.load(spec.clone()).await {
            Ok(()) => {
                self.metrics.loads.inc();
                self.last_model = Some(spec.id.clone());
                self.set_state(EngineState::Loaded, out).await?;
                info!(
                    model = %spec.id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Model loaded"
                );
                Ok(Some(spec))
            }
            Err(e) => {
                error!(model = %spec.id, error = %e, "Model load failed");
                self.metrics.load_failures.inc();
                if let Err(e) = self.backend.unload().await {
                    warn!(error = %e, "Cleanup after failed load reported an error");
                }
                self.set_state(EngineState::Unloaded, out).await?;
                out.error(id, e.into()).await?;
                Ok(None)
            }
        }
    }

    async fn execute(
        &mut self,
        id: &Option<String>,
        model: Option<String>,
        work: Work,
        config: InferenceConfig,
        commands: &mut mpsc::Receiver<Request>,
        out: &Outbox,
    ) -> Step {
        let Some(model_id) = self.choose_model(model) else {
            return out.error(id, ProtocolError::NoModel.into()).await;
        };
        if self.ensure_loaded(id, &model_id, out).await?.is_none() {
            return Ok(());
        }

        let started = match &work {
            Work::Infer(prompt) => self.backend.infer(prompt, config.clone()).await,
            Work::Embed(input) => self.backend.embed(input, config.clone()).await,
        };
        let stream = match started {
            Ok(stream) => stream,
            Err(e) => {
                out.error(id, e.into()).await?;
                return self.after_inference(out).await;
            }
        };

        self.set_state(EngineState::Inferring, out).await?;
        self.metrics.inferences.inc();
        let timer = self.metrics.inference_seconds.start_timer();
        let outcome = self
            .relay(id, stream, config.show_thinking, commands, out)
            .await?;
        let elapsed = timer.stop_and_record();
        debug!(
            request = ?id,
            model = %model_id,
            ?outcome,
            elapsed_s = elapsed,
            "Request finished"
        );

        self.after_inference(out).await
    }

    async fn after_inference(&mut self, out: &Outbox) -> Step {
        if self.backend.is_loaded() {
            self.set_state(EngineState::Loaded, out).await?;
        }
        if self.strategy == CortexStrategy::Immediate {
            self.unload(out).await?;
        }
        Ok(())
    }

    /// Forward backend events until the terminal one, taking in commands as
    /// they arrive.
    async fn relay(
        &mut self,
        id: &Option<String>,
        mut stream: InferenceStream,
        show_thinking: bool,
        commands: &mut mpsc::Receiver<Request>,
        out: &Outbox,
    ) -> Step<RelayOutcome> {
        loop {
            let intake =
                self.inbound_open && self.pending.len() < self.config.queue_capacity.max(1);
            let next = tokio::select! {
                biased;
                Some(target) = self.cancel_rx.recv() => Relayed::Cancel(target),
                event = stream.next() => Relayed::Event(event),
                cmd = commands.recv(), if intake => Relayed::Command(cmd),
            };

            match next {
                Relayed::Event(Some(Ok(event))) => {
                    let done = event == InferenceEvent::Complete;
                    if is_visible(&event, show_thinking) {
                        out.send(id, OutputBody::Event(event)).await?;
                    }
                    if done {
                        return Ok(RelayOutcome::Completed);
                    }
                }
                Relayed::Event(Some(Err(e))) => {
                    out.error(id, e.into()).await?;
                    return Ok(RelayOutcome::Failed);
                }
                Relayed::Event(None) => {
                    out.error(id, EngineError::StreamEnded.into()).await?;
                    return Ok(RelayOutcome::Failed);
                }
                Relayed::Cancel(target) if id.as_deref() == Some(target.as_str()) => {
                    self.abort(id, stream, out).await?;
                    return Ok(RelayOutcome::Cancelled);
                }
                Relayed::Cancel(target) => self.cancel_queued(&target, out).await?,
                Relayed::Command(None) => self.inbound_open = false,
                Relayed::Command(Some(request)) => {
                    let interrupt = match &request.command {
                        Command::Stop => Interrupt::Stop,
                        Command::Cancel { target } if id.as_deref() == Some(target.as_str()) => {
                            Interrupt::CancelCurrent
                        }
                        Command::Cancel { target } => Interrupt::CancelQueued(target.clone()),
                        _ => Interrupt::Queue,
                    };

                    match interrupt {
                        Interrupt::Stop => {
                            self.abort(id, stream, out).await?;
                            self.pending.push_front(request);
                            return Ok(RelayOutcome::Cancelled);
                        }
                        Interrupt::CancelCurrent => {
                            self.metrics.commands.with_label_values(&["cancel"]).inc();
                            self.abort(id, stream, out).await?;
                            out.send(&request.id, OutputBody::Ack).await?;
                            return Ok(RelayOutcome::Cancelled);
                        }
                        Interrupt::CancelQueued(target) => {
                            self.metrics.commands.with_label_values(&["cancel"]).inc();
                            self.cancel_queued(&target, out).await?;
                            out.send(&request.id, OutputBody::Ack).await?;
                        }
                        Interrupt::Queue => {
                            debug!(
                                request = ?request.id,
                                queued = self.pending.len() + 1,
                                "Queued behind in-flight request"
                            );
                            self.pending.push_back(request);
                        }
                    }
                }
            }
        }
    }

    async fn abort(&mut self, id: &Option<String>, stream: InferenceStream, out: &Outbox) -> Step {
        info!(request = ?id, "Cancelling in-flight request");
        self.metrics.cancellations.inc();
        stream.cancel(self.config.cancel_grace()).await;
        out.error(id, EngineError::Cancelled.into()).await
    }

    /// Drop a queued request, answering it with a cancellation error.
    async fn cancel_queued(&mut self, target: &str, out: &Outbox) -> Step {
        let position = self
            .pending
            .iter()
            .position(|r| r.id.as_deref() == Some(target));
        match position.and_then(|i| self.pending.remove(i)) {
            Some(request) => {
                info!(request = target, "Cancelled queued request");
                self.metrics.cancellations.inc();
                out.error(&request.id, EngineError::Cancelled.into()).await
            }
            None => {
                debug!(request = target, "Nothing to cancel");
                Ok(())
            }
        }
    }

    async fn stop(
        &mut self,
        id: &Option<String>,
        commands: &mut mpsc::Receiver<Request>,
        out: &Outbox,
    ) -> Step {
        commands.close();
        let mut rejected: Vec<Request> = self.pending.drain(..).collect();
        while let Ok(request) = commands.try_recv() {
            rejected.push(request);
        }
        info!(rejected = rejected.len(), "Stop requested");

        for request in rejected {
            out.error(&request.id, EngineError::Cancelled.into()).await?;
        }
        self.unload(out).await?;
        out.send(id, OutputBody::Ack).await?;
        Err(OrchestratorError::Stopped)
    }

    async fn unload(&mut self, out: &Outbox) -> Step {
        self.hibernate_at = None;
        if self.backend.is_loaded() {
            if let Some(spec) = self.backend.loaded_model() {
                info!(model = %spec.id, "Unloading model");
            }
            if let Err(e) = self.backend.unload().await {
                warn!(error = %e, "Unload reported an error");
            }
        }
        self.set_state(EngineState::Unloaded, out).await
    }

    async fn set_state(&mut self, state: EngineState, out: &Outbox) -> Step {
        if self.state == state {
            return Ok(());
        }
        debug!(from = %self.state, to = %state, "Engine state");
        self.state = state;
        self.metrics.set_state(state);
        out.send(&None, OutputBody::State(state)).await
    }
}

/// Ask the asset authority for `model_id`, forwarding its progress reports
/// as they come.
async fn lookup<A: AssetAuthority>(
    assets: &A,
    limit: Duration,
    id: &Option<String>,
    model_id: &str,
    out: &Outbox,
) -> Step<Result<ModelSpec, AssetError>> {
    let (progress, mut reports) = AssetProgress::channel();
    let resolve = timeout(limit, assets.ensure_model(model_id, progress));
    tokio::pin!(resolve);

    let resolved = loop {
        tokio::select! {
            biased;
            Some((done, total)) = reports.recv() => {
                let event = AssetEvent::Progress(done, total);
                out.send(id, OutputBody::Asset(event)).await?;
            }
            result = &mut resolve => {
                break result.unwrap_or_else(|_| Err(AssetError::Timeout(model_id.to_string())));
            }
        }
    };
    while let Ok((done, total)) = reports.try_recv() {
        out.send(id, OutputBody::Asset(AssetEvent::Progress(done, total)))
            .await?;
    }
    Ok(resolved)
}
