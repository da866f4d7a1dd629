//! Tests for the multi-caller client over a running orchestrator.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use cortex_stem::asset::registry::ModelRegistry;
use cortex_stem::config::{CortexStrategy, OrchestratorConfig, RegistryConfig};
use cortex_stem::engine::stub::StubBackend;
use cortex_stem::metrics::Metrics;
use cortex_stem::orchestrator::client::{ClientError, OrchestratorClient};
use cortex_stem::orchestrator::Orchestrator;
use cortex_stem::protocol::{
    AssetEvent, Command, EngineState, ErrorKind, InferenceConfig, InferenceEvent, OutputBody,
};

type Started = (OrchestratorClient, tokio::task::JoinHandle<()>, Arc<Metrics>);

fn start(token_delay: Duration) -> Started {
    start_with(token_delay, OrchestratorConfig::default())
}

fn start_with(token_delay: Duration, config: OrchestratorConfig) -> Started {
    let metrics = Arc::new(Metrics::new().unwrap());
    let orchestrator = Orchestrator::new(
        StubBackend::with_delays(Duration::from_millis(5), token_delay),
        ModelRegistry::new(&RegistryConfig::default()).unwrap(),
        config,
        metrics.clone(),
    )
    .with_strategy(CortexStrategy::KeepAlive);
    let (client, engine) = OrchestratorClient::spawn(orchestrator);
    (client, engine, metrics)
}

fn infer(prompt: &str) -> Command {
    Command::Infer {
        model: Some("stub".into()),
        prompt: prompt.to_string(),
        config: InferenceConfig::default(),
    }
}

fn content(bodies: &[OutputBody]) -> String {
    bodies
        .iter()
        .filter_map(|b| match b {
            OutputBody::Event(InferenceEvent::Content(text)) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_concurrent_callers_get_their_own_outputs() {
    let (client, _engine, _) = start(Duration::from_millis(5));

    let mut tasks = Vec::new();
    for i in 0..4 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let prompt = format!("caller {i}");
            let bodies = client.submit(infer(&prompt)).await.unwrap().collect().await;
            (prompt, bodies)
        }));
    }

    for task in tasks {
        let (prompt, bodies) = task.await.unwrap();
        assert_eq!(content(&bodies), format!("Stub reply: {prompt}"));
        assert_eq!(bodies.last(), Some(&OutputBody::Event(InferenceEvent::Complete)));
        assert!(bodies.iter().all(|b| !matches!(b, OutputBody::State(_))));
    }
}

#[tokio::test]
async fn test_load_model_and_state_watch() {
    let (client, _engine, _) = start(Duration::from_millis(5));
    assert_eq!(client.state(), EngineState::Unloaded);

    let mut watch = client.subscribe_state();
    let spec = client.load_model("stub").await.unwrap();
    assert_eq!(spec.id, "stub");

    timeout(
        Duration::from_secs(2),
        watch.wait_for(|s| *s == EngineState::Loaded),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(client.state(), EngineState::Loaded);

    client.reset().await.unwrap();
    timeout(
        Duration::from_secs(2),
        watch.wait_for(|s| *s == EngineState::Unloaded),
    )
    .await
    .unwrap()
    .unwrap();
}

#[tokio::test]
async fn test_failures_surface_as_typed_errors() {
    let (client, _engine, _) = start(Duration::from_millis(5));

    let err = client.load_model("no-such-model").await.unwrap_err();
    match err {
        ClientError::Failed(e) => assert_eq!(e.kind, ErrorKind::Asset),
        other => panic!("expected asset failure, got {other:?}"),
    }

    let response = client
        .submit(Command::Infer {
            model: None,
            prompt: "hi".into(),
            config: InferenceConfig::default(),
        })
        .await
        .unwrap();
    match response.terminal().await {
        Err(ClientError::Failed(e)) => assert_eq!(e.kind, ErrorKind::Protocol),
        other => panic!("expected protocol failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_list_models() {
    let (client, _engine, _) = start(Duration::from_millis(5));
    let names = client.list_models().await.unwrap();
    assert!(names.contains(&"stub".to_string()));
}

#[tokio::test]
async fn test_explicit_cancel() {
    let (client, _engine, _) = start(Duration::from_millis(500));

    let mut response = client.submit(infer("long")).await.unwrap();
    let id = response.id().to_string();
    loop {
        match response.next().await {
            Some(OutputBody::Event(InferenceEvent::ProcessStart)) => break,
            Some(_) => continue,
            None => panic!("response ended before ProcessStart"),
        }
    }

    client.cancel(&id).await.unwrap();
    match response.terminal().await {
        Err(ClientError::Failed(e)) => {
            assert_eq!(e.kind, ErrorKind::Engine);
            assert!(e.message.contains("cancelled"));
        }
        other => panic!("expected cancellation, got {other:?}"),
    }
}

#[tokio::test]
async fn test_dropped_response_cancels_request() {
    let (client, _engine, metrics) = start(Duration::from_millis(500));

    let mut response = client.submit(infer("abandoned")).await.unwrap();
    assert_eq!(
        response.next().await,
        Some(OutputBody::Asset(AssetEvent::Started("stub".into())))
    );
    drop(response);

    let bodies = timeout(
        Duration::from_secs(3),
        client.submit(infer("next")).await.unwrap().collect(),
    )
    .await
    .unwrap();
    assert_eq!(content(&bodies), "Stub reply: next");
    assert_eq!(metrics.cancellations.get(), 1);
}

#[tokio::test]
async fn test_dropped_response_cancels_with_full_queue() {
    let config = OrchestratorConfig {
        queue_capacity: 1,
        ..Default::default()
    };
    let (client, _engine, metrics) = start_with(Duration::from_millis(300), config);

    let mut abandoned = client.submit(infer("x")).await.unwrap();
    loop {
        match abandoned.next().await {
            Some(OutputBody::Event(InferenceEvent::ProcessStart)) => break,
            Some(_) => continue,
            None => panic!("response ended before ProcessStart"),
        }
    }
    drop(abandoned);

    // One request waits in the orchestrator's FIFO, the other fills the channel.
    let y = client.submit(infer("y")).await.unwrap();
    let z = timeout(Duration::from_secs(2), client.submit(infer("z")))
        .await
        .unwrap()
        .unwrap();

    let y_bodies = timeout(Duration::from_secs(3), y.collect()).await.unwrap();
    assert_eq!(content(&y_bodies), "Stub reply: y");
    assert_eq!(metrics.cancellations.get(), 1);

    let z_bodies = timeout(Duration::from_secs(3), z.collect()).await.unwrap();
    assert_eq!(content(&z_bodies), "Stub reply: z");
    assert_eq!(metrics.cancellations.get(), 1);
}

#[tokio::test]
async fn test_response_dropped_while_queued_is_cancelled() {
    let (client, _engine, metrics) = start(Duration::from_millis(200));

    let running = client.submit(infer("first")).await.unwrap();
    drop(client.submit(infer("never read")).await.unwrap());

    let bodies = timeout(Duration::from_secs(3), running.collect()).await.unwrap();
    assert_eq!(content(&bodies), "Stub reply: first");

    timeout(Duration::from_secs(2), async {
        while metrics.cancellations.get() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("dropped request was not cancelled");

    // Only the dropped request was cancelled, and the engine is free again.
    let third = client.submit(infer("third")).await.unwrap();
    let bodies = timeout(Duration::from_secs(3), third.collect()).await.unwrap();
    assert_eq!(content(&bodies), "Stub reply: third");
    assert_eq!(metrics.cancellations.get(), 1);
}

#[tokio::test]
async fn test_shutdown_stops_orchestrator() {
    let (client, engine, _) = start(Duration::from_millis(5));
    client.load_model("stub").await.unwrap();

    client.shutdown().await.unwrap();
    timeout(Duration::from_secs(2), engine).await.unwrap().unwrap();

    assert!(matches!(
        client.submit(Command::ListModels).await,
        Err(ClientError::Closed)
    ));
}
