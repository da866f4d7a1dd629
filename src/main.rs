//! cortex-stem binary: HTTP server and command-line front ends.

use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tracing::{info, warn};

use cortex_stem::asset::registry::ModelRegistry;
use cortex_stem::config::{Cli, CliCommand, Config};
use cortex_stem::engine::{Backend, EngineBackend};
use cortex_stem::metrics::Metrics;
use cortex_stem::orchestrator::client::OrchestratorClient;
use cortex_stem::orchestrator::Orchestrator;
use cortex_stem::protocol::{Command, InferenceConfig, InferenceEvent, OutputBody, ThoughtEvent};
use cortex_stem::server::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "cortex_stem=debug,tower_http=debug"
    } else {
        "cortex_stem=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    info!("cortex-stem v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Arc::new(Config::load(&cli.config)?);
    let metrics = Arc::new(Metrics::new().context("registering metrics")?);

    let registry = ModelRegistry::new(&config.registry)?;
    let backend = Backend::from_config(&config.engine)?;
    info!(
        backend = backend.name(),
        strategy = %config.orchestrator.strategy(),
        models_dir = %registry.models_dir().display(),
        "Configuration loaded"
    );

    let orchestrator = Orchestrator::new(
        backend,
        registry,
        config.orchestrator.clone(),
        metrics.clone(),
    );
    let (client, engine) = OrchestratorClient::spawn(orchestrator);

    let result = match cli.command {
        CliCommand::Serve { listen, model } => {
            serve(client.clone(), config.clone(), metrics, listen, model).await
        }
        CliCommand::Chat {
            model,
            show_thinking,
        } => chat(&client, &config, model, show_thinking).await,
        CliCommand::Infer {
            prompt,
            model,
            max_tokens,
            temperature,
            show_thinking,
        } => {
            let mut request = config.inference.clone();
            request.max_tokens = max_tokens.unwrap_or(request.max_tokens);
            request.temperature = temperature.unwrap_or(request.temperature);
            request.show_thinking = show_thinking || request.show_thinking;
            run_prompt(&client, model, prompt, request).await
        }
        CliCommand::Embed { input, model } => embed(&client, &config, model, input).await,
        CliCommand::Models => {
            for name in client.list_models().await? {
                println!("{name}");
            }
            Ok(())
        }
    };

    if let Err(e) = client.shutdown().await {
        warn!(error = %e, "Orchestrator did not acknowledge shutdown");
    }
    drop(client);
    engine.await.context("orchestrator task failed")?;

    result
}

async fn serve(
    client: OrchestratorClient,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
    listen: Option<String>,
    preload: Option<String>,
) -> anyhow::Result<()> {
    if let Some(model) = preload.or_else(|| config.orchestrator.default_model.clone()) {
        let spec = client.load_model(&model).await?;
        info!(model = %spec.id, quant = %spec.quantization, "Preloaded model");
    }

    // Build application state.
    let state = Arc::new(AppState {
        client,
        config: config.clone(),
        metrics,
        start_time: Instant::now(),
    });

    // Build the HTTP router.
    let app = build_router(state);

    // Start the server.
    let listen_addr = listen.unwrap_or_else(|| config.server.listen.clone());
    info!(addr = %listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Could not listen for ctrl-c");
            }
            info!("Shutting down");
        })
        .await?;

    Ok(())
}

/// Stream one prompt's answer to stdout. Reasoning goes to stderr.
async fn run_prompt(
    client: &OrchestratorClient,
    model: Option<String>,
    prompt: String,
    config: InferenceConfig,
) -> anyhow::Result<()> {
    let mut response = client
        .submit(Command::Infer {
            model,
            prompt,
            config,
        })
        .await?;

    let mut stdout = std::io::stdout();
    while let Some(body) = response.next().await {
        match body {
            OutputBody::Event(InferenceEvent::Content(text)) => {
                print!("{text}");
                stdout.flush()?;
            }
            OutputBody::Event(InferenceEvent::Thought(thought)) => match thought {
                ThoughtEvent::Start => eprint!("[thinking] "),
                ThoughtEvent::Delta(text) => eprint!("{text}"),
                ThoughtEvent::Stop => eprintln!(),
            },
            OutputBody::Event(InferenceEvent::Complete) => {
                println!();
                return Ok(());
            }
            OutputBody::Error(e) => anyhow::bail!("{:?} error: {}", e.kind, e.message),
            _ => {}
        }
    }
    anyhow::bail!("response ended early")
}

async fn chat(
    client: &OrchestratorClient,
    config: &Config,
    model: Option<String>,
    show_thinking: bool,
) -> anyhow::Result<()> {
    let mut request = config.inference.clone();
    request.show_thinking = show_thinking || request.show_thinking;

    eprintln!("Type a prompt, or an empty line to quit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("> ");
        std::io::stderr().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let prompt = line.trim();
        if prompt.is_empty() {
            break;
        }
        let answered = run_prompt(client, model.clone(), prompt.to_string(), request.clone()).await;
        if let Err(e) = answered {
            eprintln!("error: {e}");
        }
    }
    Ok(())
}

async fn embed(
    client: &OrchestratorClient,
    config: &Config,
    model: Option<String>,
    input: String,
) -> anyhow::Result<()> {
    let mut response = client
        .submit(Command::Embed {
            model,
            input,
            config: config.inference.clone(),
        })
        .await?;

    while let Some(body) = response.next().await {
        match body {
            OutputBody::Event(InferenceEvent::Embedding(vector)) => {
                let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
                let head: Vec<String> = vector.iter().take(8).map(|v| format!("{v:.4}")).collect();
                println!("dim={} norm={norm:.4} [{} ...]", vector.len(), head.join(", "));
            }
            OutputBody::Event(InferenceEvent::Complete) => return Ok(()),
            OutputBody::Error(e) => anyhow::bail!("{:?} error: {}", e.kind, e.message),
            _ => {}
        }
    }
    anyhow::bail!("response ended early")
}
