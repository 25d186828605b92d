use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use relay_core::InMemorySessionStore;
use relay_core::Orchestrator;
use relay_core::TurnRequest;
use relay_core::TurnSettings;
use relay_core::sink::EventSink;
use relay_protocol::TurnEvent;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Run one turn of an external coding agent and stream its response.
#[derive(Parser, Debug)]
#[command(name = "relay", version, about)]
struct Cli {
    /// Provider tag: claude, gemini or codex.
    #[arg(long, short = 'p')]
    provider: String,

    /// Continue an existing session instead of starting a new one.
    #[arg(long)]
    session: Option<String>,

    /// Model override; the provider default applies when omitted.
    #[arg(long, short = 'm')]
    model: Option<String>,

    /// Working directory for the agent process.
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Run the agent with permission prompts disabled.
    #[arg(long)]
    skip_permissions: bool,

    /// Additional allowed tool (repeatable).
    #[arg(long = "allow-tool")]
    allow_tools: Vec<String>,

    /// Image file to attach (repeatable).
    #[arg(long = "image")]
    images: Vec<PathBuf>,

    /// Emit events as NDJSON instead of plain text.
    #[arg(long)]
    json: bool,

    /// The prompt to send.
    prompt: String,
}

/// Streams response content to stdout and everything else to stderr.
struct PrintSink;

impl EventSink for PrintSink {
    fn deliver(&self, event: TurnEvent) {
        match event {
            TurnEvent::SessionCreated { session_id } => {
                eprintln!("session: {session_id}");
            }
            TurnEvent::Response { content, is_final } => {
                print!("{content}");
                if is_final {
                    println!();
                }
                let _ = std::io::stdout().flush();
            }
            TurnEvent::Error { message } => {
                eprintln!("error: {message}");
            }
            TurnEvent::Complete { exit_code, .. } => {
                if exit_code != 0 {
                    eprintln!("agent exited with code {exit_code}");
                }
            }
        }
    }
}

struct JsonSink;

impl EventSink for JsonSink {
    fn deliver(&self, event: TurnEvent) {
        if let Ok(line) = serde_json::to_string(&event) {
            println!("{line}");
            let _ = std::io::stdout().flush();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RELAY_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut images = Vec::new();
    for path in &cli.images {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read image {}", path.display()))?;
        images.push(base64_encode(&bytes));
    }

    let store = Arc::new(InMemorySessionStore::new());
    let orchestrator = Arc::new(Orchestrator::new(store));
    let sink: Arc<dyn EventSink> = if cli.json {
        Arc::new(JsonSink)
    } else {
        Arc::new(PrintSink)
    };

    let request = TurnRequest {
        provider: cli.provider,
        session_id: cli.session,
        prompt: cli.prompt,
        images,
        cwd: cli.cwd,
        settings: TurnSettings {
            model: cli.model,
            skip_permissions: cli.skip_permissions,
            allowed_tools: cli.allow_tools,
        },
    };

    let runner = Arc::clone(&orchestrator);
    let mut turn = tokio::spawn(async move { runner.run_turn(request, sink).await });

    let result = tokio::select! {
        result = &mut turn => result.context("turn task panicked")?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, aborting turn");
            for key in orchestrator.registry().keys() {
                orchestrator.abort(&key);
            }
            turn.await.context("turn task panicked")?
        }
    };

    match result {
        Ok(()) => Ok(()),
        Err(err) => {
            std::process::exit(err.synthetic_exit_code().clamp(1, 255));
        }
    }
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
