use anyhow::{bail, Context};
use clap::Parser;
use pulse_client::{ActivityView, ClientConfig, ClientHandle, DEFAULT_HUB_URL};
use pulse_core::{EventType, WireEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "pulse-tail", about = "Follows a pulse hub event stream")]
struct Args {
    #[arg(long, default_value = "")]
    url: String,
    /// Print raw event frames instead of one summary line per event.
    #[arg(long, default_value_t = false)]
    json: bool,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);
    if let Err(err) = run(args).await {
        error!(event = "tail_error", error = %format!("{err:#}"));
        std::process::exit(1);
    }
}

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(args: Args) -> anyhow::Result<()> {
    let url = resolve_url(&args.url)?;
    let client = ClientHandle::spawn(ClientConfig::new(url.as_str()));
    let mut events = client.subscribe();
    let mut status = client.status();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                info!(event = "connection_status", status = %current);
            }
            received = events.recv() => match received {
                Ok(event) => print_event(&event, args.json),
                Err(RecvError::Lagged(skipped)) => warn!(event = "events_skipped", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    }

    let view = client.view().borrow().clone();
    client.shutdown().await;
    if !args.json {
        print_view(&view);
    }
    Ok(())
}

fn resolve_url(flag: &str) -> anyhow::Result<Url> {
    let raw = if !flag.trim().is_empty() {
        flag.trim().to_string()
    } else {
        std::env::var("PULSE_HUB_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_HUB_URL.to_string())
    };
    let url = Url::parse(&raw).with_context(|| format!("invalid hub url {raw}"))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        bail!("hub url must use ws:// or wss://, got {raw}");
    }
    Ok(url)
}

fn print_event(event: &WireEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(err) => warn!(event = "print_failed", error = %err),
        }
        return;
    }
    println!(
        "{} {:<16} {:<15} {}",
        event.timestamp,
        event.agent_id,
        event.event_type.as_str(),
        summarize(event)
    );
}

fn summarize(event: &WireEvent) -> String {
    match event.event_type {
        EventType::AgentStarted => format!(
            "status={} model={}",
            event.payload_str("status").unwrap_or("active"),
            event.payload_str("model").unwrap_or("unknown")
        ),
        EventType::AgentEnded => "ended".to_string(),
        EventType::ToolCalled => event.payload_str("tool").unwrap_or_default().to_string(),
        EventType::ModelSwitched => format!(
            "{} -> {}",
            event.payload_str("previousModel").unwrap_or("?"),
            event.payload_str("model").unwrap_or("?")
        ),
        EventType::TokenUpdate => format!(
            "total={} delta={}",
            event.payload_u64("total").unwrap_or(0),
            event.payload.get("delta").and_then(|v| v.as_i64()).unwrap_or(0)
        ),
        EventType::Heartbeat => format!(
            "{} clients={}",
            event.payload_str("kind").unwrap_or("heartbeat"),
            event.payload_u64("clients").unwrap_or(0)
        ),
    }
}

fn print_view(view: &ActivityView) {
    if view.is_empty() {
        return;
    }
    println!();
    for agent in view.agents() {
        println!(
            "{:<16} {:<7} {:<20} tokens={:<10} tools={}",
            agent.agent_id,
            agent.status.as_str(),
            agent.model,
            agent.tokens.total(),
            agent.tools.iter().cloned().collect::<Vec<_>>().join(",")
        );
    }
}
