use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncBufReadExt;

use botherd::config::OrchestratorConfig;
use botherd::gateway::{InProcessGateway, MessageGateway};
use botherd::handler::{EchoHandler, HandlerRegistry};
use botherd::orchestrator::Orchestrator;
use botherd::scheduler::{ScheduleDraft, ScheduleSpec};
use botherd::store::{MemoryStore, Store};
use botherd::types::{Assignment, ChannelId};

/// Demo binary: an in-process channel fed from stdin, two echo bots
/// assigned to it, and the full orchestration engine in between.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; BOTHERD_LOG_DIR switches to a rolling file log.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _file_guard = match std::env::var("BOTHERD_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "botherd.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
            None
        }
    };

    let config = OrchestratorConfig::from_env();
    let channel = ChannelId::from(
        std::env::var("BOTHERD_DEMO_CHANNEL")
            .unwrap_or_else(|_| "demo".to_string())
            .as_str(),
    );

    eprintln!("🤖 botherd v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Channel: {}", channel);
    eprintln!(
        "   Poll interval: {:?}, scheduler tick: {:?}",
        config.worker.poll_interval, config.scheduler.tick_interval
    );
    eprintln!("   Type a message and press Enter. /quit to exit.\n");

    // Demo topology: one bot echoing everything, one gated on "!b".
    let store = Arc::new(MemoryStore::new());
    let echo_all = Assignment::new("echo-a", channel.as_str(), "echo").with_priority(1);
    let echo_gated = Assignment::new("echo-b", channel.as_str(), "echo")
        .with_priority(2)
        .with_config(serde_json::json!({"prefix": "!b"}));
    for assignment in [echo_all, echo_gated] {
        store.save_running_state(assignment.id, true).await?;
        store.insert_assignment(assignment).await;
    }

    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(EchoHandler));
    let registry = Arc::new(registry);

    let gateway = Arc::new(InProcessGateway::new());

    let (orchestrator, started) = Orchestrator::start(
        store.clone(),
        gateway.clone(),
        registry,
        config,
    )
    .await?;
    eprintln!("   Workers: {} reconciled\n", started.len());

    // Optional recurring demo schedule, e.g. BOTHERD_DEMO_CRON="*/1 * * * *".
    if let Ok(expr) = std::env::var("BOTHERD_DEMO_CRON") {
        let spec = ScheduleSpec::recurring(&expr, "UTC")?;
        let id = orchestrator
            .scheduler()
            .create(ScheduleDraft {
                channel: channel.clone(),
                message: "scheduled check-in".to_string(),
                spec,
            })
            .await?;
        eprintln!("   Demo schedule {id} created ({expr})\n");
    }

    // Print bot and scheduler traffic as it lands in the channel.
    let printer_gateway = gateway.clone();
    let printer_channel = channel.clone();
    let printer = tokio::spawn(async move {
        let mut seen = 0u64;
        loop {
            tokio::time::sleep(Duration::from_millis(300)).await;
            match printer_gateway.fetch(&printer_channel, Some(seen)).await {
                Ok(messages) => {
                    for message in messages {
                        seen = seen.max(message.id);
                        if message.is_bot_originated() {
                            let tag = message.sender_tag.as_deref().unwrap_or("bot");
                            println!("[{tag}] {}", message.content);
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "printer fetch failed"),
            }
        }
    });

    // Operator input loop; Ctrl-C or /quit shuts down cleanly.
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if line == "/quit" {
                        break;
                    }
                    gateway.inject(&channel, line, Some("operator")).await;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "stdin read failed");
                    break;
                }
            }
        }
    }

    printer.abort();
    orchestrator.shutdown().await;
    Ok(())
}
