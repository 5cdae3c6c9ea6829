//! Ingest command implementation.

use crate::server::{start_server, ServerState};
use anyhow::{Context, Result};
use std::sync::Arc;
use ticksink_core::config::FlushMode;
use ticksink_core::store::open_factory;
use ticksink_core::{CompositeRecord, Config, PersistenceEngine, SessionId, SessionStart};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Counts from reading the input stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestCounts {
    pub lines: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub malformed: u64,
}

/// Record one session from JSON-lines input, then finalize it.
pub async fn run(
    config: Config,
    input: String,
    player: Option<String>,
    activity: Option<String>,
) -> Result<()> {
    let health_port = config.monitoring.health_port;
    let metrics_port = config.monitoring.metrics_port;
    let inline = config.engine.flush_mode == FlushMode::Inline;

    info!(
        input = %input,
        store = ?config.store.backend,
        flush_mode = ?config.engine.flush_mode,
        "Starting ingest"
    );

    let factory = open_factory(&config.store);
    let engine = tokio::task::spawn_blocking(move || PersistenceEngine::start(config, factory))
        .await
        .context("engine startup task failed")??;
    let engine = Arc::new(engine);

    let start = SessionStart {
        player_name: player,
        activity_type: activity,
    };
    let session = {
        let engine = Arc::clone(&engine);
        tokio::task::spawn_blocking(move || engine.begin_session_with(start))
            .await
            .context("session start task failed")??
    };

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_state = Arc::new(ServerState {
        engine: Arc::clone(&engine),
    });
    tokio::spawn(start_server(
        server_state,
        health_port,
        metrics_port,
        shutdown_tx.subscribe(),
    ));

    let read = async {
        if input == "-" {
            read_records(BufReader::new(tokio::io::stdin()), &engine, session, inline).await
        } else {
            let file = tokio::fs::File::open(&input)
                .await
                .with_context(|| format!("Failed to open input '{}'", input))?;
            read_records(BufReader::new(file), &engine, session, inline).await
        }
    };

    let mut interrupted = false;
    let counts = tokio::select! {
        counts = read => Some(counts?),
        _ = shutdown_signal() => {
            interrupted = true;
            None
        }
    };

    let report = {
        let engine = Arc::clone(&engine);
        tokio::task::spawn_blocking(move || {
            let finalized = engine.finalize_session(session);
            let shutdown = engine.shutdown();
            (finalized, shutdown, engine.metrics_summary())
        })
        .await
        .context("finalize task failed")?
    };
    let _ = shutdown_tx.send(());

    let (finalized, shutdown, summary) = report;
    let finalized = finalized?;

    if let Some(counts) = counts {
        println!("Input lines:      {}", counts.lines);
        println!("Accepted:         {}", counts.accepted);
        println!("Rejected:         {}", counts.rejected);
        println!("Malformed:        {}", counts.malformed);
    }
    println!("Session:          {}", finalized.session_id);
    println!("Total recorded:   {}", finalized.total_recorded);
    println!("Drained:          {}", finalized.drained);
    if finalized.dropped_on_timeout > 0 || shutdown.dropped > 0 {
        println!(
            "Dropped:          {}",
            finalized.dropped_on_timeout + shutdown.dropped
        );
    }
    println!("{}", summary);

    if interrupted {
        return Err(ticksink_core::Error::Shutdown.into());
    }
    Ok(())
}

/// Feed each JSON line to the engine until end of input.
///
/// Records without a session id are stamped with the active one.
async fn read_records<R>(
    reader: R,
    engine: &PersistenceEngine,
    session: SessionId,
    inline: bool,
) -> Result<IngestCounts>
where
    R: AsyncBufRead + Unpin,
{
    let mut counts = IngestCounts::default();
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await.context("Failed to read input")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        counts.lines += 1;

        let record = match serde_json::from_str::<CompositeRecord>(line) {
            Ok(record) => record.or_session(session),
            Err(e) => {
                warn!(line = counts.lines, error = %e, "Skipping malformed input line");
                counts.malformed += 1;
                continue;
            }
        };

        // Inline mode flushes on the submitting thread
        let accepted = if inline {
            tokio::task::block_in_place(|| engine.submit(record))
        } else {
            engine.submit(record)
        };
        if accepted {
            counts.accepted += 1;
        } else {
            counts.rejected += 1;
        }
    }

    Ok(counts)
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, initiating graceful shutdown");
    }
}
