//! Collaboration replay tool
//! Feeds newline-delimited sync messages through a session manager and
//! prints every reply, followed by the final state of each document.

use anyhow::{Context, Result};
use clap::Parser;
use collaboration::*;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "collab-replay")]
#[command(about = "Replay collaboration messages against an in-process session manager")]
#[command(version)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Newline-delimited messages, or `-` for stdin
    #[arg(short, long, default_value = "-")]
    input: String,

    /// Run the presence/idle sweeper while replaying and once at the end
    #[arg(long)]
    sweep: bool,

    /// Resume documents from, and save final snapshots to, this directory
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("collab_replay=info,collaboration=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => CollaborationConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => CollaborationConfig::default(),
    };
    info!(mode = %config.session.mode, "Starting replay");

    let manager = Arc::new(SessionManager::new(config));
    let store = cli.snapshot_dir.as_ref().map(SnapshotStore::new);
    let sweeper = cli.sweep.then(|| manager.spawn_sweeper());

    let replayed = if cli.input == "-" {
        replay(&manager, store.as_ref(), BufReader::new(tokio::io::stdin())).await?
    } else {
        let file = tokio::fs::File::open(&cli.input)
            .await
            .with_context(|| format!("opening {}", cli.input))?;
        replay(&manager, store.as_ref(), BufReader::new(file)).await?
    };

    if let Some(handle) = sweeper {
        handle.abort();
        let events = manager.sweep(chrono::Utc::now());
        debug!(count = events.len(), "Final sweep");
    }

    for snapshot in manager.snapshots().await? {
        if let Some(store) = &store {
            let path = store.save(&snapshot).await?;
            info!(document_id = %snapshot.document_id, path = %path.display(), "Saved snapshot");
        }
        print_message(&SyncMessage::Snapshot { snapshot })?;
    }

    info!(messages = replayed, "Replay finished");
    Ok(())
}

async fn replay<R>(
    manager: &SessionManager,
    store: Option<&SnapshotStore>,
    reader: R,
) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut count = 0;
    let mut line_number = 0;

    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let message: SyncMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                warn!(line = line_number, "Skipping malformed message: {}", e);
                print_message(&SyncMessage::from(CollaborationError::from(e)))?;
                continue;
            }
        };

        if let (Some(store), SyncMessage::Join { document_id, .. }) = (store, &message) {
            resume_if_saved(manager, store, document_id).await?;
        }

        let reply = manager.handle_message(message).await;
        print_message(&reply)?;
        count += 1;
    }

    Ok(count)
}

/// Load a saved snapshot the first time a document is joined
async fn resume_if_saved(
    manager: &SessionManager,
    store: &SnapshotStore,
    document_id: &DocumentId,
) -> Result<()> {
    if manager.get(document_id).is_ok() {
        return Ok(());
    }
    if let Some(snapshot) = store.load(document_id).await? {
        info!(
            document_id = %document_id,
            version = snapshot.version,
            "Resuming from saved snapshot"
        );
        manager.load_snapshot(snapshot)?;
    }
    Ok(())
}

fn print_message(message: &SyncMessage) -> Result<()> {
    println!("{}", serde_json::to_string(message)?);
    Ok(())
}
