//! Logging initialization using `tracing` and `tracing-subscriber`.

use std::path::{Path, PathBuf};

use tracing::info;
use tracing_subscriber::{fmt, fmt::writer::BoxMakeWriter, util::SubscriberInitExt, EnvFilter};

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

#[derive(Debug, Clone)]
pub enum LogSink {
    /// Log to stderr so user output and logs do not interleave.
    Console,
    /// Append-only log file.
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub sink: LogSink,
    pub debug: bool,
}

/// Snapshot of node-graph and inode-table sizes, dumped when the sandbox
/// control signal arrives.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphSnapshot {
    pub nodes: usize,
    pub inodes: usize,
}

/// Initialize global tracing subscriber. Safe to call multiple times;
/// subsequent calls will no-op.
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = if config.debug {
        EnvFilter::new("trace")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let (writer, ansi) = match &config.sink {
        LogSink::Console => (BoxMakeWriter::new(std::io::stderr), true),
        LogSink::File(path) => {
            ensure_parent(path)?;
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            (BoxMakeWriter::new(std::sync::Mutex::new(file)), false)
        }
    };

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(writer)
        .with_ansi(ansi);

    match config.format {
        LogFormat::Human => {
            let _ = builder.finish().try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().finish().try_init();
        }
    };

    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Emit node/inode counts; driven by the SIGUSR1 handler.
pub fn log_graph_snapshot(snapshot: GraphSnapshot) {
    info!(
        target = "jailfs::graph",
        nodes = snapshot.nodes,
        inodes = snapshot.inodes,
        "graph_snapshot"
    );
}
