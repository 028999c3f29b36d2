pub mod config;
pub mod mcp_client;

use std::path::{Path, PathBuf};

pub use mcp_client::McpHub;

/// Base name of the log file written by [`init_tracing`].
pub const LOG_FILE_NAME: &str = "synapse-mcp.log";

/// Number of rotated log files kept next to the live one.
const LOG_FILES_KEPT: u32 = 3;

/// Return the platform-standard data directory for synapse-mcp.
///
/// - macOS: `~/Library/Application Support/synapse-mcp/`
/// - Windows: `{FOLDERID_RoamingAppData}\synapse-mcp\`
/// - Linux: `$XDG_DATA_HOME/synapse-mcp/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.synapse-mcp/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("synapse-mcp");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".synapse-mcp")
}

/// How [`init_tracing`] should emit log records.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// One JSON object per record instead of the human-readable format.
    pub json: bool,
    /// Write to `<dir>/synapse-mcp.log` instead of stderr.
    pub log_dir: Option<PathBuf>,
}

/// Initialize the global tracing subscriber.
///
/// The filter comes from `RUST_LOG`, defaulting to `synapse_mcp=info,warn`.
/// With a log directory, existing logs are rotated first
/// (synapse-mcp.log → .1 → .2 → .3) and the fresh file gets a
/// line-flushing writer. Returns the log file path when one is used.
pub fn init_tracing(opts: &LogOptions) -> std::io::Result<Option<PathBuf>> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("synapse_mcp=info,warn"));

    let (writer, log_path) = match &opts.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let log_path = dir.join(LOG_FILE_NAME);
            rotate_log_file(&log_path, LOG_FILES_KEPT);
            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)?;
            (BoxMakeWriter::new(FlushingWriter::new(log_file)), Some(log_path))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);

    let installed = if opts.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(std::io::Error::other)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?log_path,
        pid = std::process::id(),
        "=== synapse-mcp starting ==="
    );
    Ok(log_path)
}

/// Rotate log files: `synapse-mcp.log` → `.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// Keeps each log line on disk immediately so a crashed provider run still
/// leaves a complete trail.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
