use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Once, OnceLock};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt, TestWriter};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::PermscopeConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// A bare level (`info`, `debug`, ...) or a full `EnvFilter` directive
    /// string such as `warn,permscope::dispatch=trace`.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,

    /// Mirror log lines to stderr. Reports always go to stdout.
    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,

    /// Also append log lines to this file. An unopenable file only disables
    /// this sink.
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Lines retained in memory for post-mortem output.
    #[serde(default = "LoggingConfig::default_buffer_lines")]
    pub buffer_lines: usize,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }

    fn default_buffer_lines() -> usize {
        500
    }

    /// Canonicalizes bare level names; anything else passes through as
    /// filter directives.
    pub(crate) fn level_directives(&self) -> String {
        let level = self.level.trim();
        match level.to_ascii_lowercase().as_str() {
            "" => Self::default_level(),
            "warning" => "warn".to_owned(),
            bare @ ("trace" | "debug" | "info" | "warn" | "error") => bare.to_owned(),
            _ => level.to_owned(),
        }
    }

    /// The effective filter: configured directives, extended by `RUST_LOG`
    /// when set. Unparsable combinations fall back to the parts that do parse,
    /// and finally to `info`.
    pub fn env_filter(&self) -> EnvFilter {
        let configured = self.level_directives();
        let from_env = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let mut candidates = Vec::with_capacity(3);
        if let Some(env) = &from_env {
            candidates.push(format!("{configured},{env}"));
            candidates.push(env.clone());
        }
        candidates.push(configured);

        candidates
            .iter()
            .find_map(|directives| EnvFilter::try_new(directives).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: Self::default_stderr(),
            file: None,
            buffer_lines: Self::default_buffer_lines(),
        }
    }
}

/// Bounded in-memory tail of formatted log lines.
#[derive(Debug)]
pub struct LogBuffer {
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(4_096))),
        }
    }

    pub fn push_line(&self, line: String) {
        let mut lines = self.lines.lock();
        while lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Up to `n` of the newest lines, oldest first.
    pub fn last_lines(&self, n: usize) -> Vec<String> {
        let lines = self.lines.lock();
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }
}

/// [`MakeWriter`] feeding a [`LogBuffer`]; usable with scoped subscribers in
/// tests.
#[derive(Clone)]
pub struct LogBufferMakeWriter {
    buffer: Arc<LogBuffer>,
}

impl LogBufferMakeWriter {
    pub fn new(buffer: Arc<LogBuffer>) -> Self {
        Self { buffer }
    }
}

impl<'a> MakeWriter<'a> for LogBufferMakeWriter {
    type Writer = PendingLines;

    fn make_writer(&'a self) -> Self::Writer {
        PendingLines {
            buffer: self.buffer.clone(),
            bytes: Vec::new(),
        }
    }
}

/// Collects one formatted event and splits it into lines when dropped.
pub struct PendingLines {
    buffer: Arc<LogBuffer>,
    bytes: Vec<u8>,
}

impl Write for PendingLines {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PendingLines {
    fn drop(&mut self) {
        String::from_utf8_lossy(&self.bytes)
            .lines()
            .filter(|line| !line.is_empty())
            .for_each(|line| self.buffer.push_line(line.to_owned()));
    }
}

static TRACING_INIT: Once = Once::new();
static GLOBAL_LOG_BUFFER: OnceLock<Arc<LogBuffer>> = OnceLock::new();

/// Installs the global `tracing` subscriber on first call and returns the
/// process-wide log buffer. Later calls only return the buffer.
pub fn init_tracing(logging: &LoggingConfig) -> Arc<LogBuffer> {
    let buffer = GLOBAL_LOG_BUFFER
        .get_or_init(|| Arc::new(LogBuffer::new(logging.buffer_lines)))
        .clone();

    TRACING_INIT.call_once(|| {
        let (writer, file_error) = sinks(logging, &buffer);
        let fmt = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false);
        let fmt: Box<dyn tracing_subscriber::Layer<_> + Send + Sync> = if logging.json {
            fmt.json().boxed()
        } else {
            fmt.boxed()
        };

        let installed = tracing_subscriber::registry()
            .with(logging.env_filter())
            .with(fmt)
            .try_init()
            .is_ok();
        if let (true, Some((path, err))) = (installed, file_error) {
            tracing::warn!(
                target: "permscope.config",
                path = %path.display(),
                error = %err,
                "log file unavailable; continuing without it"
            );
        }
    });

    buffer
}

/// [`init_tracing`] for a whole configuration.
pub fn init_tracing_with_config(config: &PermscopeConfig) -> Arc<LogBuffer> {
    init_tracing(&config.logging)
}

fn sinks(
    logging: &LoggingConfig,
    buffer: &Arc<LogBuffer>,
) -> (BoxMakeWriter, Option<(PathBuf, io::Error)>) {
    let mut writer = BoxMakeWriter::new(LogBufferMakeWriter::new(buffer.clone()));
    if logging.stderr {
        // Test binaries only capture output written through the print macros.
        writer = if cfg!(debug_assertions) {
            BoxMakeWriter::new(writer.and(TestWriter::with_stderr))
        } else {
            BoxMakeWriter::new(writer.and(io::stderr))
        };
    }

    let mut file_error = None;
    if let Some(path) = &logging.file {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => writer = BoxMakeWriter::new(writer.and(Arc::new(file))),
            Err(err) => file_error = Some((path.clone(), err)),
        }
    }
    (writer, file_error)
}
