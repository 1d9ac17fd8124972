use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::Level;
use tracing_appender::rolling;
use tracing_subscriber::fmt::writer::MakeWriterExt;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone)]
pub enum LogTarget {
    Stdout,
    RollingFile { dir: String },
}

#[derive(Debug, Clone)]
pub struct LoggingOptions {
    pub level: Level,
    pub target: LogTarget,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            target: LogTarget::Stdout,
        }
    }
}

impl LoggingOptions {
    pub fn new(debug: bool, target: LogTarget) -> Self {
        Self {
            level: if debug { Level::DEBUG } else { Level::INFO },
            target,
        }
    }
}

/// Installs the process-wide tracing subscriber. Safe to call more than
/// once; only the first call takes effect.
pub fn init_logging(opts: LoggingOptions) {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    let format = tracing_subscriber::fmt::format()
        .with_file(true)
        .with_line_number(false)
        .with_target(false)
        .with_thread_ids(true)
        .compact();

    match opts.target {
        LogTarget::Stdout => {
            let _ = tracing_subscriber::fmt()
                .with_max_level(opts.level)
                .event_format(format)
                .try_init();
        }
        LogTarget::RollingFile { dir } => {
            let file_appender = rolling::daily(&dir, "melian.log");
            let writer = file_appender.and(io::stdout);
            let _ = tracing_subscriber::fmt()
                .with_max_level(opts.level)
                .event_format(format)
                .with_writer(writer)
                .try_init();
        }
    }
}
