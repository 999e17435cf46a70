//! Log output to stderr or syslog

use anyhow::{anyhow, Context, Result};
use std::io;
use std::sync::{Arc, Mutex};
use syslog::{Facility, Formatter3164, Logger, LoggerBackend, Severity};
use tracing::{Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SYSLOG_TAG: &str = "sluice";

/// Initialize the global subscriber.
///
/// `RUST_LOG` overrides `log_level` when set.
pub fn init_logging(log_level: &str, use_syslog: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    if use_syslog {
        let writer = SyslogMakeWriter::connect()?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(false)
                    .without_time(),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(io::stderr).with_target(false))
            .init();
    }

    Ok(())
}

fn severity(level: &Level) -> Severity {
    if *level == Level::ERROR {
        Severity::LOG_ERR
    } else if *level == Level::WARN {
        Severity::LOG_WARNING
    } else if *level == Level::INFO {
        Severity::LOG_INFO
    } else {
        Severity::LOG_DEBUG
    }
}

type SyslogLogger = Logger<LoggerBackend, Formatter3164>;

/// Hands out one buffered writer per event, sent to syslog with the event's severity
#[derive(Clone)]
pub struct SyslogMakeWriter {
    logger: Arc<Mutex<SyslogLogger>>,
}

impl SyslogMakeWriter {
    /// Connect to the local syslog daemon as a daemon-facility logger.
    pub fn connect() -> Result<Self> {
        let formatter = Formatter3164 {
            facility: Facility::LOG_DAEMON,
            hostname: None,
            process: SYSLOG_TAG.to_string(),
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter)
            .map_err(|e| anyhow!("Failed to connect to syslog: {}", e))?;

        Ok(Self {
            logger: Arc::new(Mutex::new(logger)),
        })
    }

    fn writer_for(&self, level: &Level) -> SyslogWriter {
        SyslogWriter {
            logger: self.logger.clone(),
            severity: severity(level),
            buffer: Vec::new(),
        }
    }
}

impl<'a> MakeWriter<'a> for SyslogMakeWriter {
    type Writer = SyslogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.writer_for(&Level::INFO)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        self.writer_for(meta.level())
    }
}

/// Collects one formatted event and sends it when dropped
pub struct SyslogWriter {
    logger: Arc<Mutex<SyslogLogger>>,
    severity: Severity,
    buffer: Vec<u8>,
}

impl io::Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SyslogWriter {
    fn drop(&mut self) {
        let message = String::from_utf8_lossy(&self.buffer);
        let message = message.trim_end();
        if message.is_empty() {
            return;
        }

        let Ok(mut logger) = self.logger.lock() else {
            return;
        };
        // The pid changes when the process detaches after connecting.
        logger.formatter.pid = std::process::id();

        let _ = match self.severity {
            Severity::LOG_ERR => logger.err(message),
            Severity::LOG_WARNING => logger.warning(message),
            Severity::LOG_INFO => logger.info(message),
            _ => logger.debug(message),
        };
    }
}
