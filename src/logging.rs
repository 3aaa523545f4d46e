use crate::{anyhow_loc, function_name};
use anyhow::Result;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{Event, Subscriber};
use tracing_chrome::FlushGuard;
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

const DEFAULT_LOG_FILE: &str = "testfarm_sched.log";

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(anyhow_loc!(
                "Invalid log level '{}'. Valid options are: error, warn, info, debug, trace",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
    Simple,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Stdout,
    File { path: PathBuf },
    Both { path: PathBuf },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,

    #[serde(default = "default_log_format")]
    pub format: LogFormat,

    #[serde(default = "default_log_output")]
    pub output: LogOutput,
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_log_format() -> LogFormat {
    LogFormat::Simple
}

fn default_log_output() -> LogOutput {
    LogOutput::Stdout
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            output: default_log_output(),
        }
    }
}

/// Console format without span context: `INFO Dispatched test set #12 to testbox #3`.
pub struct PlainEventFormat;

impl<S, N> FormatEvent<S, N> for PlainEventFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let level = event.metadata().level();

        if writer.has_ansi_escapes() {
            let color_code = match *level {
                tracing::Level::ERROR => "\x1b[31m",
                tracing::Level::WARN => "\x1b[33m",
                tracing::Level::INFO => "\x1b[32m",
                tracing::Level::DEBUG => "\x1b[34m",
                tracing::Level::TRACE => "\x1b[35m",
            };
            write!(writer, "{}{:>5}\x1b[0m ", color_code, level)?;
        } else {
            write!(writer, "{:>5} ", level)?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn console_layer(format: LogFormat) -> BoxedLayer {
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer().pretty().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_target(false)
            .without_time()
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        LogFormat::Simple => tracing_subscriber::fmt::layer().event_format(PlainEventFormat).boxed(),
    }
}

fn file_layer(path: &Path) -> BoxedLayer {
    let file_appender = tracing_appender::rolling::never(
        path.parent().unwrap_or_else(|| Path::new(".")),
        path.file_name().unwrap_or_else(|| std::ffi::OsStr::new(DEFAULT_LOG_FILE)),
    );
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // The writer thread must outlive every log call.
    std::mem::forget(guard);

    tracing_subscriber::fmt::layer().json().with_writer(non_blocking).boxed()
}

pub fn init_logging(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::new(config.level.as_str());

    let layers: Vec<BoxedLayer> = match &config.output {
        LogOutput::Stdout => vec![console_layer(config.format)],
        LogOutput::File { path } => vec![file_layer(path)],
        LogOutput::Both { path } => vec![console_layer(config.format), file_layer(path)],
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| anyhow_loc!("Failed to install tracing subscriber: {}", e))?;

    tracing::debug!("Logging initialized with {} level", config.level.as_str());

    Ok(())
}

/// Initialize logging with chrome tracing support for profiling scheduling passes.
/// Returns a guard that MUST be held until the program exits to ensure the trace is flushed.
pub fn init_logging_with_profile(config: &LogConfig, trace_path: &Path) -> Result<FlushGuard> {
    let filter = EnvFilter::new(config.level.as_str());

    let (chrome_layer, guard) =
        tracing_chrome::ChromeLayerBuilder::new().file(trace_path).include_args(true).build();

    tracing_subscriber::registry()
        .with(console_layer(LogFormat::Simple))
        .with(filter)
        .with(chrome_layer)
        .try_init()
        .map_err(|e| anyhow_loc!("Failed to install tracing subscriber: {}", e))?;

    tracing::info!("Profiling enabled, trace will be written to: {:?}", trace_path);

    Ok(guard)
}

pub struct TimingGuard {
    span: tracing::Span,
    start: std::time::Instant,
}

impl TimingGuard {
    pub fn new(span: tracing::Span) -> Self {
        Self {
            span,
            start: std::time::Instant::now(),
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        self.span.record("duration_ms", duration.as_millis() as u64);
        self.span.record("duration_us", duration.as_micros() as u64);
    }
}

/// Opens a span that records its own duration when the returned guard drops.
#[macro_export]
macro_rules! timed_span {
    ($level:expr, $name:expr) => {
        $crate::timed_span!($level, $name,)
    };
    ($level:expr, $name:expr, $($fields:tt)*) => {{
        let span = tracing::span!($level, $name, duration_ms = tracing::field::Empty, duration_us = tracing::field::Empty, $($fields)*);
        $crate::logging::TimingGuard::new(span)
    }};
}
