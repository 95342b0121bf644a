//! # EtherNet/IP (ENIP) / CIP Adapter - Main Entry Point
//!
//! Parses CLI configuration, sets up structured logging, builds the
//! adapter's object model from its [`AdapterConfig`], and runs the
//! network handler to completion.
//!
//! ## Concurrency Model
//!
//! Runs on a `current_thread` Tokio runtime: the network handler is a
//! single task owning all adapter state, with small per-connection tasks
//! forwarding I/O to it (§4.J, §5). There is no additional worker pool.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use enip_adapter::{AdapterConfig, AdapterContext, Args, NullHooks};
use tracing::info;

use enip_adapter::logging::ColorizedFormatter;
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Configure logging level based on verbosity flags.
    // - default: INFO
    // -v: DEBUG
    // -vv and more: TRACE
    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // Configure the detailed log layer (file or stderr).
    // The guard must be kept alive for the duration of the program for file logging.
    let guard;
    let detailed_log_layer;

    if let Some("stderr") = args.log_file.as_deref() {
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let file_appender = match args.log_file.as_deref() {
            Some(path_str) => {
                let log_path = std::path::Path::new(path_str);
                let log_dir = log_path
                    .parent()
                    .unwrap_or_else(|| std::path::Path::new("."));
                let log_filename = log_path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("enip_adapter.log"));
                tracing_appender::rolling::daily(log_dir, log_filename)
            }
            None => tracing_appender::rolling::daily(".", "enip_adapter.log"),
        };
        let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    // Clean, user-facing output to stdout, suppressed by --quiet.
    let stdout_log = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();

    // Keep the logging guard alive for the duration of the program; if
    // dropped, file logging stops working.
    let _log_guard = guard;

    info!("Starting EtherNet/IP adapter");

    let config = AdapterConfig::from_args(&args);
    let mut ctx = AdapterContext::new(&config, Arc::new(NullHooks));

    enip_adapter::network::run(&config, &mut ctx).await?;

    Ok(())
}
