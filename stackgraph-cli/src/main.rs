use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
mod commands;
mod config;

use cli::{Args, Mode};

/// Initialize tracing with two outputs:
/// 1. Console output (stderr) - warnings and above unless RUST_LOG says otherwise
/// 2. File output (~/.stackgraph/stackgraph.log) - everything the filter allows
fn initialize_tracing() -> Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::{EnvFilter, Layer};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "info,\
         stackgraph_stacks=debug,\
         stackgraph_cli=debug,\
         kube=warn"
            .into()
    });

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let log_dir = PathBuf::from(home).join(".stackgraph");
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::never(&log_dir, "stackgraph.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Dropping the guard stops file logging; it must live as long as the process
    std::mem::forget(guard);

    let file_layer = fmt::layer().with_writer(file_writer).with_ansi(false);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(console_filter());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    Ok(())
}

fn console_filter() -> tracing_subscriber::filter::LevelFilter {
    if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::filter::LevelFilter::TRACE
    } else {
        tracing_subscriber::filter::LevelFilter::WARN
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    initialize_tracing()?;

    match args.mode {
        Mode::Plan { stack, output } => commands::stack::run_plan(stack, output).await,
        Mode::Apply {
            stack,
            dry_run,
            wait,
            timeout,
        } => commands::stack::run_apply(stack, dry_run, wait, timeout).await,
        Mode::Destroy { stack, dry_run } => commands::stack::run_destroy(stack, dry_run).await,
        Mode::Render { stack } => commands::stack::run_render(stack).await,
        Mode::Outputs { stack, output } => commands::stack::run_outputs(stack, output).await,
        Mode::Schedule { expression, days } => commands::schedule::run_schedule(expression, days),
    }
}
