use std::io::Write;
use std::sync::Arc;

use anyhow::bail;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod app;
mod cli;
mod config;
mod credentials;
mod drive;
mod extract;
mod semantic;
#[cfg(test)]
mod tests;
mod web;

use app::{AppContext, AppFactory};
use cli::Command;
use semantic::SearchStatus;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let args = cli::Args::parse();

    let mut config = AppFactory::load_config()?;
    if let Command::Serve {
        listen: Some(ref addr),
        ..
    } = args.command
    {
        config.listen_addr = addr.clone();
        config.validate()?;
    }

    let ctx = AppFactory::create_context_with(config);
    let manager = Arc::clone(ctx.manager());

    match args.command {
        Command::Serve { warmup, .. } => {
            manager.cold_start();
            if warmup {
                spawn_warmup(&ctx);
            }
            web::start_daemon(ctx)
        }

        Command::Warmup {} => {
            manager.cold_start();
            let report = manager.warmup()?;
            print_json(&report)
        }

        Command::Refresh {} => {
            let report = manager.refresh()?;
            print_json(&report)
        }

        Command::Search { query, top_k, json } => {
            manager.cold_start();
            let top_k = ctx.config().search.effective_top_k(top_k);
            let response = manager.search(&query.join(" "), top_k);

            if json {
                return print_json(&response);
            }

            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{}", response.message)?;
            if response.status == SearchStatus::Lexical {
                writeln!(stdout, "(semantic ranking unavailable, showing text matches)")?;
            }
            if !response.content.is_empty() {
                writeln!(stdout)?;
                write!(stdout, "{}", response.content)?;
            }
            Ok(())
        }

        Command::Status {} => {
            manager.cold_start();
            print_json(&manager.status())
        }

        Command::Clear { yes } => {
            if !yes {
                bail!("clearing drops every stored chunk; pass --yes to confirm");
            }
            let report = manager.clear()?;
            print_json(&report)
        }
    }
}

/// Run a warmup on its own thread while the server starts.
fn spawn_warmup(ctx: &AppContext) {
    let manager = Arc::clone(ctx.manager());
    std::thread::spawn(move || match manager.warmup() {
        Ok(report) if report.skipped => log::info!("startup warmup skipped: cache already warm"),
        Ok(report) => log::info!(
            "startup warmup finished: {} chunk(s) from {} file(s)",
            report.total_chunks,
            report.succeeded_files
        ),
        Err(e) => log::warn!("startup warmup failed: {e}"),
    });
}
