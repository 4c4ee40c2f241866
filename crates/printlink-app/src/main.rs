// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printlink: headless OctoPrint connectivity client
//
// Entry point. Initialises logging, resolves the data directory and config,
// and hands the parsed command line to the engine.

mod cli;
mod config;
mod data_dir;

use clap::Parser;

use printlink_core::human_errors::humanize_error;

use cli::Cli;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();

    let dir = match &args.data_dir {
        Some(dir) => data_dir::data_dir_at(dir),
        None => data_dir::data_dir(),
    };
    let config = config::load_config(&dir).unwrap_or_default();
    tracing::debug!(path = %dir.display(), "data directory");

    if let Err(e) = cli::run(args.action, &dir, config).await {
        tracing::debug!(error = %e, "command failed");
        let human = humanize_error(&e);
        eprintln!("{}", human.message);
        eprintln!("  {}", human.suggestion);
        std::process::exit(1);
    }
}
