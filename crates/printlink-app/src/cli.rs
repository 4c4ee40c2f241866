// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Command-line surface.  Each subcommand is a thin translation into engine
// calls; the lifecycle adapter stands in for the OS callbacks a mobile shell
// would deliver.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, info};

use printlink_core::error::{PrintlinkError, Result};
use printlink_core::types::{Credential, NewTarget, TargetId};
use printlink_engine::{ChannelConsumer, Engine, LifecycleAdapter};
use printlink_net::protocol::{parse_job, parse_printer_state};
use printlink_net::{Command, FileEntry, FileOrigin, JobAction, parse_files, refresh_sd};

use crate::config::{AppConfig, persist_config};

/// Printlink - headless OctoPrint connectivity client
#[derive(Parser, Debug)]
#[command(name = "printlink")]
#[command(about = "Keep an OctoPrint session and its printer registry in sync", long_about = None)]
pub struct Cli {
    /// Override the data directory
    #[arg(long, value_name = "DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub action: Action,
}

#[derive(Subcommand, Debug)]
pub enum Action {
    /// Manage saved printers
    Targets {
        #[command(subcommand)]
        action: TargetAction,
    },
    /// Connect to the default printer and print events as JSON lines until Ctrl-C
    Watch,
    /// Run one background refresh against the default printer
    Poll {
        /// Time the OS would grant the refresh
        #[arg(long, default_value_t = 25)]
        budget_secs: u64,
    },
    /// Send one command to the default printer
    Command {
        #[command(subcommand)]
        kind: CommandKind,
    },
    /// Show the effective configuration
    Config {
        /// Write it to config.json in the data directory
        #[arg(long)]
        write: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum TargetAction {
    List,
    Add {
        #[arg(long)]
        name: String,
        /// Base URL, e.g. http://octopi.local
        #[arg(long)]
        host: String,
        #[arg(long)]
        api_key: String,
        /// Basic-auth user for servers behind a reverse proxy
        #[arg(long)]
        username: Option<String>,
        #[arg(long, requires = "username")]
        password: Option<String>,
        #[arg(long)]
        color: Option<String>,
        /// Make this the default printer
        #[arg(long)]
        default: bool,
    },
    Remove {
        id: TargetId,
    },
    Default {
        id: TargetId,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CommandKind {
    /// Open the server's serial link to the printer
    ConnectPrinter,
    DisconnectPrinter,
    /// Print the current printer state
    Status,
    /// Print the current job progress
    Progress,
    Job {
        #[arg(value_enum)]
        action: JobArg,
    },
    ToolTemp {
        #[arg(long, default_value_t = 0)]
        tool: u8,
        celsius: f64,
    },
    BedTemp {
        celsius: f64,
    },
    Gcode {
        #[arg(required = true)]
        lines: Vec<String>,
    },
    /// List stored files on every origin
    Files,
    /// Select a file and start printing it
    PrintFile {
        /// The file lives on the printer's SD card
        #[arg(long)]
        sd: bool,
        path: String,
    },
    DeleteFile {
        #[arg(long)]
        sd: bool,
        path: String,
    },
    /// Re-read the SD card, initialising it first if needed
    RefreshSd,
    InitSd,
}

fn origin(sd: bool) -> FileOrigin {
    if sd { FileOrigin::Sdcard } else { FileOrigin::Local }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobArg {
    Start,
    Pause,
    Resume,
    Cancel,
}

impl From<JobArg> for JobAction {
    fn from(arg: JobArg) -> Self {
        match arg {
            JobArg::Start => Self::Start,
            JobArg::Pause => Self::Pause,
            JobArg::Resume => Self::Resume,
            JobArg::Cancel => Self::Cancel,
        }
    }
}

impl CommandKind {
    fn to_command(&self) -> Command {
        match self {
            Self::ConnectPrinter => Command::ConnectPrinter,
            Self::DisconnectPrinter => Command::DisconnectPrinter,
            Self::Status => Command::QueryPrinterState,
            Self::Progress => Command::QueryJob,
            Self::Job { action } => Command::Job((*action).into()),
            Self::ToolTemp { tool, celsius } => Command::SetToolTemperature {
                tool: *tool,
                celsius: *celsius,
            },
            Self::BedTemp { celsius } => Command::SetBedTemperature { celsius: *celsius },
            Self::Gcode { lines } => Command::SendGcode(lines.clone()),
            Self::Files => Command::ListFiles,
            Self::PrintFile { sd, path } => Command::PrintFile {
                origin: origin(*sd),
                path: path.clone(),
            },
            Self::DeleteFile { sd, path } => Command::DeleteFile {
                origin: origin(*sd),
                path: path.clone(),
            },
            Self::RefreshSd => Command::RefreshSd,
            Self::InitSd => Command::InitSd,
        }
    }
}

pub async fn run(action: Action, data_dir: &Path, config: AppConfig) -> Result<()> {
    match action {
        Action::Config { write } => show_config(data_dir, &config, write),
        Action::Targets { action } => {
            let engine = open_engine(data_dir, &config)?;
            targets(&engine, action).await
        }
        Action::Watch => {
            let lifecycle = LifecycleAdapter::new(Arc::new(open_engine(data_dir, &config)?));
            watch(&lifecycle).await
        }
        Action::Poll { budget_secs } => {
            let lifecycle = LifecycleAdapter::new(Arc::new(open_engine(data_dir, &config)?));
            let result = lifecycle
                .perform_fetch(Duration::from_secs(budget_secs), |result| {
                    debug!(?result, "background refresh finished");
                })
                .await;
            println!("{result:?}");
            lifecycle.will_terminate().await;
            Ok(())
        }
        Action::Command { kind } => {
            let engine = open_engine(data_dir, &config)?;
            let output = command(&engine, &kind).await?;
            if !output.is_empty() {
                println!("{output}");
            }
            Ok(())
        }
    }
}

fn open_engine(data_dir: &Path, config: &AppConfig) -> Result<Engine> {
    let db_path = data_dir.join(&config.database_file);
    info!(path = %db_path.display(), "opening registry");
    Engine::open(
        config.engine.clone(),
        &db_path,
        printlink_bridge::platform_bridge(),
    )
}

fn show_config(data_dir: &Path, config: &AppConfig, write: bool) -> Result<()> {
    config.engine.validate()?;
    println!("{}", serde_json::to_string_pretty(config)?);
    if write {
        persist_config(data_dir, config)?;
        eprintln!("Saved to {}", data_dir.join("config.json").display());
    }
    Ok(())
}

async fn targets(engine: &Engine, action: TargetAction) -> Result<()> {
    let registry = engine.registry();
    match action {
        TargetAction::List => {
            let targets = registry.list();
            if targets.is_empty() {
                eprintln!("No printers saved. Add one with `printlink targets add`.");
            }
            for target in targets {
                let marker = if target.is_default { "*" } else { " " };
                println!("{marker} {}  {:<20} {}", target.id, target.name, target.host);
            }
        }
        TargetAction::Add {
            name,
            host,
            api_key,
            username,
            password,
            color,
            default,
        } => {
            let target = registry
                .create(NewTarget {
                    name,
                    host,
                    credential: Credential {
                        api_key,
                        username,
                        password,
                    },
                    color,
                    make_default: default,
                    ..Default::default()
                })
                .await?;
            println!("{}", target.id);
        }
        TargetAction::Remove { id } => {
            if registry.get(id).is_none() {
                eprintln!("No printer with id {id}; nothing to remove.");
            }
            registry.delete(id).await?;
        }
        TargetAction::Default { id } => registry.set_default(id).await?,
    }
    engine.shutdown().await;
    Ok(())
}

/// Send `kind` to the default printer over the command channel only; no
/// realtime session is opened.  Queries are decoded before printing.
async fn command(engine: &Engine, kind: &CommandKind) -> Result<String> {
    let target = engine
        .registry()
        .get_default()
        .ok_or(PrintlinkError::NoDefaultTarget)?;
    let outcome = match kind {
        CommandKind::RefreshSd => refresh_sd(engine.connections(), &target).await,
        _ => {
            engine
                .connections()
                .send_command_to(&target, &kind.to_command())
                .await
        }
    };
    let body = outcome.into_body()?;
    let output = match kind {
        CommandKind::Status => {
            let report = parse_printer_state(&body)?;
            serde_json::to_string_pretty(&report.snapshot)?
        }
        CommandKind::Progress => serde_json::to_string_pretty(&parse_job(&body)?)?,
        CommandKind::Files => {
            let mut listing = String::new();
            render_files(&parse_files(&body)?, 0, &mut listing);
            listing.trim_end().to_owned()
        }
        _ => String::new(),
    };
    Ok(output)
}

/// One line per entry, children indented under their folder.
fn render_files(entries: &[FileEntry], depth: usize, out: &mut String) {
    for entry in entries {
        let indent = "  ".repeat(depth);
        if entry.is_folder {
            out.push_str(&format!("{indent}{}/\n", entry.name));
            render_files(&entry.children, depth + 1, out);
        } else {
            let size = entry.size.map(|s| format!("  {s} B")).unwrap_or_default();
            out.push_str(&format!(
                "{indent}{} [{}]{size}\n",
                entry.name,
                entry.origin.as_str()
            ));
        }
    }
}

async fn watch(lifecycle: &LifecycleAdapter) -> Result<()> {
    let (consumer, mut events) = ChannelConsumer::new();
    let _subscription = lifecycle.engine().subscribe(&consumer);

    lifecycle.did_finish_launching().await;
    lifecycle.will_enter_foreground().await?;
    if lifecycle.engine().registry().get_default().is_none() {
        eprintln!("No default printer; waiting for one to arrive from another device.");
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => println!("{}", serde_json::to_string(&event)?),
                None => break,
            },
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
        }
    }

    lifecycle.did_enter_background().await;
    lifecycle.will_terminate().await;
    Ok(())
}
