//! Warden command line.
//!
//! Runs one license decision the way a host application would at startup and
//! reports it. Exit status: 0 when the host may run, 2 when blocked, 1 on a
//! configuration or storage error.
//!
//! Usage:
//!   warden --config warden.toml check
//!   warden revalidate
//!   warden status
//!   warden wipe

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use warden::client::decision::Decision;
use warden::client::engine::{LicenseDecisionEngine, LocalStatus};
use warden::client::grace::GraceStatus;
use warden::client::state::LoadedState;
use warden::config::WardenConfig;
use warden::errors::LicenseResult;
use warden::logging::init_logging;

const EXIT_BLOCKED: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(about = "Offline-capable license check and kill switch", version)]
struct Cli {
    /// Configuration file (default: ./warden.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print decisions as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Startup decision with offline grace (default)
    Check,
    /// Force an online validation; no grace
    Revalidate,
    /// Show local state without contacting the server
    Status,
    /// Remove all local license state and the installation secret
    Wipe,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("warden: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> LicenseResult<ExitCode> {
    let config = WardenConfig::load_from(cli.config.as_deref())?;
    config.validate()?;
    init_logging(&config.logging)?;

    let engine = LicenseDecisionEngine::from_config(&config)?;
    match cli.command.unwrap_or(Command::Check) {
        Command::Check => report(&engine.decide().await, cli.json),
        Command::Revalidate => report(&engine.revalidate().await, cli.json),
        Command::Status => {
            print_status(&engine.local_status().await?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Wipe => {
            engine.wipe_local_state().await?;
            println!("Local license state removed.");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn report(decision: &Decision, json: bool) -> LicenseResult<ExitCode> {
    if json {
        println!("{}", serde_json::to_string_pretty(decision)?);
    } else {
        println!("{}", decision.summary());
        if let Some(edition) = &decision.edition {
            println!("  edition:  {edition}");
        }
        if let Some(customer) = &decision.customer {
            println!("  customer: {customer}");
        }
        if !decision.features.is_empty() {
            println!("  features: {}", decision.features.join(", "));
        }
        if let Some(expires_at) = decision.expires_at {
            println!("  expires:  {expires_at}");
        }
        if !decision.is_allowed() {
            println!("  {}", decision.reason.default_message());
        }
        if decision.reason.requires_online() {
            println!("  Connect to the network and run `warden revalidate`.");
        }
    }

    Ok(if decision.is_allowed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_BLOCKED)
    })
}

fn print_status(status: &LocalStatus) {
    match &status.state {
        LoadedState::Absent => println!("state:   none (never validated)"),
        LoadedState::Tampered(cause) => println!("state:   invalid ({cause})"),
        LoadedState::Valid(state) => println!(
            "state:   last validated {} (link #{})",
            state.last_good, state.counter
        ),
    }

    let grace = match status.grace {
        GraceStatus::NeverValidated => "unavailable".to_string(),
        GraceStatus::ClockUnverified => "blocked, clock watermark missing or invalid".to_string(),
        GraceStatus::RollbackDetected { anchor } => format!("blocked, clock behind {anchor}"),
        GraceStatus::Latched(latch) => format!("blocked ({})", latch.code()),
        GraceStatus::Exhausted { last_good } => format!("exhausted (since {last_good})"),
        GraceStatus::Available { .. } => format!(
            "{} day(s) remaining",
            status.grace.days_remaining().unwrap_or(0)
        ),
    };
    println!("grace:   {grace}");

    if let Some(cached) = &status.cached {
        println!(
            "license: {} for {}, expires {}",
            cached.edition.as_deref().unwrap_or("standard"),
            cached.customer.as_deref().unwrap_or("-"),
            cached.expires_at
        );
        if !cached.features.is_empty() {
            println!("features: {}", cached.features.join(", "));
        }
    }

    if let Some(failure) = &status.last_failure {
        println!(
            "last failure: {} at {} ({})",
            failure.reason, failure.at, failure.detail
        );
    }
}
