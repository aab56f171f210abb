#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! CLI that configures a mail account from environment credentials
//!
//! Exits with status 0 once the account is configured and 1 when the
//! configuration attempt fails.

use clap::Parser;
use mail_configure::{
    ConfigurationController, Credentials, Event, EventFilter, EventReceiver, ImapNegotiator,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mail-configure")]
#[command(
    about = "Configure a mail account from DC_ADDR / DC_MAIL_PW and report the outcome"
)]
struct Args {
    /// Account store file
    #[arg(long, default_value = "account.json")]
    db: PathBuf,

    /// Accept self-signed or otherwise invalid server certificates
    #[arg(long)]
    accept_invalid_certs: bool,

    /// Per-server connect and login timeout in seconds
    #[arg(long, default_value = "30")]
    timeout_secs: u64,

    /// Treat the network as offline
    #[arg(long)]
    offline: bool,

    /// Print the account summary and exit
    #[arg(long)]
    info: bool,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let negotiator = ImapNegotiator::new()
        .with_timeout(Duration::from_secs(args.timeout_secs))
        .accept_invalid_certs(args.accept_invalid_certs);
    let ctl = ConfigurationController::open(&args.db, negotiator).await?;
    ctl.set_offline(args.offline);

    if args.info {
        print_info(&ctl, &args)?;
        return Ok(ExitCode::SUCCESS);
    }

    if ctl.is_configured() {
        println!(
            "{} already configured",
            ctl.addr().unwrap_or_default()
        );
        return Ok(ExitCode::SUCCESS);
    }

    let credentials = Credentials::from_env()?;
    let mut events = ctl.subscribe(EventFilter::All);
    ctl.configure(credentials)?;

    let ok = watch(&mut events, &args).await?;
    if ok {
        println!("configured, test successful!");
        Ok(ExitCode::SUCCESS)
    } else {
        println!("received error, test unsuccessful");
        Ok(ExitCode::FAILURE)
    }
}

/// Print every event until the terminal one. Returns whether it was
/// `Ready`.
async fn watch(events: &mut EventReceiver, args: &Args) -> anyhow::Result<bool> {
    while let Some(event) = events.recv().await {
        if args.json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            println!("{event}");
        }

        match event {
            Event::Ready { .. } => return Ok(true),
            Event::Error { .. } => return Ok(false),
            _ => {}
        }
    }
    anyhow::bail!("event channel closed before the attempt finished")
}

fn print_info(ctl: &ConfigurationController, args: &Args) -> anyhow::Result<()> {
    let info = ctl.info();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        for (key, value) in &info {
            println!("{key:<14} {value}");
        }
    }

    Ok(())
}
