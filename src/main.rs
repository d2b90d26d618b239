//! ats-client - command line front end
//!
//! Log in, inspect the session, and follow the agent channel or a suite's
//! log stream from a terminal.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::io::BufRead;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ats_client::stream::ConnectionStatus;
use ats_client::{AtsClient, Args, ConnectionState, ConnectionTarget, Credentials, InboundMessage};

#[derive(Parser, Debug)]
#[command(name = "ats-client")]
#[command(about = "Client for the ATS test-management platform")]
struct Cli {
    #[command(flatten)]
    args: Args,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in and persist the token pair
    Login {
        #[arg(long, env = "ATS_USERNAME")]
        username: String,
        /// Read from stdin when not given
        #[arg(long, env = "ATS_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Forget the persisted session
    Logout,
    /// Show the current user
    Profile,
    /// Follow a test suite's log stream
    Tail {
        #[arg(long)]
        suite: String,
    },
    /// Follow the agent control channel
    Agent,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let log_level = cli.args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("ats_client={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = cli.args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let config = cli
        .args
        .client_config()
        .map_err(anyhow::Error::msg)?;
    info!(api = %config.api_base(), "Using ATS server");
    let client = AtsClient::new(config)?;

    match cli.command {
        Command::Login { username, password } => {
            let password = match password {
                Some(p) => p,
                None => read_password()?,
            };
            client.login(&Credentials::new(username, password)).await?;
            match client.auth().user() {
                Some(user) => println!("Logged in as {}", user.username),
                None => println!("Logged in"),
            }
        }
        Command::Logout => {
            client.restore();
            client.logout().await;
            println!("Logged out");
        }
        Command::Profile => {
            require_session(&client)?;
            let profile = client.gateway().profile().await?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
        }
        Command::Tail { suite } => {
            require_session(&client)?;
            let subscription = client.streams().subscribe_suite_logs(suite, |event| {
                println!("{} {}", event.timestamp, event.message);
            });
            follow(subscription.watch()).await?;
        }
        Command::Agent => {
            require_session(&client)?;
            let subscription =
                client
                    .streams()
                    .subscribe(ConnectionTarget::Agent, "*", |msg: &InboundMessage| -> anyhow::Result<()> {
                        println!("{}", serde_json::to_string(msg)?);
                        Ok(())
                    });
            follow(subscription.watch()).await?;
        }
    }

    Ok(())
}

fn require_session(client: &AtsClient) -> anyhow::Result<()> {
    if !client.restore() {
        bail!("Not logged in; run `ats-client login` first");
    }
    Ok(())
}

fn read_password() -> anyhow::Result<String> {
    eprint!("Password: ");
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read password from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Run until Ctrl-C or until the connection gives up.
async fn follow(mut status: watch::Receiver<ConnectionStatus>) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                return Ok(());
            }
            changed = status.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let current = status.borrow_and_update().clone();
                match (current.state, current.error) {
                    (ConnectionState::Idle, Some(e)) => bail!("Disconnected: {}", e),
                    (ConnectionState::Idle, None) => {
                        warn!("Connection closed");
                        return Ok(());
                    }
                    (state, _) => info!(%state, "Connection state changed"),
                }
            }
        }
    }
}
