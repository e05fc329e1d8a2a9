//! Chatline daemon
//!
//! Chat server, client and private message endpoint.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use chatd::config::{default_config_path, default_keys_dir, Config};
use chatd::keystore::{self, DEFAULT_KEY_BITS};
use chatd::private::{send_private_message, PrivateMessageReceiver};
use chatd::server::{ChatServer, ServerSettings};
use chatd::{ChatClient, Credentials, EchoHandler, UserRegistry};
use clap::{Parser, Subcommand};
use protocol::DeliveryOutcome;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Chatline daemon - authenticated, encrypted line chat.
#[derive(Parser, Debug)]
#[command(name = "chatd")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the chat server
    Serve {
        /// Address to listen on (overrides the config file)
        #[arg(long)]
        listen: Option<SocketAddr>,
    },

    /// Connect to a chat server; stdin lines are sent, replies printed
    Connect {
        /// Server address (overrides the config file)
        #[arg(long)]
        server: Option<String>,

        /// Username (overrides the config file)
        #[arg(long, short)]
        username: Option<String>,
    },

    /// Receive private messages
    Listen {
        /// Address to listen on (overrides the config file)
        #[arg(long)]
        listen: Option<SocketAddr>,
    },

    /// Send a private message
    Msg {
        /// Receiver address
        addr: String,

        /// Message text
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,

        /// Sender name (defaults to the configured username)
        #[arg(long)]
        from: Option<String>,
    },

    /// Generate key material
    Keygen {
        /// Name of the key pair (e.g. a username or "server")
        name: String,

        /// Output directory
        #[arg(long)]
        dir: Option<PathBuf>,

        /// RSA key size in bits
        #[arg(long, default_value_t = DEFAULT_KEY_BITS)]
        bits: usize,

        /// Generate a private-message shared secret `<name>.secret` instead
        #[arg(long)]
        secret: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();
    config.validate()?;

    let _log_guard = init_logging(&config, cli.verbose)?;
    tracing::debug!("Using config file: {:?}", config_path);

    match cli.command {
        Commands::Serve { listen } => {
            if let Some(addr) = listen {
                config.server.listen_addr = addr;
            }
            run_server(&config).await
        }
        Commands::Connect { server, username } => {
            if let Some(server) = server {
                config.client.server_addr = server;
            }
            if let Some(username) = username {
                config.client.username = username;
            }
            run_client(&config).await
        }
        Commands::Listen { listen } => {
            if let Some(addr) = listen {
                config.private.listen_addr = addr;
            }
            run_receiver(&config).await
        }
        Commands::Msg { addr, text, from } => {
            let sender = from.unwrap_or_else(|| config.client.username.clone());
            if sender.is_empty() {
                bail!("No sender name: set client.username or pass --from");
            }
            let key = keystore::load_shared_secret(&config.private.secret_key)?;
            let outcome = send_private_message(&addr, &sender, &text.join(" "), &key)
                .await
                .with_context(|| format!("Failed to send private message to {}", addr))?;

            match outcome {
                DeliveryOutcome::Acknowledged => {
                    println!("Delivered.");
                    Ok(())
                }
                DeliveryOutcome::RejectedAsTampered => {
                    bail!("Receiver reports the message was tampered with")
                }
                DeliveryOutcome::ReplyTampered => bail!("The receiver's reply failed verification"),
                DeliveryOutcome::Unexpected(body) => bail!("Unexpected reply: {}", body),
            }
        }
        Commands::Keygen {
            name,
            dir,
            bits,
            secret,
        } => {
            let dir = dir.unwrap_or_else(default_keys_dir);
            if secret {
                let path = dir.join(format!("{}.secret", name));
                keystore::generate_shared_secret(&path)?;
                println!("Shared secret written to {}", path.display());
            } else {
                let files = keystore::generate_key_pair(&dir, &name, bits)?;
                println!("Private key: {}", files.private_key.display());
                println!("Public key:  {}", files.public_key.display());
            }
            Ok(())
        }
    }
}

/// Sets up the tracing subscriber.
///
/// `RUST_LOG` wins over `--verbose`, which wins over the configured level.
/// With `logging.log_dir` set, events are also written to a daily file.
fn init_logging(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    let (file_layer, guard) = match &config.logging.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "chatd.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(guard)
}

async fn run_server(config: &Config) -> anyhow::Result<()> {
    let private_key = keystore::load_private_key(&config.server.private_key)?;
    let registry = Arc::new(UserRegistry::load(&config.server.users_dir)?);
    if registry.is_empty() {
        tracing::warn!(
            dir = %config.server.users_dir.display(),
            "No registered users, every login will be rejected"
        );
    }

    let settings = ServerSettings {
        session: config.channel.session_options(),
        handshake_timeout: config.server.handshake_timeout(),
    };
    let server = ChatServer::bind(
        config.server.listen_addr,
        private_key,
        registry,
        EchoHandler,
        settings,
    )
    .await
    .with_context(|| format!("Failed to listen on {}", config.server.listen_addr))?;

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        shutdown.cancel();
    });

    server.run().await?;
    Ok(())
}

async fn run_client(config: &Config) -> anyhow::Result<()> {
    let client = &config.client;
    if client.username.is_empty() {
        bail!("No username: set client.username or pass --username");
    }
    let private_key = keystore::load_private_key(&client.private_key)?;
    let server_key = keystore::load_public_key(&client.server_public_key)?;

    let credentials = Credentials {
        username: &client.username,
        private_key: &private_key,
        server_key: &server_key,
    };
    let connection = ChatClient::connect(
        &client.server_addr,
        credentials,
        config.channel.session_options(),
        &[],
    )
    .await
    .with_context(|| format!("Failed to log in to {}", client.server_addr))?;
    let connection = Arc::new(connection);

    let printer = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move {
            loop {
                match connection.read_unclaimed().await {
                    Ok(Some(line)) => println!("{}", line),
                    Ok(None) => {
                        match connection.splitter().termination() {
                            Some(reason) => {
                                tracing::error!(error = %reason, "Connection to server failed")
                            }
                            None => tracing::debug!("Server connection closed"),
                        }
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to read from server");
                        break;
                    }
                }
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = wait_for_shutdown_signal() => break,
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) => connection.send(&line).await?,
                None => break,
            }
        }
    }

    connection.close().await?;
    join_logged(printer, "printer").await;
    Ok(())
}

/// Waits for a background task, logging it if it panicked or was cancelled.
async fn join_logged(task: tokio::task::JoinHandle<()>, name: &str) -> bool {
    match task.await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(task = name, error = %e, "Background task failed");
            false
        }
    }
}

async fn run_receiver(config: &Config) -> anyhow::Result<()> {
    let key = keystore::load_shared_secret(&config.private.secret_key)?;
    let (tx, mut rx) = mpsc::channel(32);
    let receiver = PrivateMessageReceiver::bind(config.private.listen_addr, key, tx)
        .await
        .with_context(|| format!("Failed to listen on {}", config.private.listen_addr))?;

    let shutdown = receiver.shutdown_token();
    let running = tokio::spawn(receiver.run());

    loop {
        tokio::select! {
            _ = wait_for_shutdown_signal() => break,
            message = rx.recv() => match message {
                Some(message) if message.authentic => println!("{}", message.body),
                Some(message) => println!("[tampered] {}", message.body),
                None => break,
            }
        }
    }

    shutdown.cancel();
    running.await.context("Receiver task panicked")??;
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let sigterm = signal(SignalKind::terminate());
    let sigint = signal(SignalKind::interrupt());
    match (sigterm, sigint) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                _ = sigint.recv() => tracing::info!("Received SIGINT"),
            }
        }
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(error = %e, "Failed to register signal handlers, using Ctrl-C only");
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl-C");
            }
        }
    }
}

/// Wait for Ctrl-C.
#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("Received Ctrl-C");
    }
}
