use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;

use blitz_client::config;
use blitz_client::logging::init_logging;
use blitz_client::proxy::TypedProxy;
use blitz_client::server::LoopbackServer;
use blitz_client::{Client, InitData, UploadOptions};

#[derive(Parser, Debug)]
#[command(name = "blitz-client", version, about = "Log in to a blitz router and upload files")]
struct Cli {
    /// TOML property file
    #[arg(long, env = "BLITZ_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Set a property, e.g. -p Blitz.Default.Router=blitz/router@host:4064
    #[arg(short = 'p', long = "property", value_name = "KEY=VALUE", global = true)]
    properties: Vec<String>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct Credentials {
    /// Username (falls back to blitz.user)
    #[arg(short = 'u', long)]
    user: Option<String>,

    /// Password (falls back to blitz.pass)
    #[arg(short = 'w', long)]
    password: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a session and close it again
    Login {
        #[command(flatten)]
        credentials: Credentials,
    },
    /// Upload a file and print the stored record
    Upload {
        file: PathBuf,

        /// Format tag for the stored file
        #[arg(long)]
        format: Option<String>,

        /// Display name (defaults to the file name)
        #[arg(long)]
        name: Option<String>,

        /// Remote path (defaults to the absolute local path)
        #[arg(long)]
        path: Option<String>,

        /// Print the record as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        credentials: Credentials,
    },
    /// Run the in-memory loopback backend over TCP
    Serve {
        #[arg(long, default_value = "127.0.0.1:4064")]
        listen: String,

        /// USER:PASS, may be repeated
        #[arg(long = "account", value_name = "USER:PASS")]
        accounts: Vec<String>,
    },
}

/// Expand tilde (~) in paths to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        }
    } else {
        path.to_path_buf()
    }
}

/// Turn CLI options into communicator arguments.
fn communicator_args(cli: &Cli) -> Result<Vec<String>> {
    let mut args = Vec::new();
    if let Some(path) = &cli.config {
        args.push(format!(
            "--{}={}",
            config::CONFIG_FILE,
            expand_tilde(path).display()
        ));
    }
    for prop in &cli.properties {
        let (key, value) = prop
            .split_once('=')
            .with_context(|| format!("invalid property '{}', expected KEY=VALUE", prop))?;
        args.push(format!("--{}={}", key.trim(), value));
    }
    Ok(args)
}

fn parse_account(account: &str) -> Result<(String, String)> {
    let (user, pass) = account
        .split_once(':')
        .with_context(|| format!("invalid account '{}', expected USER:PASS", account))?;
    if user.is_empty() {
        anyhow::bail!("invalid account '{}': empty username", account);
    }
    Ok((user.to_string(), pass.to_string()))
}

async fn login(args: &[String], credentials: &Credentials) -> Result<Client> {
    let mut client = Client::new(args, InitData::default()).context("failed to initialize client")?;
    client
        .create_session(credentials.user.as_deref(), credentials.password.as_deref())
        .await
        .context("login failed")?;
    Ok(client)
}

async fn run(cli: Cli) -> Result<()> {
    let args = communicator_args(&cli)?;

    match cli.command {
        Command::Login { credentials } => {
            let mut client = login(&args, &credentials).await?;
            let session = client
                .session()
                .map(|s| s.object().identity().to_string())
                .unwrap_or_default();
            client.close_session().await.context("failed to close session")?;
            println!("Login OK (session {})", session);
        }
        Command::Upload {
            file,
            format,
            name,
            path,
            json,
            credentials,
        } => {
            let file = expand_tilde(&file);
            let mut client = login(&args, &credentials).await?;

            let options = UploadOptions {
                name,
                path,
                format,
                file: None,
            };
            let result = client.upload(&file, options).await;
            // Tear the session down even when the upload failed.
            let closed = client.close_session().await;
            let record = result.with_context(|| format!("upload of {} failed", file.display()))?;
            closed.context("failed to close session")?;

            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                println!(
                    "{}: id={} size={} checksum={}",
                    file.display(),
                    record.id.unwrap_or_default(),
                    record.size.unwrap_or_default(),
                    record.checksum.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Serve { listen, accounts } => {
            let mut server = LoopbackServer::new();
            for account in &accounts {
                let (user, pass) = parse_account(account)?;
                server = server.with_account(user, pass);
            }
            if accounts.is_empty() {
                tracing::warn!("no accounts configured; every login will be rejected");
            }

            let listener = TcpListener::bind(&listen)
                .await
                .with_context(|| format!("cannot listen on {}", listen))?;
            tokio::select! {
                res = server.listen(listener) => res?,
                _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;
    run(cli).await
}
