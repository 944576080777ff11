//! keyward - command-line front end for a keyward session.
//!
//! Logs in against the configured auth API, keeps the session in the
//! encrypted vault between runs, and issues authenticated GET requests.

use std::io::{self, Write};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use keyward_core::{ApiRequest, AuthClient, Config, ExecuteError, KeyProtection, SessionState};

const USAGE: &str = "usage: keyward <login [email] | status | get <path> | logout>";

/// Log file name prefix inside the data directory
const LOG_FILE_PREFIX: &str = "keyward.log";

/// Initialize the tracing subscriber for logging.
///
/// Use RUST_LOG to control the level (e.g. RUST_LOG=keyward_core=debug).
/// Output goes to stderr and to a daily log file when the data directory
/// is available.
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match config.data_dir() {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir.join("logs"), LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

enum Command {
    Login { email: Option<String> },
    Status,
    Get { path: String },
    Logout,
}

fn parse_args(args: &[String]) -> Result<Command> {
    match args.first().map(String::as_str) {
        Some("login") => Ok(Command::Login {
            email: args.get(1).cloned(),
        }),
        Some("status") => Ok(Command::Status),
        Some("get") => match args.get(1) {
            Some(path) => Ok(Command::Get { path: path.clone() }),
            None => bail!("missing path\n{}", USAGE),
        },
        Some("logout") => Ok(Command::Logout),
        _ => bail!(USAGE),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let mut config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config, using defaults: {}", e);
            Config::default()
        }
    };
    let _log_guard = init_tracing(&config);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;

    let client = AuthClient::new(&config).context("Failed to open session store")?;
    if client.key_protection() == KeyProtection::Fallback {
        warn!("OS keychain unavailable; vault key is protected by a passphrase file");
    }
    client.on_session_invalid(|event| {
        eprintln!("Session ended: {}", event.reason());
    });

    let result = match command {
        Command::Login { email } => login(&client, &mut config, email).await,
        Command::Status => status(&client).await,
        Command::Get { path } => get(&client, &path).await,
        Command::Logout => logout(&client).await,
    };

    client.shutdown().await;
    result
}

async fn login(client: &AuthClient, config: &mut Config, email: Option<String>) -> Result<()> {
    let email = match email.or_else(|| config.last_email.clone()) {
        Some(email) => email,
        None => prompt_email()?,
    };
    let password = rpassword::prompt_password("Password: ").context("Failed to read password")?;

    let session = client
        .login(&email, &password)
        .await
        .context("Login failed")?;
    info!(session_id = %session.id(), "Logged in");

    config.last_email = Some(email);
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }

    println!("Logged in as {}", session.user_id());
    Ok(())
}

fn prompt_email() -> Result<String> {
    print!("Email: ");
    io::stdout().flush()?;

    let mut email = String::new();
    io::stdin().read_line(&mut email)?;
    let email = email.trim().to_string();
    if email.is_empty() {
        bail!("Email required");
    }
    Ok(email)
}

async fn status(client: &AuthClient) -> Result<()> {
    let state = client
        .restore_session()
        .await
        .context("Failed to read session")?;

    match client.current_session().await? {
        Some(session) if state == SessionState::Active => {
            let metadata = &session.metadata;
            println!("Session:       active");
            println!("User:          {}", metadata.user_id);
            println!("Started:       {}", metadata.created_at.to_rfc3339());
            println!("Last activity: {}", metadata.last_activity_at.to_rfc3339());
            println!("Expires:       {}", metadata.expires_at.to_rfc3339());
            if let Some(exp) = session.credential.access_token_expires_at() {
                println!("Access token:  expires {}", exp.to_rfc3339());
            }
        }
        _ => println!("Not logged in"),
    }
    println!("Key storage:   {}", describe_protection(client.key_protection()));
    Ok(())
}

fn describe_protection(protection: KeyProtection) -> &'static str {
    match protection {
        KeyProtection::Platform => "OS keychain",
        KeyProtection::Fallback => "passphrase-wrapped key file",
        KeyProtection::Ephemeral => "memory only",
    }
}

async fn get(client: &AuthClient, path: &str) -> Result<()> {
    if client.restore_session().await? != SessionState::Active {
        bail!("Not logged in. Run `keyward login` first.");
    }
    client.update_activity().await;

    let response = match client.execute(&ApiRequest::get(path)).await {
        Ok(response) => response,
        Err(ExecuteError::ReauthenticationRequired { .. }) => {
            bail!("Session expired. Run `keyward login` again.")
        }
        Err(ExecuteError::RefreshUnavailable(e)) => {
            bail!("Could not reach the auth server to renew the session: {}", e)
        }
        Err(e) => return Err(e).context("Request failed"),
    };

    let status = response.status();
    let body = response.text().await.context("Failed to read response body")?;
    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", body),
    }
    if !status.is_success() {
        bail!("Server returned {}", status);
    }
    Ok(())
}

async fn logout(client: &AuthClient) -> Result<()> {
    if client.restore_session().await? == SessionState::NoSession {
        println!("Not logged in");
        return Ok(());
    }
    client.logout().await.context("Failed to clear session")?;
    println!("Logged out");
    Ok(())
}
