//! sessionkeep - command-line front end for the session manager.
//!
//! Logs in against the configured token service, shows who is signed in
//! and ends sessions. Tokens survive between runs through the configured
//! storage strategy; the identity through the encrypted snapshot.

use std::io::{self, Write};

use anyhow::{Context, Result};
use chrono::Local;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sessionkeep_core::auth::{self, token};
use sessionkeep_core::config::APP_NAME;
use sessionkeep_core::crypto::PassphraseStore;
use sessionkeep_core::{Config, Credential, LoginCredentials, SessionManager};

const USAGE: &str = "\
Usage: sessionkeep <command>

Commands:
  login [email]   Log in (prompts for the password)
  logout          End the session
  whoami          Show the signed-in user
  profile         Re-fetch the profile from the server
  status          Show token storage and expiry
  forget          Remove the snapshot and its keychain passphrase
";

/// Initialize the tracing subscriber for logging
fn init_tracing() -> tracing_appender::non_blocking::WorkerGuard {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let (writer, guard) = tracing_appender::non_blocking(io::stderr());

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer))
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprint!("{}", USAGE);
        std::process::exit(2);
    };

    let mut config = Config::load()?;
    debug!(api_url = %config.api_url, storage = ?config.token_storage, "Configuration loaded");

    match command.as_str() {
        "login" => login(&mut config, args.get(1).cloned()).await,
        "logout" => logout(&config).await,
        "whoami" => whoami(&config).await,
        "profile" => profile(&config).await,
        "status" => status(&config).await,
        "forget" => forget(&config),
        "-h" | "--help" | "help" => {
            print!("{}", USAGE);
            Ok(())
        }
        other => {
            eprintln!("Unknown command '{}'\n", other);
            eprint!("{}", USAGE);
            std::process::exit(2);
        }
    }
}

async fn open_session(config: &Config) -> Result<SessionManager> {
    let session = SessionManager::new(config)?;
    session.initialize().await;
    Ok(session)
}

async fn login(config: &mut Config, email: Option<String>) -> Result<()> {
    let email = match email {
        Some(email) => email,
        None => prompt_email(config.last_email.as_deref())?,
    };
    let password = rpassword::prompt_password("Password: ").context("Failed to read password")?;

    let session = open_session(config).await?;
    let identity = session
        .login(&LoginCredentials::new(email.clone(), password))
        .await?;

    if let Err(e) = config.remember_email(&email) {
        debug!(error = %e, "Could not save last email");
    }
    info!(user = %identity.email, "Login complete");
    println!("Logged in as {} <{}>", identity.label(), identity.email);
    Ok(())
}

fn prompt_email(last: Option<&str>) -> Result<String> {
    match last {
        Some(last) => print!("Email [{}]: ", last),
        None => print!("Email: "),
    }
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    let entered = line.trim();
    match (entered.is_empty(), last) {
        (false, _) => Ok(entered.to_string()),
        (true, Some(last)) => Ok(last.to_string()),
        (true, None) => anyhow::bail!("An email address is required"),
    }
}

async fn logout(config: &Config) -> Result<()> {
    let session = open_session(config).await?;
    session.logout().await;
    println!("Logged out");
    Ok(())
}

async fn whoami(config: &Config) -> Result<()> {
    let session = open_session(config).await?;
    match session.identity() {
        Some(identity) => {
            println!("{} <{}>", identity.label(), identity.email);
            println!("id: {}", identity.id);
            if !identity.roles.is_empty() {
                println!("roles: {}", identity.roles.join(", "));
            }
        }
        None => println!("Not logged in"),
    }
    Ok(())
}

async fn profile(config: &Config) -> Result<()> {
    let session = open_session(config).await?;
    match session.refresh_profile().await? {
        Some(identity) => println!("{}", serde_json::to_string_pretty(&identity)?),
        None => println!("Not logged in"),
    }
    Ok(())
}

async fn status(config: &Config) -> Result<()> {
    let session = open_session(config).await?;
    let store = session.store();

    println!("service:  {}", config.api_url);
    println!("storage:  {:?}", store.kind());
    println!(
        "snapshot: {}",
        if config.snapshot.enabled { "enabled" } else { "disabled" }
    );

    match store.access_token() {
        Some(Credential::Bearer(access)) => {
            let expiry = token::expires_at(&access)
                .map(|at| at.with_timezone(&Local).to_rfc2822())
                .unwrap_or_else(|| "unknown".to_string());
            match auth::seconds_until_expiry(&access) {
                Some(secs) if secs > 0 => println!("access:   valid for {}s (until {})", secs, expiry),
                _ => println!("access:   expired ({})", expiry),
            }
        }
        Some(Credential::Cookie) => println!("access:   held in server cookies"),
        None => println!("access:   none"),
    }
    println!(
        "refresh:  {}",
        if store.refresh_token().is_some() { "present" } else { "none" }
    );
    println!(
        "user:     {}",
        session
            .identity()
            .map(|identity| identity.email)
            .unwrap_or_else(|| "-".to_string())
    );
    Ok(())
}

fn forget(config: &Config) -> Result<()> {
    let path = config.snapshot_path()?;
    match std::fs::remove_file(&path) {
        Ok(()) => println!("Removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
    PassphraseStore::delete(APP_NAME)?;
    println!("Snapshot passphrase removed from keychain");
    Ok(())
}
