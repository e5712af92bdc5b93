//! Micropost CLI - a thin shell over the session core.
//!
//! Useful for exercising the session lifecycle and the authorized request
//! pipeline against a running server without the mobile app.

use std::io::{self, Write};

use anyhow::{bail, Result};
use micropost_core::{ApiClient, ApiError, Config, CredentialStore as _, LoginCredentials, SessionNotice};
use serde_json::Value;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const USAGE: &str = "\
Usage: micropost <command>

Commands:
  status                      Show the current session
  login <email> [--remember]  Sign in (password is prompted)
  logout                      Sign out and forget stored credentials
  whoami                      Ask the server who is signed in
  get <path>                  GET an API path and print the JSON response

Environment:
  MICROPOST_API_URL           API base URL
  MICROPOST_STORE             keyring | encrypted_file | memory
  MICROPOST_VAULT_PASSPHRASE  Passphrase for the encrypted credential file
  RUST_LOG                    Log filter (default: warn)";

/// Log to stderr and, when a cache directory exists, to a daily file.
/// Keep the returned guard alive until exit so buffered lines are flushed.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr = fmt::layer().with_writer(io::stderr);

    let file = Config::log_dir().and_then(|dir| {
        std::fs::create_dir_all(&dir).ok()?;
        let appender = tracing_appender::rolling::daily(dir, "micropost.log");
        Some(tracing_appender::non_blocking(appender))
    });

    match file {
        Some((writer, guard)) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        println!("{}", USAGE);
        return Ok(());
    };
    if matches!(command, "-h" | "--help" | "help") {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = Config::load()?.apply_env()?;
    let store = config.build_store()?;
    info!(store = store.name(), api = %config.api_base_url, "micropost starting");

    let client = ApiClient::new(&config, store)?;
    client.initialize().await;

    match command {
        "status" => status(&client),
        "login" => login(&client, &args[1..]).await,
        "logout" => {
            client.logout().await;
            println!("Signed out.");
            Ok(())
        }
        "whoami" => {
            let user = client.who_am_i().await?;
            println!("{}", serde_json::to_string_pretty(&user)?);
            Ok(())
        }
        "get" => {
            let Some(path) = args.get(1) else {
                bail!("Usage: micropost get <path>");
            };
            let body: Value = client.get(path).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}\n\n{}", other, USAGE);
            std::process::exit(2);
        }
    }
}

fn status(client: &ApiClient) -> Result<()> {
    let session = client.snapshot();
    if session.notice == Some(SessionNotice::Expired) {
        println!("Your session expired. Please sign in again.");
    }
    println!("{}", serde_json::to_string_pretty(&session)?);
    if client.session().is_memory_only() {
        warn!("Credential storage unavailable; this session will not survive a restart");
    }
    Ok(())
}

async fn login(client: &ApiClient, args: &[String]) -> Result<()> {
    let remember = args.iter().any(|a| a == "--remember");
    let email = match args.iter().find(|a| !a.starts_with("--")) {
        Some(email) => email.clone(),
        None => prompt_email()?,
    };
    let password = rpassword::prompt_password("Password: ")?;
    if email.is_empty() || password.is_empty() {
        bail!("Email and password required");
    }

    match client
        .login(&LoginCredentials::new(email, password, remember))
        .await
    {
        Ok(user) => {
            match user {
                Some(user) => println!("Signed in as {} <{}>.", user.name, user.email),
                None => println!("Signed in."),
            }
            if remember && client.session().is_memory_only() {
                println!("Note: credentials could not be saved; you will need to sign in again next time.");
            }
            Ok(())
        }
        Err(ApiError::Validation(fields)) => {
            for (field, messages) in &fields {
                for message in messages {
                    eprintln!("{} {}", field, message);
                }
            }
            bail!("Login failed")
        }
        Err(ApiError::Rejected(messages)) => {
            for message in &messages {
                eprintln!("{}", message);
            }
            bail!("Login failed")
        }
        Err(e) => Err(e.into()),
    }
}

fn prompt_email() -> Result<String> {
    print!("Email: ");
    io::stdout().flush()?;

    let mut email = String::new();
    io::stdin().read_line(&mut email)?;
    Ok(email.trim().to_string())
}
