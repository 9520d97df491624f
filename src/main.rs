//! pubstore-rs server entry point.

use clap::Parser;
use pubstore_rs::{
    auth::{AuthService, NewUser},
    config::{Cli, Command, Config, PublicationCommand, UserCommand},
    db::{Database, Publication, now_timestamp, timestamp_to_datetime},
    server,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often expired sessions are purged.
const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Find or load config
    let config_path = cli.config.clone().or_else(Config::find_config_file);

    let config = if let Some(ref path) = config_path {
        Config::load(path)?
    } else {
        Config::default()
    };

    // Handle command
    match cli.command {
        Some(Command::Init { force }) => cmd_init(force).await,
        Some(Command::User { action }) => cmd_user(action, &config).await,
        Some(Command::Publication { action }) => cmd_publication(action, &config).await,
        Some(Command::Serve { bind }) => cmd_serve(config, bind).await,
        None => {
            // Default: start server
            cmd_serve(config, None).await
        }
    }
}

/// Initialize config and database.
async fn cmd_init(force: bool) -> anyhow::Result<()> {
    let config_path = PathBuf::from("config.toml");

    if config_path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    // Write default config
    std::fs::write(&config_path, Config::generate_default())?;
    println!("Created config file: {}", config_path.display());

    // Initialize database
    let config = Config::default();
    let _db = Database::open(&config.database.path)?;
    println!("Initialized database: {}", config.database.path.display());

    println!("\nEdit config.toml to point at your License Server.");
    println!("Then run: pubstore-rs user add <email> --role admin");
    println!("And: pubstore-rs publication add <uuid> --title <title>");

    Ok(())
}

/// User management commands.
async fn cmd_user(action: UserCommand, config: &Config) -> anyhow::Result<()> {
    let db = Database::open(&config.database.path)?;
    let auth = AuthService::new(
        db,
        config.auth.session_days,
        config.auth.registration_enabled(),
    );

    match action {
        UserCommand::Add {
            email,
            name,
            password,
            passphrase,
            hint,
            role,
        } => {
            let password = match password {
                Some(p) => p,
                None => prompt_secret("Password: ")?,
            };
            let passphrase = match passphrase {
                Some(p) => p,
                None => prompt_secret("LCP passphrase: ")?,
            };

            let user = auth.create_user(&NewUser {
                email,
                name: name.unwrap_or_default(),
                password,
                passphrase,
                hint,
                role,
            })?;
            println!(
                "Created user: {} (role: {}, id: {})",
                user.email, user.role, user.id
            );
        }

        UserCommand::Del { email } => {
            if auth.delete_user(&email)? {
                println!("Deleted user: {}", email);
            } else {
                println!("User not found: {}", email);
            }
        }

        UserCommand::List => {
            let users = auth.list_users()?;
            if users.is_empty() {
                println!("No users found.");
            } else {
                println!("{:<32} {:<10} {:<36} LAST LOGIN", "EMAIL", "ROLE", "ID");
                println!("{}", "-".repeat(92));
                for user in users {
                    let last_login = user
                        .last_login
                        .map(|ts| timestamp_to_datetime(ts).format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "never".to_string());
                    println!(
                        "{:<32} {:<10} {:<36} {}",
                        user.email, user.role, user.id, last_login
                    );
                }
            }
        }

        UserCommand::Passwd { email, password } => {
            let password = match password {
                Some(p) => p,
                None => prompt_secret("New password: ")?,
            };

            if auth.change_password(&email, &password)? {
                println!("Password changed for: {}", email);
            } else {
                println!("User not found: {}", email);
            }
        }

        UserCommand::Passphrase {
            email,
            passphrase,
            hint,
        } => {
            let passphrase = match passphrase {
                Some(p) => p,
                None => prompt_secret("New LCP passphrase: ")?,
            };

            if auth.change_passphrase(&email, &passphrase, &hint)? {
                println!("Passphrase changed for: {}", email);
                println!("Licenses acquired before keep the previous passphrase.");
            } else {
                println!("User not found: {}", email);
            }
        }
    }

    Ok(())
}

/// Publication management commands.
async fn cmd_publication(action: PublicationCommand, config: &Config) -> anyhow::Result<()> {
    let db = Database::open(&config.database.path)?;

    match action {
        PublicationCommand::Add {
            id,
            title,
            content_type,
        } => {
            let publication = Publication {
                id,
                title,
                content_type,
                date_published: None,
                description: None,
                cover_url: None,
                created_at: now_timestamp(),
            };

            db.create_publication(&publication)?;
            println!(
                "Added publication: {} ({})",
                publication.title, publication.id
            );
        }

        PublicationCommand::Del { id } => {
            if db.delete_publication(&id)? {
                println!("Deleted publication: {}", id);
            } else {
                println!("Publication not found: {}", id);
            }
        }

        PublicationCommand::List => {
            let publications = db.list_publications()?;
            if publications.is_empty() {
                println!("No publications found.");
            } else {
                println!("{:<36} {:<24} TITLE", "ID", "TYPE");
                println!("{}", "-".repeat(92));
                for publication in publications {
                    println!(
                        "{:<36} {:<24} {}",
                        publication.id, publication.content_type, publication.title
                    );
                }
            }
        }
    }

    Ok(())
}

/// Start the server.
async fn cmd_serve(mut config: Config, bind: Option<std::net::SocketAddr>) -> anyhow::Result<()> {
    // Override bind address if specified
    if let Some(addr) = bind {
        config.server.bind = addr;
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pubstore_rs=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Open database
    let db = Database::open(&config.database.path)?;

    // Create auth service
    let auth = AuthService::new(
        db.clone(),
        config.auth.session_days,
        config.auth.registration_enabled(),
    );

    tracing::info!(
        bind = %config.server.bind,
        database = %config.database.path.display(),
        license_server = %config.lcp_server.url,
        version = ?config.lcp_server.version,
        "Starting pubstore-rs server"
    );

    if config.lcp_server.username.is_empty() {
        tracing::warn!("No License Server credentials configured");
    }

    // Create application state
    let state = server::AppState::new_with_db(config.clone(), db.clone(), auth)?;

    // Purge expired sessions periodically
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SESSION_CLEANUP_INTERVAL);
        loop {
            ticker.tick().await;
            match db.cleanup_expired_sessions() {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(removed, "Expired sessions removed"),
                Err(e) => tracing::warn!(error = %e, "Session cleanup failed"),
            }
        }
    });

    // Create router
    let app = server::create_router(state);

    let listener = TcpListener::bind(config.server.bind).await?;
    tracing::info!(address = %config.server.bind, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Prompt for a secret on stdin.
fn prompt_secret(prompt: &str) -> anyhow::Result<String> {
    print!("{}", prompt);
    io::stdout().flush()?;

    let mut secret = String::new();
    io::stdin().read_line(&mut secret)?;

    Ok(secret.trim().to_string())
}
