use crate::lcp::ProtocolVersion;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Publication store brokering Readium LCP licenses.
#[derive(Parser, Debug, Clone)]
#[command(name = "pubstore-rs")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file.
    #[arg(short, long, env = "PUBSTORE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the server (default if no command given).
    Serve {
        /// Address to bind the server to.
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },

    /// User management commands.
    User {
        /// User subcommand action.
        #[command(subcommand)]
        action: UserCommand,
    },

    /// Publication management commands.
    Publication {
        /// Publication subcommand action.
        #[command(subcommand)]
        action: PublicationCommand,
    },

    /// Initialize database and create default config.
    Init {
        /// Force overwrite existing config.
        #[arg(short, long)]
        force: bool,
    },
}

/// User management subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum UserCommand {
    /// Add a new user.
    Add {
        /// Email, used to log in.
        email: String,
        /// Display name.
        #[arg(short, long)]
        name: Option<String>,
        /// Password (will prompt if not provided).
        #[arg(short, long)]
        password: Option<String>,
        /// LCP passphrase (will prompt if not provided).
        #[arg(long)]
        passphrase: Option<String>,
        /// Hint shown by reading apps when asking for the passphrase.
        #[arg(long, default_value = "Your store passphrase")]
        hint: String,
        /// User role (admin or user).
        #[arg(short, long, default_value = "user")]
        role: String,
    },

    /// Delete a user.
    Del {
        /// Email of the user to delete.
        email: String,
    },

    /// List all users.
    List,

    /// Change user password.
    Passwd {
        /// Email.
        email: String,
        /// New password (will prompt if not provided).
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Change user LCP passphrase and hint.
    Passphrase {
        /// Email.
        email: String,
        /// New passphrase (will prompt if not provided).
        #[arg(long)]
        passphrase: Option<String>,
        /// New hint.
        #[arg(long)]
        hint: String,
    },
}

/// Publication management subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum PublicationCommand {
    /// Register a publication already encrypted on the License Server.
    Add {
        /// Publication UUID, as known by the License Server.
        id: String,
        /// Title.
        #[arg(short, long)]
        title: String,
        /// Media type of the publication.
        #[arg(long, default_value = "application/epub+zip")]
        content_type: String,
    },

    /// Remove a publication and its transactions.
    Del {
        /// Publication UUID.
        id: String,
    },

    /// List all publications.
    List,
}

/// Main configuration from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Authentication configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Default license rights.
    #[serde(default)]
    pub license: LicenseConfig,

    /// License Server access.
    #[serde(default)]
    pub lcp_server: LcpServerConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Public base URL, used in OPDS links.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    /// Store title.
    #[serde(default = "default_title")]
    pub title: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            public_base_url: default_public_base_url(),
            title: default_title(),
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::new(
        std::net::IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)),
        8080,
    )
}

fn default_public_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_title() -> String {
    "Pubstore".to_string()
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/pubstore.db")
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Registration mode: "open", "disabled".
    #[serde(default = "default_registration")]
    pub registration: String,

    /// Session token duration in days.
    #[serde(default = "default_session_days")]
    pub session_days: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            registration: default_registration(),
            session_days: default_session_days(),
        }
    }
}

fn default_registration() -> String {
    "open".to_string()
}

fn default_session_days() -> u32 {
    30
}

impl AuthConfig {
    /// Check if registration is enabled.
    pub fn registration_enabled(&self) -> bool {
        self.registration == "open"
    }
}

/// Rights applied when a caller does not constrain them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseConfig {
    /// Pages a user may print.
    #[serde(default = "default_print_limit")]
    pub print_limit: u32,

    /// Characters a user may copy.
    #[serde(default = "default_copy_limit")]
    pub copy_limit: u32,

    /// Length of an OPDS loan in days.
    #[serde(default = "default_loan_days")]
    pub loan_days: u32,

    /// Concurrent status document fetches for a bookshelf.
    #[serde(default = "default_status_workers")]
    pub status_workers: usize,
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            print_limit: default_print_limit(),
            copy_limit: default_copy_limit(),
            loan_days: default_loan_days(),
            status_workers: default_status_workers(),
        }
    }
}

fn default_print_limit() -> u32 {
    10
}

fn default_copy_limit() -> u32 {
    2000
}

fn default_loan_days() -> u32 {
    7
}

fn default_status_workers() -> usize {
    4
}

/// License Server access parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LcpServerConfig {
    /// Base URL of the License Server.
    #[serde(default = "default_lcp_url")]
    pub url: String,

    /// Protocol generation: "v1" or "v2".
    #[serde(default)]
    pub version: ProtocolVersion,

    /// Basic Auth user.
    #[serde(default)]
    pub username: String,

    /// Basic Auth password.
    #[serde(default)]
    pub password: String,

    /// LCP encryption profile requested from a v2 server.
    #[serde(default = "default_profile")]
    pub profile: String,

    /// Timeout for every License Server and status document call.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for LcpServerConfig {
    fn default() -> Self {
        Self {
            url: default_lcp_url(),
            version: ProtocolVersion::default(),
            username: String::new(),
            password: String::new(),
            profile: default_profile(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

fn default_lcp_url() -> String {
    "http://localhost:8989".to_string()
}

fn default_profile() -> String {
    "http://readium.org/lcp/basic-profile".to_string()
}

fn default_timeout_seconds() -> u64 {
    10
}

impl LcpServerConfig {
    /// Timeout applied to remote calls.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }
}

impl Config {
    /// Load configuration from file.
    pub fn load(path: &PathBuf) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to read config file: {}", e))
        })?;

        toml::from_str(&content).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to parse config file: {}", e))
        })
    }

    /// Find config file in default locations.
    pub fn find_config_file() -> Option<PathBuf> {
        let candidates = [
            PathBuf::from("config.toml"),
            PathBuf::from("pubstore-rs.toml"),
            dirs::config_dir()
                .map(|p| p.join("pubstore-rs").join("config.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/pubstore-rs/config.toml"),
        ];

        candidates.into_iter().find(|p| p.exists())
    }

    /// Generate default config file content.
    pub fn generate_default() -> String {
        r#"# pubstore-rs configuration

[server]
bind = "0.0.0.0:8080"
public_base_url = "http://localhost:8080"
title = "Pubstore"

[database]
# path = "/var/lib/pubstore-rs/pubstore.db"

[auth]
# Registration mode: "open" or "disabled"
registration = "open"
# Session duration in days
session_days = 30

[license]
# Rights used when a request does not set them (negative values in requests mean unlimited)
print_limit = 10
copy_limit = 2000
# OPDS loan duration in days
loan_days = 7
# Parallel status document fetches when listing a bookshelf
status_workers = 4

[lcp_server]
url = "http://localhost:8989"
# "v1" (legacy) or "v2"
version = "v2"
username = "admin"
password = "changeme"
timeout_seconds = 10
"#
        .to_string()
    }
}
