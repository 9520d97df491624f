mod schema;

pub use schema::Database;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Unique user ID (UUID).
    pub id: String,
    /// Display name.
    pub name: String,
    /// Email, used to log in and sent to the License Server.
    pub email: String,
    /// Argon2 password hash.
    #[serde(skip_serializing)]
    pub password_hash: String,
    /// LCP passphrase hint.
    pub text_hint: String,
    /// Hex SHA-256 of the LCP passphrase.
    #[serde(skip_serializing)]
    pub hashed_passphrase: String,
    /// User role: "admin" or "user".
    pub role: String,
    /// Account creation timestamp.
    pub created_at: i64,
    /// Last login timestamp.
    pub last_login: Option<i64>,
}

/// Authentication session.
#[derive(Debug, Clone)]
pub struct Session {
    /// Session token.
    pub token: String,
    /// User ID.
    pub user_id: String,
    /// Expiration timestamp.
    pub expires_at: i64,
}

/// Catalog entry a license can be acquired for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Publication {
    /// Publication UUID, shared with the License Server.
    pub id: String,
    /// Title.
    pub title: String,
    /// Media type of the protected publication.
    pub content_type: String,
    /// Publication date as given by the publisher.
    pub date_published: Option<String>,
    /// Description.
    pub description: Option<String>,
    /// Cover image URL.
    pub cover_url: Option<String>,
    /// Creation timestamp.
    pub created_at: i64,
}

/// Entitlement: binds a user and a publication to a License Server license.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Surrogate ID.
    pub id: i64,
    /// Owning user.
    pub user_id: String,
    /// Entitled publication.
    pub publication_id: String,
    /// License identifier on the License Server.
    pub licence_id: String,
    /// Creation timestamp.
    pub created_at: i64,
    /// Last update timestamp.
    pub updated_at: i64,
}

/// Transaction with its user and publication loaded.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionDetail {
    /// The transaction row.
    pub transaction: Transaction,
    /// Owning user.
    pub user: User,
    /// Entitled publication.
    pub publication: Publication,
}

/// Timestamp helper.
pub fn now_timestamp() -> i64 {
    Utc::now().timestamp()
}

/// Convert timestamp to DateTime.
pub fn timestamp_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_else(Utc::now)
}
