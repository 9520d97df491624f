use crate::db::*;
use crate::error::{AppError, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::Arc;

const USER_COLUMNS: &str =
    "id, name, email, password_hash, text_hint, hashed_passphrase, role, created_at, last_login";

const PUBLICATION_COLUMNS: &str =
    "id, title, content_type, date_published, description, cover_url, created_at";

/// Transaction joined with its user and publication.
const TRANSACTION_DETAIL_SELECT: &str = "SELECT
        t.id, t.user_id, t.publication_id, t.licence_id, t.created_at, t.updated_at,
        u.id, u.name, u.email, u.password_hash, u.text_hint, u.hashed_passphrase, u.role,
        u.created_at, u.last_login,
        p.id, p.title, p.content_type, p.date_published, p.description, p.cover_url, p.created_at
     FROM transactions t
     JOIN users u ON u.id = t.user_id
     JOIN publications p ON p.id = t.publication_id";

/// Database wrapper for thread-safe access.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| AppError::Internal(format!("Failed to open database: {}", e)))?;

        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))
            .map_err(|e| AppError::Internal(format!("Failed to enable WAL: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_schema()?;
        Ok(db)
    }

    /// Open in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AppError::Internal(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_schema()?;
        Ok(db)
    }

    /// Initialize database schema.
    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            -- Users table
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                email TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                text_hint TEXT NOT NULL,
                hashed_passphrase TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'user',
                created_at INTEGER NOT NULL,
                last_login INTEGER
            );

            -- Sessions table
            CREATE TABLE IF NOT EXISTS sessions (
                token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            -- Publications table
            CREATE TABLE IF NOT EXISTS publications (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                content_type TEXT NOT NULL,
                date_published TEXT,
                description TEXT,
                cover_url TEXT,
                created_at INTEGER NOT NULL
            );

            -- Transactions table (one row per acquired license)
            CREATE TABLE IF NOT EXISTS transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                publication_id TEXT NOT NULL,
                licence_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (publication_id) REFERENCES publications(id) ON DELETE CASCADE
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_expires ON sessions(expires_at);
            CREATE INDEX IF NOT EXISTS idx_publications_title ON publications(title);
            CREATE INDEX IF NOT EXISTS idx_transactions_licence ON transactions(licence_id);
            CREATE INDEX IF NOT EXISTS idx_transactions_user_pub
                ON transactions(user_id, publication_id, created_at);
            "#,
        )
        .map_err(|e| AppError::Internal(format!("Failed to initialize schema: {}", e)))?;

        Ok(())
    }

    fn row_to_user(row: &Row<'_>, at: usize) -> rusqlite::Result<User> {
        Ok(User {
            id: row.get(at)?,
            name: row.get(at + 1)?,
            email: row.get(at + 2)?,
            password_hash: row.get(at + 3)?,
            text_hint: row.get(at + 4)?,
            hashed_passphrase: row.get(at + 5)?,
            role: row.get(at + 6)?,
            created_at: row.get(at + 7)?,
            last_login: row.get(at + 8)?,
        })
    }

    fn row_to_publication(row: &Row<'_>, at: usize) -> rusqlite::Result<Publication> {
        Ok(Publication {
            id: row.get(at)?,
            title: row.get(at + 1)?,
            content_type: row.get(at + 2)?,
            date_published: row.get(at + 3)?,
            description: row.get(at + 4)?,
            cover_url: row.get(at + 5)?,
            created_at: row.get(at + 6)?,
        })
    }

    fn row_to_transaction_detail(row: &Row<'_>) -> rusqlite::Result<TransactionDetail> {
        Ok(TransactionDetail {
            transaction: Transaction {
                id: row.get(0)?,
                user_id: row.get(1)?,
                publication_id: row.get(2)?,
                licence_id: row.get(3)?,
                created_at: row.get(4)?,
                updated_at: row.get(5)?,
            },
            user: Self::row_to_user(row, 6)?,
            publication: Self::row_to_publication(row, 15)?,
        })
    }

    // ========== USER OPERATIONS ==========

    /// Create a new user.
    pub fn create_user(&self, user: &User) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!("INSERT INTO users ({USER_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
            params![
                user.id,
                user.name,
                user.email,
                user.password_hash,
                user.text_hint,
                user.hashed_passphrase,
                user.role,
                user.created_at,
                user.last_login,
            ],
        )
        .map_err(|e| {
            if e.to_string().contains("UNIQUE constraint") {
                AppError::InvalidFormat(format!("Email '{}' already registered", user.email))
            } else {
                AppError::Internal(format!("Failed to create user: {}", e))
            }
        })?;
        Ok(())
    }

    /// Get user by email.
    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
            params![email],
            |row| Self::row_to_user(row, 0),
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get user: {}", e)))
    }

    /// Get user by ID.
    pub fn get_user_by_id(&self, id: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            params![id],
            |row| Self::row_to_user(row, 0),
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get user: {}", e)))
    }

    /// List all users.
    pub fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY email"))
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let users = stmt
            .query_map([], |row| Self::row_to_user(row, 0))
            .map_err(|e| AppError::Internal(format!("Failed to list users: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect users: {}", e)))?;

        Ok(users)
    }

    /// Update user password.
    pub fn update_user_password(&self, email: &str, password_hash: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE users SET password_hash = ?1 WHERE email = ?2",
                params![password_hash, email],
            )
            .map_err(|e| AppError::Internal(format!("Failed to update password: {}", e)))?;
        Ok(rows > 0)
    }

    /// Update user LCP passphrase hash and hint.
    pub fn update_user_passphrase(
        &self,
        email: &str,
        hashed_passphrase: &str,
        text_hint: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE users SET hashed_passphrase = ?1, text_hint = ?2 WHERE email = ?3",
                params![hashed_passphrase, text_hint, email],
            )
            .map_err(|e| AppError::Internal(format!("Failed to update passphrase: {}", e)))?;
        Ok(rows > 0)
    }

    /// Update user last login.
    pub fn update_user_last_login(&self, user_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET last_login = ?1 WHERE id = ?2",
            params![now_timestamp(), user_id],
        )
        .map_err(|e| AppError::Internal(format!("Failed to update last login: {}", e)))?;
        Ok(())
    }

    /// Delete user. Its sessions and transactions go with it.
    pub fn delete_user(&self, email: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute("DELETE FROM users WHERE email = ?1", params![email])
            .map_err(|e| AppError::Internal(format!("Failed to delete user: {}", e)))?;
        Ok(rows > 0)
    }

    // ========== SESSION OPERATIONS ==========

    /// Create session.
    pub fn create_session(&self, session: &Session) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (token, user_id, expires_at) VALUES (?1, ?2, ?3)",
            params![session.token, session.user_id, session.expires_at],
        )
        .map_err(|e| AppError::Internal(format!("Failed to create session: {}", e)))?;
        Ok(())
    }

    /// Get session by token.
    pub fn get_session(&self, token: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT token, user_id, expires_at FROM sessions WHERE token = ?1",
            params![token],
            |row| {
                Ok(Session {
                    token: row.get(0)?,
                    user_id: row.get(1)?,
                    expires_at: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get session: {}", e)))
    }

    /// Delete session.
    pub fn delete_session(&self, token: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM sessions WHERE token = ?1", params![token])
            .map_err(|e| AppError::Internal(format!("Failed to delete session: {}", e)))?;
        Ok(())
    }

    /// Remove expired sessions.
    pub fn cleanup_expired_sessions(&self) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM sessions WHERE expires_at < ?1",
            params![now_timestamp()],
        )
        .map_err(|e| AppError::Internal(format!("Failed to cleanup sessions: {}", e)))
    }

    // ========== PUBLICATION OPERATIONS ==========

    /// Create a publication.
    pub fn create_publication(&self, publication: &Publication) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO publications ({PUBLICATION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            ),
            params![
                publication.id,
                publication.title,
                publication.content_type,
                publication.date_published,
                publication.description,
                publication.cover_url,
                publication.created_at,
            ],
        )
        .map_err(|e| {
            if e.to_string().contains("UNIQUE constraint") {
                AppError::InvalidFormat(format!("Publication '{}' already exists", publication.id))
            } else {
                AppError::Internal(format!("Failed to create publication: {}", e))
            }
        })?;
        Ok(())
    }

    /// Get publication by ID.
    pub fn get_publication(&self, id: &str) -> Result<Option<Publication>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {PUBLICATION_COLUMNS} FROM publications WHERE id = ?1"),
            params![id],
            |row| Self::row_to_publication(row, 0),
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get publication: {}", e)))
    }

    /// List all publications, by title.
    pub fn list_publications(&self) -> Result<Vec<Publication>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {PUBLICATION_COLUMNS} FROM publications ORDER BY title COLLATE NOCASE"
            ))
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let publications = stmt
            .query_map([], |row| Self::row_to_publication(row, 0))
            .map_err(|e| AppError::Internal(format!("Failed to list publications: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect publications: {}", e)))?;

        Ok(publications)
    }

    /// Delete a publication. Its transactions go with it.
    pub fn delete_publication(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute("DELETE FROM publications WHERE id = ?1", params![id])
            .map_err(|e| AppError::Internal(format!("Failed to delete publication: {}", e)))?;
        Ok(rows > 0)
    }

    // ========== TRANSACTION OPERATIONS ==========

    /// Record a newly acquired license.
    ///
    /// Fails when the user or the publication does not exist.
    pub fn create_transaction(
        &self,
        user_id: &str,
        publication_id: &str,
        licence_id: &str,
    ) -> Result<Transaction> {
        let conn = self.conn.lock();
        let now = now_timestamp();
        conn.execute(
            "INSERT INTO transactions (user_id, publication_id, licence_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![user_id, publication_id, licence_id, now],
        )
        .map_err(|e| AppError::Internal(format!("Failed to create transaction: {}", e)))?;

        Ok(Transaction {
            id: conn.last_insert_rowid(),
            user_id: user_id.to_string(),
            publication_id: publication_id.to_string(),
            licence_id: licence_id.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Point a transaction at a license reissued under another id.
    pub fn update_transaction(&self, id: i64, licence_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE transactions SET licence_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![licence_id, now_timestamp(), id],
            )
            .map_err(|e| AppError::Internal(format!("Failed to update transaction: {}", e)))?;
        Ok(rows > 0)
    }

    /// Get the transaction holding a license id.
    pub fn get_transaction_by_licence(&self, licence_id: &str) -> Result<Option<TransactionDetail>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("{TRANSACTION_DETAIL_SELECT} WHERE t.licence_id = ?1 ORDER BY t.id DESC"),
            params![licence_id],
            Self::row_to_transaction_detail,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get transaction: {}", e)))
    }

    /// Get the latest transaction of a user for a publication.
    pub fn get_transaction_by_user_and_publication(
        &self,
        user_id: &str,
        publication_id: &str,
    ) -> Result<Option<TransactionDetail>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "{TRANSACTION_DETAIL_SELECT}
                 WHERE t.user_id = ?1 AND t.publication_id = ?2
                 ORDER BY t.created_at DESC, t.id DESC"
            ),
            params![user_id, publication_id],
            Self::row_to_transaction_detail,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get transaction: {}", e)))
    }

    /// List the transactions of a user, latest first.
    pub fn list_transactions_by_user(&self, user_id: &str) -> Result<Vec<TransactionDetail>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "{TRANSACTION_DETAIL_SELECT}
                 WHERE t.user_id = ?1
                 ORDER BY t.created_at DESC, t.id DESC"
            ))
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let transactions = stmt
            .query_map(params![user_id], Self::row_to_transaction_detail)
            .map_err(|e| AppError::Internal(format!("Failed to list transactions: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect transactions: {}", e)))?;

        Ok(transactions)
    }

    /// Hard delete a transaction. The remote license is left untouched.
    pub fn delete_transaction(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute("DELETE FROM transactions WHERE id = ?1", params![id])
            .map_err(|e| AppError::Internal(format!("Failed to delete transaction: {}", e)))?;
        Ok(rows > 0)
    }
}
