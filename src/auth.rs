//! Authentication module.

use crate::db::{Database, Session, User, now_timestamp};
use crate::error::{AppError, Result};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use argon2::password_hash::rand_core::RngCore;
use sha2::{Digest, Sha256};

/// Hash a password using Argon2.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal(format!("Failed to hash password: {}", e)))
}

/// Verify a password against a hash.
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|e| AppError::Internal(format!("Invalid password hash: {}", e)))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// Hash an LCP passphrase the way reading apps do: lowercase hex SHA-256.
pub fn hash_passphrase(passphrase: &str) -> String {
    hex::encode(Sha256::digest(passphrase.as_bytes()))
}

/// Generate a secure random token.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Account to create.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct NewUser {
    /// Email, used to log in.
    pub email: String,
    /// Display name. Defaults to the email.
    #[serde(default)]
    pub name: String,
    /// Login password.
    pub password: String,
    /// LCP passphrase, only its hash is kept.
    pub passphrase: String,
    /// Passphrase hint.
    pub hint: String,
    /// Role, "admin" or "user".
    #[serde(skip)]
    pub role: String,
}

fn check_password(password: &str) -> Result<()> {
    if password.len() < 4 {
        return Err(AppError::InvalidFormat(
            "Password must be at least 4 characters".to_string(),
        ));
    }
    Ok(())
}

fn check_passphrase(passphrase: &str, hint: &str) -> Result<()> {
    if passphrase.is_empty() {
        return Err(AppError::InvalidFormat(
            "Passphrase must not be empty".to_string(),
        ));
    }
    if hint.trim().is_empty() {
        return Err(AppError::InvalidFormat(
            "Passphrase hint must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Authentication service.
pub struct AuthService {
    db: Database,
    session_duration_days: u32,
    registration_enabled: bool,
}

impl AuthService {
    /// Create a new auth service.
    pub fn new(db: Database, session_duration_days: u32, registration_enabled: bool) -> Self {
        Self {
            db,
            session_duration_days,
            registration_enabled,
        }
    }

    /// Register a new user.
    pub fn register(&self, new_user: &NewUser) -> Result<User> {
        if !self.registration_enabled {
            return Err(AppError::InvalidFormat(
                "Registration is disabled".to_string(),
            ));
        }

        self.create_user(&NewUser {
            role: "user".to_string(),
            ..new_user.clone()
        })
    }

    /// Create a new user (admin function).
    pub fn create_user(&self, new_user: &NewUser) -> Result<User> {
        let email = new_user.email.trim();
        if email.is_empty() || email.len() > 254 || !email.contains('@') {
            return Err(AppError::InvalidFormat(
                "Email must be a valid address".to_string(),
            ));
        }

        check_password(&new_user.password)?;
        check_passphrase(&new_user.passphrase, &new_user.hint)?;

        if new_user.role != "admin" && new_user.role != "user" {
            return Err(AppError::InvalidFormat(
                "Role must be 'admin' or 'user'".to_string(),
            ));
        }

        let name = match new_user.name.trim() {
            "" => email.to_string(),
            name => name.to_string(),
        };

        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            email: email.to_string(),
            password_hash: hash_password(&new_user.password)?,
            text_hint: new_user.hint.trim().to_string(),
            hashed_passphrase: hash_passphrase(&new_user.passphrase),
            role: new_user.role.clone(),
            created_at: now_timestamp(),
            last_login: None,
        };

        self.db.create_user(&user)?;
        tracing::info!(user = %user.email, role = %user.role, "User created");
        Ok(user)
    }

    /// Login and create a session.
    pub fn login(&self, email: &str, password: &str) -> Result<(User, String)> {
        let user = self
            .db
            .get_user_by_email(email.trim())?
            .ok_or_else(|| AppError::Unauthorized("Invalid email or password".to_string()))?;

        if !verify_password(password, &user.password_hash)? {
            return Err(AppError::Unauthorized(
                "Invalid email or password".to_string(),
            ));
        }

        // Update last login
        self.db.update_user_last_login(&user.id)?;

        // Create session
        let token = generate_token();
        let expires_at = now_timestamp() + (self.session_duration_days as i64 * 24 * 60 * 60);

        let session = Session {
            token: token.clone(),
            user_id: user.id.clone(),
            expires_at,
        };

        self.db.create_session(&session)?;

        Ok((user, token))
    }

    /// Validate a session token and return the user.
    pub fn validate_token(&self, token: &str) -> Result<Option<User>> {
        let session = match self.db.get_session(token)? {
            Some(s) => s,
            None => return Ok(None),
        };

        // Check expiration
        if session.expires_at < now_timestamp() {
            self.db.delete_session(token)?;
            return Ok(None);
        }

        self.db.get_user_by_id(&session.user_id)
    }

    /// Logout (delete session).
    pub fn logout(&self, token: &str) -> Result<()> {
        self.db.delete_session(token)
    }

    /// Change user password.
    pub fn change_password(&self, email: &str, new_password: &str) -> Result<bool> {
        check_password(new_password)?;

        let password_hash = hash_password(new_password)?;
        self.db.update_user_password(email, &password_hash)
    }

    /// Change the LCP passphrase. Licenses issued before keep the old one.
    pub fn change_passphrase(&self, email: &str, passphrase: &str, hint: &str) -> Result<bool> {
        check_passphrase(passphrase, hint)?;
        self.db
            .update_user_passphrase(email, &hash_passphrase(passphrase), hint.trim())
    }

    /// Delete a user.
    pub fn delete_user(&self, email: &str) -> Result<bool> {
        self.db.delete_user(email)
    }

    /// List all users.
    pub fn list_users(&self) -> Result<Vec<User>> {
        self.db.list_users()
    }

    /// Check if a user is admin.
    pub fn is_admin(&self, user: &User) -> bool {
        user.role == "admin"
    }
}
