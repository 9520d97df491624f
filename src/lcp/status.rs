//! License Status Document (LSD) retrieval.

use super::LcpError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state reported by the LSD server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseState {
    /// Issued, not yet fetched by a reading app.
    Ready,
    /// In use.
    Active,
    /// Revoked by the provider.
    Revoked,
    /// Returned by the user.
    Returned,
    /// Cancelled before use.
    Cancelled,
    /// Validity window is over.
    Expired,
    /// Empty or unrecognized status.
    Unknown,
}

impl LicenseState {
    /// Map an LSD status string.
    pub fn from_code(code: &str) -> Self {
        match code {
            "ready" => LicenseState::Ready,
            "active" => LicenseState::Active,
            "revoked" => LicenseState::Revoked,
            "returned" => LicenseState::Returned,
            "cancelled" => LicenseState::Cancelled,
            "expired" => LicenseState::Expired,
            _ => LicenseState::Unknown,
        }
    }

    /// Whether the rights attached to the license are no longer usable.
    pub fn is_constrained(&self) -> bool {
        matches!(
            self,
            LicenseState::Revoked
                | LicenseState::Returned
                | LicenseState::Cancelled
                | LicenseState::Expired
        )
    }
}

#[derive(Debug, Default, Deserialize)]
struct PotentialRights {
    #[serde(default)]
    end: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStatus {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    potential_rights: Option<PotentialRights>,
}

/// Status document fields shown to users.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusDocument {
    /// Status code (`ready`, `active`, `revoked`, ...).
    pub status: String,
    /// Human readable message.
    pub message: String,
    /// Latest date the license could be extended to.
    pub potential_rights_end: Option<DateTime<Utc>>,
}

impl StatusDocument {
    /// Parse an LSD JSON body.
    pub fn parse(body: &[u8]) -> Result<Self, LcpError> {
        let raw: RawStatus = serde_json::from_slice(body).map_err(|source| LcpError::Parse {
            document: "status",
            body_len: body.len(),
            source,
        })?;

        Ok(Self {
            status: raw.status,
            message: raw.message,
            potential_rights_end: raw.potential_rights.and_then(|p| p.end),
        })
    }

    /// Typed view of the status code.
    pub fn state(&self) -> LicenseState {
        LicenseState::from_code(&self.status)
    }
}

/// Client for status documents. The URL comes from the license and is used as is.
#[derive(Debug, Clone)]
pub struct StatusClient {
    http: reqwest::Client,
}

impl StatusClient {
    /// Create a status client on top of a shared HTTP client.
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// GET and parse the status document at `url`.
    pub async fn fetch(&self, url: &str) -> Result<StatusDocument, LcpError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|source| LcpError::Transport {
                endpoint: url.to_string(),
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(LcpError::UnexpectedStatus {
                endpoint: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = resp.bytes().await.map_err(|source| LcpError::Transport {
            endpoint: url.to_string(),
            source,
        })?;

        StatusDocument::parse(&body)
    }
}
