//! License requests sent to the License Server, in its two wire formats.

use super::LcpError;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

/// Provider URI declared in v1 license requests.
pub const PROVIDER: &str = "https://edrlab.org";

/// User fields the License Server must encrypt in the license.
const ENCRYPTED_FIELDS: &[&str] = &["email"];

/// License Server protocol generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    /// Legacy License Server (nested `user`/`encryption`/`rights` objects).
    V1,
    /// Current License Server (flat object).
    #[default]
    V2,
}

/// Rights attached to a license. `None` means unconstrained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rights {
    /// Number of pages the user may print.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub print: Option<u32>,
    /// Number of characters the user may copy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy: Option<u32>,
    /// Start of the validity window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    /// End of the validity window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

/// Identity and key material of the user a license is bound to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Licensee {
    /// User UUID.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Email address (encrypted in the license).
    pub email: String,
    /// Hint shown by reading apps when asking for the passphrase.
    pub text_hint: String,
    /// Hex SHA-256 of the user passphrase.
    pub passphrase_hash: String,
}

/// What is needed to ask for a fresh copy of an existing license.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LicenseHolder {
    /// License identifier on the License Server.
    pub licence_id: String,
    /// Publication UUID.
    pub publication_id: String,
    /// License owner.
    pub licensee: Licensee,
}

#[derive(Debug, Clone, Serialize)]
struct LegacyRequest {
    provider: &'static str,
    user: LegacyUser,
    encryption: LegacyEncryption,
    rights: Rights,
}

#[derive(Debug, Clone, Serialize)]
struct LegacyUser {
    #[serde(skip_serializing_if = "String::is_empty")]
    id: String,
    email: String,
    encrypted: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct LegacyEncryption {
    user_key: LegacyUserKey,
}

#[derive(Debug, Clone, Serialize)]
struct LegacyUserKey {
    text_hint: String,
    hex_value: String,
}

#[derive(Debug, Clone, Serialize)]
struct CurrentRequest {
    publication_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    user_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    user_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    user_email: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    user_encrypted: Vec<String>,
    #[serde(flatten)]
    rights: Rights,
    profile: String,
    text_hint: String,
    pass_hash: String,
}

#[derive(Debug, Clone)]
enum Payload {
    Legacy(LegacyRequest),
    Current(CurrentRequest),
}

#[derive(Debug, Clone)]
enum Target {
    Issue { publication_id: String },
    Reissue { licence_id: String },
}

/// A request to the License Server: issue a new license or reissue an existing one.
#[derive(Debug, Clone)]
pub struct LicenseRequest {
    target: Target,
    payload: Payload,
}

fn encrypted_fields() -> Vec<String> {
    ENCRYPTED_FIELDS.iter().map(|f| f.to_string()).collect()
}

fn check_key_material(profile: &str, licensee: &Licensee) -> Result<(), LcpError> {
    if profile.is_empty() {
        return Err(LcpError::Build("encryption profile is empty".to_string()));
    }
    if licensee.text_hint.is_empty() {
        return Err(LcpError::Build("text hint is empty".to_string()));
    }
    if licensee.passphrase_hash.is_empty() {
        return Err(LcpError::Build("passphrase hash is empty".to_string()));
    }
    Ok(())
}

impl LicenseRequest {
    /// Request a brand new license for a publication.
    pub fn issue(
        version: ProtocolVersion,
        profile: &str,
        publication_id: &str,
        licensee: &Licensee,
        rights: &Rights,
    ) -> Result<Self, LcpError> {
        if publication_id.is_empty() {
            return Err(LcpError::Build("publication id is empty".to_string()));
        }
        check_key_material(profile, licensee)?;

        let payload = match version {
            ProtocolVersion::V1 => Payload::Legacy(LegacyRequest {
                provider: PROVIDER,
                user: LegacyUser {
                    id: licensee.id.clone(),
                    email: licensee.email.clone(),
                    encrypted: encrypted_fields(),
                },
                encryption: LegacyEncryption {
                    user_key: LegacyUserKey {
                        text_hint: licensee.text_hint.clone(),
                        hex_value: licensee.passphrase_hash.clone(),
                    },
                },
                rights: *rights,
            }),
            ProtocolVersion::V2 => Payload::Current(CurrentRequest {
                publication_id: publication_id.to_string(),
                user_id: licensee.id.clone(),
                user_name: licensee.name.clone(),
                user_email: licensee.email.clone(),
                user_encrypted: encrypted_fields(),
                rights: *rights,
                profile: profile.to_string(),
                text_hint: licensee.text_hint.clone(),
                pass_hash: licensee.passphrase_hash.clone(),
            }),
        };

        Ok(Self {
            target: Target::Issue {
                publication_id: publication_id.to_string(),
            },
            payload,
        })
    }

    /// Request a fresh copy of a license the server already knows.
    pub fn reissue(
        version: ProtocolVersion,
        profile: &str,
        holder: &LicenseHolder,
    ) -> Result<Self, LcpError> {
        if holder.licence_id.is_empty() {
            return Err(LcpError::Build("license id is empty".to_string()));
        }
        check_key_material(profile, &holder.licensee)?;

        let licensee = &holder.licensee;
        let payload = match version {
            ProtocolVersion::V1 => Payload::Legacy(LegacyRequest {
                provider: PROVIDER,
                user: LegacyUser {
                    id: String::new(),
                    email: licensee.email.clone(),
                    encrypted: encrypted_fields(),
                },
                encryption: LegacyEncryption {
                    user_key: LegacyUserKey {
                        text_hint: licensee.text_hint.clone(),
                        hex_value: licensee.passphrase_hash.clone(),
                    },
                },
                rights: Rights::default(),
            }),
            ProtocolVersion::V2 => Payload::Current(CurrentRequest {
                publication_id: holder.publication_id.clone(),
                user_id: licensee.id.clone(),
                user_name: String::new(),
                user_email: licensee.email.clone(),
                user_encrypted: encrypted_fields(),
                rights: Rights::default(),
                profile: profile.to_string(),
                text_hint: licensee.text_hint.clone(),
                pass_hash: licensee.passphrase_hash.clone(),
            }),
        };

        Ok(Self {
            target: Target::Reissue {
                licence_id: holder.licence_id.clone(),
            },
            payload,
        })
    }

    /// Wire format of this request.
    pub fn version(&self) -> ProtocolVersion {
        match self.payload {
            Payload::Legacy(_) => ProtocolVersion::V1,
            Payload::Current(_) => ProtocolVersion::V2,
        }
    }

    /// Full URL to POST this request to.
    pub fn endpoint(&self, base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');
        match (&self.target, &self.payload) {
            (Target::Issue { publication_id }, Payload::Legacy(_)) => format!(
                "{}/contents/{}/license",
                base,
                urlencoding::encode(publication_id)
            ),
            (Target::Issue { .. }, Payload::Current(_)) => format!("{}/licenses", base),
            (Target::Reissue { licence_id }, _) => {
                format!("{}/licenses/{}", base, urlencoding::encode(licence_id))
            }
        }
    }

    /// Status code the License Server answers with on success.
    pub fn expected_status(&self) -> StatusCode {
        match self.target {
            Target::Issue { .. } => StatusCode::CREATED,
            Target::Reissue { .. } => StatusCode::OK,
        }
    }

    /// Serialize the request body.
    pub fn to_json(&self) -> Result<Vec<u8>, LcpError> {
        let encoded = match &self.payload {
            Payload::Legacy(req) => serde_json::to_vec(req),
            Payload::Current(req) => serde_json::to_vec(req),
        };
        encoded.map_err(|e| LcpError::Build(e.to_string()))
    }
}
