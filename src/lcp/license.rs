//! License document (LCPL) parsing.

use super::{LcpError, Rights};
use serde::{Deserialize, Serialize};

// Every field is optional so that `null` reads the same as absent.
#[derive(Debug, Default, Deserialize)]
struct Link {
    #[serde(default)]
    rel: Option<String>,
    #[serde(default)]
    href: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawLicense {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    links: Option<Vec<Link>>,
    #[serde(default)]
    rights: Option<Rights>,
}

/// The fields of an LCP license this store cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LicenseDocument {
    /// License identifier.
    pub id: String,
    /// Title of the `publication` link, display only.
    pub publication_title: String,
    /// Absolute URL of the license status document, empty when absent.
    pub status_url: String,
    /// Granted rights.
    pub rights: Rights,
}

impl LicenseDocument {
    /// Parse a license returned by either License Server generation.
    pub fn parse(body: &[u8]) -> Result<Self, LcpError> {
        let raw: RawLicense = serde_json::from_slice(body).map_err(|source| {
            tracing::warn!(body_len = body.len(), error = %source, "Unparseable license");
            LcpError::Parse {
                document: "license",
                body_len: body.len(),
                source,
            }
        })?;

        let links = raw.links.unwrap_or_default();
        let find = |rel: &str| links.iter().find(|l| l.rel.as_deref() == Some(rel));

        Ok(Self {
            publication_title: find("publication")
                .and_then(|l| l.title.clone())
                .unwrap_or_default(),
            status_url: find("status")
                .and_then(|l| l.href.clone())
                .unwrap_or_default(),
            id: raw.id.unwrap_or_default(),
            rights: raw.rights.unwrap_or_default(),
        })
    }

    /// Status document URL, if the license advertises one.
    pub fn status_url(&self) -> Option<&str> {
        (!self.status_url.is_empty()).then_some(self.status_url.as_str())
    }
}
