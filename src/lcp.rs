//! Readium LCP license brokering: request building, License Server and
//! status document exchanges, license parsing.

mod client;
mod error;
mod license;
mod request;
mod status;

pub use client::{LicenseServerClient, classify, http_client};
pub use error::{ErrorKind, LcpError};
pub use license::LicenseDocument;
pub use request::{LicenseHolder, LicenseRequest, Licensee, PROVIDER, ProtocolVersion, Rights};
pub use status::{LicenseState, StatusClient, StatusDocument};

/// Media type of an LCP license document.
pub const LICENSE_MIME: &str = "application/vnd.readium.lcp.license.v1.0+json";
