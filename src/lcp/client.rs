//! HTTP exchange with the License Server.

use super::{LcpError, LicenseHolder, LicenseRequest, Licensee, ProtocolVersion, Rights};
use crate::config::LcpServerConfig;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;

/// Longest server detail kept from a rejected request.
const MAX_DETAIL_LEN: usize = 512;

/// Build the HTTP client shared by the License Server and status clients.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, LcpError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|source| LcpError::Transport {
            endpoint: "client_init".to_string(),
            source,
        })
}

/// Map a License Server answer to success or a classified failure.
pub fn classify(
    endpoint: &str,
    status: StatusCode,
    expected: StatusCode,
    body: &str,
) -> Result<(), LcpError> {
    if status == expected {
        return Ok(());
    }
    if status.is_client_error() {
        let mut detail = body.trim().to_string();
        if detail.len() > MAX_DETAIL_LEN {
            let cut = (0..=MAX_DETAIL_LEN)
                .rev()
                .find(|i| detail.is_char_boundary(*i))
                .unwrap_or(0);
            detail.truncate(cut);
        }
        return Err(LcpError::Client {
            status: status.as_u16(),
            detail,
        });
    }
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        return Err(LcpError::Server {
            status: status.as_u16(),
        });
    }
    Err(LcpError::UnexpectedStatus {
        endpoint: endpoint.to_string(),
        status: status.as_u16(),
    })
}

/// Authenticated client for the License Server.
#[derive(Debug, Clone)]
pub struct LicenseServerClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    version: ProtocolVersion,
    profile: String,
}

impl LicenseServerClient {
    /// Create a client from the `[lcp_server]` configuration.
    pub fn new(http: reqwest::Client, config: &LcpServerConfig) -> Self {
        Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            version: config.version,
            profile: config.profile.clone(),
        }
    }

    /// Protocol generation spoken to the server.
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Ask for a new license. Returns the raw license document.
    pub async fn issue_license(
        &self,
        publication_id: &str,
        licensee: &Licensee,
        rights: &Rights,
    ) -> Result<Vec<u8>, LcpError> {
        let request =
            LicenseRequest::issue(self.version, &self.profile, publication_id, licensee, rights)?;
        let body = self.exchange(&request).await?;
        tracing::info!(publication = %publication_id, "License created");
        Ok(body)
    }

    /// Ask for an up to date copy of an existing license.
    pub async fn fetch_fresh_license(&self, holder: &LicenseHolder) -> Result<Vec<u8>, LcpError> {
        let request = LicenseRequest::reissue(self.version, &self.profile, holder)?;
        let body = self.exchange(&request).await?;
        tracing::debug!(licence_id = %holder.licence_id, "Fresh license fetched");
        Ok(body)
    }

    async fn exchange(&self, request: &LicenseRequest) -> Result<Vec<u8>, LcpError> {
        let url = request.endpoint(&self.base_url);
        let payload = request.to_json()?;

        let resp = self
            .http
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .header(CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|source| {
                tracing::warn!(endpoint = %url, error = %source, "License Server unreachable");
                LcpError::Transport {
                    endpoint: url.clone(),
                    source,
                }
            })?;

        let status = resp.status();
        let body = resp.bytes().await.map_err(|source| LcpError::Transport {
            endpoint: url.clone(),
            source,
        })?;

        classify(
            &url,
            status,
            request.expected_status(),
            &String::from_utf8_lossy(&body),
        )
        .inspect_err(|e| {
            tracing::warn!(
                endpoint = %url,
                status = status.as_u16(),
                error = %e,
                "License Server refused request"
            );
        })?;

        Ok(body.to_vec())
    }
}
