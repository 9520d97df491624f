//! Entitlement facade: acquire licenses, re-download them and report their status.
//!
//! A user is entitled to a publication when a transaction binds them. The
//! transaction is written only once the License Server has issued a license
//! and the returned document parsed, so every stored license id is real.

use crate::config::LicenseConfig;
use crate::db::{Database, Publication, Transaction, TransactionDetail, User};
use crate::error::{AppError, Result};
use crate::lcp::{
    LcpError, LicenseDocument, LicenseHolder, LicenseServerClient, Licensee, Rights, StatusClient,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Rights as they arrive in a query string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RightsParams {
    /// Pages to allow printing. Negative means unlimited.
    pub print: Option<String>,
    /// Characters to allow copying. Negative means unlimited.
    pub copy: Option<String>,
    /// Start of validity (RFC 3339 or `YYYY-MM-DD`).
    pub start: Option<String>,
    /// End of validity (RFC 3339 or `YYYY-MM-DD`).
    pub end: Option<String>,
}

fn parse_limit(raw: Option<&str>, default: u32) -> Option<u32> {
    match raw.map(str::trim).map(str::parse::<i64>) {
        Some(Ok(n)) if n < 0 => None,
        Some(Ok(n)) => Some(u32::try_from(n).unwrap_or(u32::MAX)),
        _ => Some(default),
    }
}

fn parse_date(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(date) = DateTime::parse_from_rfc3339(raw) {
        return Some(date.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
}

impl Rights {
    /// Sanitize caller supplied rights.
    ///
    /// Missing or unparseable print/copy use the configured limits and
    /// negative values lift the limit. Empty or invalid dates leave the
    /// window open.
    pub fn from_params(params: &RightsParams, limits: &LicenseConfig) -> Self {
        Self {
            print: parse_limit(params.print.as_deref(), limits.print_limit),
            copy: parse_limit(params.copy.as_deref(), limits.copy_limit),
            start: parse_date(params.start.as_deref()),
            end: parse_date(params.end.as_deref()),
        }
    }

    /// Configured limits over a loan of `days` starting now.
    pub fn loan(limits: &LicenseConfig, days: u32) -> Self {
        let start = Utc::now();
        Self {
            print: Some(limits.print_limit),
            copy: Some(limits.copy_limit),
            start: Some(start),
            end: Some(start + Duration::days(i64::from(days))),
        }
    }
}

impl From<&User> for Licensee {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            name: user.name.clone(),
            email: user.email.clone(),
            text_hint: user.text_hint.clone(),
            passphrase_hash: user.hashed_passphrase.clone(),
        }
    }
}

impl From<&TransactionDetail> for LicenseHolder {
    fn from(detail: &TransactionDetail) -> Self {
        Self {
            licence_id: detail.transaction.licence_id.clone(),
            publication_id: detail.publication.id.clone(),
            licensee: Licensee::from(&detail.user),
        }
    }
}

/// Status of an acquired license. The default value means "unknown".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LicenseStatus {
    /// LSD status code, empty when unknown.
    pub status_code: String,
    /// LSD message.
    pub status_message: String,
    /// Latest date the license could be extended to.
    pub end_potential_rights: Option<DateTime<Utc>>,
    /// Rights carried by the current license.
    pub rights: Rights,
}

impl LicenseStatus {
    /// Whether nothing could be learned about the license.
    pub fn is_unknown(&self) -> bool {
        self.status_code.is_empty()
    }
}

/// Result of a successful acquisition.
#[derive(Debug, Clone)]
pub struct Acquisition {
    /// The persisted transaction.
    pub transaction: Transaction,
    /// Parsed license.
    pub document: LicenseDocument,
    /// License bytes as issued, to hand to the reading app.
    pub body: Vec<u8>,
}

/// A bookshelf line.
#[derive(Debug, Clone, Serialize)]
pub struct ShelfEntry {
    /// Transaction with user and publication.
    #[serde(flatten)]
    pub detail: TransactionDetail,
    /// Best effort license status.
    pub status: LicenseStatus,
}

/// Race `fut` against the caller going away.
async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, LcpError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AppError::Cancelled),
        res = fut => res.map_err(AppError::from),
    }
}

/// Entitlement facade shared by the API, web and OPDS handlers.
#[derive(Clone)]
pub struct Entitlements {
    db: Database,
    license_server: LicenseServerClient,
    status: StatusClient,
    status_workers: usize,
}

impl Entitlements {
    /// Create the facade.
    pub fn new(
        db: Database,
        license_server: LicenseServerClient,
        status: StatusClient,
        status_workers: usize,
    ) -> Self {
        Self {
            db,
            license_server,
            status,
            status_workers: status_workers.max(1),
        }
    }

    /// Latest transaction binding `user_id` to `publication_id`.
    pub fn entitlement(
        &self,
        user_id: &str,
        publication_id: &str,
    ) -> Result<Option<TransactionDetail>> {
        self.db
            .get_transaction_by_user_and_publication(user_id, publication_id)
    }

    /// Get a new license for the user and record the entitlement.
    ///
    /// Nothing is stored unless the license was issued and parsed, and the
    /// request was not cancelled meanwhile.
    pub async fn acquire(
        &self,
        user: &User,
        publication: &Publication,
        rights: &Rights,
        cancel: &CancellationToken,
    ) -> Result<Acquisition> {
        let licensee = Licensee::from(user);
        let body = cancellable(
            cancel,
            self.license_server
                .issue_license(&publication.id, &licensee, rights),
        )
        .await
        .map_err(|e| e.for_publication(&publication.id))
        .inspect_err(|e| {
            tracing::warn!(
                publication = %publication.id,
                user = %user.email,
                error = %e,
                "License acquisition failed"
            );
        })?;

        let document = LicenseDocument::parse(&body)
            .map_err(|e| AppError::from(e).for_publication(&publication.id))?;
        if document.id.is_empty() {
            tracing::warn!(publication = %publication.id, "License without id");
            return Err(AppError::from(LcpError::MissingId).for_publication(&publication.id));
        }

        if cancel.is_cancelled() {
            tracing::info!(
                licence_id = %document.id,
                "Request cancelled after issuance, entitlement not recorded"
            );
            return Err(AppError::Cancelled);
        }

        let transaction = self
            .db
            .create_transaction(&user.id, &publication.id, &document.id)?;

        tracing::info!(
            licence_id = %document.id,
            publication = %publication.id,
            user = %user.email,
            "Entitlement recorded"
        );

        Ok(Acquisition {
            transaction,
            document,
            body,
        })
    }

    /// Re-download the license the user already holds for a publication.
    ///
    /// Fails with [`AppError::NotEntitled`] without any remote call when no
    /// transaction exists.
    pub async fn fresh_license(
        &self,
        user: &User,
        publication: &Publication,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let detail = self
            .entitlement(&user.id, &publication.id)?
            .ok_or_else(|| AppError::NotEntitled(publication.id.clone()))?;

        let holder = LicenseHolder::from(&detail);
        cancellable(cancel, self.license_server.fetch_fresh_license(&holder)).await
    }

    /// Status of a held license. Never fails: any problem yields the default
    /// (unknown) status.
    pub async fn current_status(
        &self,
        holder: &LicenseHolder,
        cancel: &CancellationToken,
    ) -> LicenseStatus {
        match self.try_status(holder, cancel).await {
            Ok(status) => status,
            Err(e) => {
                tracing::debug!(licence_id = %holder.licence_id, error = %e, "Status unavailable");
                LicenseStatus::default()
            }
        }
    }

    async fn try_status(
        &self,
        holder: &LicenseHolder,
        cancel: &CancellationToken,
    ) -> Result<LicenseStatus> {
        let body = cancellable(cancel, self.license_server.fetch_fresh_license(holder)).await?;
        let license = LicenseDocument::parse(&body)?;

        let Some(url) = license.status_url() else {
            return Ok(LicenseStatus {
                rights: license.rights,
                ..LicenseStatus::default()
            });
        };

        let document = cancellable(cancel, self.status.fetch(url)).await?;
        Ok(LicenseStatus {
            status_code: document.status,
            status_message: document.message,
            end_potential_rights: document.potential_rights_end,
            rights: license.rights,
        })
    }

    /// All entitlements of a user with their status, latest first.
    pub async fn bookshelf(&self, user: &User, cancel: &CancellationToken) -> Result<Vec<ShelfEntry>> {
        let details = self.db.list_transactions_by_user(&user.id)?;

        let entries = stream::iter(details)
            .map(|detail| async move {
                let status = self
                    .current_status(&LicenseHolder::from(&detail), cancel)
                    .await;
                ShelfEntry { detail, status }
            })
            .buffered(self.status_workers)
            .collect::<Vec<_>>()
            .await;

        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        Ok(entries)
    }
}
