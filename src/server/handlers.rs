//! HTTP request handlers.

use crate::auth::NewUser;
use crate::db::{self, Publication, now_timestamp};
use crate::entitlement::{LicenseStatus, RightsParams, ShelfEntry};
use crate::error::{AppError, Result};
use crate::lcp::{LICENSE_MIME, LicenseHolder, Rights};
use crate::opds::{AcquisitionChoice, OPDS_AUTH_MIME, OPDS_MIME, OPDS_PUBLICATION_MIME};
use crate::server::AppState;
use axum::{
    Form, Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{Html, IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::{CancellationToken, DropGuard};

/// Cookie carrying the session token for browser flows.
const SESSION_COOKIE: &str = "pubstore_session";

/// Build a response, returning 500 on error (which shouldn't happen).
fn build_response(status: StatusCode, content_type: &str, body: impl Into<Body>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(body.into())
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("Internal error"))
                .unwrap_or_default()
        })
}

/// 302 to `location`.
fn redirect(location: &str) -> Response<Body> {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, location)
        .body(Body::empty())
        .unwrap_or_default()
}

/// Cancellation token tied to the handler: dropping the guard (the client went
/// away and the handler future was dropped) cancels remote calls.
fn request_token() -> (CancellationToken, DropGuard) {
    let token = CancellationToken::new();
    let guard = token.clone().drop_guard();
    (token, guard)
}

/// Keep filenames header safe.
fn license_filename(title: &str) -> String {
    let name: String = title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let name = name.trim();
    if name.is_empty() {
        "license.lcpl".to_string()
    } else {
        format!("{}.lcpl", name)
    }
}

/// Stream a license document as a download.
fn license_response(title: &str, body: Vec<u8>) -> Response<Body> {
    let content_disposition = format!("attachment; filename=\"{}\"", license_filename(title));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, LICENSE_MIME)
        .header(header::CONTENT_DISPOSITION, content_disposition)
        .header(header::CONTENT_LENGTH, body.len())
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::default())
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

// ============================================================================
// WEB PAGES
// ============================================================================

/// Index page (simple HTML).
pub async fn index(State(state): State<AppState>) -> Result<Html<String>> {
    let publications = state.db.list_publications()?;
    let items: String = publications
        .iter()
        .map(|p| {
            format!(
                r#"        <li><a href="/catalog/publication/{}">{}</a></li>
"#,
                urlencoding::encode(&p.id),
                escape_html(&p.title)
            )
        })
        .collect();

    let html = format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <title>{title}</title>
    <style>
        body {{ font-family: system-ui, sans-serif; max-width: 600px; margin: 2rem auto; padding: 0 1rem; }}
        h1 {{ color: #333; }}
        a {{ color: #0066cc; }}
        code {{ background: #e8e8e8; padding: 0.2rem 0.4rem; border-radius: 4px; }}
    </style>
</head>
<body>
    <h1>{title}</h1>
    <p>Add this URL to your reading app's OPDS catalogs:</p>
    <p><code>{base_url}/opds/catalog</code></p>
    <h2>Publications</h2>
    <ul>
{items}    </ul>
</body>
</html>"#,
        title = escape_html(&state.config.server.title),
        base_url = escape_html(state.base_url()),
        items = items,
    );

    Ok(Html(html))
}

/// Publication page query.
#[derive(Debug, Deserialize)]
pub struct PageQuery {
    err: Option<String>,
}

/// Publication page with acquisition links and the last error, if any.
pub async fn catalog_publication(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Html<String>> {
    let publication = state.publication(&id)?;
    let error = query
        .err
        .filter(|e| !e.is_empty())
        .map(|e| format!(r#"    <p class="error">{}</p>"#, escape_html(&e)))
        .unwrap_or_default();
    let id = urlencoding::encode(&publication.id);

    let html = format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>{title}</title>
    <style>
        body {{ font-family: system-ui, sans-serif; max-width: 600px; margin: 2rem auto; padding: 0 1rem; }}
        .error {{ background: #fde8e8; padding: 1rem; border-radius: 8px; }}
    </style>
</head>
<body>
    <h1>{title}</h1>
{error}
    <p>{description}</p>
    <ul>
        <li><a href="/catalog/publication/{id}/license">Get a license</a></li>
        <li><a href="/catalog/publication/{id}/fresh">Download my license again</a></li>
    </ul>
</body>
</html>"#,
        title = escape_html(&publication.title),
        description = escape_html(publication.description.as_deref().unwrap_or_default()),
        error = error,
        id = id,
    );

    Ok(Html(html))
}

fn publication_page_with_error(id: &str, err: &AppError) -> Response<Body> {
    redirect(&format!(
        "/catalog/publication/{}?err={}",
        urlencoding::encode(id),
        urlencoding::encode(&err.to_string())
    ))
}

/// Web flow: acquire a license and download it. Failures come back to the
/// publication page with the error message.
pub async fn catalog_acquire(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(params): Query<RightsParams>,
) -> Response<Body> {
    let (cancel, _guard) = request_token();
    let result = async {
        let user = get_authenticated_user(&state, &headers)?;
        let publication = state.publication(&id)?;
        let rights = Rights::from_params(&params, &state.config.license);
        let acquisition = state
            .entitlements
            .acquire(&user, &publication, &rights, &cancel)
            .await?;
        Ok::<_, AppError>((publication, acquisition))
    }
    .await;

    match result {
        Ok((publication, acquisition)) => license_response(&publication.title, acquisition.body),
        Err(e) => publication_page_with_error(&id, &e),
    }
}

/// Web flow: download the license already held, or go acquire one.
pub async fn catalog_fresh(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response<Body> {
    let (cancel, _guard) = request_token();
    let result = async {
        let user = get_authenticated_user(&state, &headers)?;
        let publication = state.publication(&id)?;
        let body = state
            .entitlements
            .fresh_license(&user, &publication, &cancel)
            .await?;
        Ok::<_, AppError>((publication, body))
    }
    .await;

    match result {
        Ok((publication, body)) => license_response(&publication.title, body),
        Err(AppError::NotEntitled(_)) => redirect(&format!(
            "/catalog/publication/{}/license",
            urlencoding::encode(&id)
        )),
        Err(e) => publication_page_with_error(&id, &e),
    }
}

// ============================================================================
// AUTH
// ============================================================================

/// Login request.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    email: String,
    password: String,
}

/// Login response.
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    token: String,
    user_id: String,
    email: String,
    name: String,
    role: String,
}

impl LoginResponse {
    fn new(user: db::User, token: String) -> Self {
        Self {
            token,
            user_id: user.id,
            email: user.email,
            name: user.name,
            role: user.role,
        }
    }
}

/// Auth login. Also sets the session cookie used by the web flow.
pub async fn auth_login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Response<Body>> {
    let (user, token) = state.auth.login(&req.email, &req.password)?;
    let cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        SESSION_COOKIE,
        token,
        u64::from(state.config.auth.session_days) * 24 * 60 * 60
    );

    let mut response = Json(LoginResponse::new(user, token)).into_response();
    if let Ok(value) = cookie.parse() {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    Ok(response)
}

/// Auth register.
pub async fn auth_register(
    State(state): State<AppState>,
    Json(req): Json<NewUser>,
) -> Result<Json<LoginResponse>> {
    let user = state.auth.register(&req)?;
    let (user, token) = state.auth.login(&user.email, &req.password)?;

    Ok(Json(LoginResponse::new(user, token)))
}

/// Auth logout.
pub async fn auth_logout(State(state): State<AppState>, headers: HeaderMap) -> Result<StatusCode> {
    if let Some(token) = extract_token(&headers) {
        state.auth.logout(&token)?;
    }
    Ok(StatusCode::OK)
}

/// Get current user info.
pub async fn auth_me(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<db::User>> {
    let user = get_authenticated_user(&state, &headers)?;
    Ok(Json(user))
}

// ============================================================================
// PUBLICATIONS API
// ============================================================================

/// Publication creation request.
#[derive(Debug, Deserialize)]
pub struct CreatePublicationRequest {
    /// UUID known by the License Server; generated when absent.
    id: Option<String>,
    title: String,
    content_type: Option<String>,
    date_published: Option<String>,
    description: Option<String>,
    cover_url: Option<String>,
}

/// List publications.
pub async fn api_publications(State(state): State<AppState>) -> Result<Json<Vec<Publication>>> {
    Ok(Json(state.db.list_publications()?))
}

/// Register a publication (admin).
pub async fn api_create_publication(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreatePublicationRequest>,
) -> Result<(StatusCode, Json<Publication>)> {
    require_admin(&state, &headers)?;

    if req.title.trim().is_empty() {
        return Err(AppError::InvalidFormat("Title must not be empty".to_string()));
    }

    let publication = Publication {
        id: req
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        title: req.title.trim().to_string(),
        content_type: req
            .content_type
            .unwrap_or_else(|| "application/epub+zip".to_string()),
        date_published: req.date_published,
        description: req.description,
        cover_url: req.cover_url,
        created_at: now_timestamp(),
    };

    state.db.create_publication(&publication)?;
    tracing::info!(publication = %publication.id, title = %publication.title, "Publication added");
    Ok((StatusCode::CREATED, Json(publication)))
}

/// Publication metadata.
pub async fn api_publication(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Publication>> {
    Ok(Json(state.publication(&id)?))
}

/// Remove a publication and its transactions (admin).
pub async fn api_delete_publication(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    require_admin(&state, &headers)?;

    if !state.db.delete_publication(&id)? {
        return Err(AppError::NotFound(format!("Publication not found: {}", id)));
    }
    tracing::info!(publication = %id, "Publication removed");
    Ok(StatusCode::NO_CONTENT)
}

/// Acquire a license.
pub async fn api_acquire(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(params): Query<RightsParams>,
) -> Result<Response<Body>> {
    let (cancel, _guard) = request_token();
    let user = get_authenticated_user(&state, &headers)?;
    let publication = state.publication(&id)?;
    let rights = Rights::from_params(&params, &state.config.license);

    let acquisition = state
        .entitlements
        .acquire(&user, &publication, &rights, &cancel)
        .await?;

    Ok(license_response(&publication.title, acquisition.body))
}

/// Download the license already held.
pub async fn api_fresh_license(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response<Body>> {
    let (cancel, _guard) = request_token();
    let user = get_authenticated_user(&state, &headers)?;
    let publication = state.publication(&id)?;

    let body = state
        .entitlements
        .fresh_license(&user, &publication, &cancel)
        .await?;

    Ok(license_response(&publication.title, body))
}

/// Status of the license held for a publication.
pub async fn api_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<LicenseStatus>> {
    let (cancel, _guard) = request_token();
    let user = get_authenticated_user(&state, &headers)?;
    let publication = state.publication(&id)?;

    let detail = state
        .entitlements
        .entitlement(&user.id, &publication.id)?
        .ok_or(AppError::NotEntitled(publication.id))?;

    let status = state
        .entitlements
        .current_status(&LicenseHolder::from(&detail), &cancel)
        .await;
    Ok(Json(status))
}

/// Licenses held by the user, with their status.
pub async fn api_bookshelf(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ShelfEntry>>> {
    let (cancel, _guard) = request_token();
    let user = get_authenticated_user(&state, &headers)?;
    Ok(Json(state.entitlements.bookshelf(&user, &cancel).await?))
}

// ============================================================================
// OPDS
// ============================================================================

fn json_response<T: Serialize>(content_type: &str, value: &T) -> Result<Response<Body>> {
    let body = serde_json::to_vec(value)
        .map_err(|e| AppError::Internal(format!("Failed to encode feed: {}", e)))?;
    Ok(build_response(StatusCode::OK, content_type, body))
}

/// 401 with the OPDS authentication document.
fn opds_unauthorized(state: &AppState) -> Response<Body> {
    build_response(
        StatusCode::UNAUTHORIZED,
        OPDS_AUTH_MIME,
        state.feeds().authentication_document().to_string(),
    )
}

/// OPDS catalog.
pub async fn opds_catalog(State(state): State<AppState>) -> Result<Response<Body>> {
    let publications = state.db.list_publications()?;
    json_response(OPDS_MIME, &state.feeds().catalog(&publications))
}

/// OPDS publication, with the acquisition link matching the caller.
pub async fn opds_publication(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response<Body>> {
    let (cancel, _guard) = request_token();
    let publication = state.publication(&id)?;
    let feeds = state.feeds();

    let Some(user) = optional_user(&state, &headers)? else {
        let entry = feeds.acquirable_publication(&publication, &AcquisitionChoice::Anonymous);
        return json_response(OPDS_PUBLICATION_MIME, &entry);
    };

    let entry = match state.entitlements.entitlement(&user.id, &publication.id)? {
        Some(detail) => {
            let status = state
                .entitlements
                .current_status(&LicenseHolder::from(&detail), &cancel)
                .await;
            feeds.acquirable_publication(
                &publication,
                &AcquisitionChoice::Entitled {
                    status: &status,
                    hashed_passphrase: &user.hashed_passphrase,
                },
            )
        }
        None => feeds.acquirable_publication(&publication, &AcquisitionChoice::Authenticated),
    };

    json_response(OPDS_PUBLICATION_MIME, &entry)
}

/// Borrow entry point: ask anonymous callers to log in, send others back to
/// the publication, which now carries the loan link.
pub async fn opds_borrow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response<Body>> {
    let publication = state.publication(&id)?;
    if optional_user(&state, &headers)?.is_none() {
        return Ok(opds_unauthorized(&state));
    }
    Ok(redirect(&format!(
        "{}/opds/publication/{}",
        state.base_url(),
        urlencoding::encode(&publication.id)
    )))
}

/// Loan a publication for the configured number of days.
pub async fn opds_loan(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response<Body>> {
    let (cancel, _guard) = request_token();
    let publication = state.publication(&id)?;
    let Some(user) = optional_user(&state, &headers)? else {
        return Ok(opds_unauthorized(&state));
    };

    let limits = &state.config.license;
    let rights = Rights::loan(limits, limits.loan_days);
    let acquisition = state
        .entitlements
        .acquire(&user, &publication, &rights, &cancel)
        .await?;

    Ok(license_response(&publication.title, acquisition.body))
}

/// Fresh copy of a loaned license.
pub async fn opds_license(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response<Body>> {
    let (cancel, _guard) = request_token();
    let publication = state.publication(&id)?;
    let Some(user) = optional_user(&state, &headers)? else {
        return Ok(opds_unauthorized(&state));
    };

    let body = state
        .entitlements
        .fresh_license(&user, &publication, &cancel)
        .await?;
    Ok(license_response(&publication.title, body))
}

/// Personal bookshelf feed.
pub async fn opds_bookshelf(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response<Body>> {
    let (cancel, _guard) = request_token();
    let Some(user) = optional_user(&state, &headers)? else {
        return Ok(opds_unauthorized(&state));
    };

    let entries = state.entitlements.bookshelf(&user, &cancel).await?;
    json_response(OPDS_MIME, &state.feeds().bookshelf(&entries))
}

/// OAuth password grant form.
#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    grant_type: String,
    username: String,
    password: String,
}

/// OAuth token answer.
#[derive(Debug, Serialize)]
pub struct TokenResponse {
    access_token: String,
    token_type: &'static str,
    expires_in: u64,
}

/// Token endpoint advertised by the authentication document.
pub async fn opds_token(
    State(state): State<AppState>,
    Form(req): Form<TokenRequest>,
) -> Result<Json<TokenResponse>> {
    if req.grant_type != "password" {
        return Err(AppError::InvalidFormat(format!(
            "Unsupported grant type: {}",
            req.grant_type
        )));
    }

    let (_, token) = state.auth.login(&req.username, &req.password)?;
    Ok(Json(TokenResponse {
        access_token: token,
        token_type: "Bearer",
        expires_in: u64::from(state.config.auth.session_days) * 24 * 60 * 60,
    }))
}

// ============================================================================
// HELPERS
// ============================================================================

/// Extract token from the Authorization header, or the session cookie.
fn extract_token(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string());

    bearer.or_else(|| {
        headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == SESSION_COOKIE)
            .map(|(_, value)| value.to_string())
    })
}

/// Get the user behind the request, if any.
fn optional_user(state: &AppState, headers: &HeaderMap) -> Result<Option<db::User>> {
    match extract_token(headers) {
        Some(token) => state.auth.validate_token(&token),
        None => Ok(None),
    }
}

/// Get authenticated user from token.
fn get_authenticated_user(state: &AppState, headers: &HeaderMap) -> Result<db::User> {
    let token = extract_token(headers)
        .ok_or_else(|| AppError::Unauthorized("Missing Authorization header".to_string()))?;

    state
        .auth
        .validate_token(&token)?
        .ok_or_else(|| AppError::Unauthorized("Invalid or expired token".to_string()))
}

/// Get authenticated admin.
fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<db::User> {
    let user = get_authenticated_user(state, headers)?;
    if !state.auth.is_admin(&user) {
        return Err(AppError::Forbidden("Admin role required".to_string()));
    }
    Ok(user)
}
