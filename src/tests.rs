use crate::auth::{AuthService, NewUser, hash_passphrase};
use crate::config::{Config, LcpServerConfig};
use crate::db::{Database, Publication, Session, User, now_timestamp};
use crate::entitlement::{Entitlements, LicenseStatus};
use crate::error::AppError;
use crate::lcp::{
    ErrorKind, LICENSE_MIME, LcpError, LicenseHolder, LicenseServerClient, ProtocolVersion,
    Rights, StatusClient, http_client,
};
use crate::server::{self, AppState};
use chrono::{Duration, Utc};
use serde_json::{Value, json};
use std::io::Write;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// `admin:secret`
const BASIC_AUTH: &str = "Basic YWRtaW46c2VjcmV0";

fn test_db() -> Database {
    Database::open_memory().unwrap()
}

fn create_user(db: &Database, id: &str, email: &str) -> User {
    let user = User {
        id: id.to_string(),
        name: "Alice".to_string(),
        email: email.to_string(),
        password_hash: "hash".to_string(),
        text_hint: "Favourite colour".to_string(),
        hashed_passphrase: hash_passphrase("blue"),
        role: "user".to_string(),
        created_at: now_timestamp(),
        last_login: None,
    };
    db.create_user(&user).unwrap();
    user
}

fn create_publication(db: &Database, id: &str, title: &str) -> Publication {
    let publication = Publication {
        id: id.to_string(),
        title: title.to_string(),
        content_type: "application/epub+zip".to_string(),
        date_published: None,
        description: None,
        cover_url: None,
        created_at: now_timestamp(),
    };
    db.create_publication(&publication).unwrap();
    publication
}

fn setup_user_and_publication(db: &Database) -> (User, Publication) {
    (
        create_user(db, "user-1", "alice@example.com"),
        create_publication(db, "pub-1", "Moby Dick"),
    )
}

fn lcp_config(url: &str, version: ProtocolVersion, timeout_seconds: u64) -> LcpServerConfig {
    LcpServerConfig {
        url: url.to_string(),
        version,
        username: "admin".to_string(),
        password: "secret".to_string(),
        timeout_seconds,
        ..LcpServerConfig::default()
    }
}

fn entitlements(db: &Database, config: &LcpServerConfig) -> Entitlements {
    let http = http_client(config.timeout()).unwrap();
    Entitlements::new(
        db.clone(),
        LicenseServerClient::new(http.clone(), config),
        StatusClient::new(http),
        4,
    )
}

fn license_json(id: &str, status_href: &str) -> Value {
    json!({
        "id": id,
        "provider": "https://edrlab.org",
        "links": [
            {"rel": "publication", "href": "https://example.com/moby.epub", "title": "Moby Dick"},
            {"rel": "status", "href": status_href, "type": "application/vnd.readium.license.status.v1.0+json"}
        ],
        "rights": {"print": 10, "copy": 2000}
    })
}

fn year_rights() -> Rights {
    let start = Utc::now();
    Rights {
        print: Some(10),
        copy: Some(2000),
        start: Some(start),
        end: Some(start + Duration::days(365)),
    }
}

// ========== DATABASE ==========

#[test]
fn db_create_and_get_user() {
    let db = test_db();
    create_user(&db, "user-1", "alice@example.com");

    let found = db.get_user_by_email("alice@example.com").unwrap().unwrap();
    assert_eq!(found.id, "user-1");
    assert_eq!(found.text_hint, "Favourite colour");
    assert_eq!(found.hashed_passphrase, hash_passphrase("blue"));

    let found_by_id = db.get_user_by_id("user-1").unwrap().unwrap();
    assert_eq!(found_by_id.email, "alice@example.com");
}

#[test]
fn db_duplicate_email_fails() {
    let db = test_db();
    create_user(&db, "user-1", "alice@example.com");

    let mut dup = db.get_user_by_id("user-1").unwrap().unwrap();
    dup.id = "user-2".to_string();
    assert!(matches!(
        db.create_user(&dup),
        Err(AppError::InvalidFormat(_))
    ));
}

#[test]
fn db_update_passphrase() {
    let db = test_db();
    create_user(&db, "user-1", "alice@example.com");

    assert!(
        db.update_user_passphrase("alice@example.com", "beef", "New hint")
            .unwrap()
    );
    let user = db.get_user_by_id("user-1").unwrap().unwrap();
    assert_eq!(user.hashed_passphrase, "beef");
    assert_eq!(user.text_hint, "New hint");

    assert!(!db.update_user_passphrase("nobody@example.com", "x", "y").unwrap());
}

#[test]
fn db_create_and_get_session() {
    let db = test_db();
    create_user(&db, "user-1", "alice@example.com");

    let session = Session {
        token: "token-1".to_string(),
        user_id: "user-1".to_string(),
        expires_at: now_timestamp() + 3600,
    };
    db.create_session(&session).unwrap();

    let found = db.get_session("token-1").unwrap().unwrap();
    assert_eq!(found.user_id, "user-1");

    db.delete_session("token-1").unwrap();
    assert!(db.get_session("token-1").unwrap().is_none());
}

#[test]
fn db_expired_sessions_cleanup() {
    let db = test_db();
    create_user(&db, "user-1", "alice@example.com");

    let expired = Session {
        token: "expired".to_string(),
        user_id: "user-1".to_string(),
        expires_at: now_timestamp() - 3600,
    };
    let valid = Session {
        token: "valid".to_string(),
        user_id: "user-1".to_string(),
        expires_at: now_timestamp() + 3600,
    };

    db.create_session(&expired).unwrap();
    db.create_session(&valid).unwrap();

    assert_eq!(db.cleanup_expired_sessions().unwrap(), 1);

    assert!(db.get_session("expired").unwrap().is_none());
    assert!(db.get_session("valid").unwrap().is_some());
}

#[test]
fn db_publications() {
    let db = test_db();
    create_publication(&db, "pub-b", "beta");
    create_publication(&db, "pub-a", "Alpha");

    let titles: Vec<_> = db
        .list_publications()
        .unwrap()
        .into_iter()
        .map(|p| p.title)
        .collect();
    assert_eq!(titles, vec!["Alpha", "beta"]);

    assert!(db.delete_publication("pub-a").unwrap());
    assert!(db.get_publication("pub-a").unwrap().is_none());
    assert!(!db.delete_publication("pub-a").unwrap());
}

#[test]
fn db_transaction_requires_existing_user_and_publication() {
    let db = test_db();
    setup_user_and_publication(&db);

    assert!(db.create_transaction("ghost", "pub-1", "L1").is_err());
    assert!(db.create_transaction("user-1", "ghost", "L1").is_err());
    assert!(db.list_transactions_by_user("user-1").unwrap().is_empty());
}

#[test]
fn db_transaction_lookups_preload_user_and_publication() {
    let db = test_db();
    setup_user_and_publication(&db);

    let created = db.create_transaction("user-1", "pub-1", "L1").unwrap();
    assert!(created.id > 0);

    let detail = db.get_transaction_by_licence("L1").unwrap().unwrap();
    assert_eq!(detail.transaction, created);
    assert_eq!(detail.user.email, "alice@example.com");
    assert_eq!(detail.publication.title, "Moby Dick");

    let detail = db
        .get_transaction_by_user_and_publication("user-1", "pub-1")
        .unwrap()
        .unwrap();
    assert_eq!(detail.transaction.licence_id, "L1");

    assert!(db.get_transaction_by_licence("L2").unwrap().is_none());
    assert!(
        db.get_transaction_by_user_and_publication("user-1", "pub-2")
            .unwrap()
            .is_none()
    );
}

#[test]
fn db_latest_transaction_wins() {
    let db = test_db();
    setup_user_and_publication(&db);
    create_publication(&db, "pub-2", "Walden");

    db.create_transaction("user-1", "pub-1", "L1").unwrap();
    db.create_transaction("user-1", "pub-2", "L2").unwrap();
    db.create_transaction("user-1", "pub-1", "L3").unwrap();

    let current = db
        .get_transaction_by_user_and_publication("user-1", "pub-1")
        .unwrap()
        .unwrap();
    assert_eq!(current.transaction.licence_id, "L3");

    let shelf: Vec<_> = db
        .list_transactions_by_user("user-1")
        .unwrap()
        .into_iter()
        .map(|d| d.transaction.licence_id)
        .collect();
    assert_eq!(shelf, vec!["L3", "L2", "L1"]);
}

#[test]
fn db_update_and_delete_transaction() {
    let db = test_db();
    setup_user_and_publication(&db);

    let tx = db.create_transaction("user-1", "pub-1", "L1").unwrap();
    assert!(db.update_transaction(tx.id, "L1-bis").unwrap());
    assert!(db.get_transaction_by_licence("L1").unwrap().is_none());
    assert!(db.get_transaction_by_licence("L1-bis").unwrap().is_some());

    assert!(db.delete_transaction(tx.id).unwrap());
    assert!(!db.delete_transaction(tx.id).unwrap());
    assert!(db.list_transactions_by_user("user-1").unwrap().is_empty());
}

#[test]
fn db_deleting_publication_removes_transactions() {
    let db = test_db();
    setup_user_and_publication(&db);
    db.create_transaction("user-1", "pub-1", "L1").unwrap();

    db.delete_publication("pub-1").unwrap();
    assert!(db.get_transaction_by_licence("L1").unwrap().is_none());
}

// ========== AUTH ==========

fn new_user(email: &str, password: &str, role: &str) -> NewUser {
    NewUser {
        email: email.to_string(),
        name: String::new(),
        password: password.to_string(),
        passphrase: "blue".to_string(),
        hint: "Favourite colour".to_string(),
        role: role.to_string(),
    }
}

#[test]
fn auth_create_user_and_login() {
    let db = test_db();
    let auth = AuthService::new(db, 30, true);

    let user = auth
        .create_user(&new_user("alice@example.com", "password123", "user"))
        .unwrap();
    assert_eq!(user.email, "alice@example.com");
    assert_eq!(user.name, "alice@example.com");
    assert_eq!(user.role, "user");
    assert_eq!(user.hashed_passphrase, hash_passphrase("blue"));

    let (logged_in, token) = auth.login("alice@example.com", "password123").unwrap();
    assert_eq!(logged_in.id, user.id);
    assert!(!token.is_empty());
}

#[test]
fn auth_validate_token() {
    let db = test_db();
    let auth = AuthService::new(db, 30, true);

    auth.create_user(&new_user("alice@example.com", "pass1234", "admin"))
        .unwrap();
    let (_, token) = auth.login("alice@example.com", "pass1234").unwrap();

    let user = auth.validate_token(&token).unwrap().unwrap();
    assert_eq!(user.email, "alice@example.com");

    assert!(auth.validate_token("invalid_token").unwrap().is_none());
}

#[test]
fn auth_logout() {
    let db = test_db();
    let auth = AuthService::new(db, 30, true);

    auth.create_user(&new_user("bob@example.com", "password", "user"))
        .unwrap();
    let (_, token) = auth.login("bob@example.com", "password").unwrap();

    auth.logout(&token).unwrap();
    assert!(auth.validate_token(&token).unwrap().is_none());
}

#[test]
fn auth_registration_disabled() {
    let db = test_db();
    let auth = AuthService::new(db, 30, false);

    let result = auth.register(&new_user("new@example.com", "password", ""));
    assert!(result.is_err());
}

#[test]
fn auth_register_is_never_admin() {
    let db = test_db();
    let auth = AuthService::new(db, 30, true);

    let user = auth
        .register(&new_user("new@example.com", "password", "admin"))
        .unwrap();
    assert_eq!(user.role, "user");
}

#[test]
fn auth_invalid_password() {
    let db = test_db();
    let auth = AuthService::new(db, 30, true);

    auth.create_user(&new_user("user@example.com", "correct", "user"))
        .unwrap();
    let result = auth.login("user@example.com", "wrong");
    assert!(matches!(result, Err(AppError::Unauthorized(_))));
}

#[test]
fn auth_change_password() {
    let db = test_db();
    let auth = AuthService::new(db, 30, true);

    auth.create_user(&new_user("user@example.com", "oldpass", "user"))
        .unwrap();
    auth.change_password("user@example.com", "newpass").unwrap();

    assert!(auth.login("user@example.com", "oldpass").is_err());
    assert!(auth.login("user@example.com", "newpass").is_ok());
}

#[test]
fn auth_change_passphrase() {
    let db = test_db();
    let auth = AuthService::new(db.clone(), 30, true);

    let user = auth
        .create_user(&new_user("user@example.com", "password", "user"))
        .unwrap();
    assert!(
        auth.change_passphrase("user@example.com", "red", "Other colour")
            .unwrap()
    );

    let user = db.get_user_by_id(&user.id).unwrap().unwrap();
    assert_eq!(user.hashed_passphrase, hash_passphrase("red"));
    assert_eq!(user.text_hint, "Other colour");

    assert!(auth.change_passphrase("user@example.com", "", "hint").is_err());
    assert!(auth.change_passphrase("user@example.com", "red", " ").is_err());
}

#[test]
fn auth_invalid_input_rejected() {
    let db = test_db();
    let auth = AuthService::new(db, 30, true);

    assert!(
        auth.create_user(&new_user("user@example.com", "abc", "user"))
            .is_err()
    );
    assert!(auth.create_user(&new_user("not-an-email", "password", "user")).is_err());
    assert!(auth.create_user(&new_user("", "password", "user")).is_err());
    assert!(
        auth.create_user(&new_user("user@example.com", "password", "root"))
            .is_err()
    );

    let mut no_hint = new_user("user@example.com", "password", "user");
    no_hint.hint.clear();
    assert!(auth.create_user(&no_hint).is_err());
}

#[test]
fn auth_is_admin() {
    let db = test_db();
    let auth = AuthService::new(db, 30, true);

    let admin = auth
        .create_user(&new_user("admin@example.com", "password", "admin"))
        .unwrap();
    let user = auth
        .create_user(&new_user("user@example.com", "password", "user"))
        .unwrap();

    assert!(auth.is_admin(&admin));
    assert!(!auth.is_admin(&user));
}

// ========== CONFIG ==========

#[test]
fn config_parse_toml() {
    let toml = r#"
[server]
bind = "127.0.0.1:9090"
title = "Test Store"
public_base_url = "https://store.example.com/"

[database]
path = "/tmp/test.db"

[auth]
registration = "disabled"
session_days = 7

[license]
print_limit = 20
status_workers = 8

[lcp_server]
url = "https://lcp.example.com"
version = "v1"
username = "admin"
password = "secret"
timeout_seconds = 3
"#;
    let config: Config = toml::from_str(toml).unwrap();
    assert_eq!(config.server.bind.port(), 9090);
    assert_eq!(config.server.title, "Test Store");
    assert!(!config.auth.registration_enabled());
    assert_eq!(config.auth.session_days, 7);
    assert_eq!(config.license.print_limit, 20);
    assert_eq!(config.license.copy_limit, 2000);
    assert_eq!(config.license.status_workers, 8);
    assert_eq!(config.lcp_server.version, ProtocolVersion::V1);
    assert_eq!(config.lcp_server.timeout(), std::time::Duration::from_secs(3));
    assert_eq!(
        config.lcp_server.profile,
        "http://readium.org/lcp/basic-profile"
    );
}

#[test]
fn config_default_values() {
    let config = Config::default();
    assert_eq!(config.server.bind.port(), 8080);
    assert!(config.auth.registration_enabled());
    assert_eq!(config.license.loan_days, 7);
    assert_eq!(config.lcp_server.version, ProtocolVersion::V2);
    assert_eq!(config.lcp_server.timeout_seconds, 10);
}

#[test]
fn config_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(Config::generate_default().as_bytes())
        .unwrap();

    let config = Config::load(&file.path().to_path_buf()).unwrap();
    assert_eq!(config.lcp_server.username, "admin");
    assert_eq!(config.license.status_workers, 4);

    let mut broken = tempfile::NamedTempFile::new().unwrap();
    broken.write_all(b"[server\nbind = ").unwrap();
    assert!(matches!(
        Config::load(&broken.path().to_path_buf()),
        Err(AppError::Config(_))
    ));
}

// ========== ERRORS ==========

#[test]
fn license_server_errors_name_the_publication_only_when_acquiring() {
    let fresh = AppError::from(LcpError::Server { status: 500 });
    assert!(fresh.to_string().starts_with("License Server error"));
    assert_eq!(fresh.status_code().as_u16(), 502);

    let acquiring = AppError::from(LcpError::Server { status: 500 }).for_publication("pub-1");
    assert!(acquiring.to_string().contains("publication pub-1"));
    assert_eq!(acquiring.status_code().as_u16(), 502);
    assert!(acquiring.license_error().is_some());

    let not_found = AppError::NotFound("pub-1".to_string()).for_publication("pub-1");
    assert!(matches!(not_found, AppError::NotFound(_)));
    assert!(not_found.license_error().is_none());

    assert_eq!(
        AppError::Config("bad".to_string()).status_code().as_u16(),
        500
    );
}

// ========== ENTITLEMENTS ==========

#[tokio::test]
async fn acquire_records_transaction_and_status_follows_license() {
    let server = MockServer::start().await;
    let status_href = format!("{}/lsd/L1/status", server.uri());

    Mock::given(method("POST"))
        .and(path("/licenses"))
        .and(header("authorization", BASIC_AUTH))
        .and(body_partial_json(json!({
            "publication_id": "pub-1",
            "user_email": "alice@example.com",
            "pass_hash": hash_passphrase("blue"),
            "print": 10,
            "copy": 2000
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(license_json("L1", &status_href)))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/licenses/L1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(license_json("L1", &status_href)))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/lsd/L1/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "L1",
            "status": "ready",
            "message": "The license is ready",
            "potential_rights": {"end": "2030-01-01T00:00:00Z"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let db = test_db();
    let (user, publication) = setup_user_and_publication(&db);
    let facade = entitlements(&db, &lcp_config(&server.uri(), ProtocolVersion::V2, 5));
    let cancel = CancellationToken::new();

    let acquisition = facade
        .acquire(&user, &publication, &year_rights(), &cancel)
        .await
        .unwrap();
    assert_eq!(acquisition.transaction.licence_id, "L1");
    assert_eq!(acquisition.document.status_url, status_href);

    let shelf = db.list_transactions_by_user("user-1").unwrap();
    assert_eq!(shelf.len(), 1);
    assert_eq!(shelf[0].transaction.licence_id, "L1");

    let status = facade
        .current_status(&LicenseHolder::from(&shelf[0]), &cancel)
        .await;
    assert_eq!(status.status_code, "ready");
    assert_eq!(status.status_message, "The license is ready");
    assert!(status.end_potential_rights.is_some());
    assert_eq!(status.rights.print, Some(10));
}

#[tokio::test]
async fn acquire_speaks_legacy_protocol() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/contents/pub-1/license"))
        .and(body_partial_json(json!({
            "provider": "https://edrlab.org",
            "user": {"id": "user-1", "email": "alice@example.com"},
            "encryption": {"user_key": {"text_hint": "Favourite colour"}}
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(license_json("L9", "")))
        .expect(1)
        .mount(&server)
        .await;

    let db = test_db();
    let (user, publication) = setup_user_and_publication(&db);
    let facade = entitlements(&db, &lcp_config(&server.uri(), ProtocolVersion::V1, 5));

    let acquisition = facade
        .acquire(&user, &publication, &year_rights(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(acquisition.transaction.licence_id, "L9");
}

#[tokio::test]
async fn rejected_acquisition_records_nothing() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/licenses"))
        .respond_with(ResponseTemplate::new(422).set_body_string("unknown publication"))
        .expect(1)
        .mount(&server)
        .await;

    let db = test_db();
    let (user, publication) = setup_user_and_publication(&db);
    let facade = entitlements(&db, &lcp_config(&server.uri(), ProtocolVersion::V2, 5));

    let err = facade
        .acquire(&user, &publication, &year_rights(), &CancellationToken::new())
        .await
        .unwrap_err();
    match &err {
        AppError::Acquisition {
            publication_id,
            source,
        } => {
            assert_eq!(publication_id, "pub-1");
            assert_eq!(source.kind(), ErrorKind::RemoteClient);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("pub-1"));
    assert_eq!(err.status_code().as_u16(), 422);
    assert!(err.to_string().contains("unknown publication"));
    assert!(db.list_transactions_by_user("user-1").unwrap().is_empty());
}

#[tokio::test]
async fn server_failure_and_garbage_record_nothing() {
    let server = MockServer::start().await;
    let db = test_db();
    let (user, publication) = setup_user_and_publication(&db);
    let facade = entitlements(&db, &lcp_config(&server.uri(), ProtocolVersion::V2, 5));
    let cancel = CancellationToken::new();

    let guard = Mock::given(method("POST"))
        .and(path("/licenses"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount_as_scoped(&server)
        .await;
    let err = facade
        .acquire(&user, &publication, &year_rights(), &cancel)
        .await
        .unwrap_err();
    assert_eq!(
        err.license_error().map(LcpError::kind),
        Some(ErrorKind::RemoteServer)
    );
    assert_eq!(err.status_code().as_u16(), 502);
    drop(guard);

    let guard = Mock::given(method("POST"))
        .and(path("/licenses"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount_as_scoped(&server)
        .await;
    let err = facade
        .acquire(&user, &publication, &year_rights(), &cancel)
        .await
        .unwrap_err();
    assert_eq!(
        err.license_error().map(LcpError::kind),
        Some(ErrorKind::Transport)
    );
    assert_eq!(err.status_code().as_u16(), 503);
    drop(guard);

    let guard = Mock::given(method("POST"))
        .and(path("/licenses"))
        .respond_with(ResponseTemplate::new(201).set_body_string("<html>oops</html>"))
        .expect(1)
        .mount_as_scoped(&server)
        .await;
    let err = facade
        .acquire(&user, &publication, &year_rights(), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.license_error().map(LcpError::kind), Some(ErrorKind::Parse));
    drop(guard);

    let _guard = Mock::given(method("POST"))
        .and(path("/licenses"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"links": []})))
        .expect(1)
        .mount_as_scoped(&server)
        .await;
    let err = facade
        .acquire(&user, &publication, &year_rights(), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.license_error().map(LcpError::kind), Some(ErrorKind::Parse));

    assert!(db.list_transactions_by_user("user-1").unwrap().is_empty());
}

#[tokio::test]
async fn unreachable_license_server_is_transport_error() {
    let db = test_db();
    let (user, publication) = setup_user_and_publication(&db);
    // Port 9 (discard) on localhost is closed in test environments.
    let facade = entitlements(&db, &lcp_config("http://127.0.0.1:9", ProtocolVersion::V2, 2));

    let err = facade
        .acquire(&user, &publication, &year_rights(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(
        err.license_error().map(LcpError::kind),
        Some(ErrorKind::Transport)
    );
    assert_eq!(err.status_code().as_u16(), 503);
    assert!(db.list_transactions_by_user("user-1").unwrap().is_empty());
}

#[tokio::test]
async fn cancelled_acquisition_records_nothing() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201).set_body_json(license_json("L1", "")))
        .expect(0)
        .mount(&server)
        .await;

    let db = test_db();
    let (user, publication) = setup_user_and_publication(&db);
    let facade = entitlements(&db, &lcp_config(&server.uri(), ProtocolVersion::V2, 5));

    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = facade
        .acquire(&user, &publication, &year_rights(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Cancelled));
    assert!(db.list_transactions_by_user("user-1").unwrap().is_empty());
}

#[tokio::test]
async fn second_acquisition_supersedes_first() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/licenses"))
        .respond_with(ResponseTemplate::new(201).set_body_json(license_json("L1", "")))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/licenses"))
        .respond_with(ResponseTemplate::new(201).set_body_json(license_json("L2", "")))
        .mount(&server)
        .await;

    let db = test_db();
    let (user, publication) = setup_user_and_publication(&db);
    let facade = entitlements(&db, &lcp_config(&server.uri(), ProtocolVersion::V2, 5));
    let cancel = CancellationToken::new();

    facade
        .acquire(&user, &publication, &year_rights(), &cancel)
        .await
        .unwrap();
    facade
        .acquire(&user, &publication, &year_rights(), &cancel)
        .await
        .unwrap();

    let current = facade.entitlement("user-1", "pub-1").unwrap().unwrap();
    assert_eq!(current.transaction.licence_id, "L2");
    assert_eq!(db.list_transactions_by_user("user-1").unwrap().len(), 2);
}

#[tokio::test]
async fn fresh_license_without_entitlement_makes_no_call() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let db = test_db();
    let (user, publication) = setup_user_and_publication(&db);
    let facade = entitlements(&db, &lcp_config(&server.uri(), ProtocolVersion::V2, 5));

    let err = facade
        .fresh_license(&user, &publication, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotEntitled(ref id) if id == "pub-1"));
    assert_eq!(err.status_code().as_u16(), 403);
}

#[tokio::test]
async fn fresh_license_reissues_stored_licence() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/licenses/L1"))
        .and(header("authorization", BASIC_AUTH))
        .and(body_partial_json(json!({"user_email": "alice@example.com"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(license_json("L1", "")))
        .expect(1)
        .mount(&server)
        .await;

    let db = test_db();
    let (user, publication) = setup_user_and_publication(&db);
    let before = db.create_transaction("user-1", "pub-1", "L1").unwrap();
    let facade = entitlements(&db, &lcp_config(&server.uri(), ProtocolVersion::V2, 5));

    let body = facade
        .fresh_license(&user, &publication, &CancellationToken::new())
        .await
        .unwrap();
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["id"], "L1");

    let after = db.get_transaction_by_licence("L1").unwrap().unwrap();
    assert_eq!(after.transaction, before);
}

#[tokio::test]
async fn status_timeout_yields_unknown_status() {
    let server = MockServer::start().await;
    let status_href = format!("{}/lsd/L1/status", server.uri());

    Mock::given(method("POST"))
        .and(path("/licenses/L1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(license_json("L1", &status_href)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/lsd/L1/status"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"status": "active"}))
                .set_delay(std::time::Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let db = test_db();
    setup_user_and_publication(&db);
    db.create_transaction("user-1", "pub-1", "L1").unwrap();
    let facade = entitlements(&db, &lcp_config(&server.uri(), ProtocolVersion::V2, 1));

    let detail = db.get_transaction_by_licence("L1").unwrap().unwrap();
    let status = facade
        .current_status(&LicenseHolder::from(&detail), &CancellationToken::new())
        .await;
    assert_eq!(status, LicenseStatus::default());
    assert!(status.status_code.is_empty());
    assert!(status.status_message.is_empty());
}

#[tokio::test]
async fn status_failures_never_propagate() {
    let server = MockServer::start().await;
    let status_href = format!("{}/lsd/L1/status", server.uri());

    Mock::given(method("POST"))
        .and(path("/licenses/L1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(license_json("L1", &status_href)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/lsd/L1/status"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/licenses/L2"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let db = test_db();
    setup_user_and_publication(&db);
    let facade = entitlements(&db, &lcp_config(&server.uri(), ProtocolVersion::V2, 5));
    let cancel = CancellationToken::new();

    let holder = |licence_id: &str| LicenseHolder {
        licence_id: licence_id.to_string(),
        publication_id: "pub-1".to_string(),
        licensee: (&db.get_user_by_id("user-1").unwrap().unwrap()).into(),
    };

    assert!(facade.current_status(&holder("L1"), &cancel).await.is_unknown());
    assert!(facade.current_status(&holder("L2"), &cancel).await.is_unknown());
}

#[tokio::test]
async fn status_without_status_link_keeps_rights() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/licenses/L1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(license_json("L1", "")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let db = test_db();
    setup_user_and_publication(&db);
    db.create_transaction("user-1", "pub-1", "L1").unwrap();
    let facade = entitlements(&db, &lcp_config(&server.uri(), ProtocolVersion::V2, 5));

    let detail = db.get_transaction_by_licence("L1").unwrap().unwrap();
    let status = facade
        .current_status(&LicenseHolder::from(&detail), &CancellationToken::new())
        .await;
    assert!(status.is_unknown());
    assert_eq!(status.rights.copy, Some(2000));
}

#[tokio::test]
async fn bookshelf_keeps_creation_order() {
    let server = MockServer::start().await;

    for (id, state) in [("L1", "active"), ("L2", "revoked"), ("L3", "ready")] {
        let status_href = format!("{}/lsd/{}/status", server.uri(), id);
        Mock::given(method("POST"))
            .and(path(format!("/licenses/{}", id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(license_json(id, &status_href)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/lsd/{}/status", id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": state})))
            .mount(&server)
            .await;
    }

    let db = test_db();
    let (user, _) = setup_user_and_publication(&db);
    create_publication(&db, "pub-2", "Walden");
    create_publication(&db, "pub-3", "Dubliners");
    db.create_transaction("user-1", "pub-1", "L1").unwrap();
    db.create_transaction("user-1", "pub-2", "L2").unwrap();
    db.create_transaction("user-1", "pub-3", "L3").unwrap();

    let facade = entitlements(&db, &lcp_config(&server.uri(), ProtocolVersion::V2, 5));
    let shelf = facade
        .bookshelf(&user, &CancellationToken::new())
        .await
        .unwrap();

    let lines: Vec<_> = shelf
        .iter()
        .map(|e| {
            (
                e.detail.transaction.licence_id.as_str(),
                e.status.status_code.as_str(),
            )
        })
        .collect();
    assert_eq!(lines, vec![("L3", "ready"), ("L2", "revoked"), ("L1", "active")]);
}

// ========== HTTP ==========

async fn spawn_app(lcp_url: &str) -> (String, AppState) {
    let db = test_db();
    let mut config = Config::default();
    config.lcp_server = lcp_config(lcp_url, ProtocolVersion::V2, 5);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    config.server.public_base_url = base_url.clone();

    let auth = AuthService::new(db.clone(), 30, true);
    let state = AppState::new_with_db(config, db, auth).unwrap();
    let app = server::create_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (base_url, state)
}

fn no_redirect_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

#[tokio::test]
async fn http_acquire_streams_license() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/licenses"))
        .respond_with(ResponseTemplate::new(201).set_body_json(license_json("L1", "")))
        .expect(1)
        .mount(&server)
        .await;

    let (base_url, state) = spawn_app(&server.uri()).await;
    let (user, publication) = setup_user_and_publication(&state.db);
    let token = "session-token";
    state
        .db
        .create_session(&Session {
            token: token.to_string(),
            user_id: user.id.clone(),
            expires_at: now_timestamp() + 3600,
        })
        .unwrap();

    let client = no_redirect_client();
    let url = format!("{}/api/publications/{}/license", base_url, publication.id);

    let resp = client.post(&url).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 401);

    let resp = client
        .post(format!("{}?print=-1&copy=abc", url))
        .bearer_auth(token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.headers()["content-type"], LICENSE_MIME);
    assert_eq!(
        resp.headers()["content-disposition"],
        "attachment; filename=\"Moby Dick.lcpl\""
    );
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["id"], "L1");

    let current = state.entitlements.entitlement("user-1", "pub-1").unwrap();
    assert_eq!(current.unwrap().transaction.licence_id, "L1");

    let requests = server.received_requests().await.unwrap();
    let sent: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert!(sent.get("print").is_none());
    assert_eq!(sent["copy"], 2000);
}

#[tokio::test]
async fn http_web_flow_redirects_on_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/licenses"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let (base_url, state) = spawn_app(&server.uri()).await;
    let (user, _) = setup_user_and_publication(&state.db);
    state
        .db
        .create_session(&Session {
            token: "cookie-token".to_string(),
            user_id: user.id,
            expires_at: now_timestamp() + 3600,
        })
        .unwrap();

    let client = no_redirect_client();

    let resp = client
        .get(format!("{}/catalog/publication/pub-1/license", base_url))
        .header("cookie", "pubstore_session=cookie-token")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 302);
    let location = resp.headers()["location"].to_str().unwrap().to_string();
    assert!(location.starts_with("/catalog/publication/pub-1?err="));

    let resp = client
        .get(format!("{}/catalog/publication/pub-1/fresh", base_url))
        .header("cookie", "pubstore_session=cookie-token")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 302);
    assert_eq!(
        resp.headers()["location"],
        "/catalog/publication/pub-1/license"
    );
}

#[tokio::test]
async fn http_opds_links_follow_authentication() {
    let server = MockServer::start().await;
    let (base_url, state) = spawn_app(&server.uri()).await;
    let (user, _) = setup_user_and_publication(&state.db);
    state
        .db
        .create_session(&Session {
            token: "opds-token".to_string(),
            user_id: user.id,
            expires_at: now_timestamp() + 3600,
        })
        .unwrap();

    let client = no_redirect_client();
    let url = format!("{}/opds/publication/pub-1", base_url);

    let anonymous: Value = client.get(&url).send().await.unwrap().json().await.unwrap();
    assert_eq!(
        anonymous["links"][1]["href"],
        format!("{}/opds/publication/pub-1/borrow", base_url)
    );

    let resp = client
        .get(format!("{}/borrow", url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);
    assert_eq!(
        resp.headers()["content-type"],
        "application/opds-authentication+json"
    );

    let authenticated: Value = client
        .get(&url)
        .bearer_auth("opds-token")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        authenticated["links"][1]["href"],
        format!("{}/opds/publication/pub-1/loan", base_url)
    );

    let catalog: Value = client
        .get(format!("{}/opds/catalog", base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(catalog["publications"][0]["metadata"]["title"], "Moby Dick");
}
