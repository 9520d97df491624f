//! HTTP server and routes.

mod handlers;
mod state;

pub use state::AppState;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let web_routes = Router::new()
        .route("/publication/{id}", get(handlers::catalog_publication))
        .route("/publication/{id}/license", get(handlers::catalog_acquire))
        .route("/publication/{id}/fresh", get(handlers::catalog_fresh));

    let auth_routes = Router::new()
        .route("/login", post(handlers::auth_login))
        .route("/register", post(handlers::auth_register))
        .route("/logout", post(handlers::auth_logout))
        .route("/me", get(handlers::auth_me));

    let api_routes = Router::new()
        .route(
            "/publications",
            get(handlers::api_publications).post(handlers::api_create_publication),
        )
        .route(
            "/publications/{id}",
            get(handlers::api_publication).delete(handlers::api_delete_publication),
        )
        .route(
            "/publications/{id}/license",
            get(handlers::api_fresh_license).post(handlers::api_acquire),
        )
        .route("/publications/{id}/status", get(handlers::api_status))
        .route("/bookshelf", get(handlers::api_bookshelf));

    let opds_routes = Router::new()
        .route("/catalog", get(handlers::opds_catalog))
        .route("/bookshelf", get(handlers::opds_bookshelf))
        .route("/token", post(handlers::opds_token))
        .route("/publication/{id}", get(handlers::opds_publication))
        .route("/publication/{id}/borrow", get(handlers::opds_borrow))
        .route("/publication/{id}/loan", get(handlers::opds_loan))
        .route("/publication/{id}/license", get(handlers::opds_license));

    Router::new()
        .route("/", get(handlers::index))
        .nest("/catalog", web_routes)
        .nest("/api/auth", auth_routes)
        .nest("/api", api_routes)
        .nest("/opds", opds_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
