mod api;
mod error;
mod state;
mod types;

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::limit::RequestBodyLimitLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use self::state::*;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::validate_handler,
        api::get_settings_handler,
        api::update_settings_handler,
        api::upload_handler,
        api::search_handler,
        api::image_handler,
        api::stats_handler,
    ),
    components(schemas(
        types::UploadForm,
        types::UploadResponse,
        types::SearchRequest,
        types::SearchResponse,
        types::SearchResult,
        types::StatsResponse,
        types::ValidateResponse,
    ))
)]
pub struct ApiDoc;

/// 构建API服务器
pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(api::index_page))
        .route("/settings", get(api::settings_page))
        .route("/api/validate", get(api::validate_handler))
        .route("/api/settings", get(api::get_settings_handler).post(api::update_settings_handler))
        .route("/api/upload", post(api::upload_handler))
        .route("/api/search", post(api::search_handler))
        .route("/api/image/{*path}", get(api::image_handler))
        .route("/api/stats", get(api::stats_handler))
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(DefaultBodyLimit::disable())
        // 上传限制：500M
        .layer(RequestBodyLimitLayer::new(500 * 1024 * 1024))
        .with_state(state)
}
