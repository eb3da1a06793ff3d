// Web服务器模块

pub mod error;
pub mod handlers;
pub mod state;

use axum::{routing::get, Router};
use tower_http::{services::ServeFile, trace::TraceLayer};

pub use state::AppState;

/// 构建路由
pub fn build_router(state: AppState) -> Router {
    let index_page = ServeFile::new(&state.config.server.index_path);

    Router::new()
        .route_service("/", index_page)
        .route("/favicon.ico", get(handlers::favicon))
        .route("/health", get(handlers::health_check))
        .route("/archive/:id", get(handlers::download_archive))
        .route("/archive/:id/", get(handlers::download_archive))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
