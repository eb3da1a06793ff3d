// 辅助端点

use axum::http::StatusCode;

/// GET /favicon.ico
pub async fn favicon() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// GET /health
pub async fn health_check() -> &'static str {
    "ok"
}
