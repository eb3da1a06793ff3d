// 错误到 HTTP 响应的映射（纯文本响应体）

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::archive::ArchiveError;

impl IntoResponse for ArchiveError {
    fn into_response(self) -> Response {
        let status = match &self {
            ArchiveError::NotFound(_) => StatusCode::NOT_FOUND,
            ArchiveError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            ArchiveError::Spawn(_)
            | ArchiveError::ProducerFailure { .. }
            | ArchiveError::Io(_)
            | ArchiveError::InjectedFault(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, self.to_string()).into_response()
    }
}
