//! 归档下载 API 处理器

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::archive::{ArchiveError, ArchiveRequest, ArchiveTransfer, FaultKind, RateLimit};
use crate::server::AppState;

/// 下载参数
#[derive(Debug, Default, Deserialize)]
pub struct ArchiveQuery {
    /// 限速（KB/s），覆盖默认配置；<= 0 表示不限速，无法解析时使用默认配置
    #[serde(default)]
    pub rate: Option<String>,
    /// 注入故障（仅在配置开启时生效）
    #[serde(default)]
    pub fault: Option<String>,
}

/// GET /archive/:id
/// GET /archive/:id/
/// 把目录打包为 ZIP 并以流的方式返回
pub async fn download_archive(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ArchiveQuery>,
) -> Result<Response, ArchiveError> {
    let directory = state.resolver.resolve(&id).await?;

    let archive = &state.config.archive;
    let requested_rate = parse_rate(query.rate.as_deref());
    let rate_limit = RateLimit::resolve(archive.throttle_kbps, requested_rate, archive.min_rate_kbps);
    let fault = parse_fault(archive.fault_injection, query.fault.as_deref());

    let request = ArchiveRequest::new(id.clone(), directory)
        .with_rate_limit(rate_limit)
        .with_fault(fault);

    let (transfer, body) = ArchiveTransfer::start(
        request,
        &state.producer,
        &state.transfer_options(),
        state.shutdown.child_token(),
    )
    .await?;

    info!(
        "开始发送归档: archive_id={}, transfer_id={}, 限速={:?} KB/s",
        id,
        transfer.transfer_id(),
        rate_limit.map(|r| r.kbps())
    );

    state.tasks.spawn(async move {
        if let Err(e) = transfer.run().await {
            debug!("归档转发任务以错误结束: {}", e);
        }
    });

    Ok((archive_headers(&id), body).into_response())
}

fn parse_rate(raw: Option<&str>) -> Option<f64> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse::<f64>() {
        Ok(rate) => Some(rate),
        Err(_) => {
            debug!("忽略无效的限速参数: rate={:?}", raw);
            None
        }
    }
}

fn parse_fault(enabled: bool, raw: Option<&str>) -> Option<FaultKind> {
    let raw = raw?;
    if !enabled {
        debug!("故障注入未开启，忽略 fault={}", raw);
        return None;
    }
    match raw.parse::<FaultKind>() {
        Ok(kind) => {
            warn!("注入故障: {}", kind);
            Some(kind)
        }
        Err(e) => {
            warn!("{}", e);
            None
        }
    }
}

/// 归档响应头
pub fn archive_headers(id: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/zip"));
    headers.insert(header::CONTENT_DISPOSITION, content_disposition(id));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    // 禁止反向代理缓冲响应
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    headers
}

/// `filename` 只保留安全的 ASCII 字符，`filename*` 携带 UTF-8 编码的完整名称
fn content_disposition(id: &str) -> HeaderValue {
    let ascii: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_graphic() && !matches!(c, '"' | ';' | ',' | '\\') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let value = format!(
        "attachment; filename=photos-{}.zip; filename*=UTF-8''photos-{}.zip",
        ascii,
        urlencoding::encode(id)
    );
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_headers() {
        let headers = archive_headers("3fa9c1");
        assert_eq!(headers[header::CONTENT_TYPE], "application/zip");
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
        assert_eq!(headers["x-accel-buffering"], "no");
        assert_eq!(
            headers[header::CONTENT_DISPOSITION],
            "attachment; filename=photos-3fa9c1.zip; filename*=UTF-8''photos-3fa9c1.zip"
        );
    }

    #[test]
    fn test_content_disposition_non_ascii() {
        let value = content_disposition("相册 1");
        assert_eq!(
            value,
            "attachment; filename=photos-___1.zip; filename*=UTF-8''photos-%E7%9B%B8%E5%86%8C%201.zip"
        );
    }

    #[test]
    fn test_parse_rate() {
        assert_eq!(parse_rate(Some("32")), Some(32.0));
        assert_eq!(parse_rate(Some(" 0.5 ")), Some(0.5));
        assert_eq!(parse_rate(Some("-1")), Some(-1.0));
        assert_eq!(parse_rate(Some("abc")), None);
        assert_eq!(parse_rate(Some("")), None);
        assert_eq!(parse_rate(None), None);
    }

    #[test]
    fn test_parse_fault() {
        assert_eq!(parse_fault(true, Some("panic")), Some(FaultKind::Panic));
        assert_eq!(parse_fault(false, Some("panic")), None);
        assert_eq!(parse_fault(true, Some("unknown")), None);
        assert_eq!(parse_fault(true, None), None);
    }
}
