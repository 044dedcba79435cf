//! Range-capable HTTP source for transfers

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use reqwest::header::{HeaderMap, CONTENT_RANGE, ETAG, IF_RANGE, LAST_MODIFIED, RANGE};
use reqwest::{Client, Proxy, StatusCode};
use std::time::Duration;
use tracing::debug;

use crate::task::Validators;

use super::error::{Result, TransferError};

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            user_agent: concat!("tidefetch/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// One GET against the remote source, optionally resuming at `offset`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub offset: u64,
    /// Validator sent as `If-Range` so a changed resource yields a full body
    pub if_range: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// 200: the whole representation from byte zero
    Full,
    /// 206: the representation starting at `start`
    Partial { start: u64 },
    /// 416: nothing left at the requested offset
    RangeNotSatisfiable,
}

pub type BodyStream = BoxStream<'static, Result<Bytes>>;

pub struct SourceResponse {
    pub kind: ResponseKind,
    /// Full size of the representation, when the source reports it
    pub total_bytes: Option<u64>,
    pub validators: Validators,
    pub body: BodyStream,
}

impl std::fmt::Debug for SourceResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceResponse")
            .field("kind", &self.kind)
            .field("total_bytes", &self.total_bytes)
            .field("validators", &self.validators)
            .finish_non_exhaustive()
    }
}

/// Remote byte source used by the task runner
#[async_trait]
pub trait HttpSource: Send + Sync + 'static {
    async fn fetch(&self, request: FetchRequest) -> Result<SourceResponse>;
}

/// [`HttpSource`] backed by reqwest
pub struct ReqwestSource {
    client: Client,
}

impl ReqwestSource {
    pub fn new(config: &HttpConfig, proxy_url: Option<&str>) -> Result<Self> {
        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(10));

        if let Some(url) = proxy_url {
            let proxy = Proxy::all(url)
                .map_err(|e| TransferError::Permanent(format!("Invalid proxy: {}", e)))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| TransferError::Permanent(e.to_string()))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl HttpSource for ReqwestSource {
    async fn fetch(&self, request: FetchRequest) -> Result<SourceResponse> {
        debug!(url = %request.url, offset = request.offset, "Starting request");

        let mut builder = self.client.get(&request.url);
        if request.offset > 0 {
            builder = builder.header(RANGE, format!("bytes={}-", request.offset));
            if let Some(validator) = &request.if_range {
                builder = builder.header(IF_RANGE, validator);
            }
        }

        let response = builder.send().await.map_err(classify_reqwest_error)?;
        let status = response.status();
        let headers = response.headers();
        let validators = Validators {
            etag: header_string(headers, ETAG),
            last_modified: header_string(headers, LAST_MODIFIED),
        };
        let content_range = header_string(headers, CONTENT_RANGE)
            .as_deref()
            .and_then(parse_content_range);

        let (kind, total_bytes) = match status {
            StatusCode::RANGE_NOT_SATISFIABLE => (
                ResponseKind::RangeNotSatisfiable,
                content_range.and_then(|range| range.total),
            ),
            StatusCode::PARTIAL_CONTENT => {
                let range = content_range.ok_or_else(|| {
                    TransferError::Permanent("206 response without a Content-Range".to_string())
                })?;
                let start = range.start.ok_or_else(|| {
                    TransferError::Permanent("206 response with an unsatisfied range".to_string())
                })?;
                (ResponseKind::Partial { start }, range.total)
            }
            status if status.is_success() => (ResponseKind::Full, response.content_length()),
            status => return Err(classify_status(status)),
        };

        debug!(
            url = %request.url,
            status = status.as_u16(),
            total_bytes = ?total_bytes,
            "Response received"
        );

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(classify_reqwest_error))
            .boxed();

        Ok(SourceResponse {
            kind,
            total_bytes,
            validators,
            body,
        })
    }
}

fn header_string(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Parsed `Content-Range: bytes <start>-<end>/<total>` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub total: Option<u64>,
}

pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let spec = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = spec.split_once('/')?;

    let total = match total.trim() {
        "*" => None,
        total => Some(total.parse().ok()?),
    };
    let (start, end) = match range.trim() {
        "*" => (None, None),
        range => {
            let (start, end) = range.split_once('-')?;
            (Some(start.trim().parse().ok()?), Some(end.trim().parse().ok()?))
        }
    };

    Some(ContentRange { start, end, total })
}

/// Map a non-success HTTP status to a transfer error
pub fn classify_status(status: StatusCode) -> TransferError {
    let message = format!(
        "HTTP {}: {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown")
    );
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            TransferError::Transient(message)
        }
        status if status.is_server_error() => TransferError::Transient(message),
        _ => TransferError::Permanent(message),
    }
}

fn classify_reqwest_error(error: reqwest::Error) -> TransferError {
    if error.is_builder() || error.is_redirect() {
        TransferError::Permanent(error.to_string())
    } else if error.is_timeout() {
        TransferError::Transient(format!("Connection timeout: {}", error))
    } else {
        TransferError::Transient(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::ErrorClass;

    #[test]
    fn test_http_config_defaults() {
        let config = HttpConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.read_timeout, Duration::from_secs(60));
        assert!(config.user_agent.starts_with("tidefetch/"));
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(
            parse_content_range("bytes 400-999/1000"),
            Some(ContentRange {
                start: Some(400),
                end: Some(999),
                total: Some(1000)
            })
        );
        assert_eq!(
            parse_content_range("bytes 0-99/*").map(|r| r.total),
            Some(None)
        );
        assert_eq!(
            parse_content_range("bytes */1000"),
            Some(ContentRange {
                start: None,
                end: None,
                total: Some(1000)
            })
        );
        assert!(parse_content_range("items 0-1/2").is_none());
        assert!(parse_content_range("bytes abc-1/2").is_none());
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS).class(),
            ErrorClass::Transient
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND).class(), ErrorClass::Permanent);
        assert_eq!(classify_status(StatusCode::FORBIDDEN).class(), ErrorClass::Permanent);
        assert_eq!(classify_status(StatusCode::GONE).class(), ErrorClass::Permanent);
    }
}
