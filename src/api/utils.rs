//! Request parsing helpers shared by the handlers

use crate::api::error::ApiError;
use crate::task::TaskStatus;

/// Upper bound on `GET /tasks?limit=`
pub const MAX_LIST_LIMIT: usize = 1000;

/// Accepts `application/json` with optional parameters, nothing else
pub fn parse_content_type(content_type: &str) -> Result<mime::Mime, ApiError> {
    let media_type: mime::Mime = content_type.parse().map_err(|_| {
        ApiError::InvalidPayload(format!("invalid Content-Type: {}", content_type))
    })?;

    if media_type.type_() != mime::APPLICATION || media_type.subtype() != mime::JSON {
        return Err(ApiError::InvalidPayload(format!(
            "Content-Type must be application/json, got: {}/{}",
            media_type.type_(),
            media_type.subtype()
        )));
    }

    Ok(media_type)
}

pub fn validate_body_size(data: &[u8], max_size: usize) -> Result<(), ApiError> {
    if data.len() > max_size {
        return Err(ApiError::PayloadTooLarge(data.len()));
    }
    Ok(())
}

/// Status filter from the query string; empty means no filter
pub fn parse_status_filter(value: Option<&str>) -> Result<Option<TaskStatus>, ApiError> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => raw
            .parse::<TaskStatus>()
            .map(Some)
            .map_err(|e| ApiError::InvalidPayload(e.to_string())),
    }
}

pub fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(MAX_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}
