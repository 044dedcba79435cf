use thiserror::Error;

use super::models::CreateTaskRequest;

const MAX_FILE_NAME_LEN: usize = 255;
const MAX_IDENTIFIER_LEN: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestValidationError {
    #[error("url must be an http/https url")]
    InvalidUrl,
    #[error("file_name must be between 1 and {MAX_FILE_NAME_LEN} characters")]
    InvalidFileName,
    #[error("identifier exceeds {MAX_IDENTIFIER_LEN} characters")]
    IdentifierTooLong,
    #[error("metadata must be an object when present")]
    InvalidMetadata,
    #[error("selected_files must be an array when present")]
    InvalidSelectedFiles,
}

/// Shape checks on a submission. Path safety of `file_name` is enforced by
/// the manager.
pub fn validate_create(request: &CreateTaskRequest) -> Result<(), RequestValidationError> {
    if !request.url.starts_with("http://") && !request.url.starts_with("https://") {
        return Err(RequestValidationError::InvalidUrl);
    }

    if request.file_name.is_empty() || request.file_name.len() > MAX_FILE_NAME_LEN {
        return Err(RequestValidationError::InvalidFileName);
    }

    if request.identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(RequestValidationError::IdentifierTooLong);
    }

    if let Some(metadata) = &request.metadata {
        if !metadata.is_object() {
            return Err(RequestValidationError::InvalidMetadata);
        }
    }

    if let Some(selected) = &request.selected_files {
        if !selected.is_array() {
            return Err(RequestValidationError::InvalidSelectedFiles);
        }
    }

    Ok(())
}
