use thiserror::Error;

use crate::retry::ErrorClass;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Transient transfer error: {0}")]
    Transient(String),

    #[error("Permanent transfer error: {0}")]
    Permanent(String),

    /// The remote representation changed since the partial download began
    #[error("Remote resource changed: {0}")]
    ValidationMismatch(String),

    #[error("Local storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Task store error: {0}")]
    Store(#[from] StoreError),
}

impl TransferError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TransferError::Transient(_) | TransferError::ValidationMismatch(_) => {
                ErrorClass::Transient
            }
            TransferError::Permanent(_) | TransferError::Storage(_) | TransferError::Store(_) => {
                ErrorClass::Permanent
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            TransferError::Transient("reset".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            TransferError::ValidationMismatch("etag".into()).class(),
            ErrorClass::Transient
        );
        let disk_full = std::io::Error::new(std::io::ErrorKind::StorageFull, "disk full");
        assert_eq!(TransferError::from(disk_full).class(), ErrorClass::Permanent);
    }
}
