use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(rusqlite::Error),

    /// Structural damage to the database file. Fatal — the process must not
    /// keep accepting writes against a corrupt store.
    #[error("database corruption detected: {0}")]
    Corruption(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid stored value: {0}")]
    BadRow(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ffi, ref message) = e {
            if matches!(
                ffi.code,
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase
            ) {
                return StoreError::Corruption(
                    message.clone().unwrap_or_else(|| ffi.to_string()),
                );
            }
        }
        StoreError::Sqlite(e)
    }
}

impl StoreError {
    /// True for errors after which the process should exit non-zero.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Corruption(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
