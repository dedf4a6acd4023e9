use thiserror;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("sqlx error: {0}")]
    SQLXError(#[from] sqlx::Error),
    #[error("sqlx migration error: {0}")]
    SQLXMigrateError(#[from] sqlx::migrate::MigrateError),
    #[error("sea-query error: {0}")]
    SeaQueryError(#[from] sea_query::error::Error),

    #[error("error serializing to value: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    #[error("record already exists: {0}")]
    Conflict(String),

    #[error("registry error: {0}")]
    StevedoreError(#[from] stevedore_core::Error),
}

impl From<Error> for stevedore_core::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::StevedoreError(e) => e,
            _ => stevedore_core::Error::backend(e),
        }
    }
}
