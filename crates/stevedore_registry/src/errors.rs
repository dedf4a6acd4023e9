use thiserror;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A storage or record store operation failed; `op` names what was being attempted.
    #[error("{op}: {source}")]
    Storage {
        op: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("reference count of {0} kept changing, gave up after {1} attempts")]
    RefCountContention(String, usize),

    #[error(transparent)]
    Stevedore(#[from] stevedore_core::Error),
}

impl From<Error> for stevedore_core::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Stevedore(e) => e,
            _ => stevedore_core::Error::backend(e),
        }
    }
}

/// Attach the failing operation to storage and record store errors.
pub(crate) trait Context<T> {
    fn context(self, op: impl FnOnce() -> String) -> Result<T>;
}

impl<T> Context<T> for std::result::Result<T, stevedore_objectstore::Error> {
    fn context(self, op: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|e| Error::Storage {
            op: op(),
            source: Box::new(e),
        })
    }
}

impl<T> Context<T> for stevedore_core::Result<T> {
    fn context(self, op: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|e| match e {
            stevedore_core::Error::BackendError(source) => Error::Storage { op: op(), source },
            e => Error::Stevedore(e),
        })
    }
}
