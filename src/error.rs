//! Error types for the job server.

use std::path::PathBuf;

use crate::job::JobId;

/// Errors returned by [`JobStore`](crate::store::JobStore) implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An insert collided with an existing job's idempotency key. Carries the
    /// id of the job already stored under that key.
    #[error("a job with this idempotency key already exists as {existing}")]
    DuplicateIdempotencyKey {
        /// Id of the job already stored under the colliding key.
        existing: JobId,
    },

    /// A stored row held a value the data model cannot represent.
    #[error("invalid value in stored row: {0}")]
    Decode(String),

    /// The underlying database failed.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Applying the schema migrations failed.
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Not one of `pending`, `processing`, `completed`, `failed`, `cancelled`.
    #[error("invalid job status `{0}`")]
    InvalidStatus(String),

    /// Not one of `low`, `normal`, `high`.
    #[error("invalid job priority `{0}`")]
    InvalidPriority(String),

    /// Not one of `exponential`, `fixed`.
    #[error("invalid retry strategy `{0}`")]
    InvalidStrategy(String),

    /// The configuration file could not be read.
    #[error("failed to read config file {path}")]
    ConfigRead {
        /// Path of the file that could not be read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML.
    #[error("failed to parse config file {path}")]
    ConfigParse {
        /// Path of the file that failed to parse.
        path: PathBuf,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },
}
