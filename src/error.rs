//! Error types for start-up failures.
//!
//! Everything in here is fatal: these errors only come out of the bootstrap
//! path, and the Lambda never starts serving traffic if one is raised.
//! Per-request problems are either a synthetic 404 (see `routing`) or a plain
//! boxed `lambda_http::Error`.

use std::path::PathBuf;

/// Problems with the deployment configuration: environment variables, the
/// settings file, or the metadata file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("required environment variable `{0}` is not set")]
    MissingEnv(&'static str),

    #[error("environment variable `{name}` should be a boolean, got {value:?}")]
    InvalidEnvBool { name: &'static str, value: String },

    #[error("invalid database file list {value:?}: {reason}")]
    InvalidDbFiles { value: String, reason: String },

    #[error("{line:?} should be name:value")]
    MissingSeparator { line: String },

    #[error("unknown config setting: {0}")]
    UnknownSetting(String),

    #[error("config setting `{key}` should be a boolean, got {value:?}")]
    InvalidBool { key: String, value: String },

    #[error("config setting `{key}` should be an integer, got {value:?}")]
    InvalidInt {
        key: String,
        value: String,
        #[source]
        source: std::num::ParseIntError,
    },

    #[error("invalid metadata file `{}`: {reason}", path.display())]
    InvalidMetadata { path: PathBuf, reason: String },

    #[error("I/O error reading `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Problems materializing the database files on local disk.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// This should never happen with a sane build.
    #[error("some, but not all, dbs were in the deployment package: expected {expected:?}; got {found:?}")]
    PartialBundle {
        expected: Vec<String>,
        found: Vec<PathBuf>,
    },

    #[error("database `{0}` must be fetched but no bucket is configured")]
    NoBucket(String),

    #[error("failed to fetch s3://{bucket}/{key}: {source}")]
    Fetch {
        bucket: String,
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("I/O error on `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
