//! Custom error types for geoingest

use thiserror::Error;

/// Main error type for geoingest operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Manifest parse error: {0}")]
    ManifestParse(String),

    #[error("Missing source for {0}: file path does not exist and no download URL was specified")]
    MissingSource(String),

    #[error("Integrity check failed for {file}: expected {expected}, got {actual}")]
    Integrity {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("Unsupported hash format: {0}")]
    UnsupportedHash(String),

    #[error("Download failed for {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("No administrative owner configured: pass --owner or set `owner` in config.toml")]
    MissingAdministrator,

    #[error("Conversion failed for {file}: {message}")]
    Conversion { file: String, message: String },

    #[error("Extension load error: {0}")]
    ExtensionLoad(String),

    #[error("Job error: {0}")]
    Job(String),

    #[error("Job {0} has already completed")]
    JobTerminal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn conversion(file: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Error::Conversion {
            file: file.into(),
            message: message.to_string(),
        }
    }

    /// Whether this error aborts a whole manifest run rather than a single item
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::MissingAdministrator | Error::ManifestParse(_) | Error::Database(_)
        )
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(format!("{:#}", err))
    }
}

/// Result type alias for geoingest
pub type Result<T> = std::result::Result<T, Error>;
