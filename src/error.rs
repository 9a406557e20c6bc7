use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SyncError {
    #[error(
        "collection \"{dataset}\" not found; either it does not exist or credentials are needed for restricted data. Available collections:\n{}",
        available.join("\n")
    )]
    NotFound {
        dataset: String,
        available: Vec<String>,
    },

    #[error("request failed {attempts} times for {url}")]
    RequestExhausted { url: String, attempts: u32 },

    #[error("transfer of {dataset} incomplete: {remaining} item(s) still missing after all passes")]
    TransferIncomplete { dataset: String, remaining: usize },

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("interrupted")]
    Cancelled,

    #[error("HTTP client error: {0}")]
    Http(String),

    #[error("unexpected response from remote service: {0}")]
    InvalidResponse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse YAML config: {0}")]
    ConfigParse(String),

    #[error("unsupported downloader \"{0}\" (supported: TciaDownloader, nbia, Manual)")]
    UnsupportedDownloader(String),

    #[error("unsupported registry module \"{0}\" (supported: keep_patients)")]
    UnsupportedModule(String),
}

