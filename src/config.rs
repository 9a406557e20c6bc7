use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::catalog::BackendKind;
use crate::error::SyncError;
use crate::modules::{DatasetModule, ModuleEntry};

/// Contents of `datasets.yaml`: dataset name to download instructions.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(transparent)]
pub struct DatasetRegistry {
    pub datasets: BTreeMap<String, DatasetEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DatasetEntry {
    #[serde(default)]
    pub downloader: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub bids: Option<BidsEntry>,
    #[serde(default)]
    pub modules: Vec<ModuleEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BidsEntry {
    #[serde(rename = "subject-prefix")]
    pub subject_prefix: String,
    #[serde(rename = "session-prefix")]
    pub session_prefix: String,
}

/// Contents of `credentials.yaml`: downloader name to login data.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(transparent)]
pub struct CredentialsFile {
    pub downloaders: BTreeMap<String, Credentials>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Credentials {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    Public,
    Password { user: String, password: String },
    Token(String),
}

impl Credentials {
    /// Unset or blank fields mean public access.
    pub fn access(&self) -> Access {
        if let Some(token) = non_blank(&self.token) {
            return Access::Token(token);
        }
        match (non_blank(&self.user), non_blank(&self.password)) {
            (Some(user), Some(password)) => Access::Password { user, password },
            _ => Access::Public,
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// What one dataset run needs from the registry, after fallbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDataset {
    pub name: String,
    pub backend: BackendKind,
    pub entry: DatasetEntry,
    pub modules: Vec<DatasetModule>,
}

impl DatasetRegistry {
    pub fn resolve(&self, name: &str) -> Result<ResolvedDataset, SyncError> {
        match self.datasets.get(name) {
            Some(entry) => {
                let backend = match entry.downloader.as_deref() {
                    Some(downloader) => downloader.parse()?,
                    None => BackendKind::Nbia,
                };
                let modules = entry
                    .modules
                    .iter()
                    .map(DatasetModule::try_from)
                    .collect::<Result<Vec<_>, _>>()?;
                info!(dataset = name, downloader = %backend, modules = modules.len(), "found registry entry");
                Ok(ResolvedDataset {
                    name: name.to_string(),
                    backend,
                    entry: entry.clone(),
                    modules,
                })
            }
            None => {
                warn!(
                    dataset = name,
                    "no registry entry; falling back to the NBIA downloader"
                );
                Ok(ResolvedDataset {
                    name: name.to_string(),
                    backend: BackendKind::Nbia,
                    entry: DatasetEntry::default(),
                    modules: Vec::new(),
                })
            }
        }
    }
}

impl CredentialsFile {
    pub fn for_backend(&self, backend: BackendKind) -> Credentials {
        let key = backend.to_string();
        match self.downloaders.get(&key) {
            Some(credentials) => {
                if credentials.access() == Access::Public {
                    info!(downloader = %key, "credentials are empty; only public datasets supported");
                }
                credentials.clone()
            }
            None => {
                info!(downloader = %key, "no credentials entry; only public datasets supported");
                Credentials::default()
            }
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn registry(path: &Path) -> Result<DatasetRegistry, SyncError> {
        Self::load_optional(path)
    }

    pub fn credentials(path: &Path) -> Result<CredentialsFile, SyncError> {
        Self::load_optional(path)
    }

    /// A missing file reads as the empty default; an unreadable or malformed one is an error.
    fn load_optional<T: DeserializeOwned + Default>(path: &Path) -> Result<T, SyncError> {
        if !path.exists() {
            warn!(path = %path.display(), "config file not found; using defaults");
            return Ok(T::default());
        }
        let content =
            fs::read_to_string(path).map_err(|_| SyncError::ConfigRead(path.to_path_buf()))?;
        Self::parse(&content)
    }

    pub fn parse<T: DeserializeOwned + Default>(content: &str) -> Result<T, SyncError> {
        if content.trim().is_empty() {
            return Ok(T::default());
        }
        serde_yaml::from_str(content).map_err(|err| SyncError::ConfigParse(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_credentials_are_public() {
        let credentials = Credentials {
            user: Some(" ".to_string()),
            password: None,
            token: Some(String::new()),
        };
        assert_eq!(credentials.access(), Access::Public);
    }

    #[test]
    fn token_wins_over_password() {
        let credentials = Credentials {
            user: Some("u".to_string()),
            password: Some("p".to_string()),
            token: Some("t".to_string()),
        };
        assert_eq!(credentials.access(), Access::Token("t".to_string()));
    }
}
