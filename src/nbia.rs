use std::fs::{self, File};
use std::path::Path;
use std::sync::Mutex;

use chrono::{TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::cache::ResponseCache;
use crate::catalog::Catalog;
use crate::config::{Access, Credentials};
use crate::domain::{AuthToken, DigestSet, ItemMetadata, RemoteItem, parse_acquisition_date};
use crate::error::SyncError;
use crate::fs_util;
use crate::http::{CancelToken, RequestPolicy, RetryingHttp, build_client};

pub const PUBLIC_BASE_URL: &str =
    "https://services.cancerimagingarchive.net/nbia-api/services/v1/";
pub const AUTHENTICATED_BASE_URL: &str =
    "https://services.cancerimagingarchive.net/nbia-api/services/v2/";
pub const ADVANCED_BASE_URL: &str = "https://services.cancerimagingarchive.net/nbia-api/services/";
pub const TOKEN_URL: &str =
    "https://keycloak.dbmi.cloud/auth/realms/TCIA/protocol/openid-connect/token";

/// Tokens are issued for two hours; renew a little before that.
pub fn token_validity() -> TimeDelta {
    TimeDelta::hours(1) + TimeDelta::minutes(50)
}

/// Client for the NBIA search and download API of The Cancer Imaging Archive.
pub struct NbiaHttpClient {
    http: RetryingHttp,
    cache: Option<ResponseCache>,
    base_url: String,
    advanced_url: String,
    token_url: String,
    access: Access,
    token: Mutex<Option<AuthToken>>,
    content_policy: RequestPolicy,
    token_policy: RequestPolicy,
}

impl NbiaHttpClient {
    pub fn new(
        credentials: &Credentials,
        cache: Option<ResponseCache>,
        cancel: CancelToken,
    ) -> Result<Self, SyncError> {
        let access = credentials.access();
        let base_url = match access {
            Access::Public => PUBLIC_BASE_URL,
            Access::Password { .. } | Access::Token(_) => AUTHENTICATED_BASE_URL,
        };
        let token = match &access {
            Access::Token(value) => Some(AuthToken {
                value: value.clone(),
                expires_at: chrono::DateTime::<Utc>::MAX_UTC,
            }),
            _ => None,
        };
        if matches!(access, Access::Public) {
            info!("no credentials given; only public collections are reachable");
        }
        Ok(Self {
            http: RetryingHttp::new(build_client()?, cancel),
            cache,
            base_url: base_url.to_string(),
            advanced_url: ADVANCED_BASE_URL.to_string(),
            token_url: TOKEN_URL.to_string(),
            access,
            token: Mutex::new(token),
            content_policy: RequestPolicy::content(),
            token_policy: RequestPolicy::token(),
        })
    }

    pub fn with_policies(mut self, content: RequestPolicy, token: RequestPolicy) -> Self {
        self.content_policy = content;
        self.token_policy = token;
        self
    }

    pub fn with_endpoints(
        mut self,
        base_url: impl Into<String>,
        advanced_url: impl Into<String>,
        token_url: impl Into<String>,
    ) -> Self {
        self.base_url = base_url.into();
        self.advanced_url = advanced_url.into();
        self.token_url = token_url.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Current bearer token, renewed first when it has expired. `None` for public access.
    pub fn token(&self) -> Result<Option<String>, SyncError> {
        let mut guard = self
            .token
            .lock()
            .map_err(|_| SyncError::AuthenticationFailed("token lock poisoned".to_string()))?;
        if let Some(token) = guard.as_ref() {
            if !token.is_expired_at(Utc::now()) {
                return Ok(Some(token.value.clone()));
            }
            info!("renewing token");
        }
        match &self.access {
            Access::Public => Ok(None),
            Access::Token(value) => Ok(Some(value.clone())),
            Access::Password { user, password } => {
                let token = self.request_token(user, password)?;
                let value = token.value.clone();
                *guard = Some(token);
                Ok(Some(value))
            }
        }
    }

    fn request_token(&self, user: &str, password: &str) -> Result<AuthToken, SyncError> {
        info!("requesting token");
        let params = [
            ("client_id", "nbia"),
            ("scope", "openid"),
            ("grant_type", "password"),
            ("username", user),
            ("password", password),
        ];
        let response = self
            .http
            .send(&self.token_url, self.token_policy, |client| {
                client.post(&self.token_url).form(&params)
            })
            .map_err(|err| match err {
                SyncError::RequestExhausted { url, attempts } => SyncError::AuthenticationFailed(
                    format!("token request failed {attempts} times for {url}"),
                ),
                other => other,
            })?;
        let body = response
            .text()
            .map_err(|err| SyncError::AuthenticationFailed(err.to_string()))?;
        let value = parse_access_token(&body)?;
        let token = AuthToken {
            value,
            expires_at: Utc::now() + token_validity(),
        };
        info!(expires_at = %token.expires_at, "token acquired");
        Ok(token)
    }

    fn get_text(
        &self,
        url: &str,
        params: &[(&str, &str)],
        cached: bool,
    ) -> Result<String, SyncError> {
        let key = ResponseCache::key("GET", url, params);
        if cached {
            if let Some(body) = self.cache.as_ref().and_then(|cache| cache.get(&key)) {
                debug!(url, "served from response cache");
                return Ok(body);
            }
        }

        let token = self.token()?;
        let response = self.http.send(url, self.content_policy, |client| {
            let request = client.get(url).query(params);
            match &token {
                Some(token) => request.bearer_auth(token),
                None => request,
            }
        })?;
        let body = response
            .text()
            .map_err(|err| SyncError::Http(err.to_string()))?;

        if cached {
            if let Some(cache) = &self.cache {
                if let Err(err) = cache.put(&key, url, &body) {
                    warn!(url, error = %err, "failed to store response in cache");
                }
            }
        }
        Ok(body)
    }

    pub fn collections(&self) -> Result<Vec<String>, SyncError> {
        debug!("requesting available collections");
        let url = format!("{}getCollectionValues", self.base_url);
        let body = self.get_text(&url, &[], false)?;
        parse_collections(&body)
    }

    pub fn check_collection(&self, dataset: &str) -> Result<(), SyncError> {
        let available = self.collections()?;
        if !available.iter().any(|name| name == dataset) {
            return Err(SyncError::NotFound {
                dataset: dataset.to_string(),
                available,
            });
        }
        info!(dataset, "collection found");
        Ok(())
    }

    pub fn series(&self, dataset: &str) -> Result<Vec<SeriesRecord>, SyncError> {
        let url = format!("{}getSeries", self.base_url);
        let body = self.get_text(&url, &[("Collection", dataset)], true)?;
        parse_json_list(&body)
    }

    pub fn study_description(&self, series_uid: &str) -> Result<Option<String>, SyncError> {
        debug!(series_uid, "requesting series metadata");
        let url = format!("{}getSeriesMetaData", self.base_url);
        let body = self.get_text(&url, &[("SeriesInstanceUID", series_uid)], true)?;
        parse_study_description(&body)
    }

    pub fn sop_instance_uids(&self, series_uid: &str) -> Result<Vec<String>, SyncError> {
        let url = format!("{}getSOPInstanceUIDs", self.base_url);
        let body = self.get_text(&url, &[("SeriesInstanceUID", series_uid)], true)?;
        parse_sop_instance_uids(&body)
    }

    pub fn instance_md5(&self, sop_instance_uid: &str) -> Result<String, SyncError> {
        let url = format!("{}getM5HashForImage", self.base_url);
        let body = self.get_text(&url, &[("SOPInstanceUid", sop_instance_uid)], true)?;
        let digest = body.trim().trim_matches('"').to_ascii_lowercase();
        if digest.len() != 32 || !digest.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return Err(SyncError::InvalidResponse(format!(
                "malformed MD5 for instance {sop_instance_uid}"
            )));
        }
        Ok(digest)
    }

    pub fn dicom_tags(&self, series_uid: &str) -> Result<Vec<Map<String, Value>>, SyncError> {
        let url = format!("{}getDicomTags", self.advanced_url);
        let body = self.get_text(&url, &[("SeriesUID", series_uid)], true)?;
        parse_json_list(&body)
    }
}

impl Catalog for NbiaHttpClient {
    fn list_items(&self, dataset: &str) -> Result<Vec<RemoteItem>, SyncError> {
        self.check_collection(dataset)?;
        let series = self.series(dataset)?;
        info!(dataset, count = series.len(), "downloading series metadata");
        let mut items = Vec::with_capacity(series.len());
        for record in series {
            let description = self.study_description(&record.series_instance_uid)?;
            items.push(series_to_item(record, description));
        }
        Ok(items)
    }

    fn authoritative_hashes(&self, item_id: &str) -> Result<DigestSet, SyncError> {
        let mut digests = DigestSet::new();
        for sop_instance_uid in self.sop_instance_uids(item_id)? {
            digests.insert(self.instance_md5(&sop_instance_uid)?);
        }
        Ok(digests)
    }

    fn fetch(&self, item_id: &str, destination_dir: &Path) -> Result<(), SyncError> {
        debug!(item_id, destination = %destination_dir.display(), "downloading series");
        fs::create_dir_all(destination_dir)
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let url = format!("{}getImageWithMD5Hash", self.base_url);
        let token = self.token()?;
        let mut response = self.http.send(&url, self.content_policy, |client| {
            let request = client
                .get(&url)
                .query(&[("SeriesInstanceUID", item_id)]);
            match &token {
                Some(token) => request.bearer_auth(token),
                None => request,
            }
        })?;

        let temp_dir = tempfile::Builder::new()
            .prefix(fs_util::PARTIAL_PREFIX)
            .tempdir_in(destination_dir)
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let zip_path = temp_dir.path().join("series.zip");
        let mut file =
            File::create(&zip_path).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let bytes = self.http.cancel_token().copy(&mut response, &mut file)?;
        drop(file);
        debug!(item_id, bytes, "series archive downloaded");

        let extract_dir = temp_dir.path().join("extract");
        fs::create_dir_all(&extract_dir).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        fs_util::extract_zip(&zip_path, &extract_dir).map_err(|err| {
            SyncError::InvalidResponse(format!("archive for series {item_id} unreadable: {err}"))
        })?;
        fs_util::atomic_rename_dir(&extract_dir, &destination_dir.join(item_id))
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

/// One row of `getSeries`. Fields the archive leaves out or sends as null read as empty.
#[derive(Debug, Clone, Deserialize)]
pub struct SeriesRecord {
    #[serde(rename = "SeriesInstanceUID")]
    pub series_instance_uid: String,
    #[serde(rename = "PatientID", default, deserialize_with = "lenient_string")]
    pub patient_id: String,
    #[serde(rename = "StudyInstanceUID", default, deserialize_with = "lenient_string")]
    pub study_instance_uid: String,
    #[serde(rename = "SeriesDate", default, deserialize_with = "lenient_string")]
    pub series_date: String,
    #[serde(rename = "SeriesDescription", default, deserialize_with = "lenient_string")]
    pub series_description: String,
    #[serde(rename = "SeriesNumber", default, deserialize_with = "lenient_string")]
    pub series_number: String,
}

pub fn series_to_item(record: SeriesRecord, study_description: Option<String>) -> RemoteItem {
    let acquisition_date = parse_acquisition_date(&record.series_date);
    if acquisition_date.is_none() && !record.series_date.trim().is_empty() {
        debug!(
            series = %record.series_instance_uid,
            raw = %record.series_date,
            "unparsable series date"
        );
    }
    RemoteItem::new(
        record.series_instance_uid,
        ItemMetadata {
            subject_id: record.patient_id,
            acquisition_date,
            group_id: record.study_instance_uid,
            group_label: study_description.unwrap_or_default(),
            sequence_number: record.series_number,
            item_label: record.series_description,
        },
    )
}

pub fn parse_collections(body: &str) -> Result<Vec<String>, SyncError> {
    let rows: Vec<Map<String, Value>> = parse_json_list(body)?;
    Ok(rows
        .iter()
        .filter_map(|row| row.get("Collection").and_then(Value::as_str))
        .map(str::to_string)
        .collect())
}

pub fn parse_study_description(body: &str) -> Result<Option<String>, SyncError> {
    let rows: Vec<Map<String, Value>> = parse_json_list(body)?;
    Ok(rows
        .first()
        .and_then(|row| row.get("Study Description"))
        .and_then(Value::as_str)
        .map(str::to_string))
}

pub fn parse_sop_instance_uids(body: &str) -> Result<Vec<String>, SyncError> {
    let rows: Vec<Map<String, Value>> = parse_json_list(body)?;
    Ok(rows
        .iter()
        .filter_map(|row| row.get("SOPInstanceUID").and_then(Value::as_str))
        .map(str::to_string)
        .collect())
}

pub fn parse_access_token(body: &str) -> Result<String, SyncError> {
    #[derive(Deserialize)]
    struct TokenResponse {
        access_token: String,
    }
    serde_json::from_str::<TokenResponse>(body)
        .map(|response| response.access_token)
        .map_err(|err| SyncError::AuthenticationFailed(format!("token response: {err}")))
}

/// The archive answers an empty body instead of `[]` when a query matches nothing.
fn parse_json_list<T: DeserializeOwned>(body: &str) -> Result<Vec<T>, SyncError> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(body).map_err(|err| SyncError::InvalidResponse(err.to_string()))
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text,
        Some(other) => other.to_string(),
    })
}
