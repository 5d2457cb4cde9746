//! Blocking REST client implementing the engine's remote traits.

use anyhow::{Context, Result};
use relocate_engine::{
    ChildPage, EntityHeader, EntityLister, MoveOutcome, MoveRequest, RemoteError, RemoteKind,
    SnapshotOutcome, StorageMutator, VersionInfo, VersionPage,
};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{HeaderMap, IF_MATCH, RETRY_AFTER};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub struct HttpRemote {
    http: Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        // Url::join replaces the last segment unless the base ends with a slash
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).context("invalid server URL")?;
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("relocate/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(HttpRemote { http, base_url, token })
    }

    fn url(&self, path: &str, page_token: Option<&str>) -> Result<Url, RemoteError> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|e| RemoteError::Other(format!("invalid request path {}: {}", path, e)))?;
        if let Some(token) = page_token {
            url.query_pairs_mut().append_pair("nextPageToken", token);
        }
        Ok(url)
    }

    fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder, what: &str) -> Result<T, RemoteError> {
        let req = match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        };
        let resp = req.send().map_err(|e| transport_error(e, what))?;
        let status = resp.status();
        let retry_after = retry_after(resp.headers());
        let body = resp.text().map_err(|e| transport_error(e, what))?;

        if !status.is_success() {
            tracing::debug!(call = what, status = status.as_u16(), "remote call failed");
            return Err(classify_status(status, retry_after, what, &body));
        }
        serde_json::from_str(&body)
            .map_err(|e| RemoteError::Other(format!("invalid response for {}: {}", what, e)))
    }

    fn get<T: DeserializeOwned>(&self, path: &str, page_token: Option<&str>) -> Result<T, RemoteError> {
        let url = self.url(path, page_token)?;
        self.send_json(self.http.get(url), path)
    }
}

impl EntityLister for HttpRemote {
    fn get_entity(&self, entity_id: &str) -> Result<EntityHeader, RemoteError> {
        let dto: EntityDto = self.get(&format!("entity/{}", entity_id), None)?;
        Ok(dto.into())
    }

    fn list_children(
        &self,
        container_id: &str,
        page_token: Option<&str>,
    ) -> Result<ChildPage, RemoteError> {
        let page: PageDto<EntityDto> =
            self.get(&format!("entity/{}/children", container_id), page_token)?;
        Ok(ChildPage {
            children: page.results.into_iter().map(EntityHeader::from).collect(),
            next_page_token: page.next_page_token,
        })
    }

    fn list_versions(
        &self,
        entity_id: &str,
        page_token: Option<&str>,
    ) -> Result<VersionPage, RemoteError> {
        let page: PageDto<VersionNumberDto> =
            self.get(&format!("entity/{}/version", entity_id), page_token)?;
        Ok(VersionPage {
            versions: page.results.into_iter().map(|v| v.version_number).collect(),
            next_page_token: page.next_page_token,
        })
    }

    fn get_version(&self, entity_id: &str, version: u32) -> Result<VersionInfo, RemoteError> {
        let dto: VersionDto = self.get(&format!("entity/{}/version/{}", entity_id, version), None)?;
        Ok(dto.into())
    }
}

impl StorageMutator for HttpRemote {
    fn move_version(&self, request: &MoveRequest) -> Result<MoveOutcome, RemoteError> {
        let path = format!("entity/{}/version/{}/storage", request.entity_id, request.version);
        let url = self.url(&path, None)?;
        let body = MoveBody {
            destination_location_id: &request.destination_location_id,
            file_handle_id: request.file_handle_id.as_deref(),
        };
        let mut req = self.http.put(url).json(&body);
        if let Some(etag) = &request.etag {
            req = req.header(IF_MATCH, etag.as_str());
        }
        let dto: MoveDto = self.send_json(req, &path)?;
        Ok(MoveOutcome { file_handle_id: dto.data_file_handle_id })
    }

    fn snapshot_table(&self, table_id: &str) -> Result<SnapshotOutcome, RemoteError> {
        let path = format!("entity/{}/table/snapshot", table_id);
        let url = self.url(&path, None)?;
        let dto: SnapshotDto = self.send_json(self.http.post(url), &path)?;
        Ok(SnapshotOutcome { snapshot_version: dto.snapshot_version_number })
    }
}

/// Map a non-success HTTP status onto the engine's error taxonomy.
fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    what: &str,
    body: &str,
) -> RemoteError {
    let detail = if body.trim().is_empty() {
        format!("{} ({})", what, status)
    } else {
        format!("{} ({}): {}", what, status, body.trim())
    };
    match status {
        StatusCode::NOT_FOUND => RemoteError::NotFound(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::PermissionDenied(detail),
        StatusCode::PRECONDITION_FAILED => RemoteError::StaleEtag(detail),
        StatusCode::CONFLICT => RemoteError::ConcurrentModification(detail),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
            RemoteError::Throttled { retry_after }
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => RemoteError::Timeout(detail),
        s if s.is_server_error() => RemoteError::Transport(detail),
        _ => RemoteError::Other(detail),
    }
}

fn transport_error(err: reqwest::Error, what: &str) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout(what.to_string())
    } else {
        RemoteError::Transport(format!("{}: {}", what, err))
    }
}

/// Retry-After in delta-seconds form; HTTP dates are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

// Wire formats

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntityDto {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "type")]
    kind: RemoteKind,
    #[serde(default)]
    version_number: Option<u32>,
}

impl From<EntityDto> for EntityHeader {
    fn from(dto: EntityDto) -> Self {
        EntityHeader {
            id: dto.id,
            name: dto.name,
            kind: dto.kind,
            current_version: dto.version_number,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageDto<T> {
    results: Vec<T>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionNumberDto {
    version_number: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionDto {
    #[serde(default)]
    data_file_handle_id: Option<String>,
    #[serde(default)]
    storage_location_id: Option<String>,
    #[serde(default)]
    etag: Option<String>,
    #[serde(default)]
    content_size: Option<u64>,
}

impl From<VersionDto> for VersionInfo {
    fn from(dto: VersionDto) -> Self {
        VersionInfo {
            file_handle_id: dto.data_file_handle_id,
            storage_location_id: dto.storage_location_id,
            etag: dto.etag,
            file_size: dto.content_size,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MoveBody<'a> {
    destination_location_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_handle_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoveDto {
    #[serde(default)]
    data_file_handle_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotDto {
    #[serde(default)]
    snapshot_version_number: Option<u32>,
}
