//! Microsoft Graph drive API client.

use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use eqms_common::{Error, Result};

use super::auth::TokenManager;

/// Microsoft Graph API base URL.
const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";
const GRAPH_HOST: &str = "graph.microsoft.com";

/// Characters left unescaped in a drive path segment.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Which document library to address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveRef {
    /// Default document library of a SharePoint site.
    Site(String),
    Drive(String),
}

impl DriveRef {
    fn base_url(&self) -> String {
        match self {
            DriveRef::Site(site) => format!("{}/sites/{}/drive", GRAPH_API_BASE, site),
            DriveRef::Drive(drive) => format!("{}/drives/{}", GRAPH_API_BASE, drive),
        }
    }
}

/// Parent pointer of a drive item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemReference {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

/// Drive item (file or folder) as returned by Graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub last_modified_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub e_tag: Option<String>,
    /// Present for folders.
    #[serde(default)]
    pub folder: Option<serde_json::Value>,
    /// Present for files.
    #[serde(default)]
    pub file: Option<serde_json::Value>,
    #[serde(default)]
    pub parent_reference: Option<ItemReference>,
}

impl DriveItem {
    /// Check if this is a folder.
    pub fn is_folder(&self) -> bool {
        self.folder.is_some()
    }
}

/// One page of a children listing.
#[derive(Debug, Deserialize)]
struct ChildrenPage {
    value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

/// Graph client bound to one drive.
pub struct GraphClient {
    http: Client,
    token_manager: Arc<TokenManager>,
    base_url: String,
}

impl GraphClient {
    /// # Errors
    /// - HTTP client cannot be built
    pub fn new(drive: &DriveRef, token_manager: Arc<TokenManager>) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("eqms-storage/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            token_manager,
            base_url: drive.base_url(),
        })
    }

    /// Get authorization header.
    async fn auth_header(&self) -> Result<String> {
        let token = self.token_manager.get_access_token().await?;
        Ok(format!("Bearer {}", token.expose()))
    }

    /// Path-addressed item URL for drive-relative components.
    pub fn item_url(&self, components: &[String]) -> String {
        if components.is_empty() {
            return format!("{}/root", self.base_url);
        }
        let encoded: Vec<String> = components
            .iter()
            .map(|c| utf8_percent_encode(c, SEGMENT).to_string())
            .collect();
        format!("{}/root:/{}:", self.base_url, encoded.join("/"))
    }

    /// Get the drive resource itself.
    pub async fn drive(&self) -> Result<serde_json::Value> {
        let auth = self.auth_header().await?;
        let response = self
            .http
            .get(&self.base_url)
            .header(header::AUTHORIZATION, auth)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to get drive: {}", e)))?;

        self.handle_response(response).await
    }

    /// Get an item by path, `None` when it does not exist.
    pub async fn get_item(&self, components: &[String]) -> Result<Option<DriveItem>> {
        let auth = self.auth_header().await?;
        let response = self
            .http
            .get(self.item_url(components))
            .header(header::AUTHORIZATION, auth)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to get item: {}", e)))?;

        match self.handle_response(response).await {
            Ok(item) => Ok(Some(item)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Download file content.
    pub async fn download(&self, components: &[String]) -> Result<Vec<u8>> {
        let auth = self.auth_header().await?;
        let response = self
            .http
            .get(format!("{}/content", self.item_url(components)))
            .header(header::AUTHORIZATION, auth)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to download: {}", e)))?;

        let response = self.checked(response).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Network(format!("Failed to read content: {}", e)))?;
        Ok(bytes.to_vec())
    }

    /// Simple upload (single request).
    ///
    /// With `replace` false an existing item is a conflict.
    pub async fn upload(&self, components: &[String], data: Vec<u8>, replace: bool) -> Result<DriveItem> {
        let auth = self.auth_header().await?;
        let behavior = if replace { "replace" } else { "fail" };
        let response = self
            .http
            .put(format!("{}/content", self.item_url(components)))
            .header(header::AUTHORIZATION, auth)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .query(&[("@microsoft.graph.conflictBehavior", behavior)])
            .body(data)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to upload: {}", e)))?;

        self.handle_response(response).await
    }

    /// List folder children, following pagination links.
    pub async fn list_children(&self, components: &[String]) -> Result<Vec<DriveItem>> {
        let mut items = Vec::new();
        let mut page_url = format!("{}/children", self.item_url(components));

        loop {
            let auth = self.auth_header().await?;
            let response = self
                .http
                .get(&page_url)
                .header(header::AUTHORIZATION, auth)
                .send()
                .await
                .map_err(|e| Error::Network(format!("Failed to list folder: {}", e)))?;

            let page: ChildrenPage = self.handle_response(response).await?;
            items.extend(page.value);

            match page.next_link {
                Some(next) => page_url = graph_link(&next)?,
                None => break,
            }
        }

        Ok(items)
    }

    /// Create a folder inside a parent folder.
    pub async fn create_folder(&self, parent: &[String], name: &str) -> Result<DriveItem> {
        let auth = self.auth_header().await?;
        let body = serde_json::json!({
            "name": name,
            "folder": {},
            "@microsoft.graph.conflictBehavior": "fail"
        });
        let response = self
            .http
            .post(format!("{}/children", self.item_url(parent)))
            .header(header::AUTHORIZATION, auth)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to create folder: {}", e)))?;

        self.handle_response(response).await
    }

    /// Make sure every folder along `components` exists and return the last one.
    pub async fn ensure_folder(&self, components: &[String]) -> Result<DriveItem> {
        let mut current = match self.get_item(&[]).await? {
            Some(root) => root,
            None => return Err(Error::NotFound("Drive root not found".to_string())),
        };

        for depth in 1..=components.len() {
            let prefix = &components[..depth];
            current = match self.get_item(prefix).await? {
                Some(item) if item.is_folder() => item,
                Some(_) => {
                    return Err(Error::InvalidInput(format!(
                        "Not a folder: /{}",
                        prefix.join("/")
                    )))
                }
                None => match self.create_folder(&prefix[..depth - 1], &prefix[depth - 1]).await {
                    Ok(item) => item,
                    // Created concurrently.
                    Err(Error::AlreadyExists(_)) => self
                        .get_item(prefix)
                        .await?
                        .ok_or_else(|| Error::NotFound(format!("Folder vanished: /{}", prefix.join("/"))))?,
                    Err(e) => return Err(e),
                },
            };
        }

        Ok(current)
    }

    /// Move (and optionally rename) an item into another folder.
    pub async fn move_item(&self, item_id: &str, parent_id: &str, name: &str) -> Result<DriveItem> {
        let auth = self.auth_header().await?;
        let body = serde_json::json!({
            "name": name,
            "parentReference": { "id": parent_id },
            "@microsoft.graph.conflictBehavior": "fail"
        });
        let response = self
            .http
            .patch(format!("{}/items/{}", self.base_url, item_id))
            .header(header::AUTHORIZATION, auth)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to move item: {}", e)))?;

        self.handle_response(response).await
    }

    /// Delete an item.
    pub async fn delete(&self, components: &[String]) -> Result<()> {
        let auth = self.auth_header().await?;
        let response = self
            .http
            .delete(self.item_url(components))
            .header(header::AUTHORIZATION, auth)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to delete: {}", e)))?;

        self.checked(response).await?;
        Ok(())
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        self.checked(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::Network(format!("Failed to parse response: {}", e)))
    }

    /// Status check that also drops a token the server rejected.
    async fn checked(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status() == StatusCode::UNAUTHORIZED {
            self.token_manager.invalidate().await;
        }
        Self::check_status(response).await
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body))
    }
}

/// Validate a server-supplied link before the bearer token is sent to it.
fn graph_link(link: &str) -> Result<String> {
    let parsed = url::Url::parse(link)
        .map_err(|e| Error::Network(format!("Invalid next link: {}", e)))?;
    if parsed.scheme() != "https" || parsed.host_str() != Some(GRAPH_HOST) {
        return Err(Error::Network(format!("Unexpected next link host: {}", link)));
    }
    Ok(parsed.into())
}

/// Map a failed Graph status to an error.
pub(crate) fn status_error(status: StatusCode, body: &str) -> Error {
    match status {
        StatusCode::UNAUTHORIZED => Error::Authentication("Invalid or expired token".to_string()),
        StatusCode::FORBIDDEN => Error::PermissionDenied("Access denied".to_string()),
        StatusCode::NOT_FOUND => Error::NotFound("Resource not found".to_string()),
        StatusCode::CONFLICT => Error::AlreadyExists("Item already exists".to_string()),
        _ => Error::Network(format!("API error: {} - {}", status, body)),
    }
}
