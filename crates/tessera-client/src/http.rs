//! Key directory over HTTP.
//!
//! [`HttpBundleDirectory`] calls the directory service's JSON routes:
//!
//! | Operation                                    | Route                  |
//! |----------------------------------------------|------------------------|
//! | [`BundleDirectory::register_device`]         | `POST /devices`        |
//! | [`BundleDirectory::fetch_bundle`]            | `GET /bundle/{userId}` |
//! | [`BundleDirectory::top_up`]                  | `POST /prekeys`        |
//!
//! Routes are relative to the base URL, which includes the service prefix
//! (`http://host:5001/api/keys`). The acting user travels in the
//! [`USER_ID_HEADER`] header.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use tessera_proto::{DeviceReceipt, ErrorBody, PreKeyBundle, PublishDeviceRequest, TopUpRequest};

use crate::directory::{BundleDirectory, DirectoryError};

/// Header carrying the acting user's id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Per-request timeout used by [`HttpBundleDirectory::new`].
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// [`BundleDirectory`] backed by the directory service's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpBundleDirectory {
    client: Client,
    base_url: Url,
    user_id: String,
}

impl HttpBundleDirectory {
    /// Directory at `base_url`, acting as `user_id`.
    pub fn new(base_url: &str, user_id: impl Into<String>) -> Result<Self, DirectoryError> {
        let client = Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|err| DirectoryError::Unavailable(err.to_string()))?;
        Self::with_client(client, base_url, user_id)
    }

    /// Same as [`new`](Self::new) with a caller-configured client.
    pub fn with_client(
        client: Client,
        base_url: &str,
        user_id: impl Into<String>,
    ) -> Result<Self, DirectoryError> {
        let base_url = Url::parse(base_url)
            .map_err(|err| DirectoryError::InvalidArgument(format!("base url: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(DirectoryError::InvalidArgument(format!(
                "base url cannot hold paths: {base_url}"
            )));
        }

        Ok(Self { client, base_url, user_id: user_id.into() })
    }

    /// User this handle acts for.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Base URL with `segments` appended, each percent-encoded.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, DirectoryError> {
        let response = request
            .header(USER_ID_HEADER, &self.user_id)
            .send()
            .await
            .map_err(|err| DirectoryError::Unavailable(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let err = status_error(status, response).await;
            tracing::debug!(
                user_id = %self.user_id,
                %status,
                error = %err,
                "directory request failed"
            );
            return Err(err);
        }

        response.json().await.map_err(|err| DirectoryError::Unavailable(err.to_string()))
    }
}

#[async_trait]
impl BundleDirectory for HttpBundleDirectory {
    async fn register_device(
        &self,
        request: PublishDeviceRequest,
    ) -> Result<DeviceReceipt, DirectoryError> {
        self.send(self.client.post(self.url(&["devices"])).json(&request)).await
    }

    async fn fetch_bundle(&self, user_id: &str) -> Result<PreKeyBundle, DirectoryError> {
        self.send(self.client.get(self.url(&["bundle", user_id]))).await
    }

    async fn top_up(&self, request: TopUpRequest) -> Result<DeviceReceipt, DirectoryError> {
        self.send(self.client.post(self.url(&["prekeys"])).json(&request)).await
    }
}

/// Map a non-success response to the directory error of its status.
async fn status_error(status: StatusCode, response: Response) -> DirectoryError {
    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.message,
        Err(_) => status.to_string(),
    };

    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => {
            DirectoryError::InvalidArgument(message)
        },
        StatusCode::NOT_FOUND => DirectoryError::NotFound(message),
        StatusCode::CONFLICT => DirectoryError::Conflict(message),
        _ => DirectoryError::Unavailable(message),
    }
}
