//! Production REST clients for the capability contracts.
//!
//! Both clients authenticate with a bearer token minted from the service
//! account JSON stored in the machine's credentials secret.

mod compute;
mod tags;

pub use compute::RestComputeService;
pub use tags::RestTagService;

use std::sync::Arc;
use std::time::Duration;

use gcp_auth::{CustomServiceAccount, TokenProvider};
use reqwest::{Method, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::compute::{ComputeService, ComputeServiceBuilder};
use crate::error::{ApiErrorDetail, CloudError, Result};
use crate::tags::{TagService, TagServiceBuilder};

const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Builder producing [`RestComputeService`] clients.
pub fn compute_service_builder() -> ComputeServiceBuilder {
    Arc::new(|credentials: &str, endpoint: Option<&str>| {
        let service: Arc<dyn ComputeService> =
            Arc::new(RestComputeService::new(credentials, endpoint)?);
        Ok(service)
    })
}

/// Builder producing [`RestTagService`] clients.
pub fn tag_service_builder() -> TagServiceBuilder {
    Arc::new(|credentials: &str, endpoint: Option<&str>| {
        let service: Arc<dyn TagService> = Arc::new(RestTagService::new(credentials, endpoint)?);
        Ok(service)
    })
}

/// Google API error envelope.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ErrorBody {
    code: u16,
    message: String,
    errors: Vec<ApiErrorDetail>,
}

/// Authenticated HTTP client shared by the REST services.
pub(crate) struct ApiClient {
    http: reqwest::Client,
    auth: Arc<dyn TokenProvider>,
}

impl ApiClient {
    pub(crate) fn from_credentials(credentials_json: &str) -> Result<Self> {
        let account = CustomServiceAccount::from_json(credentials_json)
            .map_err(|e| CloudError::auth(format!("invalid service account credentials: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CloudError::transport(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            auth: Arc::new(account),
        })
    }

    pub(crate) fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http.request(method, url)
    }

    async fn access_token(&self) -> Result<String> {
        let token = self
            .auth
            .token(&[CLOUD_PLATFORM_SCOPE])
            .await
            .map_err(|e| CloudError::auth(format!("failed to get access token: {e}")))?;
        Ok(token.as_str().to_string())
    }

    /// Send the request and decode a JSON body, classifying API errors
    /// against `project`.
    pub(crate) async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        project: Option<&str>,
    ) -> Result<T> {
        let token = self.access_token().await?;
        let response = request
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| CloudError::transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CloudError::transport(e.to_string()))?;

        if !status.is_success() {
            debug!("API request failed with {}: {}", status, body);
            return Err(api_error(status.as_u16(), &body, project));
        }

        serde_json::from_str(&body).map_err(|e| CloudError::decode(e.to_string()))
    }
}

fn api_error(status: u16, body: &str, project: Option<&str>) -> CloudError {
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(response) => {
            let code = if response.error.code == 0 {
                status
            } else {
                response.error.code
            };
            CloudError::from_api(code, &response.error.message, &response.error.errors, project)
        }
        Err(_) => CloudError::from_api(status, body.trim(), &[], project),
    }
}

/// Join a base path and a relative path with exactly one slash.
pub(crate) fn join(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
