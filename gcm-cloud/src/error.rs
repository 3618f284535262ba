//! Cloud error types.
//!
//! Errors are classified exactly once, where the API response is decoded.
//! Everything downstream switches on [`CloudErrorKind`] instead of parsing
//! messages again.

use thiserror::Error;

/// Closed set of failure classes reported by the capability contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudErrorKind {
    /// The addressed resource does not exist.
    NotFound,
    /// The project named in the request does not exist.
    ProjectNotFound,
    /// The zone named in the request is not a valid zone.
    InvalidZone,
    /// The caller lacks permission (or the resource is hidden from it).
    PermissionDenied,
    /// Any other 4xx response.
    ClientError,
    /// 5xx responses and rate limiting.
    ServerError,
    /// The request never produced an HTTP response.
    Transport,
    /// The response body could not be decoded.
    Decode,
    /// No access token could be obtained.
    Auth,
}

/// One entry of the `errors` array in a Google API error body.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct ApiErrorDetail {
    pub reason: String,
    pub message: String,
    pub domain: String,
}

/// Error returned by every capability contract call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CloudError {
    pub kind: CloudErrorKind,
    /// HTTP status code, when the API answered.
    pub code: Option<u16>,
    pub message: String,
}

impl CloudError {
    pub fn new(kind: CloudErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    /// Classify an API error response.
    ///
    /// `project` is the project the request addressed. A 404 only counts as
    /// [`CloudErrorKind::ProjectNotFound`] when one of the details names
    /// exactly that project.
    pub fn from_api(
        code: u16,
        message: &str,
        details: &[ApiErrorDetail],
        project: Option<&str>,
    ) -> Self {
        let kind = classify(code, details, project);
        Self {
            kind,
            code: Some(code),
            message: format!("Error {}: {}", code, message),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::NotFound, message).with_code(404)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::Transport, message)
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::Decode, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::Auth, message)
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    /// True for any 404 answer, including a missing project.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.kind,
            CloudErrorKind::NotFound | CloudErrorKind::ProjectNotFound
        )
    }

    /// True when the API answered with a 4xx status.
    pub fn is_client_error(&self) -> bool {
        matches!(self.code, Some(code) if (400..500).contains(&code))
    }
}

// Zone errors come back as 400 or 404 depending on the endpoint, so any
// 4xx naming the zone field counts.
fn classify(code: u16, details: &[ApiErrorDetail], project: Option<&str>) -> CloudErrorKind {
    if (400..500).contains(&code)
        && details
            .iter()
            .any(|d| d.reason == "invalid" && d.message.contains("'zone'"))
    {
        return CloudErrorKind::InvalidZone;
    }

    match code {
        404 => {
            let project_missing = project.is_some_and(|project| {
                let needle = format!("'projects/{}'", project);
                details
                    .iter()
                    .any(|d| d.reason == "notFound" && d.message.contains(&needle))
            });
            if project_missing {
                CloudErrorKind::ProjectNotFound
            } else {
                CloudErrorKind::NotFound
            }
        }
        401 | 403 => CloudErrorKind::PermissionDenied,
        429 => CloudErrorKind::ServerError,
        400..=499 => CloudErrorKind::ClientError,
        _ => CloudErrorKind::ServerError,
    }
}

/// Result type for capability contract calls.
pub type Result<T> = std::result::Result<T, CloudError>;
