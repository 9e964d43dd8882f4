use reqwest::multipart;
use serde::Deserialize;
use url::Url;

use crate::error::ChatError;

/// Response body of `POST /api/upload`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct UploadResponse {
    pub success: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Single-attempt image upload client. One multipart request per
/// invocation, no automatic retry; the caller decides whether to try
/// again.
#[derive(Debug, Clone)]
pub struct Uploader {
    http: reqwest::Client,
    api_url: Url,
}

impl Uploader {
    pub fn new(http: reqwest::Client, api_url: Url) -> Self {
        Self { http, api_url }
    }

    /// Upload file bytes under the sender's id and return the served URL.
    /// Any non-success response or transport failure maps to
    /// `UploadFailed` and no message is sent.
    pub async fn upload(
        &self,
        user_id: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<String, ChatError> {
        let endpoint = self
            .api_url
            .join("/api/upload")
            .map_err(|err| ChatError::UploadFailed(err.to_string()))?;

        let file_part = multipart::Part::bytes(bytes).file_name(file_name.to_owned());
        let form = multipart::Form::new()
            .part("file", file_part)
            .text("userId", user_id.to_owned());

        let response = self
            .http
            .post(endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|err| ChatError::UploadFailed(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ChatError::UploadFailed(format!(
                "server returned HTTP {}",
                response.status()
            )));
        }

        let body: UploadResponse = response
            .json()
            .await
            .map_err(|err| ChatError::UploadFailed(err.to_string()))?;

        match body {
            UploadResponse {
                success: true,
                url: Some(url),
                ..
            } => Ok(url),
            UploadResponse { error, .. } => Err(ChatError::UploadFailed(
                error.unwrap_or_else(|| "server reported failure".to_owned()),
            )),
        }
    }
}
