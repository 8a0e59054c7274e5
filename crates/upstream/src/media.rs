//! Media converters for the format and permission fallbacks

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::content::MediaKind;
use crate::error::UpstreamError;
use crate::http::error_from_response;
use crate::{BoxFuture, MediaConverter};

/// Converter used when no transcoding service is configured.
///
/// Frame extraction reuses the provided locator as the still image (the
/// platform renders the first frame of a video URL as a photo). Transcoding is
/// not possible and always fails as an unsupported format.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReuseLocator;

impl MediaConverter for ReuseLocator {
    fn transcode<'a>(
        &'a self,
        _media_url: &'a str,
        kind: MediaKind,
    ) -> BoxFuture<'a, Result<String, UpstreamError>> {
        Box::pin(async move {
            Err(UpstreamError::network(format!(
                "format conversion unsupported for {}: no transcoder configured",
                kind.label()
            )))
        })
    }

    fn extract_frame<'a>(
        &'a self,
        media_url: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, UpstreamError>> {
        Box::pin(async move { Ok(Some(media_url.to_string())) })
    }
}

#[derive(Serialize)]
struct ConvertRequest<'a> {
    media_url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    media_kind: Option<MediaKind>,
}

#[derive(Deserialize)]
struct ConvertResponse {
    media_url: String,
}

/// Client for an external transcoding service.
///
/// - `POST /transcode` `{media_url, media_kind}` → `{media_url}`
/// - `POST /frames` `{media_url}` → `{media_url}`, or 404/422 when the asset
///   has no usable frame.
pub struct HttpTranscoder {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTranscoder {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    async fn convert(
        &self,
        path: &str,
        request: &ConvertRequest<'_>,
    ) -> Result<Option<String>, UpstreamError> {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(|e| UpstreamError::network(format!("transcoder request failed: {e}")))?;

        let status = response.status().as_u16();
        if status == 404 || status == 422 {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let body: ConvertResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::network(format!("invalid transcoder response: {e}")))?;
        debug!(path, media_url = %body.media_url, "media converted");
        Ok(Some(body.media_url))
    }
}

impl MediaConverter for HttpTranscoder {
    fn transcode<'a>(
        &'a self,
        media_url: &'a str,
        kind: MediaKind,
    ) -> BoxFuture<'a, Result<String, UpstreamError>> {
        Box::pin(async move {
            let request = ConvertRequest {
                media_url,
                media_kind: Some(kind),
            };
            self.convert("/transcode", &request).await?.ok_or_else(|| {
                UpstreamError::http(422, format!("transcoder could not convert {} asset", kind.label()))
            })
        })
    }

    fn extract_frame<'a>(
        &'a self,
        media_url: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, UpstreamError>> {
        Box::pin(async move {
            let request = ConvertRequest {
                media_url,
                media_kind: None,
            };
            self.convert("/frames", &request).await
        })
    }
}
