//! Outbound abstraction over a content-publishing API
//!
//! Defines the `Upstream` trait that decouples the publishing core from any one
//! platform's wire format, plus the `MediaConverter` trait used by the format
//! and permission fallbacks. `HttpUpstream` and `HttpTranscoder` talk to a
//! generic JSON API over reqwest; `ReuseLocator` is the converter used when no
//! transcoding service is configured.
//!
//! Every fallible call returns `UpstreamError`, a plain value carrying the HTTP
//! status, message and `Retry-After` hint. Classification of those errors into
//! strategy decisions happens downstream, in the publisher.

pub mod content;
pub mod error;
pub mod http;
pub mod media;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use content::{Capability, CapabilitySet, Content, ContentError, MAX_CAPTION_CHARS, MediaKind};
pub use error::UpstreamError;
pub use http::HttpUpstream;
pub use media::{HttpTranscoder, ReuseLocator};

use std::future::Future;
use std::pin::Pin;

use common::Secret;

/// Boxed future used by the dyn-compatible traits in this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Tokens issued by the platform's refresh endpoint.
///
/// `expires_in` is a delta in seconds from the response time; the pool turns
/// it into an absolute timestamp when storing the credential. A missing
/// `refresh_token` means the old refresh token stays valid.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: Secret<String>,
    pub refresh_token: Option<Secret<String>>,
    pub expires_in: Option<u64>,
}

/// Abstraction over the platform's publishing API.
///
/// Uses `Pin<Box<dyn Future>>` return types so implementations can be shared
/// as `Arc<dyn Upstream>` between the pool (refresh) and the publisher.
pub trait Upstream: Send + Sync {
    /// Identifier for logging (e.g. "http", "mock").
    fn id(&self) -> &str;

    /// Publish `content` on behalf of the account owning `token`.
    ///
    /// Returns the platform's identifier for the published item.
    fn publish<'a>(
        &'a self,
        token: &'a str,
        content: &'a Content,
    ) -> BoxFuture<'a, Result<String, UpstreamError>>;

    /// Which publish operations the token's permission tier allows.
    fn check_capabilities<'a>(
        &'a self,
        token: &'a str,
    ) -> BoxFuture<'a, Result<CapabilitySet, UpstreamError>>;

    /// Exchange a refresh token for a new access token.
    fn refresh_token<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<TokenGrant, UpstreamError>>;
}

/// Media re-encoding used by the fallback strategies.
pub trait MediaConverter: Send + Sync {
    /// Re-encode or compress the asset at `media_url`, returning the locator of
    /// the converted asset.
    fn transcode<'a>(
        &'a self,
        media_url: &'a str,
        kind: MediaKind,
    ) -> BoxFuture<'a, Result<String, UpstreamError>>;

    /// Locator of a still image representing the video at `media_url`.
    ///
    /// `Ok(None)` means no real image is available; callers must not
    /// substitute a placeholder.
    fn extract_frame<'a>(
        &'a self,
        media_url: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, UpstreamError>>;
}
