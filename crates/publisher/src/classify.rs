//! Failure classification for upstream errors
//!
//! Maps an `UpstreamError` to the small fixed set of reasons that drive
//! strategy transitions. Pure and synchronous: no network, no clock.

use std::time::Duration;

use serde::Serialize;
use upstream::UpstreamError;

const RATE_LIMIT_PATTERNS: &[&str] = &["rate limit"];

const PERMISSION_PATTERNS: &[&str] = &["permission", "oauth", "scope"];

const FORMAT_PATTERNS: &[&str] = &["format", "unsupported", "not supported"];

const UNREACHABLE_PATTERNS: &[&str] = &["uri", "download", "fetch", "timeout"];

/// Why a strategy attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureReason {
    RateLimit { retry_after_secs: u64 },
    PermissionDenied,
    UnsupportedFormat,
    MediaUnreachable,
    Transient,
    Unknown,
}

/// `FailureReason` without its payload, used as the transition table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReasonKind {
    RateLimit,
    PermissionDenied,
    UnsupportedFormat,
    MediaUnreachable,
    Transient,
    Unknown,
}

impl ReasonKind {
    pub const ALL: [ReasonKind; 6] = [
        ReasonKind::RateLimit,
        ReasonKind::PermissionDenied,
        ReasonKind::UnsupportedFormat,
        ReasonKind::MediaUnreachable,
        ReasonKind::Transient,
        ReasonKind::Unknown,
    ];
}

impl FailureReason {
    pub fn kind(&self) -> ReasonKind {
        match self {
            FailureReason::RateLimit { .. } => ReasonKind::RateLimit,
            FailureReason::PermissionDenied => ReasonKind::PermissionDenied,
            FailureReason::UnsupportedFormat => ReasonKind::UnsupportedFormat,
            FailureReason::MediaUnreachable => ReasonKind::MediaUnreachable,
            FailureReason::Transient => ReasonKind::Transient,
            FailureReason::Unknown => ReasonKind::Unknown,
        }
    }

    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            FailureReason::RateLimit { .. } => "rate_limit",
            FailureReason::PermissionDenied => "permission_denied",
            FailureReason::UnsupportedFormat => "unsupported_format",
            FailureReason::MediaUnreachable => "media_unreachable",
            FailureReason::Transient => "transient",
            FailureReason::Unknown => "unknown",
        }
    }
}

/// Classifies upstream errors.
///
/// `default_retry_after` applies to rate limits whose response carried no
/// `Retry-After` hint.
#[derive(Debug, Clone, Copy)]
pub struct Classifier {
    default_retry_after: Duration,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

impl Classifier {
    pub fn new(default_retry_after: Duration) -> Self {
        Self {
            default_retry_after,
        }
    }

    /// Classify an upstream error. Rules, first match wins:
    ///
    /// 1. HTTP 429 or "rate limit" → `RateLimit`
    /// 2. "permission" / "oauth" / "scope" → `PermissionDenied`
    /// 3. "format" / "unsupported" / "not supported" → `UnsupportedFormat`
    /// 4. "uri" / "download" / "fetch" / "timeout" → `MediaUnreachable`
    /// 5. HTTP 5xx → `Transient`
    /// 6. anything else → `Unknown`
    pub fn classify(&self, error: &UpstreamError) -> FailureReason {
        let message = error.message.to_lowercase();

        if error.http_status == Some(429) || matches_any(&message, RATE_LIMIT_PATTERNS) {
            let retry_after_secs = error
                .retry_after_secs
                .unwrap_or(self.default_retry_after.as_secs());
            return FailureReason::RateLimit { retry_after_secs };
        }
        if matches_any(&message, PERMISSION_PATTERNS) {
            return FailureReason::PermissionDenied;
        }
        if matches_any(&message, FORMAT_PATTERNS) {
            return FailureReason::UnsupportedFormat;
        }
        if matches_any(&message, UNREACHABLE_PATTERNS) {
            return FailureReason::MediaUnreachable;
        }
        match error.http_status {
            Some(500..=599) => FailureReason::Transient,
            _ => FailureReason::Unknown,
        }
    }
}

fn matches_any(message: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| message.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(error: UpstreamError) -> FailureReason {
        Classifier::default().classify(&error)
    }

    #[test]
    fn status_429_uses_retry_after_header() {
        let reason = classify(UpstreamError::http(429, "slow down").with_retry_after(120));
        assert_eq!(reason, FailureReason::RateLimit { retry_after_secs: 120 });
    }

    #[test]
    fn rate_limit_defaults_to_configured_retry_after() {
        assert_eq!(
            classify(UpstreamError::http(429, "slow down")),
            FailureReason::RateLimit {
                retry_after_secs: 3600
            }
        );

        let classifier = Classifier::new(Duration::from_secs(90));
        assert_eq!(
            classifier.classify(&UpstreamError::http(429, "")),
            FailureReason::RateLimit {
                retry_after_secs: 90
            }
        );
    }

    #[test]
    fn rate_limit_keyword_without_429() {
        let reason = classify(UpstreamError::http(400, "Application request Rate Limit reached"));
        assert_eq!(reason.kind(), ReasonKind::RateLimit);
    }

    #[test]
    fn rate_limit_wins_over_other_keywords() {
        let reason = classify(UpstreamError::http(429, "permission scope rate exceeded"));
        assert_eq!(reason.kind(), ReasonKind::RateLimit);
    }

    #[test]
    fn permission_keywords() {
        for msg in [
            "Missing permission pages_manage_posts",
            "Invalid OAuth access token",
            "requires scope instagram_content_publish",
        ] {
            assert_eq!(
                classify(UpstreamError::http(403, msg)),
                FailureReason::PermissionDenied,
                "message: {msg}"
            );
        }
    }

    #[test]
    fn permission_wins_over_format() {
        let reason = classify(UpstreamError::http(400, "permission required for this format"));
        assert_eq!(reason, FailureReason::PermissionDenied);
    }

    #[test]
    fn format_keywords() {
        for msg in [
            "Invalid video FORMAT",
            "Unsupported codec",
            "aspect ratio not supported",
        ] {
            assert_eq!(
                classify(UpstreamError::http(400, msg)),
                FailureReason::UnsupportedFormat,
                "message: {msg}"
            );
        }
    }

    #[test]
    fn unreachable_keywords() {
        for msg in [
            "media URI could not be retrieved",
            "failed to download media",
            "unable to fetch asset",
            "timeout while retrieving video",
        ] {
            assert_eq!(
                classify(UpstreamError::http(400, msg)),
                FailureReason::MediaUnreachable,
                "message: {msg}"
            );
        }
    }

    #[test]
    fn server_errors_are_transient() {
        assert_eq!(
            classify(UpstreamError::http(503, "service unavailable")),
            FailureReason::Transient
        );
        assert_eq!(
            classify(UpstreamError::http(500, "internal error")),
            FailureReason::Transient
        );
    }

    #[test]
    fn keywords_win_over_5xx() {
        assert_eq!(
            classify(UpstreamError::http(502, "could not download media")),
            FailureReason::MediaUnreachable
        );
    }

    #[test]
    fn everything_else_is_unknown() {
        assert_eq!(
            classify(UpstreamError::http(400, "something odd")),
            FailureReason::Unknown
        );
        assert_eq!(
            classify(UpstreamError::network("connection refused")),
            FailureReason::Unknown
        );
    }

    #[test]
    fn reason_serializes_with_type_tag() {
        let json = serde_json::to_value(FailureReason::RateLimit {
            retry_after_secs: 60,
        })
        .unwrap();
        assert_eq!(json["type"], "rate_limit");
        assert_eq!(json["retry_after_secs"], 60);
    }
}
