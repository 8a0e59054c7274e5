//! Strategy executors
//!
//! `StrategyExecutor::execute` runs one strategy with one token and turns
//! every upstream failure into a classified value. It never touches the
//! credential pool; acting on the classification is the orchestrator's job.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};
use upstream::{Content, MAX_CAPTION_CHARS, MediaConverter, MediaKind, Upstream, UpstreamError};

use crate::classify::{Classifier, FailureReason};
use crate::strategy::Strategy;
use crate::trace::{StepOutcome, SubAttempt, TraceEntry};

/// Delays and caption text used by the fallback strategies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// One re-attempt after each delay, in order.
    pub accessibility_delays: Vec<Duration>,
    pub generic_delay: Duration,
    /// Appended to the caption when a video is published as a photo.
    pub fallback_caption_suffix: String,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            accessibility_delays: vec![
                Duration::from_secs(2),
                Duration::from_secs(5),
                Duration::from_secs(10),
            ],
            generic_delay: Duration::from_secs(3),
            fallback_caption_suffix: "\n\n(Shared as a photo: this account cannot publish video.)"
                .to_string(),
        }
    }
}

/// Result of one strategy run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    Published {
        content_id: String,
    },
    Failed {
        reason: FailureReason,
        error: Option<UpstreamError>,
    },
    /// Continue with another strategy without classifying a failure.
    Redirect(Strategy),
    /// The strategy does not apply to this content.
    Skipped,
}

/// An attempt plus the trace entry describing it.
#[derive(Debug, Clone)]
pub struct Step {
    pub attempt: Attempt,
    pub entry: TraceEntry,
    /// Content actually sent upstream when the strategy published something
    /// other than its input (converted media, a still frame as a photo).
    /// The retry strategies repeat this rather than the original.
    pub attempted: Option<Content>,
}

impl Step {
    fn new(attempt: Attempt, entry: TraceEntry) -> Self {
        Self {
            attempt,
            entry,
            attempted: None,
        }
    }
}

pub struct StrategyExecutor {
    upstream: Arc<dyn Upstream>,
    converter: Arc<dyn MediaConverter>,
    classifier: Classifier,
    policy: RetryPolicy,
}

impl StrategyExecutor {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        converter: Arc<dyn MediaConverter>,
        classifier: Classifier,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            upstream,
            converter,
            classifier,
            policy,
        }
    }

    /// Run `strategy` for `content` with `token`.
    pub async fn execute(&self, strategy: Strategy, token: &str, content: &Content) -> Step {
        let step = match strategy {
            Strategy::PermissionAwarePublish => self.permission_aware(token, content).await,
            Strategy::DirectPublish => {
                let attempt = self.publish(token, content).await;
                self.single(strategy, attempt)
            }
            Strategy::FormatFallback => self.format_fallback(token, content).await,
            Strategy::PermissionFallback => self.permission_fallback(token, content).await,
            Strategy::AccessibilityRetry => {
                let delays = self.policy.accessibility_delays.clone();
                self.delayed_retries(strategy, token, content, &delays).await
            }
            Strategy::GenericRetry => {
                let delays = [self.policy.generic_delay];
                self.delayed_retries(strategy, token, content, &delays).await
            }
        };

        metrics::counter!(
            "publish_strategy_attempts_total",
            "strategy" => strategy.name(),
            "outcome" => step.entry.outcome.label()
        )
        .increment(1);
        debug!(
            strategy = strategy.name(),
            outcome = step.entry.outcome.label(),
            reason = step.entry.reason.map(|r| r.label()),
            "strategy finished"
        );
        step
    }

    async fn permission_aware(&self, token: &str, content: &Content) -> Step {
        let strategy = Strategy::PermissionAwarePublish;
        let capabilities = match self.upstream.check_capabilities(token).await {
            Ok(capabilities) => capabilities,
            Err(e) => return self.single(strategy, Err(e)),
        };

        if capabilities.supports(content.media_kind) {
            let attempt = self.publish(token, content).await;
            return self.single(strategy, attempt);
        }
        if content.media_kind != MediaKind::Photo && capabilities.supports(MediaKind::Photo) {
            info!(
                media_kind = content.media_kind.label(),
                "permission tier is photo-only, converting to photo"
            );
            return Step::new(
                Attempt::Redirect(Strategy::PermissionFallback),
                TraceEntry::new(strategy, StepOutcome::Redirected),
            );
        }

        let reason = FailureReason::PermissionDenied;
        Step::new(
            Attempt::Failed {
                reason,
                error: None,
            },
            TraceEntry {
                reason: Some(reason),
                ..TraceEntry::new(strategy, StepOutcome::Failed)
            },
        )
    }

    async fn format_fallback(&self, token: &str, content: &Content) -> Step {
        let strategy = Strategy::FormatFallback;
        let converted = match self
            .converter
            .transcode(&content.media_url, content.media_kind)
            .await
        {
            Ok(url) => url,
            Err(e) => {
                let reason = FailureReason::UnsupportedFormat;
                return Step::new(
                    Attempt::Failed {
                        reason,
                        error: Some(e.clone()),
                    },
                    TraceEntry::failed(strategy, reason, e),
                );
            }
        };
        debug!(media_url = %converted, "media converted, republishing");
        let converted = content.with_media_url(converted);
        let attempt = self.publish(token, &converted).await;
        Step {
            attempted: Some(converted),
            ..self.single(strategy, attempt)
        }
    }

    async fn permission_fallback(&self, token: &str, content: &Content) -> Step {
        let strategy = Strategy::PermissionFallback;
        let skipped = Step::new(
            Attempt::Skipped,
            TraceEntry::new(strategy, StepOutcome::Skipped),
        );
        if content.media_kind == MediaKind::Photo {
            return skipped;
        }

        let frame = match self.converter.extract_frame(&content.media_url).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!(media_url = %content.media_url, "no still frame available, skipping photo fallback");
                return skipped;
            }
            Err(e) => return self.single(strategy, Err(e)),
        };

        let photo = Content::new(
            MediaKind::Photo,
            frame,
            fallback_caption(&content.caption, &self.policy.fallback_caption_suffix),
        );
        let attempt = self.publish(token, &photo).await;
        Step {
            attempted: Some(photo),
            ..self.single(strategy, attempt)
        }
    }

    /// Re-attempt `content` after each delay. Stops at the first success or
    /// rate limit.
    async fn delayed_retries(
        &self,
        strategy: Strategy,
        token: &str,
        content: &Content,
        delays: &[Duration],
    ) -> Step {
        let mut entry = TraceEntry::new(strategy, StepOutcome::Failed);
        let mut last = None;

        for delay in delays {
            tokio::time::sleep(*delay).await;
            match self.publish(token, content).await {
                Ok(content_id) => {
                    entry.sub_attempts.push(SubAttempt {
                        delay_secs: delay.as_secs(),
                        error: None,
                    });
                    entry.outcome = StepOutcome::Succeeded;
                    return Step::new(Attempt::Published { content_id }, entry);
                }
                Err(e) => {
                    let reason = self.classifier.classify(&e);
                    debug!(
                        strategy = strategy.name(),
                        delay_secs = delay.as_secs(),
                        reason = reason.label(),
                        "delayed re-attempt failed"
                    );
                    entry.sub_attempts.push(SubAttempt {
                        delay_secs: delay.as_secs(),
                        error: Some(e.clone()),
                    });
                    let rate_limited = matches!(reason, FailureReason::RateLimit { .. });
                    last = Some((reason, e));
                    if rate_limited {
                        break;
                    }
                }
            }
        }

        let (reason, error) = match last {
            Some((reason, error)) => (reason, Some(error)),
            None => (FailureReason::Unknown, None),
        };
        entry.reason = Some(reason);
        entry.upstream_error = error.clone();
        Step::new(Attempt::Failed { reason, error }, entry)
    }

    async fn publish(&self, token: &str, content: &Content) -> Result<String, UpstreamError> {
        self.upstream.publish(token, content).await
    }

    /// Step for a strategy that made exactly one publishing call.
    fn single(&self, strategy: Strategy, result: Result<String, UpstreamError>) -> Step {
        match result {
            Ok(content_id) => Step::new(
                Attempt::Published { content_id },
                TraceEntry::new(strategy, StepOutcome::Succeeded),
            ),
            Err(e) => {
                let reason = self.classifier.classify(&e);
                Step::new(
                    Attempt::Failed {
                        reason,
                        error: Some(e.clone()),
                    },
                    TraceEntry::failed(strategy, reason, e),
                )
            }
        }
    }
}

/// Caption for a photo standing in for a video: the original caption,
/// shortened if needed so the suffix still fits the platform limit.
fn fallback_caption(caption: &str, suffix: &str) -> String {
    let room = MAX_CAPTION_CHARS.saturating_sub(suffix.chars().count());
    let mut out: String = caption.chars().take(room).collect();
    out.push_str(suffix);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use upstream::CapabilitySet;
    use upstream::mock::{MockConverter, MockUpstream};

    struct Harness {
        upstream: Arc<MockUpstream>,
        converter: Arc<MockConverter>,
        executor: StrategyExecutor,
    }

    fn harness() -> Harness {
        let upstream = Arc::new(MockUpstream::new());
        let converter = Arc::new(MockConverter::new());
        let executor = StrategyExecutor::new(
            upstream.clone(),
            converter.clone(),
            Classifier::default(),
            RetryPolicy::default(),
        );
        Harness {
            upstream,
            converter,
            executor,
        }
    }

    fn video() -> Content {
        Content::new(MediaKind::Video, "https://cdn.example.com/v.mp4", "launch day")
    }

    #[tokio::test]
    async fn direct_publish_success() {
        let h = harness();
        let step = h
            .executor
            .execute(Strategy::DirectPublish, "at", &video())
            .await;
        assert_eq!(
            step.attempt,
            Attempt::Published {
                content_id: "media-1".into()
            }
        );
        assert_eq!(step.entry.outcome, StepOutcome::Succeeded);
        assert_eq!(h.upstream.publish_calls()[0].token, "at");
    }

    #[tokio::test]
    async fn direct_publish_failure_is_classified() {
        let h = harness();
        h.upstream
            .push_failure(UpstreamError::http(400, "Unsupported video codec"));
        let step = h
            .executor
            .execute(Strategy::DirectPublish, "at", &video())
            .await;
        assert!(matches!(
            step.attempt,
            Attempt::Failed {
                reason: FailureReason::UnsupportedFormat,
                ..
            }
        ));
        assert_eq!(step.entry.reason, Some(FailureReason::UnsupportedFormat));
        assert_eq!(
            step.entry.upstream_error.as_ref().unwrap().http_status,
            Some(400)
        );
    }

    #[tokio::test]
    async fn permission_aware_publishes_supported_kind() {
        let h = harness();
        let step = h
            .executor
            .execute(Strategy::PermissionAwarePublish, "at", &video())
            .await;
        assert!(matches!(step.attempt, Attempt::Published { .. }));
        assert_eq!(h.upstream.capability_calls(), 1);
        assert_eq!(
            h.upstream.publish_calls()[0].content.media_kind,
            MediaKind::Video
        );
    }

    #[tokio::test]
    async fn permission_aware_redirects_photo_only_tier() {
        let h = harness();
        h.upstream.set_capabilities(Ok(CapabilitySet::photo_only()));
        let step = h
            .executor
            .execute(Strategy::PermissionAwarePublish, "at", &video())
            .await;
        assert_eq!(step.attempt, Attempt::Redirect(Strategy::PermissionFallback));
        assert_eq!(step.entry.outcome, StepOutcome::Redirected);
        assert!(h.upstream.publish_calls().is_empty());
    }

    #[tokio::test]
    async fn permission_aware_without_any_capability_is_denied() {
        let h = harness();
        h.upstream
            .set_capabilities(Ok(CapabilitySet::from_iter(std::iter::empty())));
        let step = h
            .executor
            .execute(Strategy::PermissionAwarePublish, "at", &video())
            .await;
        assert_eq!(
            step.attempt,
            Attempt::Failed {
                reason: FailureReason::PermissionDenied,
                error: None
            }
        );
    }

    #[tokio::test]
    async fn permission_aware_capability_error_is_classified() {
        let h = harness();
        h.upstream
            .set_capabilities(Err(UpstreamError::http(503, "unavailable")));
        let step = h
            .executor
            .execute(Strategy::PermissionAwarePublish, "at", &video())
            .await;
        assert!(matches!(
            step.attempt,
            Attempt::Failed {
                reason: FailureReason::Transient,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn format_fallback_publishes_converted_media() {
        let h = harness();
        let step = h
            .executor
            .execute(Strategy::FormatFallback, "at", &video())
            .await;
        assert!(matches!(step.attempt, Attempt::Published { .. }));
        assert_eq!(h.converter.transcode_calls(), 1);
        let call = &h.upstream.publish_calls()[0];
        assert_eq!(call.content.media_url, "https://cdn.example.com/converted.mp4");
        assert_eq!(call.content.caption, "launch day");
        assert_eq!(step.attempted.as_ref(), Some(&call.content));
    }

    #[tokio::test]
    async fn format_fallback_converter_failure_is_unsupported_format() {
        let h = harness();
        h.converter
            .set_transcoded(Err(UpstreamError::http(500, "encoder crashed")));
        let step = h
            .executor
            .execute(Strategy::FormatFallback, "at", &video())
            .await;
        assert!(matches!(
            step.attempt,
            Attempt::Failed {
                reason: FailureReason::UnsupportedFormat,
                ..
            }
        ));
        assert!(h.upstream.publish_calls().is_empty());
    }

    #[tokio::test]
    async fn permission_fallback_publishes_frame_as_photo() {
        let h = harness();
        let step = h
            .executor
            .execute(Strategy::PermissionFallback, "at", &video())
            .await;
        assert!(matches!(step.attempt, Attempt::Published { .. }));

        let call = &h.upstream.publish_calls()[0];
        assert_eq!(call.content.media_kind, MediaKind::Photo);
        assert_eq!(call.content.media_url, "https://cdn.example.com/frame.jpg");
        assert!(call.content.caption.starts_with("launch day"));
        assert!(call.content.caption.ends_with(&RetryPolicy::default().fallback_caption_suffix));
        assert_eq!(step.attempted.as_ref(), Some(&call.content));
    }

    #[tokio::test]
    async fn direct_publish_attempts_its_input() {
        let h = harness();
        let step = h
            .executor
            .execute(Strategy::DirectPublish, "at", &video())
            .await;
        assert!(step.attempted.is_none());
    }

    #[tokio::test]
    async fn permission_fallback_skips_without_real_media() {
        let h = harness();
        h.converter.set_frame(Ok(None));
        let step = h
            .executor
            .execute(Strategy::PermissionFallback, "at", &video())
            .await;
        assert_eq!(step.attempt, Attempt::Skipped);
        assert_eq!(step.entry.outcome, StepOutcome::Skipped);
        assert!(h.upstream.publish_calls().is_empty());
    }

    #[tokio::test]
    async fn permission_fallback_skips_photos() {
        let h = harness();
        let photo = Content::new(MediaKind::Photo, "https://cdn.example.com/p.jpg", "");
        let step = h
            .executor
            .execute(Strategy::PermissionFallback, "at", &photo)
            .await;
        assert_eq!(step.attempt, Attempt::Skipped);
        assert_eq!(h.converter.frame_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn accessibility_retry_waits_between_attempts() {
        let h = harness();
        h.upstream
            .fail_all_publishes(UpstreamError::http(400, "failed to download media"));
        let start = tokio::time::Instant::now();

        let step = h
            .executor
            .execute(Strategy::AccessibilityRetry, "at", &video())
            .await;

        let offsets: Vec<u64> = h
            .upstream
            .publish_calls()
            .iter()
            .map(|c| (c.at - start).as_secs())
            .collect();
        assert_eq!(offsets, vec![2, 7, 17]);
        let delays: Vec<u64> = step.entry.sub_attempts.iter().map(|s| s.delay_secs).collect();
        assert_eq!(delays, vec![2, 5, 10]);
        assert_eq!(step.entry.reason, Some(FailureReason::MediaUnreachable));
    }

    #[tokio::test(start_paused = true)]
    async fn accessibility_retry_stops_on_success() {
        let h = harness();
        h.upstream
            .push_failure(UpstreamError::http(400, "could not fetch media"))
            .push_publish(Ok("media-late".into()));

        let step = h
            .executor
            .execute(Strategy::AccessibilityRetry, "at", &video())
            .await;
        assert_eq!(
            step.attempt,
            Attempt::Published {
                content_id: "media-late".into()
            }
        );
        assert_eq!(step.entry.sub_attempts.len(), 2);
        assert_eq!(step.entry.sub_attempts[1].error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn accessibility_retry_stops_on_rate_limit() {
        let h = harness();
        h.upstream
            .push_failure(UpstreamError::http(429, "slow down").with_retry_after(60));

        let step = h
            .executor
            .execute(Strategy::AccessibilityRetry, "at", &video())
            .await;
        assert_eq!(step.entry.sub_attempts.len(), 1);
        assert!(matches!(
            step.attempt,
            Attempt::Failed {
                reason: FailureReason::RateLimit {
                    retry_after_secs: 60
                },
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn generic_retry_is_one_delayed_attempt() {
        let h = harness();
        h.upstream
            .fail_all_publishes(UpstreamError::http(502, "bad gateway"));
        let start = tokio::time::Instant::now();

        let step = h
            .executor
            .execute(Strategy::GenericRetry, "at", &video())
            .await;

        let calls = h.upstream.publish_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!((calls[0].at - start).as_secs(), 3);
        assert!(matches!(
            step.attempt,
            Attempt::Failed {
                reason: FailureReason::Transient,
                ..
            }
        ));
    }

    #[test]
    fn fallback_caption_respects_limit() {
        let caption = "x".repeat(MAX_CAPTION_CHARS);
        let out = fallback_caption(&caption, " (photo)");
        assert_eq!(out.chars().count(), MAX_CAPTION_CHARS);
        assert!(out.ends_with(" (photo)"));

        assert_eq!(fallback_caption("hi", "!"), "hi!");
    }
}
