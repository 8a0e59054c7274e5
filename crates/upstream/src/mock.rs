//! Scripted in-memory upstream for tests
//!
//! `MockUpstream` answers publish calls from a FIFO script, falling back to a
//! fixed failure or to an auto-numbered success once the script is empty. It
//! records every publish call with its `tokio::time::Instant`, so tests running
//! on paused time can assert the exact retry delays.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::content::{CapabilitySet, Content, MediaKind};
use crate::error::UpstreamError;
use crate::{BoxFuture, MediaConverter, TokenGrant, Upstream};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One recorded publish call.
#[derive(Debug, Clone)]
pub struct PublishCall {
    pub token: String,
    pub content: Content,
    pub at: Instant,
}

/// Scripted upstream.
pub struct MockUpstream {
    script: Mutex<VecDeque<Result<String, UpstreamError>>>,
    fallback_error: Mutex<Option<UpstreamError>>,
    publish_delay: Mutex<Duration>,
    publish_calls: Mutex<Vec<PublishCall>>,
    capabilities: Mutex<Result<CapabilitySet, UpstreamError>>,
    capability_calls: AtomicUsize,
    refresh: Mutex<Result<TokenGrant, UpstreamError>>,
    refresh_delay: Mutex<Duration>,
    refresh_calls: AtomicUsize,
    next_id: AtomicUsize,
}

impl Default for MockUpstream {
    fn default() -> Self {
        Self::new()
    }
}

impl MockUpstream {
    /// Publishes succeed, every capability is granted, refresh returns
    /// `at_refreshed` valid for an hour.
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback_error: Mutex::new(None),
            publish_delay: Mutex::new(Duration::ZERO),
            publish_calls: Mutex::new(Vec::new()),
            capabilities: Mutex::new(Ok(CapabilitySet::all())),
            capability_calls: AtomicUsize::new(0),
            refresh: Mutex::new(Ok(TokenGrant {
                access_token: "at_refreshed".into(),
                refresh_token: Some("rt_refreshed".into()),
                expires_in: Some(3600),
            })),
            refresh_delay: Mutex::new(Duration::ZERO),
            refresh_calls: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
        }
    }

    /// Queue the result of the next unscripted publish call.
    pub fn push_publish(&self, result: Result<String, UpstreamError>) -> &Self {
        lock(&self.script).push_back(result);
        self
    }

    /// Queue a failure for the next publish call.
    pub fn push_failure(&self, error: UpstreamError) -> &Self {
        self.push_publish(Err(error))
    }

    /// Fail every publish call once the script is exhausted.
    pub fn fail_all_publishes(&self, error: UpstreamError) -> &Self {
        *lock(&self.fallback_error) = Some(error);
        self
    }

    /// Delay every publish call by `delay` (for deadline tests).
    pub fn set_publish_delay(&self, delay: Duration) -> &Self {
        *lock(&self.publish_delay) = delay;
        self
    }

    pub fn set_capabilities(&self, result: Result<CapabilitySet, UpstreamError>) -> &Self {
        *lock(&self.capabilities) = result;
        self
    }

    pub fn set_refresh(&self, result: Result<TokenGrant, UpstreamError>) -> &Self {
        *lock(&self.refresh) = result;
        self
    }

    /// Delay every refresh call by `delay` (for coalescing tests).
    pub fn set_refresh_delay(&self, delay: Duration) -> &Self {
        *lock(&self.refresh_delay) = delay;
        self
    }

    pub fn publish_calls(&self) -> Vec<PublishCall> {
        lock(&self.publish_calls).clone()
    }

    pub fn capability_calls(&self) -> usize {
        self.capability_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    fn next_publish_result(&self) -> Result<String, UpstreamError> {
        if let Some(result) = lock(&self.script).pop_front() {
            return result;
        }
        if let Some(error) = lock(&self.fallback_error).clone() {
            return Err(error);
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!("media-{n}"))
    }
}

impl Upstream for MockUpstream {
    fn id(&self) -> &str {
        "mock"
    }

    fn publish<'a>(
        &'a self,
        token: &'a str,
        content: &'a Content,
    ) -> BoxFuture<'a, Result<String, UpstreamError>> {
        Box::pin(async move {
            lock(&self.publish_calls).push(PublishCall {
                token: token.to_string(),
                content: content.clone(),
                at: Instant::now(),
            });
            let delay = *lock(&self.publish_delay);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.next_publish_result()
        })
    }

    fn check_capabilities<'a>(
        &'a self,
        _token: &'a str,
    ) -> BoxFuture<'a, Result<CapabilitySet, UpstreamError>> {
        Box::pin(async move {
            self.capability_calls.fetch_add(1, Ordering::SeqCst);
            lock(&self.capabilities).clone()
        })
    }

    fn refresh_token<'a>(
        &'a self,
        _refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<TokenGrant, UpstreamError>> {
        Box::pin(async move {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            let delay = *lock(&self.refresh_delay);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            lock(&self.refresh).clone()
        })
    }
}

/// Scripted media converter.
pub struct MockConverter {
    transcoded: Mutex<Result<String, UpstreamError>>,
    frame: Mutex<Result<Option<String>, UpstreamError>>,
    transcode_calls: AtomicUsize,
    frame_calls: AtomicUsize,
}

impl Default for MockConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConverter {
    /// Transcoding yields `https://cdn.example.com/converted.mp4`; frame
    /// extraction yields `https://cdn.example.com/frame.jpg`.
    pub fn new() -> Self {
        Self {
            transcoded: Mutex::new(Ok("https://cdn.example.com/converted.mp4".into())),
            frame: Mutex::new(Ok(Some("https://cdn.example.com/frame.jpg".into()))),
            transcode_calls: AtomicUsize::new(0),
            frame_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_transcoded(&self, result: Result<String, UpstreamError>) -> &Self {
        *lock(&self.transcoded) = result;
        self
    }

    pub fn set_frame(&self, result: Result<Option<String>, UpstreamError>) -> &Self {
        *lock(&self.frame) = result;
        self
    }

    pub fn transcode_calls(&self) -> usize {
        self.transcode_calls.load(Ordering::SeqCst)
    }

    pub fn frame_calls(&self) -> usize {
        self.frame_calls.load(Ordering::SeqCst)
    }
}

impl MediaConverter for MockConverter {
    fn transcode<'a>(
        &'a self,
        _media_url: &'a str,
        _kind: MediaKind,
    ) -> BoxFuture<'a, Result<String, UpstreamError>> {
        Box::pin(async move {
            self.transcode_calls.fetch_add(1, Ordering::SeqCst);
            lock(&self.transcoded).clone()
        })
    }

    fn extract_frame<'a>(
        &'a self,
        _media_url: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, UpstreamError>> {
        Box::pin(async move {
            self.frame_calls.fetch_add(1, Ordering::SeqCst);
            lock(&self.frame).clone()
        })
    }
}
