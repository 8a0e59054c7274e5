//! Content model shared by the publisher and the upstream adapters

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Longest caption the platform accepts.
pub const MAX_CAPTION_CHARS: usize = 2200;

/// Kind of media being published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
    Reel,
    Story,
}

impl MediaKind {
    pub const ALL: [MediaKind; 4] = [
        MediaKind::Photo,
        MediaKind::Video,
        MediaKind::Reel,
        MediaKind::Story,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
            MediaKind::Reel => "reel",
            MediaKind::Story => "story",
        }
    }
}

/// Reasons a publish request is rejected before any upstream call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContentError {
    #[error("media_url is empty")]
    EmptyMediaUrl,

    #[error("media_url must start with http:// or https://, got: {0}")]
    UnsupportedScheme(String),

    #[error("caption has {0} characters, limit is {MAX_CAPTION_CHARS}")]
    CaptionTooLong(usize),
}

/// One item to publish: what kind of media, where to fetch it, and its caption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    pub media_kind: MediaKind,
    pub media_url: String,
    #[serde(default)]
    pub caption: String,
}

impl Content {
    pub fn new(media_kind: MediaKind, media_url: impl Into<String>, caption: impl Into<String>) -> Self {
        Self {
            media_kind,
            media_url: media_url.into(),
            caption: caption.into(),
        }
    }

    /// Reject input that no strategy could ever publish.
    pub fn validate(&self) -> Result<(), ContentError> {
        let url = self.media_url.trim();
        if url.is_empty() {
            return Err(ContentError::EmptyMediaUrl);
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ContentError::UnsupportedScheme(url.to_string()));
        }
        let chars = self.caption.chars().count();
        if chars > MAX_CAPTION_CHARS {
            return Err(ContentError::CaptionTooLong(chars));
        }
        Ok(())
    }

    /// Same caption and kind, different media locator.
    pub fn with_media_url(&self, media_url: impl Into<String>) -> Self {
        Self {
            media_kind: self.media_kind,
            media_url: media_url.into(),
            caption: self.caption.clone(),
        }
    }
}

/// A publish operation an account's permission tier may allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    PublishPhoto,
    PublishVideo,
    PublishReel,
    PublishStory,
}

impl Capability {
    /// The operation needed to publish `kind`.
    pub fn for_kind(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Photo => Capability::PublishPhoto,
            MediaKind::Video => Capability::PublishVideo,
            MediaKind::Reel => Capability::PublishReel,
            MediaKind::Story => Capability::PublishStory,
        }
    }
}

/// The set of publish operations available to one token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(HashSet<Capability>);

impl CapabilitySet {
    /// Every publish operation.
    pub fn all() -> Self {
        MediaKind::ALL.into_iter().map(Capability::for_kind).collect()
    }

    /// Tier that may only publish still images.
    pub fn photo_only() -> Self {
        [Capability::PublishPhoto].into_iter().collect()
    }

    pub fn supports(&self, kind: MediaKind) -> bool {
        self.0.contains(&Capability::for_kind(kind))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
