//! Publishing strategies and their transition table
//!
//! Each strategy is one way of getting content onto the platform. A failed
//! strategy's classified reason selects the next one; `None` means the chain
//! is exhausted. The table is an exhaustive `match`, so adding a strategy or a
//! reason without deciding its transitions does not compile.

use serde::Serialize;
use upstream::MediaKind;

use crate::classify::ReasonKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Strategy {
    /// Check the account's permission tier, then publish the most direct
    /// operation it allows.
    PermissionAwarePublish,
    /// Publish the content as given.
    DirectPublish,
    /// Re-encode the media, then publish the same operation.
    FormatFallback,
    /// Publish a still frame of a video as a photo.
    PermissionFallback,
    /// Re-attempt the last publish after increasing delays.
    AccessibilityRetry,
    /// One last re-attempt of the last publish after a fixed delay.
    GenericRetry,
}

impl Strategy {
    pub const ALL: [Strategy; 6] = [
        Strategy::PermissionAwarePublish,
        Strategy::DirectPublish,
        Strategy::FormatFallback,
        Strategy::PermissionFallback,
        Strategy::AccessibilityRetry,
        Strategy::GenericRetry,
    ];

    /// Photos go straight to the platform; motion content first checks what
    /// the account may publish.
    pub fn initial(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Photo => Strategy::DirectPublish,
            MediaKind::Video | MediaKind::Reel | MediaKind::Story => {
                Strategy::PermissionAwarePublish
            }
        }
    }

    /// Whether this strategy repeats the previous strategy's publish instead
    /// of deriving its own from the original content.
    pub fn repeats_last_attempt(&self) -> bool {
        matches!(self, Strategy::AccessibilityRetry | Strategy::GenericRetry)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::PermissionAwarePublish => "PermissionAwarePublish",
            Strategy::DirectPublish => "DirectPublish",
            Strategy::FormatFallback => "FormatFallback",
            Strategy::PermissionFallback => "PermissionFallback",
            Strategy::AccessibilityRetry => "AccessibilityRetry",
            Strategy::GenericRetry => "GenericRetry",
        }
    }

    /// Next strategy after this one failed for `reason`.
    ///
    /// A rate limit always ends the chain: the credential is spent and every
    /// remaining strategy would reuse it.
    pub fn next(self, reason: ReasonKind) -> Option<Strategy> {
        use ReasonKind as R;
        use Strategy as S;

        match (self, reason) {
            (_, R::RateLimit) => None,

            (S::PermissionAwarePublish, _) => Some(S::DirectPublish),

            (S::DirectPublish, R::PermissionDenied) => Some(S::PermissionFallback),
            (S::DirectPublish, R::UnsupportedFormat) => Some(S::FormatFallback),
            (S::DirectPublish, R::MediaUnreachable) => Some(S::AccessibilityRetry),
            (S::DirectPublish, R::Transient | R::Unknown) => Some(S::GenericRetry),

            (S::FormatFallback, R::PermissionDenied) => Some(S::PermissionFallback),
            (S::FormatFallback, R::UnsupportedFormat) => None,
            (S::FormatFallback, R::MediaUnreachable) => Some(S::AccessibilityRetry),
            (S::FormatFallback, R::Transient | R::Unknown) => Some(S::GenericRetry),

            (S::PermissionFallback, R::Transient | R::Unknown) => Some(S::GenericRetry),
            (
                S::PermissionFallback,
                R::PermissionDenied | R::UnsupportedFormat | R::MediaUnreachable,
            ) => None,

            (S::AccessibilityRetry | S::GenericRetry, _) => None,
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
