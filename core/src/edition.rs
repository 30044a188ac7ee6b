//! Editions: numbered release units with a monotonic lifecycle.

use crate::UnknownCode;
use crate::ids::EditionId;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an edition.
///
/// Transitions only move forward: `Pending → PreorderOpen → Active → Closed`
/// (`Pending → Active` is allowed when preorders never opened).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditionStatus {
    /// Announced, not yet purchasable.
    Pending,
    /// Preorders are being taken.
    PreorderOpen,
    /// Released; access grants are unlocked.
    Active,
    /// No longer sold.
    Closed,
}

impl EditionStatus {
    /// Convert status to its stored code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::PreorderOpen => "preorder_open",
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }

    /// Parse status from its stored code.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownCode`] if the code doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, UnknownCode> {
        match s {
            "pending" => Ok(Self::Pending),
            "preorder_open" => Ok(Self::PreorderOpen),
            "active" => Ok(Self::Active),
            "closed" => Ok(Self::Closed),
            _ => Err(UnknownCode::new("edition status", s)),
        }
    }

    /// Whether the release engine may still activate an edition in this status.
    #[must_use]
    pub const fn is_releasable(self) -> bool {
        matches!(self, Self::Pending | Self::PreorderOpen)
    }

    /// Whether the edition has been released (active or closed after release).
    #[must_use]
    pub const fn is_released(self) -> bool {
        matches!(self, Self::Active | Self::Closed)
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::PreorderOpen => 1,
            Self::Active => 2,
            Self::Closed => 3,
        }
    }

    /// Whether moving from `self` to `next` respects monotonic ordering.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        next.rank() > self.rank()
    }
}

impl std::fmt::Display for EditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A numbered release unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edition {
    /// Row identifier.
    pub id: EditionId,
    /// Globally unique, immutable ordering key.
    pub number: i32,
    /// Lifecycle status.
    pub status: EditionStatus,
    /// Planned release date, if scheduled.
    pub release_date: Option<NaiveDate>,
    /// Editorial sign-off that the edition may be released.
    pub ready_for_release: bool,
    /// Print run cap, if any.
    pub max_copies: Option<i32>,
    /// When the release engine activated the edition.
    pub released_at: Option<DateTime<Utc>>,
}

impl Edition {
    /// Whether the edition counts as released for read purposes: its release
    /// date has passed or it is explicitly marked ready.
    #[must_use]
    pub fn is_visible_on(&self, today: NaiveDate) -> bool {
        self.ready_for_release || self.release_date.is_some_and(|date| date <= today)
    }

    /// Target unlock time for a scheduled grant on this edition.
    ///
    /// Midnight UTC of the release date, or `fallback` when the edition has no
    /// release date yet.
    #[must_use]
    pub fn unlock_at(&self, fallback: DateTime<Utc>) -> DateTime<Utc> {
        self.release_date
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map_or(fallback, |naive| naive.and_utc())
    }
}
