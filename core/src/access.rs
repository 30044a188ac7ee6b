//! Access grants: one user's entitlement to one edition.

use crate::UnknownCode;
use crate::edition::{Edition, EditionStatus};
use crate::ids::{AccessId, EditionId, SubscriptionId, UserId};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Status of an access grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessStatus {
    /// Waiting for the edition to be released.
    Scheduled,
    /// Unlocked.
    Active,
    /// Lapsed after `expires_at`.
    Expired,
}

impl AccessStatus {
    /// Convert status to its stored code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Active => "active",
            Self::Expired => "expired",
        }
    }

    /// Parse status from its stored code.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownCode`] if the code doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, UnknownCode> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "active" => Ok(Self::Active),
            "expired" => Ok(Self::Expired),
            _ => Err(UnknownCode::new("access status", s)),
        }
    }
}

/// Plan tier a grant was bought under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    /// Digital reading access only.
    Digital,
    /// Printed copy shipped, no digital access.
    Physical,
    /// Both digital access and a printed copy.
    Combined,
}

impl PlanType {
    /// Convert plan type to its stored code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Digital => "digital",
            Self::Physical => "physical",
            Self::Combined => "combined",
        }
    }

    /// Parse plan type from its stored code.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownCode`] if the code doesn't match a known plan type.
    pub fn parse(s: &str) -> Result<Self, UnknownCode> {
        match s {
            "digital" => Ok(Self::Digital),
            "physical" => Ok(Self::Physical),
            "combined" => Ok(Self::Combined),
            _ => Err(UnknownCode::new("plan type", s)),
        }
    }

    /// Whether the plan unlocks digital reading access.
    #[must_use]
    pub const fn includes_digital(self) -> bool {
        matches!(self, Self::Digital | Self::Combined)
    }

    /// Whether the plan ships a printed copy.
    #[must_use]
    pub const fn includes_physical(self) -> bool {
        matches!(self, Self::Physical | Self::Combined)
    }
}

/// A stored access grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditionAccess {
    /// Row identifier.
    pub id: AccessId,
    /// Grantee.
    pub user_id: UserId,
    /// Edition the grant is for.
    pub edition_id: EditionId,
    /// Grant status.
    pub status: AccessStatus,
    /// Target unlock time.
    pub unlock_at: DateTime<Utc>,
    /// Actual unlock time.
    pub unlocked_at: Option<DateTime<Utc>>,
    /// When the grant was created.
    pub granted_at: DateTime<Utc>,
    /// When the grant lapses, if ever.
    pub expires_at: Option<DateTime<Utc>>,
    /// Subscription that produced the grant, if any.
    pub subscription_id: Option<SubscriptionId>,
    /// Plan tier.
    pub access_type: PlanType,
}

/// Insert request for an access grant.
///
/// Stores apply upsert semantics on `(user_id, edition_id)`: a second request
/// for the same pair returns the existing grant untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccess {
    /// Grantee.
    pub user_id: UserId,
    /// Edition the grant is for.
    pub edition_id: EditionId,
    /// Initial status, always explicit.
    pub status: AccessStatus,
    /// Target unlock time.
    pub unlock_at: DateTime<Utc>,
    /// Set when the grant is created already unlocked.
    pub unlocked_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub granted_at: DateTime<Utc>,
    /// Expiry, if any.
    pub expires_at: Option<DateTime<Utc>>,
    /// Originating subscription.
    pub subscription_id: Option<SubscriptionId>,
    /// Plan tier.
    pub access_type: PlanType,
}

impl NewAccess {
    /// Build a grant for `edition`.
    ///
    /// If the edition is already active the grant is created unlocked
    /// (immediate grant); otherwise it is created `Scheduled` and waits for
    /// the release engine.
    #[must_use]
    pub fn for_edition(
        user_id: UserId,
        edition: &Edition,
        access_type: PlanType,
        subscription_id: Option<SubscriptionId>,
        now: DateTime<Utc>,
    ) -> Self {
        let immediate = edition.status == EditionStatus::Active;
        Self {
            user_id,
            edition_id: edition.id,
            status: if immediate {
                AccessStatus::Active
            } else {
                AccessStatus::Scheduled
            },
            unlock_at: if immediate { now } else { edition.unlock_at(now) },
            unlocked_at: immediate.then_some(now),
            granted_at: now,
            expires_at: None,
            subscription_id,
            access_type,
        }
    }

    /// Whether the grant is created already unlocked.
    #[must_use]
    pub fn is_immediate(&self) -> bool {
        self.status == AccessStatus::Active
    }
}

/// A grant unlocked by a release, joined with the grantee's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockedGrant {
    /// Grant that was unlocked.
    pub access_id: AccessId,
    /// Grantee.
    pub user_id: UserId,
    /// Grantee email address.
    pub email: String,
    /// Grantee display name.
    pub name: Option<String>,
    /// Plan tier of the grant.
    pub access_type: PlanType,
}

/// Read model of an active grant, as stored in the entitlement cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessView {
    /// Grant identifier.
    pub access_id: AccessId,
    /// Grantee.
    pub user_id: UserId,
    /// Edition identifier.
    pub edition_id: EditionId,
    /// Edition number.
    pub edition_number: i32,
    /// Plan tier.
    pub access_type: PlanType,
    /// When the grant was unlocked.
    pub unlocked_at: Option<DateTime<Utc>>,
    /// When the grant lapses, if ever.
    pub expires_at: Option<DateTime<Utc>>,
    /// Edition release date.
    pub release_date: Option<NaiveDate>,
    /// Edition ready flag.
    pub ready_for_release: bool,
}

impl AccessView {
    /// Whether the underlying edition counts as released on `today`.
    #[must_use]
    pub fn is_visible_on(&self, today: NaiveDate) -> bool {
        self.ready_for_release || self.release_date.is_some_and(|date| date <= today)
    }
}
