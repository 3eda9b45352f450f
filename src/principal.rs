//! Principals and tiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Named class of principal with an associated budget policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
    Business,
    Enterprise,
}

impl Tier {
    /// All known tiers, used to validate policy tables at startup.
    pub const ALL: [Tier; 4] = [Tier::Free, Tier::Pro, Tier::Business, Tier::Enterprise];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Business => "business",
            Tier::Enterprise => "enterprise",
        }
    }
}

/// The entity being rate-limited and budgeted: a user ID, API key, or
/// tenant ID. Immutable once attached to a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub tier: Tier,
    pub created_at: DateTime<Utc>,
}

impl Principal {
    pub fn new(id: impl Into<String>, tier: Tier) -> Self {
        Self {
            id: id.into(),
            tier,
            created_at: Utc::now(),
        }
    }
}
