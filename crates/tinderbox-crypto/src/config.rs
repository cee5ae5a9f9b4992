use serde::{Deserialize, Serialize};

use crate::prekey::STANDARD_PREKEY_ID_SPACE;

pub const DEFAULT_MINIMUM_PREKEY_COUNT: u32 = 1;
pub const DEFAULT_SESSION_CACHE_CAPACITY: usize = 1000;
/// Enough for the last-resort prekey.
pub const DEFAULT_PREKEY_CACHE_CAPACITY: usize = 1;

/// Tunables for a [`Cryptobox`](crate::Cryptobox).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoboxConfig {
    /// Standard prekeys kept available for peers. Clamped to the size of the
    /// standard ID space.
    pub minimum_prekey_count: u32,
    pub session_cache_capacity: usize,
    pub prekey_cache_capacity: usize,
}

impl Default for CryptoboxConfig {
    fn default() -> Self {
        Self {
            minimum_prekey_count: DEFAULT_MINIMUM_PREKEY_COUNT,
            session_cache_capacity: DEFAULT_SESSION_CACHE_CAPACITY,
            prekey_cache_capacity: DEFAULT_PREKEY_CACHE_CAPACITY,
        }
    }
}

impl CryptoboxConfig {
    pub fn with_minimum_prekeys(mut self, count: u32) -> Self {
        self.minimum_prekey_count = count;
        self
    }

    pub fn with_session_cache_capacity(mut self, capacity: usize) -> Self {
        self.session_cache_capacity = capacity;
        self
    }

    pub fn with_prekey_cache_capacity(mut self, capacity: usize) -> Self {
        self.prekey_cache_capacity = capacity;
        self
    }

    /// Parse a JSON config. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// The minimum pool size actually enforced.
    pub fn minimum_prekeys(&self) -> u32 {
        if self.minimum_prekey_count > STANDARD_PREKEY_ID_SPACE {
            tracing::warn!(
                requested = self.minimum_prekey_count,
                clamped = STANDARD_PREKEY_ID_SPACE,
                "minimum prekey count exceeds the standard ID space"
            );
            STANDARD_PREKEY_ID_SPACE
        } else {
            self.minimum_prekey_count
        }
    }
}
