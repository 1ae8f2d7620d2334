//! Engine tuning knobs.

use serde::{Deserialize, Serialize};

/// Default number of pool-admission lock stripes.
pub const DEFAULT_LOCK_STRIPES: usize = 1024;

/// Default cap on hashes returned by one `get_hashes` call.
pub const DEFAULT_MAX_HASHES_PER_REQUEST: usize = 500;

pub const DEFAULT_MAX_ORPHAN_BLOCKS: usize = 750;

pub const DEFAULT_MAX_ORPHAN_TRANSACTIONS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Mutex stripes guarding concurrent pool admission.
    pub lock_stripes: usize,
    /// Upper bound applied to a caller's `max_hash_count` in `get_hashes`.
    pub max_hashes_per_request: usize,
    pub max_orphan_blocks: usize,
    pub max_orphan_transactions: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            lock_stripes: DEFAULT_LOCK_STRIPES,
            max_hashes_per_request: DEFAULT_MAX_HASHES_PER_REQUEST,
            max_orphan_blocks: DEFAULT_MAX_ORPHAN_BLOCKS,
            max_orphan_transactions: DEFAULT_MAX_ORPHAN_TRANSACTIONS,
        }
    }
}
