//! Default values shared across crates.

/// Records per page when a load does not name a limit.
pub const DEFAULT_PAGE_SIZE: u32 = 25;

/// Largest page a single load may request.
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Seconds between staleness polls.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Prefix marking cache entries that hold read results.
pub const READ_KEY_PREFIX: &str = "read:";
