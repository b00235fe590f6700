//! Cache key derivation.

use recsync_core::{stable_hash, QueryPayload};

/// Key of the cached result of `query`: the read prefix followed by a stable
/// digest of the whole payload.
pub fn read_key(prefix: &str, query: &QueryPayload) -> String {
    format!("{}{}", prefix, stable_hash(query))
}

/// Whether `key` holds a cached read.
pub fn is_read_key(prefix: &str, key: &str) -> bool {
    key.starts_with(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use recsync_core::Filter;

    #[test]
    fn test_read_key_is_prefixed_and_stable() {
        let query = QueryPayload::new(1, 25);
        let key = read_key("read:", &query);
        assert!(key.starts_with("read:"));
        assert_eq!(key, read_key("read:", &query.clone()));
        assert!(is_read_key("read:", &key));
        assert!(!is_read_key("read:", "session:abc"));
    }

    #[test]
    fn test_read_key_differs_per_query() {
        let a = QueryPayload::new(1, 25);
        let mut b = QueryPayload::new(1, 25);
        b.filters.push(Filter::new("status", "open"));
        assert_ne!(read_key("read:", &a), read_key("read:", &b));
    }
}
