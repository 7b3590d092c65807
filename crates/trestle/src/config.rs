//! Registry of opaque per-route filter configuration.
//!
//! The engine hands us serialized config payloads and keeps only the
//! numeric id we return; every id stays valid until an explicit destroy.
//! Ids are monotonic and never reused while the registry lives.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use trestle_filter_api::{ConfigError, ConfigParser, FilterConfig, FilterError};

pub struct ConfigRegistry {
    entries: DashMap<u64, FilterConfig>,
    next_id: AtomicU64,
    parser: Option<Arc<dyn ConfigParser>>,
}

impl ConfigRegistry {
    /// Create a registry, optionally with a custom parser supplied by the
    /// filter. Without one, raw payload bytes are stored as-is and merge
    /// defaults to child-overrides-parent.
    pub fn new(parser: Option<Arc<dyn ConfigParser>>) -> ConfigRegistry {
        ConfigRegistry {
            entries: DashMap::new(),
            // 0 is reserved as the "no config" sentinel on the ABI.
            next_id: AtomicU64::new(1),
            parser,
        }
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Parse and store a payload, returning its id. Fails only on
    /// malformed input.
    pub fn parse(&self, raw: &[u8]) -> Result<u64, ConfigError> {
        let value: FilterConfig = match &self.parser {
            Some(parser) => parser.parse(raw)?,
            None => Arc::new(raw.to_vec()),
        };
        let id = self.allocate_id();
        self.entries.insert(id, value);
        Ok(id)
    }

    /// Merge a child config over its parent.
    ///
    /// With a custom parser the merged value is stored under a new id;
    /// otherwise the child id is returned unchanged. Missing ids are a
    /// contract violation, not a runtime condition.
    pub fn merge(&self, parent_id: u64, child_id: u64) -> Result<u64, FilterError> {
        let Some(parser) = &self.parser else {
            // Child overrides parent by default.
            return Ok(child_id);
        };
        let parent = self.get(parent_id)?;
        let child = self.get(child_id)?;
        let merged = parser.merge(&parent, &child);
        let id = self.allocate_id();
        self.entries.insert(id, merged);
        Ok(id)
    }

    /// Remove an entry. Idempotent; the caller is responsible for not
    /// destroying ids still referenced by in-flight requests.
    pub fn destroy(&self, id: u64) {
        self.entries.remove(&id);
    }

    /// Look up a stored config.
    pub fn get(&self, id: u64) -> Result<FilterConfig, FilterError> {
        self.entries
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(FilterError::UnknownConfig(id))
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trestle_filter_api::ErrorCategory;

    struct UpperParser;

    impl ConfigParser for UpperParser {
        fn parse(&self, raw: &[u8]) -> Result<FilterConfig, ConfigError> {
            let text = std::str::from_utf8(raw)
                .map_err(|e| ConfigError::Malformed(e.to_string()))?;
            Ok(Arc::new(text.to_uppercase()))
        }

        fn merge(&self, parent: &FilterConfig, child: &FilterConfig) -> FilterConfig {
            let parent = parent.downcast_ref::<String>().cloned().unwrap_or_default();
            let child = child.downcast_ref::<String>().cloned().unwrap_or_default();
            Arc::new(format!("{parent}+{child}"))
        }
    }

    #[test]
    fn parse_stores_raw_bytes_without_parser() {
        let registry = ConfigRegistry::new(None);
        let id = registry.parse(b"payload").unwrap();
        let config = registry.get(id).unwrap();
        assert_eq!(
            config.downcast_ref::<Vec<u8>>().unwrap().as_slice(),
            b"payload"
        );
    }

    #[test]
    fn destroy_then_lookup_is_a_contract_violation() {
        let registry = ConfigRegistry::new(None);
        let id = registry.parse(b"x").unwrap();
        registry.destroy(id);
        let err = registry.get(id).unwrap_err();
        assert!(matches!(err, FilterError::UnknownConfig(found) if found == id));
        assert_eq!(err.category(), ErrorCategory::ContractViolation);
        // Idempotent.
        registry.destroy(id);
    }

    #[test]
    fn merge_without_parser_returns_child_unchanged() {
        let registry = ConfigRegistry::new(None);
        let parent = registry.parse(b"parent").unwrap();
        let child = registry.parse(b"child").unwrap();
        assert_eq!(registry.merge(parent, child).unwrap(), child);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn merge_with_parser_stores_new_entry() {
        let registry = ConfigRegistry::new(Some(Arc::new(UpperParser)));
        let parent = registry.parse(b"route").unwrap();
        let child = registry.parse(b"vhost").unwrap();
        let merged = registry.merge(parent, child).unwrap();
        assert_ne!(merged, parent);
        assert_ne!(merged, child);
        let config = registry.get(merged).unwrap();
        assert_eq!(config.downcast_ref::<String>().unwrap(), "ROUTE+VHOST");
    }

    #[test]
    fn merge_with_parser_requires_live_ids() {
        let registry = ConfigRegistry::new(Some(Arc::new(UpperParser)));
        let child = registry.parse(b"c").unwrap();
        assert!(matches!(
            registry.merge(999, child),
            Err(FilterError::UnknownConfig(999))
        ));
    }

    #[test]
    fn ids_are_monotonic_and_never_zero() {
        let registry = ConfigRegistry::new(None);
        let first = registry.parse(b"a").unwrap();
        assert!(first > 0);
        let second = registry.parse(b"b").unwrap();
        registry.destroy(second);
        let third = registry.parse(b"c").unwrap();
        assert!(second > first);
        assert!(third > second);
    }
}
