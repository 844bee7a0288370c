//! Cluster configuration repository (CCS) lookup boundary.
//!
//! The real CCS is an external daemon queried by path-style keys such as
//! `/cluster/gulm/heartbeat_rate`. This workspace never talks to a live CCS
//! (it is an external collaborator, see SPEC_FULL.md §6), so resolution is
//! behind a trait with a default implementation that always misses,
//! matching "failure returns default values" for this source.

pub trait CcsSource: Send + Sync {
    /// Looks up a single string-valued key. `None` means "not configured",
    /// which callers treat the same as a CCS connection failure: fall
    /// through to the next-lower-precedence source.
    fn lookup(&self, path: &str) -> Option<String>;
}

pub struct NoneCcs;

impl CcsSource for NoneCcs {
    fn lookup(&self, _path: &str) -> Option<String> {
        None
    }
}

/// In-memory CCS stand-in used by tests and by any future local
/// configuration file loader.
pub struct StaticCcs {
    values: std::collections::HashMap<String, String>,
}

impl StaticCcs {
    pub fn new() -> Self {
        Self {
            values: std::collections::HashMap::new(),
        }
    }

    pub fn set(&mut self, path: &str, value: &str) {
        self.values.insert(path.to_string(), value.to_string());
    }
}

impl CcsSource for StaticCcs {
    fn lookup(&self, path: &str) -> Option<String> {
        self.values.get(path).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_ccs_always_misses() {
        assert_eq!(NoneCcs.lookup("/cluster/@name"), None);
    }

    #[test]
    fn static_ccs_returns_set_values() {
        let mut ccs = StaticCcs::new();
        ccs.set("/cluster/@name", "mycluster");
        assert_eq!(ccs.lookup("/cluster/@name"), Some("mycluster".to_string()));
        assert_eq!(ccs.lookup("/cluster/@missing"), None);
    }
}
