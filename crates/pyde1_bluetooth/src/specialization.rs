//! Prefix-to-constructor registry driving class specialisation: a device
//! arrives generic, and on first advertisement seen during capture, its
//! advertised name picks a specific class from this registry.

/// Maps advertised-name prefixes to a specific device class tag. Populated
/// at startup; longest-prefix-first so a more specific entry wins over a
/// shorter one that would also match.
#[derive(Debug, Clone, Default)]
pub struct SpecializationRegistry {
    entries: Vec<(String, String)>,
}

impl SpecializationRegistry {
    pub fn new() -> Self {
        SpecializationRegistry { entries: Vec::new() }
    }

    pub fn register(&mut self, prefix: impl Into<String>, class_name: impl Into<String>) {
        self.entries.push((prefix.into(), class_name.into()));
        self.entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    }

    /// The specific class for `advertised_name`, or `None` to stay generic.
    pub fn resolve(&self, advertised_name: &str) -> Option<String> {
        self.entries
            .iter()
            .find(|(prefix, _)| advertised_name.starts_with(prefix.as_str()))
            .map(|(_, class)| class.clone())
    }

    /// A registry pre-populated with the scale and thermometer models
    /// known at this revision. Callers add site-specific entries on top.
    pub fn with_known_models() -> Self {
        let mut registry = Self::new();
        registry.register("Skale", "AcaiaScale");
        registry.register("ACAIA", "AcaiaScale");
        registry.register("PROCHBT", "AcaiaScale");
        registry.register("LUNAR", "AcaiaLunar");
        registry.register("Felicita", "FelicitaScale");
        registry.register("BOOKOO", "BookooScale");
        registry
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn longer_prefix_wins_over_shorter_overlapping_one() {
        let mut registry = SpecializationRegistry::new();
        registry.register("Ska", "GenericSkaFamily");
        registry.register("Skale", "AcaiaScale");
        assert_eq!(registry.resolve("Skale2"), Some("AcaiaScale".to_string()));
    }

    #[test]
    fn unmatched_name_stays_generic() {
        let registry = SpecializationRegistry::with_known_models();
        assert_eq!(registry.resolve("Unknown-1234"), None);
    }
}
