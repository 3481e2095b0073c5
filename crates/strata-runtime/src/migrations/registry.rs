use std::collections::BTreeMap;

use strata_core::error::{Result, StrataError};
use strata_core::schema::MigrationScript;

/// Catalog of known migrations, ordered by id.
///
/// Built once at startup and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct MigrationRegistry {
    scripts: BTreeMap<String, MigrationScript>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry, failing on the first duplicate id.
    pub fn from_scripts(scripts: impl IntoIterator<Item = MigrationScript>) -> Result<Self> {
        let mut registry = Self::new();
        for script in scripts {
            registry.register(script)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, script: MigrationScript) -> Result<()> {
        if self.scripts.contains_key(script.id()) {
            return Err(StrataError::DuplicateId(script.id().to_string()));
        }
        self.scripts.insert(script.id().to_string(), script);
        Ok(())
    }

    /// Scripts in ascending id order. Each call starts a fresh iteration.
    pub fn all(&self) -> impl DoubleEndedIterator<Item = &MigrationScript> + '_ {
        self.scripts.values()
    }

    pub fn find(&self, id: &str) -> Result<&MigrationScript> {
        self.scripts
            .get(id)
            .ok_or_else(|| StrataError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.scripts.contains_key(id)
    }

    /// The script with the greatest id.
    pub fn latest(&self) -> Option<&MigrationScript> {
        self.scripts.values().next_back()
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::schema::OperationSet;

    fn script(id: &str) -> MigrationScript {
        MigrationScript::new(id, OperationSet::default(), OperationSet::default())
    }

    #[test]
    fn test_all_is_sorted_and_restartable() {
        let registry = MigrationRegistry::from_scripts([
            script("20230301120000_b"),
            script("20220101000000_a"),
            script("20240101000000_c"),
        ])
        .unwrap();

        let first: Vec<&str> = registry.all().map(|s| s.id()).collect();
        let second: Vec<&str> = registry.all().map(|s| s.id()).collect();
        assert_eq!(
            first,
            vec!["20220101000000_a", "20230301120000_b", "20240101000000_c"]
        );
        assert_eq!(first, second);
        assert_eq!(registry.latest().unwrap().id(), "20240101000000_c");
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = MigrationRegistry::new();
        registry.register(script("20220101000000_a")).unwrap();

        let err = registry.register(script("20220101000000_a")).unwrap_err();
        assert!(matches!(err, StrataError::DuplicateId(id) if id == "20220101000000_a"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_find_unknown_id() {
        let registry = MigrationRegistry::new();
        assert!(matches!(
            registry.find("nope"),
            Err(StrataError::NotFound(_))
        ));
        assert!(registry.is_empty());
    }
}
