//! Load migration scripts from a directory.
//!
//! Two file layouts are understood:
//!
//! - `<id>.toml` with `up` and `down` arrays of tagged operations:
//!
//!   ```toml
//!   [[up]]
//!   op = "add_column"
//!   table = "Users"
//!   column = "Email"
//!   type = "varchar(256)"
//!
//!   [[down]]
//!   op = "drop_column"
//!   table = "Users"
//!   column = "Email"
//!   ```
//!
//! - `<id>.up.sql` / `<id>.down.sql` pairs, each split into raw statements.
//!
//! Anything else in the directory is ignored.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

use strata_core::error::{Result, StrataError};
use strata_core::schema::{MigrationScript, Operation, OperationSet};

use super::registry::MigrationRegistry;
use super::split::split_sql_statements;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScriptFile {
    #[serde(default)]
    up: OperationSet,
    #[serde(default)]
    down: OperationSet,
}

#[derive(Default)]
struct SqlPair {
    up: Option<String>,
    down: Option<String>,
}

fn raw_operations(sql: &str) -> OperationSet {
    split_sql_statements(sql)
        .into_iter()
        .map(|sql| Operation::RawStatement { sql })
        .collect()
}

/// Read every migration in `dir`, sorted by id.
///
/// A missing directory yields no migrations.
pub fn load_migrations_from_dir(dir: &Path) -> Result<Vec<MigrationScript>> {
    if !dir.exists() {
        debug!("Migrations directory does not exist: {:?}", dir);
        return Ok(Vec::new());
    }

    let mut scripts: BTreeMap<String, MigrationScript> = BTreeMap::new();
    let mut sql_pairs: BTreeMap<String, SqlPair> = BTreeMap::new();

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if let Some(id) = file_name.strip_suffix(".toml") {
            let content = std::fs::read_to_string(&path)?;
            let file: ScriptFile = toml::from_str(&content).map_err(|e| {
                StrataError::Config(format!("Failed to parse migration {}: {}", file_name, e))
            })?;
            scripts.insert(id.to_string(), MigrationScript::new(id, file.up, file.down));
        } else if let Some(id) = file_name.strip_suffix(".up.sql") {
            sql_pairs.entry(id.to_string()).or_default().up = Some(std::fs::read_to_string(&path)?);
        } else if let Some(id) = file_name.strip_suffix(".down.sql") {
            sql_pairs.entry(id.to_string()).or_default().down =
                Some(std::fs::read_to_string(&path)?);
        }
    }

    for (id, pair) in sql_pairs {
        if scripts.contains_key(&id) {
            return Err(StrataError::DuplicateId(id));
        }
        let Some(up) = pair.up else {
            return Err(StrataError::Config(format!(
                "Migration {} has a .down.sql file but no .up.sql",
                id
            )));
        };
        let down = match pair.down {
            Some(down) => raw_operations(&down),
            None => {
                warn!("Migration {} has no .down.sql; it cannot be reverted", id);
                OperationSet::default()
            }
        };
        let script = MigrationScript::new(id.as_str(), raw_operations(&up), down);
        scripts.insert(id, script);
    }

    if let Some(empty) = scripts.keys().find(|id| id.trim().is_empty()) {
        return Err(StrataError::Config(format!(
            "Migration file with empty id: '{}'",
            empty
        )));
    }

    debug!("Loaded {} migrations from {:?}", scripts.len(), dir);
    Ok(scripts.into_values().collect())
}

/// Load `dir` straight into a registry.
pub fn load_registry(dir: &Path) -> Result<MigrationRegistry> {
    MigrationRegistry::from_scripts(load_migrations_from_dir(dir)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_from_nonexistent_dir() {
        let scripts = load_migrations_from_dir(Path::new("/nonexistent/path")).unwrap();
        assert!(scripts.is_empty());
    }

    #[test]
    fn test_load_mixed_formats_sorted() {
        let dir = TempDir::new().unwrap();

        fs::write(
            dir.path().join("20230301120000_AddEmail.toml"),
            r#"
[[up]]
op = "add_column"
table = "Users"
column = "Email"
type = "varchar(256)"

[[down]]
op = "drop_column"
table = "Users"
column = "Email"
"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("20220101000000_Init.up.sql"),
            "CREATE TABLE \"Users\" (\"Id\" INTEGER); CREATE INDEX \"IX\" ON \"Users\" (\"Id\");",
        )
        .unwrap();
        fs::write(
            dir.path().join("20220101000000_Init.down.sql"),
            "DROP TABLE \"Users\";",
        )
        .unwrap();
        fs::write(dir.path().join("readme.txt"), "Not a migration").unwrap();

        let scripts = load_migrations_from_dir(dir.path()).unwrap();
        assert_eq!(scripts.len(), 2);
        assert_eq!(scripts[0].id(), "20220101000000_Init");
        assert_eq!(scripts[0].up.len(), 2);
        assert_eq!(scripts[0].down.len(), 1);
        assert_eq!(scripts[1].id(), "20230301120000_AddEmail");
        assert!(matches!(
            scripts[1].up.iter().next(),
            Some(Operation::AddColumn { column, .. }) if column == "Email"
        ));
    }

    #[test]
    fn test_up_sql_without_down_is_irreversible() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("20220101000000_Seed.up.sql"), "SELECT 1;").unwrap();

        let scripts = load_migrations_from_dir(dir.path()).unwrap();
        assert_eq!(scripts.len(), 1);
        assert!(scripts[0].down.is_empty());
    }

    #[test]
    fn test_same_id_in_both_formats_is_duplicate() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("20220101000000_Init.toml"), "up = []").unwrap();
        fs::write(dir.path().join("20220101000000_Init.up.sql"), "SELECT 1;").unwrap();

        let err = load_migrations_from_dir(dir.path()).unwrap_err();
        assert!(matches!(err, StrataError::DuplicateId(_)));
    }

    #[test]
    fn test_invalid_toml_names_the_file() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("20220101000000_Bad.toml"),
            "[[up]]\nop = \"explode\"",
        )
        .unwrap();

        let err = load_migrations_from_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("20220101000000_Bad.toml"));
    }
}
