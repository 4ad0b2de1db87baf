//! Structural migration of legacy manifests into the versioned
//! `modules.*` namespace. Idempotent: running twice never reports changes
//! the second time.

use serde_json::{Map, Value};

use crate::core::config::SOURCE_MODULE_KEY;

/// Current manifest modules layout version.
pub const MODULES_VERSION: i64 = 1;

/// Legacy top-level keys relocated under `modules.source`.
const LEGACY_SOURCE_FIELDS: &[&str] = &[
    "name",
    "path",
    "enabled",
    "target",
    "last_refresh_at",
    "last_health",
];

/// Default `modules.db` payload keys (all null, empty pending list).
pub fn default_db_module_payload() -> Map<String, Value> {
    let mut payload = Map::new();
    for key in [
        "bootstrap_shortuuid7",
        "head_migration_uuid7",
        "head_migration_shortuuid7",
        "ledger_checksum",
        "last_vacuum_at",
        "last_ensure_at",
    ] {
        payload.insert(key.to_string(), Value::Null);
    }
    payload.insert("pending_migrations".to_string(), Value::Array(Vec::new()));
    payload
}

/// Outcome of a manifest migration attempt.
#[derive(Debug, Clone)]
pub struct ManifestMigrationResult {
    pub applied: bool,
    pub data: Value,
    pub reason: Option<String>,
}

/// Apply structural migrations to a manifest object.
#[derive(Debug, Clone)]
pub struct ManifestMigrator {
    modules_key: String,
    db_module_key: String,
}

impl ManifestMigrator {
    pub fn new(modules_key: &str, db_module_key: &str) -> Self {
        Self {
            modules_key: modules_key.to_string(),
            db_module_key: db_module_key.to_string(),
        }
    }

    /// Return a migrated manifest mapping when changes are required.
    ///
    /// Steps, in order: ensure the modules namespace, ensure
    /// `modules.source`, relocate legacy root fields verbatim, seed
    /// `modules.db` defaults, stamp `modules_version`. When no step mutates
    /// the document the original data is returned with `applied = false`.
    pub fn migrate(&self, data: &Value) -> ManifestMigrationResult {
        let mut updated = match data {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        let mut changes: Vec<&str> = Vec::new();
        if !data.is_object() && !data.is_null() {
            changes.push("replaced non-object manifest document");
        }

        if !updated
            .get(&self.modules_key)
            .map(Value::is_object)
            .unwrap_or(false)
        {
            updated.insert(self.modules_key.clone(), Value::Object(Map::new()));
            changes.push("initialized modules namespace");
        }

        {
            let modules = updated
                .get_mut(&self.modules_key)
                .and_then(Value::as_object_mut)
                .expect("modules namespace ensured above");
            if !modules
                .get(SOURCE_MODULE_KEY)
                .map(Value::is_object)
                .unwrap_or(false)
            {
                modules.insert(SOURCE_MODULE_KEY.to_string(), Value::Object(Map::new()));
                changes.push("created modules.source payload");
            }
        }

        let mut relocated = Vec::new();
        for field in LEGACY_SOURCE_FIELDS {
            if let Some(value) = updated.remove(*field) {
                relocated.push(((*field).to_string(), value));
            }
        }
        if !relocated.is_empty() {
            let modules = updated
                .get_mut(&self.modules_key)
                .and_then(Value::as_object_mut)
                .expect("modules namespace ensured above");
            let source_module = modules
                .get_mut(SOURCE_MODULE_KEY)
                .and_then(Value::as_object_mut)
                .expect("source module ensured above");
            for (field, value) in relocated {
                source_module.insert(field, value);
            }
            changes.push("relocated legacy source fields");
        }

        {
            let modules = updated
                .get_mut(&self.modules_key)
                .and_then(Value::as_object_mut)
                .expect("modules namespace ensured above");
            match modules.get_mut(&self.db_module_key) {
                Some(Value::Object(db_module)) => {
                    let mut seeded = false;
                    for (key, default_value) in default_db_module_payload() {
                        if !db_module.contains_key(&key) {
                            db_module.insert(key, default_value);
                            seeded = true;
                        }
                    }
                    if seeded {
                        changes.push("completed modules.db defaults");
                    }
                }
                _ => {
                    modules.insert(
                        self.db_module_key.clone(),
                        Value::Object(default_db_module_payload()),
                    );
                    changes.push("seeded modules.db defaults");
                }
            }
        }

        if updated.get("modules_version") != Some(&Value::Number(MODULES_VERSION.into())) {
            updated.insert(
                "modules_version".to_string(),
                Value::Number(MODULES_VERSION.into()),
            );
            changes.push("stamped modules_version");
        }

        if changes.is_empty() {
            return ManifestMigrationResult {
                applied: false,
                data: data.clone(),
                reason: None,
            };
        }

        ManifestMigrationResult {
            applied: true,
            data: Value::Object(updated),
            reason: Some(changes.join("; ")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn migrator() -> ManifestMigrator {
        ManifestMigrator::new("modules", "db")
    }

    #[test]
    fn test_legacy_fields_relocate_verbatim() {
        let legacy = json!({
            "name": "legacy",
            "path": "/abs",
            "enabled": true,
            "target": null,
            "last_refresh_at": null,
            "last_health": {"status": "unknown"},
        });
        let result = migrator().migrate(&legacy);
        assert!(result.applied);
        let source = &result.data["modules"]["source"];
        assert_eq!(source["name"], "legacy");
        assert_eq!(source["path"], "/abs");
        assert_eq!(source["last_health"]["status"], "unknown");
        assert!(result.data.get("name").is_none());
        assert_eq!(result.data["modules_version"], 1);
        assert_eq!(result.data["modules"]["db"]["pending_migrations"], json!([]));
    }

    #[test]
    fn test_migration_is_idempotent() {
        let legacy = json!({"name": "legacy", "path": "/abs"});
        let first = migrator().migrate(&legacy);
        assert!(first.applied);
        let second = migrator().migrate(&first.data);
        assert!(!second.applied);
        assert_eq!(second.data, first.data);
    }

    #[test]
    fn test_existing_db_keys_preserved() {
        let doc = json!({
            "modules": {
                "source": {},
                "db": {"bootstrap_shortuuid7": "AAAA00000000"},
            },
            "modules_version": 1,
        });
        let result = migrator().migrate(&doc);
        assert!(result.applied);
        assert_eq!(
            result.data["modules"]["db"]["bootstrap_shortuuid7"],
            "AAAA00000000"
        );
        assert!(result.data["modules"]["db"]["ledger_checksum"].is_null());
    }
}
