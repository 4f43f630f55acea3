//! # Migration Registry (迁移注册表)
//!
//! Discovers migration units, derives each ordinal from its canonical
//! `NNN_description` key and exposes them in ascending ordinal order,
//! independent of registration or filesystem order.
//!
//! ## 职责
//!
//! 1. 解析并校验迁移命名（malformed → `RegistryError`）
//! 2. 拒绝重复的 ordinal / key
//! 3. 维护历史键别名表（仅用于匹配旧版本写入的账本记录）
//!
//! All validation happens at construction, before any database access.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use super::definitions::{MigrationUnit, ScriptFileMigration};
use super::script_checker::{check_migration_script, CheckResult};
use super::RegistryError;

/// `NNN_description` with an optional `.sql` extension (any case); NNN has at
/// least three digits.
static RE_MIGRATION_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{3,})_([A-Za-z0-9][A-Za-z0-9_\-]*)(?:\.(?i:sql))?$").unwrap()
});

/// Parsed canonical migration name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationName {
    pub ordinal: u32,
    pub description: String,
}

/// 解析迁移名称
pub fn parse_migration_name(name: &str) -> Result<MigrationName, RegistryError> {
    let malformed = || RegistryError::MalformedName {
        name: name.to_string(),
    };
    let caps = RE_MIGRATION_NAME.captures(name).ok_or_else(malformed)?;
    let ordinal: u32 = caps[1].parse().map_err(|_| malformed())?;
    if ordinal == 0 {
        return Err(malformed());
    }
    Ok(MigrationName {
        ordinal,
        description: caps[2].to_string(),
    })
}

// ============================================================================
// RegisteredMigration
// ============================================================================

/// A unit together with the ordinal derived from its key.
pub struct RegisteredMigration {
    ordinal: u32,
    key: String,
    unit: Box<dyn MigrationUnit>,
}

impl RegisteredMigration {
    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn unit(&self) -> &dyn MigrationUnit {
        self.unit.as_ref()
    }
}

impl std::fmt::Debug for RegisteredMigration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredMigration")
            .field("ordinal", &self.ordinal)
            .field("key", &self.key)
            .finish()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// 迁移注册表
#[derive(Debug)]
pub struct MigrationRegistry {
    /// 按 ordinal 升序
    migrations: Vec<RegisteredMigration>,
    /// legacy key → canonical key
    aliases: HashMap<String, String>,
}

impl MigrationRegistry {
    pub fn builder() -> MigrationRegistryBuilder {
        MigrationRegistryBuilder::default()
    }

    /// Discovers `*.sql` files in `dir`. Files with other extensions are
    /// ignored; script bodies are not read here.
    ///
    /// Aliases whose target is not among the discovered files are dropped.
    pub fn scan_dir(dir: &Path, aliases: &[(&str, &str)]) -> Result<Self, RegistryError> {
        let source_err = |source| RegistryError::Source {
            path: dir.to_path_buf(),
            source,
        };

        let mut builder = Self::builder();
        let mut discovered: Vec<String> = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(source_err)? {
            let path = entry.map_err(source_err)?.path();
            let is_sql = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("sql"));
            if !path.is_file() || !is_sql {
                tracing::debug!(path = %path.display(), "[MigrationRegistry] 跳过非迁移文件");
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                return Err(RegistryError::MalformedName {
                    name: path.display().to_string(),
                });
            };
            discovered.push(file_name.to_string());
            builder = builder.register(ScriptFileMigration::new(file_name, path.clone()));
        }

        for (legacy, canonical) in aliases {
            if discovered.iter().any(|k| k == canonical) {
                builder = builder.alias(*legacy, *canonical);
            }
        }
        let registry = builder.build()?;
        tracing::info!(
            dir = %dir.display(),
            count = registry.len(),
            "[MigrationRegistry] 已发现迁移脚本"
        );
        Ok(registry)
    }

    /// Units in ascending ordinal order.
    pub fn load_ordered(&self) -> &[RegisteredMigration] {
        &self.migrations
    }

    pub fn get(&self, key: &str) -> Option<&RegisteredMigration> {
        self.migrations.iter().find(|m| m.key == key)
    }

    /// Maps a recorded ledger key to its canonical key, following the alias
    /// table for keys written by older engine versions.
    pub fn resolve_key<'a>(&'a self, recorded: &'a str) -> Option<&'a str> {
        if self.get(recorded).is_some() {
            return Some(recorded);
        }
        self.aliases.get(recorded).map(String::as_str)
    }

    pub fn aliases(&self) -> impl Iterator<Item = (&str, &str)> {
        self.aliases.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Runs the static script checker over every script-backed unit.
    pub fn lint(&self) -> anyhow::Result<Vec<(String, CheckResult)>> {
        let mut results = Vec::new();
        for migration in &self.migrations {
            if let Some(sql) = migration.unit().script()? {
                results.push((migration.key.clone(), check_migration_script(&migration.key, sql)));
            }
        }
        Ok(results)
    }
}

// ============================================================================
// Builder
// ============================================================================

#[derive(Default)]
pub struct MigrationRegistryBuilder {
    units: Vec<Box<dyn MigrationUnit>>,
    aliases: Vec<(String, String)>,
}

impl MigrationRegistryBuilder {
    pub fn register(mut self, unit: impl MigrationUnit + 'static) -> Self {
        self.units.push(Box::new(unit));
        self
    }

    pub fn register_boxed(mut self, unit: Box<dyn MigrationUnit>) -> Self {
        self.units.push(unit);
        self
    }

    pub fn alias(mut self, legacy: impl Into<String>, canonical: impl Into<String>) -> Self {
        self.aliases.push((legacy.into(), canonical.into()));
        self
    }

    pub fn aliases(mut self, table: &[(&str, &str)]) -> Self {
        self.aliases
            .extend(table.iter().map(|(l, c)| (l.to_string(), c.to_string())));
        self
    }

    /// Validates names, uniqueness and aliases, then orders by ordinal.
    pub fn build(self) -> Result<MigrationRegistry, RegistryError> {
        let mut by_ordinal: HashMap<u32, String> = HashMap::new();
        let mut migrations = Vec::with_capacity(self.units.len());

        for unit in self.units {
            let key = unit.key().to_string();
            let name = parse_migration_name(&key)?;

            if migrations.iter().any(|m: &RegisteredMigration| m.key == key) {
                return Err(RegistryError::DuplicateKey { key });
            }
            if let Some(first) = by_ordinal.get(&name.ordinal) {
                return Err(RegistryError::DuplicateOrdinal {
                    ordinal: name.ordinal,
                    first: first.clone(),
                    second: key,
                });
            }
            by_ordinal.insert(name.ordinal, key.clone());
            migrations.push(RegisteredMigration {
                ordinal: name.ordinal,
                key,
                unit,
            });
        }
        migrations.sort_by_key(|m| m.ordinal);

        let mut aliases: HashMap<String, String> = HashMap::new();
        for (legacy, canonical) in self.aliases {
            if migrations.iter().any(|m| m.key == legacy) {
                return Err(RegistryError::AliasConflict {
                    alias: legacy,
                    reason: "shadows a registered key".to_string(),
                });
            }
            if !migrations.iter().any(|m| m.key == canonical) {
                return Err(RegistryError::AliasConflict {
                    alias: legacy,
                    reason: format!("target '{}' is not registered", canonical),
                });
            }
            if let Some(existing) = aliases.get(&legacy) {
                if existing != &canonical {
                    return Err(RegistryError::AliasConflict {
                        reason: format!("maps to both '{}' and '{}'", existing, canonical),
                        alias: legacy,
                    });
                }
                continue;
            }
            aliases.insert(legacy, canonical);
        }

        tracing::debug!(
            migrations = migrations.len(),
            aliases = aliases.len(),
            "[MigrationRegistry] 注册表构建完成"
        );
        Ok(MigrationRegistry {
            migrations,
            aliases,
        })
    }
}
