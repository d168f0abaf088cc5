// =============================================================================
// Repository — persistence seam for rules, exposure limits, LP configs
// =============================================================================
//
// The engine loads this state on startup and writes through synchronously
// on every admin mutation, so a restart always comes back with the last
// acknowledged admin state.  The store itself is pluggable; the built-in
// implementations are a JSON file store (atomic tmp + rename per file) and
// an in-memory store for tests and embedded use.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::{de::DeserializeOwned, Serialize};
use tracing::info;

use crate::exposure::ExposureLimit;
use crate::lp::LpConfig;
use crate::router::rules::RoutingRule;

pub trait Repository: Send + Sync {
    fn load_rules(&self) -> Result<Vec<RoutingRule>>;
    fn save_rule(&self, rule: &RoutingRule) -> Result<()>;
    fn delete_rule(&self, id: &str) -> Result<()>;

    fn load_exposure_limits(&self) -> Result<Vec<(String, ExposureLimit)>>;
    fn save_exposure_limit(&self, symbol: &str, limit: &ExposureLimit) -> Result<()>;

    fn load_lp_configs(&self) -> Result<Vec<LpConfig>>;
    fn save_lp_config(&self, config: &LpConfig) -> Result<()>;
    fn delete_lp_config(&self, id: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

const RULES_FILE: &str = "rules.json";
const LIMITS_FILE: &str = "exposure_limits.json";
const LP_CONFIGS_FILE: &str = "lp_configs.json";

/// JSON files in a directory, one per collection, written atomically.
pub struct FileRepository {
    dir: PathBuf,
    /// Serialises read-modify-write cycles across admin callers.
    write_lock: Mutex<()>,
}

impl FileRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create repository dir {}", dir.display()))?;
        info!(dir = %dir.display(), "file repository opened");
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn read_map<T: DeserializeOwned>(&self, file: &str) -> Result<HashMap<String, T>> {
        let path = self.dir.join(file);
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Atomic write: tmp sibling, then rename.
    fn write_map<T: Serialize>(&self, file: &str, map: &HashMap<String, T>) -> Result<()> {
        let path = self.dir.join(file);
        let content =
            serde_json::to_string_pretty(map).context("failed to serialise repository map")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename into {}", path.display()))?;
        Ok(())
    }

    fn upsert_entry<T: Serialize>(&self, file: &str, key: &str, value: &T) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut map: HashMap<String, serde_json::Value> = self.read_map(file)?;
        map.insert(key.to_string(), serde_json::to_value(value)?);
        self.write_map(file, &map)
    }

    fn delete_entry(&self, file: &str, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut map: HashMap<String, serde_json::Value> = self.read_map(file)?;
        map.remove(key);
        self.write_map(file, &map)
    }
}

impl Repository for FileRepository {
    fn load_rules(&self) -> Result<Vec<RoutingRule>> {
        Ok(self.read_map::<RoutingRule>(RULES_FILE)?.into_values().collect())
    }

    fn save_rule(&self, rule: &RoutingRule) -> Result<()> {
        self.upsert_entry(RULES_FILE, &rule.id, rule)
    }

    fn delete_rule(&self, id: &str) -> Result<()> {
        self.delete_entry(RULES_FILE, id)
    }

    fn load_exposure_limits(&self) -> Result<Vec<(String, ExposureLimit)>> {
        Ok(self
            .read_map::<ExposureLimit>(LIMITS_FILE)?
            .into_iter()
            .collect())
    }

    fn save_exposure_limit(&self, symbol: &str, limit: &ExposureLimit) -> Result<()> {
        self.upsert_entry(LIMITS_FILE, symbol, limit)
    }

    fn load_lp_configs(&self) -> Result<Vec<LpConfig>> {
        Ok(self
            .read_map::<LpConfig>(LP_CONFIGS_FILE)?
            .into_values()
            .collect())
    }

    fn save_lp_config(&self, config: &LpConfig) -> Result<()> {
        self.upsert_entry(LP_CONFIGS_FILE, &config.id, config)
    }

    fn delete_lp_config(&self, id: &str) -> Result<()> {
        self.delete_entry(LP_CONFIGS_FILE, id)
    }
}

impl std::fmt::Debug for FileRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRepository")
            .field("dir", &self.dir)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Volatile store for tests and embedded setups without a persistence
/// requirement.
#[derive(Default)]
pub struct MemoryRepository {
    rules: RwLock<HashMap<String, RoutingRule>>,
    limits: RwLock<HashMap<String, ExposureLimit>>,
    lp_configs: RwLock<HashMap<String, LpConfig>>,
}

impl Repository for MemoryRepository {
    fn load_rules(&self) -> Result<Vec<RoutingRule>> {
        Ok(self.rules.read().values().cloned().collect())
    }

    fn save_rule(&self, rule: &RoutingRule) -> Result<()> {
        self.rules.write().insert(rule.id.clone(), rule.clone());
        Ok(())
    }

    fn delete_rule(&self, id: &str) -> Result<()> {
        self.rules.write().remove(id);
        Ok(())
    }

    fn load_exposure_limits(&self) -> Result<Vec<(String, ExposureLimit)>> {
        Ok(self
            .limits
            .read()
            .iter()
            .map(|(s, l)| (s.clone(), *l))
            .collect())
    }

    fn save_exposure_limit(&self, symbol: &str, limit: &ExposureLimit) -> Result<()> {
        self.limits.write().insert(symbol.to_string(), *limit);
        Ok(())
    }

    fn load_lp_configs(&self) -> Result<Vec<LpConfig>> {
        Ok(self.lp_configs.read().values().cloned().collect())
    }

    fn save_lp_config(&self, config: &LpConfig) -> Result<()> {
        self.lp_configs
            .write()
            .insert(config.id.clone(), config.clone());
        Ok(())
    }

    fn delete_lp_config(&self, id: &str) -> Result<()> {
        self.lp_configs.write().remove(id);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRepository")
            .field("rules", &self.rules.read().len())
            .field("limits", &self.limits.read().len())
            .field("lp_configs", &self.lp_configs.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::rules::RuleFilters;
    use crate::types::RouteAction;

    fn rule(id: &str) -> RoutingRule {
        RoutingRule {
            id: id.into(),
            priority: 1,
            enabled: true,
            filters: RuleFilters::default(),
            action: RouteAction::ABook,
            hedge_percent: None,
            reason_tag: None,
        }
    }

    #[test]
    fn file_repository_roundtrips_rules() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileRepository::new(dir.path()).unwrap();

        assert!(repo.load_rules().unwrap().is_empty());

        repo.save_rule(&rule("r1")).unwrap();
        repo.save_rule(&rule("r2")).unwrap();

        let mut ids: Vec<String> = repo
            .load_rules()
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["r1", "r2"]);

        repo.delete_rule("r1").unwrap();
        let rules = repo.load_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, "r2");
    }

    #[test]
    fn file_repository_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let repo = FileRepository::new(dir.path()).unwrap();
            repo.save_rule(&rule("r1")).unwrap();
            repo.save_exposure_limit("EURUSD", &ExposureLimit::default())
                .unwrap();
        }
        let repo = FileRepository::new(dir.path()).unwrap();
        assert_eq!(repo.load_rules().unwrap().len(), 1);
        let limits = repo.load_exposure_limits().unwrap();
        assert_eq!(limits.len(), 1);
        assert_eq!(limits[0].0, "EURUSD");
    }

    #[test]
    fn save_is_idempotent_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileRepository::new(dir.path()).unwrap();
        repo.save_rule(&rule("r1")).unwrap();
        let mut updated = rule("r1");
        updated.priority = 9;
        repo.save_rule(&updated).unwrap();

        let rules = repo.load_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].priority, 9);
    }

    #[test]
    fn memory_repository_roundtrips() {
        let repo = MemoryRepository::default();
        repo.save_rule(&rule("r1")).unwrap();
        assert_eq!(repo.load_rules().unwrap().len(), 1);
        repo.delete_rule("r1").unwrap();
        assert!(repo.load_rules().unwrap().is_empty());

        repo.save_exposure_limit(
            "XAUUSD",
            &ExposureLimit {
                max_net: 100.0,
                max_gross: 200.0,
                auto_hedge_level: 50.0,
            },
        )
        .unwrap();
        let limits = repo.load_exposure_limits().unwrap();
        assert!((limits[0].1.max_net - 100.0).abs() < f64::EPSILON);
    }
}
