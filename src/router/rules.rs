// =============================================================================
// Routing Rules — admin-managed overrides evaluated first in the pipeline
// =============================================================================
//
// Rules are kept as an immutable sorted list behind an atomic swap: the
// single admin writer builds a new list and publishes it in one step, so
// hot-path readers always see either the old or the new complete list.
//
// Total order: descending priority, then ascending id for rules at equal
// priority. Evaluation takes the first enabled match.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::profiler::ClientProfile;
use crate::types::{Classification, Order, RouteAction};

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Optional per-rule filters; a rule matches when every present filter
/// matches the order and the current profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleFilters {
    #[serde(default)]
    pub accounts: Option<Vec<String>>,
    #[serde(default)]
    pub symbols: Option<Vec<String>>,
    #[serde(default)]
    pub min_volume: Option<f64>,
    #[serde(default)]
    pub max_volume: Option<f64>,
    #[serde(default)]
    pub classifications: Option<Vec<Classification>>,
    #[serde(default)]
    pub min_toxicity: Option<f64>,
    #[serde(default)]
    pub max_toxicity: Option<f64>,
}

impl RuleFilters {
    fn validate(&self) -> Result<()> {
        if let (Some(min), Some(max)) = (self.min_volume, self.max_volume) {
            if min > max {
                anyhow::bail!("volume filter range is empty ({min} > {max})");
            }
        }
        if let (Some(min), Some(max)) = (self.min_toxicity, self.max_toxicity) {
            if min > max {
                anyhow::bail!("toxicity filter range is empty ({min} > {max})");
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Rule
// ---------------------------------------------------------------------------

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: String,
    /// Higher evaluates first.
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub filters: RuleFilters,
    pub action: RouteAction,
    /// A-Book percentage for `PartialHedge`; must lie strictly inside
    /// (0, 100).
    #[serde(default)]
    pub hedge_percent: Option<f64>,
    /// Free-form tag echoed into decision reasons alongside `rule:<id>`.
    #[serde(default)]
    pub reason_tag: Option<String>,
}

impl RoutingRule {
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            anyhow::bail!("rule id must not be empty");
        }
        self.filters.validate()?;
        match self.action {
            RouteAction::PartialHedge => match self.hedge_percent {
                Some(p) if p > 0.0 && p < 100.0 => {}
                Some(p) => anyhow::bail!("hedge_percent {p} outside (0, 100)"),
                None => anyhow::bail!("PartialHedge rule requires hedge_percent"),
            },
            _ => {
                if self.hedge_percent.is_some() {
                    anyhow::bail!("hedge_percent is only valid for PartialHedge rules");
                }
            }
        }
        Ok(())
    }

    /// Whether every present filter matches this order/profile pair.
    pub fn matches(&self, order: &Order, profile: &ClientProfile) -> bool {
        if let Some(accounts) = &self.filters.accounts {
            if !accounts.iter().any(|a| a == &order.account_id) {
                return false;
            }
        }
        if let Some(symbols) = &self.filters.symbols {
            if !symbols.iter().any(|s| s == &order.symbol) {
                return false;
            }
        }
        if let Some(min) = self.filters.min_volume {
            if order.volume < min {
                return false;
            }
        }
        if let Some(max) = self.filters.max_volume {
            if order.volume > max {
                return false;
            }
        }
        if let Some(classes) = &self.filters.classifications {
            if !classes.contains(&profile.classification) {
                return false;
            }
        }
        if let Some(min) = self.filters.min_toxicity {
            if profile.toxicity_score < min {
                return false;
            }
        }
        if let Some(max) = self.filters.max_toxicity {
            if profile.toxicity_score > max {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Atomic-swap rule list: one writer, many wait-free readers.
pub struct RuleStore {
    rules: ArcSwap<Vec<RoutingRule>>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self {
            rules: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Replace the whole list (startup load).
    pub fn load(&self, mut rules: Vec<RoutingRule>) {
        Self::sort(&mut rules);
        let count = rules.len();
        self.rules.store(Arc::new(rules));
        info!(count, "routing rules loaded");
    }

    /// The current complete, sorted list.
    pub fn snapshot(&self) -> Arc<Vec<RoutingRule>> {
        self.rules.load_full()
    }

    /// Insert or replace a rule by id.
    pub fn upsert(&self, rule: RoutingRule) -> Result<()> {
        rule.validate()?;
        let mut next: Vec<RoutingRule> = self
            .snapshot()
            .iter()
            .filter(|r| r.id != rule.id)
            .cloned()
            .collect();
        next.push(rule);
        Self::sort(&mut next);
        self.rules.store(Arc::new(next));
        Ok(())
    }

    /// Remove a rule by id. Removing an unknown id is a no-op (admin calls
    /// are idempotent by id).
    pub fn delete(&self, id: &str) -> bool {
        let current = self.snapshot();
        if !current.iter().any(|r| r.id == id) {
            return false;
        }
        let next: Vec<RoutingRule> = current.iter().filter(|r| r.id != id).cloned().collect();
        self.rules.store(Arc::new(next));
        true
    }

    fn sort(rules: &mut [RoutingRule]) {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderKind, Side};

    fn rule(id: &str, priority: i32, action: RouteAction) -> RoutingRule {
        RoutingRule {
            id: id.into(),
            priority,
            enabled: true,
            filters: RuleFilters::default(),
            action,
            hedge_percent: if action == RouteAction::PartialHedge {
                Some(50.0)
            } else {
                None
            },
            reason_tag: None,
        }
    }

    fn order(account: &str, symbol: &str, volume: f64) -> Order {
        Order {
            id: "o1".into(),
            account_id: account.into(),
            symbol: symbol.into(),
            side: Side::Buy,
            volume,
            price: None,
            kind: OrderKind::Market,
        }
    }

    fn profile(classification: Classification, toxicity: f64) -> ClientProfile {
        let mut p = ClientProfile::bootstrap("A1");
        p.classification = classification;
        p.toxicity_score = toxicity;
        p
    }

    #[test]
    fn partial_hedge_percent_must_be_inside_open_interval() {
        let mut r = rule("r1", 1, RouteAction::PartialHedge);
        assert!(r.validate().is_ok());

        r.hedge_percent = Some(0.0);
        assert!(r.validate().is_err());
        r.hedge_percent = Some(100.0);
        assert!(r.validate().is_err());
        r.hedge_percent = None;
        assert!(r.validate().is_err());
    }

    #[test]
    fn hedge_percent_rejected_on_other_actions() {
        let mut r = rule("r1", 1, RouteAction::ABook);
        r.hedge_percent = Some(30.0);
        assert!(r.validate().is_err());
    }

    #[test]
    fn empty_filter_ranges_rejected() {
        let mut r = rule("r1", 1, RouteAction::BBook);
        r.filters.min_volume = Some(10.0);
        r.filters.max_volume = Some(1.0);
        assert!(r.validate().is_err());
    }

    #[test]
    fn filters_all_must_match() {
        let mut r = rule("r1", 1, RouteAction::ABook);
        r.filters.accounts = Some(vec!["A1".into()]);
        r.filters.symbols = Some(vec!["EURUSD".into()]);
        r.filters.min_volume = Some(1.0);
        r.filters.max_volume = Some(10.0);
        r.filters.classifications = Some(vec![Classification::Professional]);
        r.filters.min_toxicity = Some(10.0);
        r.filters.max_toxicity = Some(50.0);

        let p = profile(Classification::Professional, 30.0);
        assert!(r.matches(&order("A1", "EURUSD", 5.0), &p));

        assert!(!r.matches(&order("A2", "EURUSD", 5.0), &p));
        assert!(!r.matches(&order("A1", "GBPUSD", 5.0), &p));
        assert!(!r.matches(&order("A1", "EURUSD", 0.5), &p));
        assert!(!r.matches(&order("A1", "EURUSD", 50.0), &p));
        assert!(!r.matches(
            &order("A1", "EURUSD", 5.0),
            &profile(Classification::Retail, 30.0)
        ));
        assert!(!r.matches(
            &order("A1", "EURUSD", 5.0),
            &profile(Classification::Professional, 60.0)
        ));
    }

    #[test]
    fn no_filters_matches_everything() {
        let r = rule("r1", 1, RouteAction::BBook);
        assert!(r.matches(
            &order("A9", "XAUUSD", 123.0),
            &profile(Classification::Toxic, 99.0)
        ));
    }

    #[test]
    fn store_orders_by_priority_then_id() {
        let store = RuleStore::new();
        store.upsert(rule("b", 1, RouteAction::ABook)).unwrap();
        store.upsert(rule("a", 1, RouteAction::ABook)).unwrap();
        store.upsert(rule("c", 5, RouteAction::ABook)).unwrap();

        let rules = store.snapshot();
        let ids: Vec<&str> = rules.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn upsert_replaces_by_id() {
        let store = RuleStore::new();
        store.upsert(rule("r1", 1, RouteAction::ABook)).unwrap();
        store.upsert(rule("r1", 9, RouteAction::BBook)).unwrap();

        let rules = store.snapshot();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].priority, 9);
        assert_eq!(rules[0].action, RouteAction::BBook);
    }

    #[test]
    fn delete_is_idempotent() {
        let store = RuleStore::new();
        store.upsert(rule("r1", 1, RouteAction::ABook)).unwrap();
        assert!(store.delete("r1"));
        assert!(!store.delete("r1"));
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn invalid_rule_leaves_store_untouched() {
        let store = RuleStore::new();
        store.upsert(rule("r1", 1, RouteAction::ABook)).unwrap();

        let mut bad = rule("r2", 2, RouteAction::PartialHedge);
        bad.hedge_percent = Some(150.0);
        assert!(store.upsert(bad).is_err());

        let rules = store.snapshot();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, "r1");
    }
}
