//! Cost tracking and budget enforcement.
//!
//! Every provider submission is preceded by a precheck against the
//! configured ceilings (per-session, per-day, per-month, absolute). Usage
//! is recorded as append-only cost rows with a unit-price snapshot, so
//! later pricing changes never rewrite history. Warning thresholds emit
//! advisory events; only an actual ceiling stops a turn.

use crate::bus::{EventBus, EventPayload};
use crate::config::BudgetConfig;
use crate::errors::PryxResult;
use crate::store::{CostRecord, Store};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

/// Embedded pricing snapshot covering common models.
const PRICING_DATA: &str = include_str!("pricing_data.json");

/// Default pricing for unknown models ($10 input / $30 output per 1M tokens).
const DEFAULT_INPUT_PER_MILLION: f64 = 10.0;
const DEFAULT_OUTPUT_PER_MILLION: f64 = 30.0;

#[derive(Debug, Clone)]
pub struct ModelPrice {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

#[derive(Debug, Clone)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// Outcome of the pre-submission budget check.
#[derive(Debug, Clone)]
pub enum PreCheck {
    Ok { warnings: Vec<String> },
    Abort { reason: String },
}

impl PreCheck {
    pub fn is_abort(&self) -> bool {
        matches!(self, PreCheck::Abort { .. })
    }
}

pub struct CostTracker {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    config: std::sync::RwLock<BudgetConfig>,
    /// Pricing lookup: config overrides first, then the embedded snapshot.
    pricing: std::sync::RwLock<Vec<(String, ModelPrice)>>,
}

fn build_pricing(config: &BudgetConfig) -> Vec<(String, ModelPrice)> {
    let mut pricing = Vec::new();
    for (pattern, cost) in &config.model_costs {
        pricing.push((
            pattern.clone(),
            ModelPrice {
                input_per_million: cost.input_per_million,
                output_per_million: cost.output_per_million,
            },
        ));
    }
    match serde_json::from_str::<Vec<serde_json::Value>>(PRICING_DATA) {
        Ok(entries) => {
            for entry in entries {
                let pattern = entry["pattern"].as_str().unwrap_or_default();
                if pattern.is_empty() {
                    continue;
                }
                pricing.push((
                    pattern.to_string(),
                    ModelPrice {
                        input_per_million: entry["input_mtok"]
                            .as_f64()
                            .unwrap_or(DEFAULT_INPUT_PER_MILLION),
                        output_per_million: entry["output_mtok"]
                            .as_f64()
                            .unwrap_or(DEFAULT_OUTPUT_PER_MILLION),
                    },
                ));
            }
        }
        Err(e) => warn!("failed to parse embedded pricing data: {}", e),
    }
    pricing
}

impl CostTracker {
    pub fn new(store: Arc<Store>, bus: Arc<EventBus>, config: BudgetConfig) -> Self {
        let pricing = build_pricing(&config);
        Self {
            store,
            bus,
            config: std::sync::RwLock::new(config),
            pricing: std::sync::RwLock::new(pricing),
        }
    }

    pub fn budget(&self) -> BudgetConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the budget configuration at runtime (gateway surface).
    pub fn set_budget(&self, config: BudgetConfig) {
        let pricing = build_pricing(&config);
        *self.pricing.write().unwrap_or_else(|e| e.into_inner()) = pricing;
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;
    }

    /// Prefix match against the pricing table, config overrides first.
    pub fn lookup_price(&self, model: &str) -> ModelPrice {
        let pricing = self.pricing.read().unwrap_or_else(|e| e.into_inner());
        for (prefix, price) in pricing.iter() {
            if model.starts_with(prefix.as_str()) {
                return price.clone();
            }
        }
        ModelPrice {
            input_per_million: DEFAULT_INPUT_PER_MILLION,
            output_per_million: DEFAULT_OUTPUT_PER_MILLION,
        }
    }

    pub fn estimate_cost(&self, model: &str, input_tokens: i64, output_tokens: i64) -> f64 {
        let price = self.lookup_price(model);
        (input_tokens as f64 / 1_000_000.0) * price.input_per_million
            + (output_tokens as f64 / 1_000_000.0) * price.output_per_million
    }

    fn ceilings(&self, session_id: &str) -> PryxResult<Vec<(&'static str, f64, f64)>> {
        let config = self.budget();
        let mut out = Vec::new();
        if let Some(limit) = config.per_session {
            let used = self.store.cost_sum("", Some(session_id))?;
            out.push(("session", used, limit));
        }
        if let Some(limit) = config.per_day {
            let day = Utc::now().format("%Y-%m-%d").to_string();
            let used = self.store.cost_sum(&day, None)?;
            out.push(("day", used, limit));
        }
        if let Some(limit) = config.per_month {
            let month = Utc::now().format("%Y-%m").to_string();
            let used = self.store.cost_sum(&month, None)?;
            out.push(("month", used, limit));
        }
        if let Some(limit) = config.absolute {
            let used = self.store.cost_total()?;
            out.push(("absolute", used, limit));
        }
        Ok(out)
    }

    /// Pre-submission check. Refuses when any ceiling is already met;
    /// otherwise returns advisory warnings for crossed thresholds.
    pub fn pre_check(
        &self,
        session_id: &str,
        estimated_input_tokens: i64,
        model: &str,
    ) -> PryxResult<PreCheck> {
        let estimate = self.estimate_cost(model, estimated_input_tokens, 0);
        let warn_thresholds = self.budget().warn_thresholds;
        let mut warnings = Vec::new();
        for (period, used, limit) in self.ceilings(session_id)? {
            if used >= limit {
                return Ok(PreCheck::Abort {
                    reason: format!(
                        "{period} budget exceeded (${used:.4} spent, ceiling ${limit:.4})"
                    ),
                });
            }
            // Report the highest threshold the projected spend sits above.
            let crossed = warn_thresholds
                .iter()
                .filter(|t| used + estimate >= limit * **t)
                .cloned()
                .fold(None::<f64>, |acc, t| Some(acc.map_or(t, |a| a.max(t))));
            if let Some(threshold) = crossed {
                warnings.push(format!(
                    "{period} budget at {:.0}% of ${limit:.2} ceiling",
                    threshold * 100.0
                ));
            }
        }
        Ok(PreCheck::Ok { warnings })
    }

    /// Mid-turn check between tool iterations. `accrued` is the cost already
    /// incurred by this turn but not yet recorded. Returns the breach reason
    /// when continuing would exceed a ceiling.
    pub fn check_mid_turn(&self, session_id: &str, accrued: f64) -> PryxResult<Option<String>> {
        for (period, used, limit) in self.ceilings(session_id)? {
            if used + accrued >= limit {
                return Ok(Some(format!(
                    "{period} budget exhausted mid-turn (${:.4} of ${limit:.4})",
                    used + accrued
                )));
            }
        }
        Ok(None)
    }

    /// Append the cost record for a turn's provider usage, emit
    /// `cost.update`, and return the record. The unit prices stored are the
    /// snapshot used for the computation.
    pub fn record_usage(
        &self,
        session_id: &str,
        turn_id: &str,
        provider: &str,
        model: &str,
        usage: &TokenUsage,
    ) -> PryxResult<CostRecord> {
        let price = self.lookup_price(model);
        let cost = self.estimate_cost(model, usage.input_tokens, usage.output_tokens);
        let record = CostRecord {
            session_id: session_id.to_string(),
            turn_id: turn_id.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            input_price: price.input_per_million,
            output_price: price.output_per_million,
            cost,
            created_at: Utc::now(),
        };
        self.store.record_cost(&record)?;

        let warning = match self.pre_check(session_id, 0, model)? {
            PreCheck::Ok { warnings } => warnings.into_iter().next(),
            PreCheck::Abort { reason } => Some(reason),
        };
        self.bus.publish(
            session_id,
            EventPayload::CostUpdate {
                turn_id: turn_id.to_string(),
                cost,
                warning,
            },
        );
        info!(
            "recorded ${:.6} for turn {} (model={}, in={}, out={})",
            cost, turn_id, model, usage.input_tokens, usage.output_tokens
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ModelCost;
    use std::collections::HashMap;

    fn tracker_with(config: BudgetConfig) -> (tempfile::TempDir, Arc<Store>, CostTracker) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("pryx.db")).unwrap());
        let bus = Arc::new(EventBus::new());
        let tracker = CostTracker::new(store.clone(), bus, config);
        (dir, store, tracker)
    }

    #[test]
    fn no_ceilings_always_ok() {
        let (_dir, _store, tracker) = tracker_with(BudgetConfig::default());
        let check = tracker.pre_check("s1", 100_000, "claude-sonnet-4-5").unwrap();
        assert!(!check.is_abort());
    }

    #[test]
    fn known_model_pricing() {
        let (_dir, _store, tracker) = tracker_with(BudgetConfig::default());
        let price = tracker.lookup_price("claude-sonnet-4-5");
        assert!((price.input_per_million - 3.0).abs() < 1e-9);
        // 1M input + 1M output on sonnet = $3 + $15.
        let cost = tracker.estimate_cost("claude-sonnet-4-5", 1_000_000, 1_000_000);
        assert!((cost - 18.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_uses_default_pricing() {
        let (_dir, _store, tracker) = tracker_with(BudgetConfig::default());
        let price = tracker.lookup_price("totally-unknown-xyz");
        assert!((price.input_per_million - DEFAULT_INPUT_PER_MILLION).abs() < 1e-9);
    }

    #[test]
    fn config_override_beats_embedded_table() {
        let mut model_costs = HashMap::new();
        model_costs.insert(
            "claude-sonnet".to_string(),
            ModelCost {
                input_per_million: 1.0,
                output_per_million: 2.0,
            },
        );
        let (_dir, _store, tracker) = tracker_with(BudgetConfig {
            model_costs,
            ..BudgetConfig::default()
        });
        let price = tracker.lookup_price("claude-sonnet-4-5");
        assert!((price.input_per_million - 1.0).abs() < 1e-9);
    }

    #[test]
    fn daily_ceiling_aborts_after_spend() {
        let (_dir, _store, tracker) = tracker_with(BudgetConfig {
            per_day: Some(0.01),
            ..BudgetConfig::default()
        });
        // Spend past the ceiling: 10k in / 10k out on sonnet ≈ $0.18.
        tracker
            .record_usage(
                "s1",
                "t1",
                "anthropic",
                "claude-sonnet-4-5",
                &TokenUsage {
                    input_tokens: 10_000,
                    output_tokens: 10_000,
                },
            )
            .unwrap();
        let check = tracker.pre_check("s1", 1_000, "claude-sonnet-4-5").unwrap();
        match check {
            PreCheck::Abort { reason } => assert!(reason.contains("day")),
            PreCheck::Ok { .. } => panic!("expected abort"),
        }
    }

    #[test]
    fn session_ceiling_scoped_to_session() {
        let (_dir, _store, tracker) = tracker_with(BudgetConfig {
            per_session: Some(0.01),
            ..BudgetConfig::default()
        });
        tracker
            .record_usage(
                "s1",
                "t1",
                "anthropic",
                "claude-sonnet-4-5",
                &TokenUsage {
                    input_tokens: 10_000,
                    output_tokens: 10_000,
                },
            )
            .unwrap();
        assert!(tracker.pre_check("s1", 100, "claude-sonnet-4-5").unwrap().is_abort());
        // Another session is unaffected.
        assert!(!tracker.pre_check("s2", 100, "claude-sonnet-4-5").unwrap().is_abort());
    }

    #[test]
    fn warnings_emitted_below_ceiling() {
        let (_dir, _store, tracker) = tracker_with(BudgetConfig {
            per_day: Some(1.0),
            ..BudgetConfig::default()
        });
        // Spend ~$0.72 of the $1.00 ceiling.
        tracker
            .record_usage(
                "s1",
                "t1",
                "anthropic",
                "claude-sonnet-4-5",
                &TokenUsage {
                    input_tokens: 40_000,
                    output_tokens: 40_000,
                },
            )
            .unwrap();
        let check = tracker.pre_check("s1", 0, "claude-sonnet-4-5").unwrap();
        match check {
            PreCheck::Ok { warnings } => {
                assert!(warnings.iter().any(|w| w.contains("70%")), "{warnings:?}");
            }
            PreCheck::Abort { .. } => panic!("should not abort below ceiling"),
        }
    }

    #[test]
    fn mid_turn_breach_detected() {
        let (_dir, _store, tracker) = tracker_with(BudgetConfig {
            per_day: Some(0.01),
            ..BudgetConfig::default()
        });
        let breach = tracker.check_mid_turn("s1", 0.02).unwrap();
        assert!(breach.is_some());
        let ok = tracker.check_mid_turn("s1", 0.001).unwrap();
        assert!(ok.is_none());
    }

    #[test]
    fn usage_recorded_with_price_snapshot() {
        let (_dir, store, tracker) = tracker_with(BudgetConfig::default());
        let record = tracker
            .record_usage(
                "s1",
                "t1",
                "anthropic",
                "claude-sonnet-4-5",
                &TokenUsage {
                    input_tokens: 1000,
                    output_tokens: 500,
                },
            )
            .unwrap();
        assert!((record.input_price - 3.0).abs() < 1e-9);
        assert!((record.output_price - 15.0).abs() < 1e-9);
        assert!((store.cost_total().unwrap() - record.cost).abs() < 1e-12);
    }
}
