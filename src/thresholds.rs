//! Flag threshold aggregation
//!
//! Every vote publishes the thresholds its authority used for this cycle.
//! They come in two kinds that must not be mixed:
//!
//! - **Constant** thresholds (`guard-wfu`, `guard-tk`, ...) are the same for
//!   every authority and are taken from configuration.
//! - **Variable** thresholds (`guard-bw-*`, `stable-mtbf`, `fast-speed`, ...)
//!   are derived by each authority from its own view of the network and are
//!   kept per authority. Ranges and medians are for display only; checks
//!   always run against each authority's own value.

use crate::config::ConstantThresholds;
use crate::protocol::{ThresholdValue, VoteDocument};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A threshold that applies identically across authorities
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConstantThreshold {
    pub value: f64,
}

/// A threshold each authority sets for itself
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableThreshold {
    /// Authority nickname -> value
    pub per_authority: BTreeMap<String, f64>,
}

impl VariableThreshold {
    pub fn get(&self, authority: &str) -> Option<f64> {
        self.per_authority.get(authority).copied()
    }

    /// `(min, max)` across authorities
    pub fn range(&self) -> Option<(f64, f64)> {
        let mut values = self.per_authority.values().copied();
        let first = values.next()?;
        Some(values.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v))))
    }

    pub fn median(&self) -> Option<f64> {
        let mut values: Vec<f64> = self.per_authority.values().copied().collect();
        if values.is_empty() {
            return None;
        }
        values.sort_by(f64::total_cmp);
        let mid = values.len() / 2;
        if values.len() % 2 == 0 {
            Some((values[mid - 1] + values[mid]) / 2.0)
        } else {
            Some(values[mid])
        }
    }
}

/// Borrowed view of either threshold kind; callers must handle both
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Threshold<'a> {
    Constant(&'a ConstantThreshold),
    Variable(&'a VariableThreshold),
}

/// Display row for one variable threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSummary {
    pub key: String,
    pub min: f64,
    pub max: f64,
    pub median: f64,
    pub authorities: usize,
}

/// All thresholds for one cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdTable {
    pub constant: BTreeMap<String, ConstantThreshold>,
    pub variable: BTreeMap<String, VariableThreshold>,
    /// Authority -> key -> value that did not parse as a number
    pub raw: BTreeMap<String, BTreeMap<String, String>>,
}

impl ThresholdTable {
    /// Build the table from this cycle's votes
    pub fn aggregate(votes: &[VoteDocument], constants: &ConstantThresholds) -> Self {
        let mut table = ThresholdTable::default();
        for (key, value) in constants.entries() {
            table.constant.insert(key.to_string(), ConstantThreshold { value });
        }

        for vote in votes {
            for (key, value) in &vote.flag_thresholds {
                match (table.constant.get(key), value) {
                    (Some(constant), ThresholdValue::Number(n)) => {
                        if (constant.value - n).abs() > f64::EPSILON * constant.value.abs().max(1.0) {
                            log::warn!(
                                "⚠️ {} publishes {}={} but the constant is {}; keeping the constant",
                                vote.authority,
                                key,
                                n,
                                constant.value
                            );
                        }
                    }
                    (None, ThresholdValue::Number(n)) => {
                        table
                            .variable
                            .entry(key.clone())
                            .or_default()
                            .per_authority
                            .insert(vote.authority.clone(), *n);
                    }
                    (_, ThresholdValue::Raw(raw)) => {
                        table
                            .raw
                            .entry(vote.authority.clone())
                            .or_default()
                            .insert(key.clone(), raw.clone());
                    }
                }
            }
        }

        log::debug!(
            "Aggregated {} variable thresholds from {} votes",
            table.variable.len(),
            votes.len()
        );
        table
    }

    /// Look up a threshold by its `flag-thresholds` key
    pub fn get(&self, key: &str) -> Option<Threshold<'_>> {
        if let Some(c) = self.constant.get(key) {
            return Some(Threshold::Constant(c));
        }
        self.variable.get(key).map(Threshold::Variable)
    }

    pub fn constant_value(&self, key: &str) -> Option<f64> {
        self.constant.get(key).map(|c| c.value)
    }

    pub fn variable(&self, key: &str) -> Option<&VariableThreshold> {
        self.variable.get(key)
    }

    /// Range and median for every variable threshold, sorted by key
    pub fn summary(&self) -> Vec<ThresholdSummary> {
        self.variable
            .iter()
            .filter_map(|(key, v)| {
                let (min, max) = v.range()?;
                Some(ThresholdSummary {
                    key: key.clone(),
                    min,
                    max,
                    median: v.median()?,
                    authorities: v.per_authority.len(),
                })
            })
            .collect()
    }
}
