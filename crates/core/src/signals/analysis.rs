//! # Signal Analysis
//!
//! Aggregate views over the active signal population: which patterns
//! correlate with strong signals, and how each role is trending over time.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::coordinator::{SignalCoordinator, SignalPattern};

/// Correlation score above which a pattern is worth replicating
const REPLICATE_THRESHOLD: f64 = 0.7;

/// Frequency at which a pattern's score saturates
const FREQUENCY_SATURATION: f64 = 10.0;

/// One pattern's correlation across active signals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternCorrelation {
    pub pattern: SignalPattern,
    /// Number of active signals carrying this pattern
    pub frequency: usize,
    pub avg_strength: f64,
    /// `avg_strength * min(frequency / 10, 1)`
    pub score: f64,
    /// "replicate" above the 0.7 threshold, otherwise "review"
    pub recommendation: &'static str,
}

/// Trend classification for a role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Degrading,
    Stable,
}

/// Per-role temporal view of the signal population
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleTrend {
    pub role: String,
    pub frequency: usize,
    pub avg_strength: f64,
    /// Seconds between the oldest and newest signal for this role
    pub span_seconds: i64,
    pub trend: Trend,
}

impl SignalCoordinator {
    /// Group active signals by embedded pattern and score each group
    ///
    /// Results are ordered by score descending.
    pub fn correlate_patterns(&self) -> Result<Vec<PatternCorrelation>> {
        let signals = self.active_signals()?;

        let mut groups: HashMap<SignalPattern, Vec<f64>> = HashMap::new();
        for signal in signals {
            if let Some(pattern) = signal.pattern {
                groups.entry(pattern).or_default().push(signal.strength);
            }
        }

        let mut correlations: Vec<PatternCorrelation> = groups
            .into_iter()
            .map(|(pattern, strengths)| {
                let frequency = strengths.len();
                let avg_strength = strengths.iter().sum::<f64>() / frequency as f64;
                let score = avg_strength * (frequency as f64 / FREQUENCY_SATURATION).min(1.0);
                PatternCorrelation {
                    pattern,
                    frequency,
                    avg_strength,
                    score,
                    recommendation: if score > REPLICATE_THRESHOLD {
                        "replicate"
                    } else {
                        "review"
                    },
                }
            })
            .collect();

        correlations.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(correlations)
    }

    /// Per-role frequency, average strength, and time span
    ///
    /// Roles with average strength above 0.8 are improving, below 0.5
    /// degrading, otherwise stable.
    pub fn temporal_analysis(&self) -> Result<Vec<RoleTrend>> {
        let signals = self.active_signals()?;

        let mut groups: HashMap<String, Vec<(f64, DateTime<Utc>)>> = HashMap::new();
        for signal in signals {
            if let Some(role) = signal.pattern.as_ref().and_then(|p| p.role.clone()) {
                groups
                    .entry(role)
                    .or_default()
                    .push((signal.strength, signal.created_at));
            }
        }

        let mut trends: Vec<RoleTrend> = groups
            .into_iter()
            .map(|(role, entries)| {
                let frequency = entries.len();
                let avg_strength =
                    entries.iter().map(|(s, _)| s).sum::<f64>() / frequency as f64;
                let oldest = entries.iter().map(|(_, t)| *t).min().unwrap_or_else(Utc::now);
                let newest = entries.iter().map(|(_, t)| *t).max().unwrap_or_else(Utc::now);
                let trend = if avg_strength > 0.8 {
                    Trend::Improving
                } else if avg_strength < 0.5 {
                    Trend::Degrading
                } else {
                    Trend::Stable
                };
                RoleTrend {
                    role,
                    frequency,
                    avg_strength,
                    span_seconds: (newest - oldest).num_seconds(),
                    trend,
                }
            })
            .collect();

        trends.sort_by(|a, b| a.role.cmp(&b.role));
        Ok(trends)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::db::GraphDb;
    use crate::signals::coordinator::SignalKind;

    fn coordinator() -> SignalCoordinator {
        SignalCoordinator::new(&GraphDb::open_in_memory().unwrap())
    }

    fn pattern(role: &str, outcome: &str) -> SignalPattern {
        SignalPattern {
            role: Some(role.to_string()),
            outcome: Some(outcome.to_string()),
            ..SignalPattern::default()
        }
    }

    #[test]
    fn test_correlation_scoring() {
        let signals = coordinator();
        // 10 strong signals for one pattern: avg 0.9, saturation 1.0 -> 0.9
        for _ in 0..10 {
            signals
                .emit(
                    SignalKind::Guide,
                    "worked well",
                    Some(pattern("implementer", "success")),
                    0.9,
                )
                .unwrap();
        }
        // 2 weak signals for another: avg 0.4, frequency factor 0.2 -> 0.08
        for _ in 0..2 {
            signals
                .emit(
                    SignalKind::Warn,
                    "went poorly",
                    Some(pattern("prototyper", "failure")),
                    0.4,
                )
                .unwrap();
        }

        let correlations = signals.correlate_patterns().unwrap();
        assert_eq!(correlations.len(), 2);

        let top = &correlations[0];
        assert_eq!(top.frequency, 10);
        assert!((top.score - 0.9).abs() < 1e-9);
        assert_eq!(top.recommendation, "replicate");

        let bottom = &correlations[1];
        assert!((bottom.score - 0.08).abs() < 1e-9);
        assert_eq!(bottom.recommendation, "review");
    }

    #[test]
    fn test_signals_without_pattern_are_ignored() {
        let signals = coordinator();
        signals.emit(SignalKind::Guide, "free text", None, 0.9).unwrap();
        assert!(signals.correlate_patterns().unwrap().is_empty());
        assert!(signals.temporal_analysis().unwrap().is_empty());
    }

    #[test]
    fn test_temporal_trend_classification() {
        let signals = coordinator();
        for _ in 0..3 {
            signals
                .emit(
                    SignalKind::Guide,
                    "good run",
                    Some(pattern("implementer", "success")),
                    0.9,
                )
                .unwrap();
        }
        for _ in 0..3 {
            signals
                .emit(
                    SignalKind::Warn,
                    "bad run",
                    Some(pattern("prototyper", "failure")),
                    0.3,
                )
                .unwrap();
        }
        signals
            .emit(
                SignalKind::Guide,
                "middling",
                Some(pattern("analyst", "mixed")),
                0.6,
            )
            .unwrap();

        let trends = signals.temporal_analysis().unwrap();
        assert_eq!(trends.len(), 3);

        let by_role: HashMap<&str, &RoleTrend> =
            trends.iter().map(|t| (t.role.as_str(), t)).collect();
        assert_eq!(by_role["implementer"].trend, Trend::Improving);
        assert_eq!(by_role["prototyper"].trend, Trend::Degrading);
        assert_eq!(by_role["analyst"].trend, Trend::Stable);
        assert_eq!(by_role["implementer"].frequency, 3);
    }
}
