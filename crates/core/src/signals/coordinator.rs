//! # Signal Coordinator
//!
//! Decaying coordination signals ("pheromones") layered on the knowledge
//! graph. Signals bias future scheduling and worker context; they are
//! best-effort guidance, never a correctness dependency, and readers must
//! tolerate signals disappearing between read and use.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::graph::db::GraphDb;
use crate::graph::node::{self, NodeLabel};
use crate::graph::store;
use crate::graph::txn::TransactionRunner;

/// A signal is deleted once its strength falls to this floor or below
pub const MIN_STRENGTH: f64 = 0.1;

/// Maximum signals returned per bucket by `contextual`
const CONTEXTUAL_CAP: usize = 20;

/// Signal kind, with kind-appropriate decay defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// Positive guidance worth following
    Guide,
    /// Warning about a pattern that previously failed
    Warn,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Guide => "guide",
            Self::Warn => "warn",
        }
    }

    /// Default multiplicative decay rate per cycle
    pub fn default_decay_rate(&self) -> f64 {
        match self {
            Self::Guide => 0.05,
            Self::Warn => 0.15,
        }
    }

    /// Default time-to-live
    pub fn default_ttl(&self) -> Duration {
        match self {
            Self::Guide => Duration::days(30),
            Self::Warn => Duration::days(14),
        }
    }
}

/// Structured pattern a signal is attached to
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignalPattern {
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub complexity: Option<String>,
}

/// A decaying coordination signal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pheromone {
    pub id: String,
    pub kind: SignalKind,
    /// Always within [0, 1]
    pub strength: f64,
    pub decay_rate: f64,
    pub context: String,
    #[serde(default)]
    pub pattern: Option<SignalPattern>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Pheromone {
    /// Whether this signal's TTL has elapsed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Filters for `query`
#[derive(Debug, Clone, Default)]
pub struct SignalQuery {
    pub kind: Option<SignalKind>,
    pub role: Option<String>,
    pub min_strength: Option<f64>,
    pub limit: Option<usize>,
}

/// Guidance and warnings relevant to one worker spawn
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextualSignals {
    pub guidance: Vec<Pheromone>,
    pub warnings: Vec<Pheromone>,
}

/// Result of one decay cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecayReport {
    /// Signals whose strength was reduced and kept
    pub updated: usize,
    /// Signals removed because they expired or fell to the floor
    pub removed: usize,
}

/// Creates, queries, decays, and analyzes coordination signals
#[derive(Clone)]
pub struct SignalCoordinator {
    txn: TransactionRunner,
}

impl SignalCoordinator {
    pub fn new(db: &GraphDb) -> Self {
        Self {
            txn: TransactionRunner::new(db),
        }
    }

    /// Emit a new signal with kind-appropriate decay rate and TTL
    ///
    /// Strength outside [0, 1] is rejected.
    pub fn emit(
        &self,
        kind: SignalKind,
        context: &str,
        pattern: Option<SignalPattern>,
        strength: f64,
    ) -> Result<Pheromone> {
        if !(0.0..=1.0).contains(&strength) || !strength.is_finite() {
            anyhow::bail!("Signal strength must be within [0, 1], got {}", strength);
        }

        let now = Utc::now();
        let signal = Pheromone {
            id: node::generate_id("sig"),
            kind,
            strength,
            decay_rate: kind.default_decay_rate(),
            context: context.to_string(),
            pattern,
            created_at: now,
            expires_at: now + kind.default_ttl(),
        };

        let props = node::to_properties(&signal)?;
        self.txn.write(|conn| {
            store::insert_node(conn, &signal.id, NodeLabel::Pheromone, &props, now)?;
            Ok(())
        })?;

        tracing::debug!(
            signal_id = %signal.id,
            kind = kind.as_str(),
            strength,
            "Signal emitted"
        );
        Ok(signal)
    }

    /// All active (non-expired) signals, strongest first
    pub fn active_signals(&self) -> Result<Vec<Pheromone>> {
        let now = Utc::now();
        let mut signals = self.load_all()?;
        signals.retain(|s| !s.is_expired(now));
        signals.sort_by(|a, b| b.strength.partial_cmp(&a.strength).unwrap_or(std::cmp::Ordering::Equal));
        Ok(signals)
    }

    /// Query non-expired signals ordered by strength descending
    pub fn query(&self, query: &SignalQuery) -> Result<Vec<Pheromone>> {
        let mut signals = self.active_signals()?;

        if let Some(kind) = query.kind {
            signals.retain(|s| s.kind == kind);
        }
        if let Some(role) = &query.role {
            signals.retain(|s| {
                s.pattern
                    .as_ref()
                    .and_then(|p| p.role.as_deref())
                    .map(|r| r == role)
                    .unwrap_or(false)
            });
        }
        if let Some(min) = query.min_strength {
            signals.retain(|s| s.strength >= min);
        }
        if let Some(limit) = query.limit {
            signals.truncate(limit);
        }
        Ok(signals)
    }

    /// Guidance and warnings relevant to a worker about to be spawned
    ///
    /// A signal matches when its context shares a significant word with the
    /// query context, its pattern names the role, or its pattern names the
    /// complexity. Each bucket is strength-ordered and capped at 20.
    pub fn contextual(
        &self,
        role: &str,
        context: &str,
        complexity: Option<&str>,
    ) -> Result<ContextualSignals> {
        let signals = self.active_signals()?;
        let context_lower = context.to_lowercase();

        let mut result = ContextualSignals::default();
        for signal in signals {
            let signal_context = signal.context.to_lowercase();
            let context_match =
                !context_lower.is_empty() && contexts_overlap(&signal_context, &context_lower);
            let role_match = signal
                .pattern
                .as_ref()
                .and_then(|p| p.role.as_deref())
                .map(|r| r == role)
                .unwrap_or(false);
            let complexity_match = match (complexity, &signal.pattern) {
                (Some(c), Some(p)) => p.complexity.as_deref() == Some(c),
                _ => false,
            };

            if context_match || role_match || complexity_match {
                match signal.kind {
                    SignalKind::Guide => {
                        if result.guidance.len() < CONTEXTUAL_CAP {
                            result.guidance.push(signal);
                        }
                    }
                    SignalKind::Warn => {
                        if result.warnings.len() < CONTEXTUAL_CAP {
                            result.warnings.push(signal);
                        }
                    }
                }
            }
        }
        Ok(result)
    }

    /// One decay cycle over every stored signal
    ///
    /// Multiplies strength by `(1 - decay_rate)`, then deletes signals that
    /// expired or fell to the strength floor. Explicitly schedulable so the
    /// scheduler and tests both invoke it deterministically.
    pub fn decay_cycle(&self) -> Result<DecayReport> {
        let now = Utc::now();

        let report = self.txn.write(|conn| {
            let nodes = store::nodes_by_label(conn, NodeLabel::Pheromone)?;
            let mut updated = 0usize;
            let mut removed = 0usize;

            for n in &nodes {
                let signal: Pheromone = match node::from_properties(&n.properties) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(node_id = %n.id, error = %e, "Removing malformed signal");
                        store::delete_node(conn, &n.id)?;
                        removed += 1;
                        continue;
                    }
                };

                let decayed = (signal.strength * (1.0 - signal.decay_rate)).clamp(0.0, 1.0);

                if signal.is_expired(now) || decayed <= MIN_STRENGTH {
                    store::delete_node(conn, &n.id)?;
                    removed += 1;
                } else {
                    let mut next = signal;
                    next.strength = decayed;
                    store::update_node_properties(conn, &n.id, &node::to_properties(&next)?)?;
                    updated += 1;
                }
            }

            Ok(DecayReport { updated, removed })
        })?;

        tracing::debug!(
            updated = report.updated,
            removed = report.removed,
            "Decay cycle completed"
        );
        Ok(report)
    }

    /// Load every stored signal, skipping malformed rows
    pub(crate) fn load_all(&self) -> Result<Vec<Pheromone>> {
        self.txn.read(|conn| {
            let nodes = store::nodes_by_label(conn, NodeLabel::Pheromone)?;
            let mut signals = Vec::new();
            for n in &nodes {
                match node::from_properties::<Pheromone>(&n.properties) {
                    Ok(s) => signals.push(s),
                    Err(e) => {
                        tracing::warn!(node_id = %n.id, error = %e, "Skipping malformed signal");
                    }
                }
            }
            Ok(signals)
        })
    }

    /// Fetch one signal by id, if still present
    pub fn get(&self, id: &str) -> Result<Option<Pheromone>> {
        self.txn.read(|conn| match store::load_node(conn, id)? {
            Some(n) => Ok(Some(
                node::from_properties(&n.properties).context("Malformed signal")?,
            )),
            None => Ok(None),
        })
    }
}

/// Minimum word length considered significant for context overlap
const OVERLAP_WORD_LEN: usize = 4;

/// Whether two free-text contexts describe overlapping subject matter
///
/// True when one contains the other, or when any significant word appears
/// in both. Mission descriptions rarely contain a stored signal context
/// verbatim, so word overlap carries the common case. Both inputs are
/// expected lowercased.
fn contexts_overlap(a: &str, b: &str) -> bool {
    if a.contains(b) || b.contains(a) {
        return true;
    }
    let b_words: std::collections::HashSet<&str> = significant_words(b).collect();
    significant_words(a).any(|w| b_words.contains(w))
}

fn significant_words(s: &str) -> impl Iterator<Item = &str> {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= OVERLAP_WORD_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> SignalCoordinator {
        SignalCoordinator::new(&GraphDb::open_in_memory().unwrap())
    }

    #[test]
    fn test_emit_applies_kind_defaults() {
        let signals = coordinator();
        let guide = signals
            .emit(SignalKind::Guide, "prefer streaming parser", None, 0.9)
            .unwrap();
        assert_eq!(guide.decay_rate, 0.05);
        assert_eq!(guide.expires_at - guide.created_at, Duration::days(30));

        let warn = signals
            .emit(SignalKind::Warn, "flaky integration suite", None, 0.8)
            .unwrap();
        assert_eq!(warn.decay_rate, 0.15);
        assert_eq!(warn.expires_at - warn.created_at, Duration::days(14));
    }

    #[test]
    fn test_emit_rejects_out_of_range_strength() {
        let signals = coordinator();
        assert!(signals.emit(SignalKind::Guide, "x", None, 1.2).is_err());
        assert!(signals.emit(SignalKind::Guide, "x", None, -0.1).is_err());
        assert!(signals.emit(SignalKind::Guide, "x", None, f64::NAN).is_err());
        assert!(signals.emit(SignalKind::Guide, "x", None, 0.0).is_ok());
        assert!(signals.emit(SignalKind::Guide, "x", None, 1.0).is_ok());
    }

    #[test]
    fn test_query_orders_by_strength_and_filters() {
        let signals = coordinator();
        signals.emit(SignalKind::Guide, "weak", None, 0.3).unwrap();
        signals.emit(SignalKind::Guide, "strong", None, 0.9).unwrap();
        signals
            .emit(
                SignalKind::Warn,
                "role scoped",
                Some(SignalPattern {
                    role: Some("implementer".to_string()),
                    ..SignalPattern::default()
                }),
                0.6,
            )
            .unwrap();

        let all = signals.query(&SignalQuery::default()).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].context, "strong");

        let strong_only = signals
            .query(&SignalQuery {
                min_strength: Some(0.5),
                ..SignalQuery::default()
            })
            .unwrap();
        assert_eq!(strong_only.len(), 2);

        let by_role = signals
            .query(&SignalQuery {
                role: Some("implementer".to_string()),
                ..SignalQuery::default()
            })
            .unwrap();
        assert_eq!(by_role.len(), 1);
        assert_eq!(by_role[0].context, "role scoped");

        let limited = signals
            .query(&SignalQuery {
                limit: Some(1),
                ..SignalQuery::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_decay_is_multiplicative() {
        let signals = coordinator();
        signals
            .emit(SignalKind::Guide, "decaying", None, 0.9)
            .unwrap();

        let report = signals.decay_cycle().unwrap();
        assert_eq!(report, DecayReport { updated: 1, removed: 0 });

        let after = signals.query(&SignalQuery::default()).unwrap();
        assert!((after[0].strength - 0.855).abs() < 1e-9);
    }

    #[test]
    fn test_signal_removed_at_strength_floor() {
        let signals = coordinator();
        // 0.11 * (1 - 0.15) = 0.0935 <= 0.1: removed on the first cycle
        signals
            .emit(SignalKind::Warn, "nearly dead", None, 0.11)
            .unwrap();

        let report = signals.decay_cycle().unwrap();
        assert_eq!(report.removed, 1);
        assert!(signals.query(&SignalQuery::default()).unwrap().is_empty());
    }

    #[test]
    fn test_repeated_decay_eventually_removes_all() {
        let signals = coordinator();
        signals
            .emit(SignalKind::Guide, "long lived", None, 1.0)
            .unwrap();

        let mut cycles = 0;
        loop {
            let report = signals.decay_cycle().unwrap();
            cycles += 1;
            // strength never leaves [0, 1] while the signal lives
            for s in signals.query(&SignalQuery::default()).unwrap() {
                assert!((0.0..=1.0).contains(&s.strength));
                assert!(s.strength > MIN_STRENGTH);
            }
            if report.removed == 1 {
                break;
            }
            assert!(cycles < 100, "signal should decay away well before 100 cycles");
        }
        assert!(signals.query(&SignalQuery::default()).unwrap().is_empty());
    }

    #[test]
    fn test_contextual_buckets_and_matching() {
        let signals = coordinator();
        signals
            .emit(SignalKind::Guide, "auth module uses jwt", None, 0.8)
            .unwrap();
        signals
            .emit(
                SignalKind::Warn,
                "unrelated",
                Some(SignalPattern {
                    role: Some("implementer".to_string()),
                    ..SignalPattern::default()
                }),
                0.7,
            )
            .unwrap();
        signals
            .emit(SignalKind::Guide, "database pooling notes", None, 0.6)
            .unwrap();

        let ctx = signals
            .contextual("implementer", "implement the auth module", None)
            .unwrap();
        assert_eq!(ctx.guidance.len(), 1);
        assert_eq!(ctx.guidance[0].context, "auth module uses jwt");
        assert_eq!(ctx.warnings.len(), 1);
    }

    #[test]
    fn test_contextual_matches_on_shared_words() {
        let signals = coordinator();
        signals
            .emit(
                SignalKind::Warn,
                "timeout connecting to the database",
                None,
                0.8,
            )
            .unwrap();
        signals
            .emit(SignalKind::Guide, "ui polish checklist", None, 0.9)
            .unwrap();

        // neither context contains the other, but "database" appears in both
        let ctx = signals
            .contextual("implementer", "write the database migration", None)
            .unwrap();
        assert_eq!(ctx.warnings.len(), 1);
        assert_eq!(ctx.warnings[0].context, "timeout connecting to the database");
        assert!(ctx.guidance.is_empty());

        // short words like "the" never count as overlap on their own
        let ctx = signals.contextual("implementer", "the big rewrite", None).unwrap();
        assert!(ctx.warnings.is_empty());
    }

    #[test]
    fn test_contextual_cap() {
        let signals = coordinator();
        for i in 0..30 {
            signals
                .emit(
                    SignalKind::Guide,
                    &format!("shared context {}", i),
                    None,
                    0.5,
                )
                .unwrap();
        }
        let ctx = signals.contextual("analyst", "shared context", None).unwrap();
        assert_eq!(ctx.guidance.len(), 20);
    }
}
