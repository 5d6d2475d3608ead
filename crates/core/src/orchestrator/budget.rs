//! # Budget Tracking
//!
//! Token and cost accounting for a run. Workers report usage when they
//! exit; the tracker aggregates it and gates new spawns once the configured
//! ceiling comes into view.

use std::sync::{Arc, Mutex as StdMutex};

use crate::models::BudgetConfig;

/// Utilization fraction above which new spawns are refused
const SOFT_LIMIT: f64 = 0.9;

/// Verdict for a prospective spawn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Within budget
    Admit,
    /// Past the soft limit; no new work is admitted
    SoftLimit,
    /// Budget exhausted; the run must stop
    Exceeded,
}

#[derive(Debug, Default, Clone, Copy)]
struct Usage {
    tokens: u64,
    cost_usd: f64,
}

/// Thread-safe usage accumulator gated by a [`BudgetConfig`]
#[derive(Clone)]
pub struct BudgetTracker {
    config: BudgetConfig,
    usage: Arc<StdMutex<Usage>>,
}

impl BudgetTracker {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            usage: Arc::new(StdMutex::new(Usage::default())),
        }
    }

    /// Record usage reported by a finished worker
    pub fn record_usage(&self, tokens: Option<u64>, cost_usd: Option<f64>) {
        if let Ok(mut usage) = self.usage.lock() {
            usage.tokens += tokens.unwrap_or(0);
            usage.cost_usd += cost_usd.unwrap_or(0.0);
        }
    }

    pub fn tokens_used(&self) -> u64 {
        self.usage.lock().map(|u| u.tokens).unwrap_or(0)
    }

    pub fn cost_used(&self) -> f64 {
        self.usage.lock().map(|u| u.cost_usd).unwrap_or(0.0)
    }

    /// Fraction of the tightest configured limit consumed, 0.0 when
    /// unlimited
    pub fn utilization(&self) -> f64 {
        let usage = match self.usage.lock() {
            Ok(u) => *u,
            Err(_) => return 0.0,
        };
        let token_util = self
            .config
            .max_tokens
            .map(|max| {
                if max == 0 {
                    1.0
                } else {
                    usage.tokens as f64 / max as f64
                }
            })
            .unwrap_or(0.0);
        let cost_util = self
            .config
            .max_cost_usd
            .map(|max| {
                if max <= 0.0 {
                    1.0
                } else {
                    usage.cost_usd / max
                }
            })
            .unwrap_or(0.0);
        token_util.max(cost_util)
    }

    /// Whether a new worker may be spawned
    pub fn admission(&self) -> Admission {
        let utilization = self.utilization();
        if utilization >= 1.0 {
            Admission::Exceeded
        } else if utilization >= SOFT_LIMIT {
            Admission::SoftLimit
        } else {
            Admission::Admit
        }
    }
}
