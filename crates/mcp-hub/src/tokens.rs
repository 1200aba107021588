//! Per-server token accounting
//!
//! Counts tokens with tiktoken's cl100k encoding and falls back to a
//! chars-per-token estimate when the encoder cannot be loaded.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tiktoken_rs::{cl100k_base, CoreBPE};

/// Fallback estimate when tokenizer unavailable
const FALLBACK_CHARS_PER_TOKEN: usize = 4;

/// Default fraction of the limit at which a warning is emitted
pub const DEFAULT_WARNING_RATIO: f64 = 0.8;

static CL100K_TOKENIZER: Lazy<Mutex<Option<CoreBPE>>> =
    Lazy::new(|| Mutex::new(cl100k_base().ok()));

/// Count tokens in the given text
pub fn count_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    let guard = CL100K_TOKENIZER.lock();
    let count = match guard.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => text.chars().count().div_ceil(FALLBACK_CHARS_PER_TOKEN),
    };
    count as u64
}

/// What the manager does once a server has exceeded its limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenLimitPolicy {
    /// Refuse further calls until the budget is reset
    #[default]
    Reject,
    /// Keep serving calls, only emit the notification
    WarnOnly,
}

/// Snapshot of a server's usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub used: u64,
    pub limit: Option<u64>,
}

/// Thresholds crossed by a single [`TokenBudget::record`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BudgetUpdate {
    pub warning_crossed: bool,
    pub limit_crossed: bool,
}

/// Token counters for one connection
#[derive(Debug, Clone)]
pub struct TokenBudget {
    used: u64,
    limit: Option<u64>,
    warning_ratio: f64,
    warned: bool,
    exceeded: bool,
}

impl TokenBudget {
    pub fn new(limit: Option<u64>, warning_ratio: f64) -> Self {
        Self {
            used: 0,
            limit,
            warning_ratio: warning_ratio.clamp(0.0, 1.0),
            warned: false,
            exceeded: false,
        }
    }

    /// Add consumed tokens and report thresholds crossed for the first time
    pub fn record(&mut self, tokens: u64) -> BudgetUpdate {
        self.used = self.used.saturating_add(tokens);

        let Some(limit) = self.limit else {
            return BudgetUpdate::default();
        };

        let mut update = BudgetUpdate::default();
        let threshold = (limit as f64 * self.warning_ratio).ceil() as u64;

        if !self.warned && self.used >= threshold {
            self.warned = true;
            update.warning_crossed = true;
        }
        if !self.exceeded && self.used > limit {
            self.exceeded = true;
            update.limit_crossed = true;
        }
        update
    }

    /// Whether the hard limit has been crossed
    pub fn is_exhausted(&self) -> bool {
        self.exceeded
    }

    pub fn reset(&mut self) {
        self.used = 0;
        self.warned = false;
        self.exceeded = false;
    }

    pub fn usage(&self) -> TokenUsage {
        TokenUsage {
            used: self.used,
            limit: self.limit,
        }
    }
}
