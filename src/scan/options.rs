//! Scan options: parsing defaults, global clamps, and per-mode SLO budgets.
//!
//! Options arrive from the HTTP surface, are clamped once at session
//! creation, and clamped again before every chunk so a stored session can
//! never smuggle an out-of-range budget past a deploy that tightened the
//! limits.

use rocket_okapi::okapi::schemars::{self, JsonSchema};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// SLO mode selecting the budget envelope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    #[default]
    Quick,
    Deep,
}

/// Provider query strategy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    #[default]
    Transactions,
    Broad,
}

const fn d_days_back() -> i64 {
    90
}
const fn d_page_size() -> u32 {
    100
}
const fn d_chunk_ms() -> u64 {
    9_000
}
const fn d_full_fetch_cap() -> u32 {
    25
}
const fn d_concurrency() -> u32 {
    6
}
const fn d_max_pages() -> u32 {
    8
}
const fn d_max_candidates() -> u32 {
    80
}
const fn d_max_list_ids() -> u32 {
    1_200
}
const fn d_cluster_cap() -> u32 {
    50
}
const fn d_list_ms() -> u64 {
    9_000
}
const fn d_meta_ms() -> u64 {
    8_000
}
const fn d_full_ms() -> u64 {
    12_000
}
const fn d_attach_ms() -> u64 {
    12_000
}

/// Budget configuration for one session. All fields have safe defaults.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ScanOptions {
    pub mode: ScanMode,
    pub days_back: i64,
    pub page_size: u32,
    pub chunk_ms: u64,
    pub full_fetch_cap: u32,
    pub concurrency: u32,
    pub max_pages: u32,
    pub max_candidates: u32,
    pub max_list_ids: u32,
    pub cluster_cap: u32,
    pub query_mode: QueryMode,
    pub include_promotions: bool,
    pub list_ms: u64,
    pub meta_ms: u64,
    pub full_ms: u64,
    pub attach_ms: u64,
    pub cursor: Option<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            mode: ScanMode::Quick,
            days_back: d_days_back(),
            page_size: d_page_size(),
            chunk_ms: d_chunk_ms(),
            full_fetch_cap: d_full_fetch_cap(),
            concurrency: d_concurrency(),
            max_pages: d_max_pages(),
            max_candidates: d_max_candidates(),
            max_list_ids: d_max_list_ids(),
            cluster_cap: d_cluster_cap(),
            query_mode: QueryMode::Transactions,
            include_promotions: false,
            list_ms: d_list_ms(),
            meta_ms: d_meta_ms(),
            full_ms: d_full_ms(),
            attach_ms: d_attach_ms(),
            cursor: None,
        }
    }
}

impl ScanOptions {
    /// Clamp every field to its schema range.
    pub fn normalized(mut self) -> Self {
        self.days_back = self.days_back.clamp(1, 3_650);
        self.page_size = self.page_size.clamp(50, 500);
        self.chunk_ms = self.chunk_ms.clamp(8_000, 45_000);
        self.full_fetch_cap = self.full_fetch_cap.min(120);
        self.concurrency = self.concurrency.clamp(2, 10);
        self.max_pages = self.max_pages.clamp(1, 400);
        self.max_candidates = self.max_candidates.clamp(10, 400);
        self.max_list_ids = self.max_list_ids.clamp(300, 25_000);
        self.cluster_cap = self.cluster_cap.clamp(10, 200);
        self.list_ms = self.list_ms.clamp(3_000, 15_000);
        self.meta_ms = self.meta_ms.clamp(3_000, 15_000);
        self.full_ms = self.full_ms.clamp(3_000, 20_000);
        self.attach_ms = self.attach_ms.clamp(3_000, 20_000);
        self
    }

    /// Apply the per-mode SLO envelope on top of the schema clamps. Applied
    /// at session creation and again before each chunk runs.
    pub fn enforce_budgets(mut self) -> Self {
        self = self.normalized();
        match self.mode {
            ScanMode::Quick => {
                self.days_back = self.days_back.min(120);
                self.max_pages = self.max_pages.min(8);
                self.max_list_ids = self.max_list_ids.min(1_200);
                self.full_fetch_cap = self.full_fetch_cap.min(20);
                self.max_candidates = self.max_candidates.min(80);
                self.chunk_ms = self.chunk_ms.min(12_000);
                self.query_mode = QueryMode::Transactions;
                self.include_promotions = false;
            }
            ScanMode::Deep => {
                // Deep mode keeps the schema maxima.
            }
        }
        self
    }

    pub fn chunk_budget(&self) -> Duration {
        Duration::from_millis(self.chunk_ms)
    }

    pub fn mailbox_timeouts(&self) -> crate::mailbox::MailboxTimeouts {
        crate::mailbox::MailboxTimeouts {
            list: self.list_timeout(),
            meta: self.meta_timeout(),
            full: self.full_timeout(),
            attach: self.attach_timeout(),
        }
    }

    pub fn list_timeout(&self) -> Duration {
        Duration::from_millis(self.list_ms)
    }

    pub fn meta_timeout(&self) -> Duration {
        Duration::from_millis(self.meta_ms)
    }

    pub fn full_timeout(&self) -> Duration {
        Duration::from_millis(self.full_ms)
    }

    pub fn attach_timeout(&self) -> Duration {
        Duration::from_millis(self.attach_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_in_range() {
        let options = ScanOptions::default();
        assert_eq!(options, options.clone().normalized());
    }

    #[test]
    fn test_normalized_clamps_extremes() {
        let options = ScanOptions {
            days_back: 100_000,
            page_size: 1,
            chunk_ms: 1,
            concurrency: 99,
            max_list_ids: 5,
            ..ScanOptions::default()
        }
        .normalized();

        assert_eq!(options.days_back, 3_650);
        assert_eq!(options.page_size, 50);
        assert_eq!(options.chunk_ms, 8_000);
        assert_eq!(options.concurrency, 10);
        assert_eq!(options.max_list_ids, 300);
    }

    #[test]
    fn test_quick_budget_envelope() {
        let options = ScanOptions {
            mode: ScanMode::Quick,
            days_back: 3_650,
            max_pages: 400,
            max_list_ids: 25_000,
            full_fetch_cap: 120,
            max_candidates: 400,
            chunk_ms: 45_000,
            query_mode: QueryMode::Broad,
            include_promotions: true,
            ..ScanOptions::default()
        }
        .enforce_budgets();

        assert_eq!(options.days_back, 120);
        assert_eq!(options.max_pages, 8);
        assert_eq!(options.max_list_ids, 1_200);
        assert_eq!(options.full_fetch_cap, 20);
        assert_eq!(options.max_candidates, 80);
        assert_eq!(options.chunk_ms, 12_000);
        assert_eq!(options.query_mode, QueryMode::Transactions);
        assert!(!options.include_promotions);
    }

    #[test]
    fn test_deep_budget_keeps_schema_maxima() {
        let options = ScanOptions {
            mode: ScanMode::Deep,
            days_back: 3_650,
            max_pages: 400,
            max_list_ids: 25_000,
            ..ScanOptions::default()
        }
        .enforce_budgets();

        assert_eq!(options.days_back, 3_650);
        assert_eq!(options.max_pages, 400);
        assert_eq!(options.max_list_ids, 25_000);
    }
}
