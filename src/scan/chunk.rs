//! Chunk engine: one bounded unit of scanning work.
//!
//! A chunk runs the full pipeline under a hard wall-clock deadline:
//!
//! 1. **List** message ids until the driver is exhausted, the list budget is
//!    hit, or time runs short.
//! 2. **Screen** metadata with bounded concurrency and the quick classifier.
//! 3. **Full fetch** the first `fullFetchCap` screened-in messages.
//! 4. **Build** per-message candidates.
//! 5. **Cluster** the screened-in metadata by sender cadence.
//! 6. **Aggregate**, gate, and dedupe; **enrich** amount-less survivors with
//!    a second body fetch if time allows.
//!
//! Workers abort at `deadline - 900ms` so partial results always flush.
//! Per-message failures are isolated: the worker records nothing and the
//! chunk keeps going. Only a failed *first* list call is fatal.

use crate::detect::aggregate::{aggregate_chunk, dedupe_best_per_merchant, strict_gate};
use crate::detect::candidate::{BuildOutcome, build_candidate, near_miss};
use crate::detect::classifier::{self, ScreenReason};
use crate::detect::cluster::{ScreenedMessage, build_clusters};
use crate::detect::merchant::{MerchantDirectory, SenderSurface, UserOverride, resolve};
use crate::detect::normalize::{build_haystack, email_domain};
use crate::mailbox::{Deadline, DriverError, MailboxDriver};
use crate::models::{Candidate, ChunkStats, NearMiss};
use crate::scan::options::ScanOptions;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Instant;

/// Reported in stats so stored chunk logs identify the pipeline revision.
pub const ENGINE_VERSION: &str = "2.1";

/// Listing pulls at most this many provider pages per chunk.
const MAX_LIST_PAGES_PER_CHUNK: u32 = 3;

/// Candidates without an amount re-fetched in the enrich stage, at most.
const ENRICH_CAP: usize = 25;

/// Near-miss samples kept per chunk.
const NEAR_MISS_CAP: usize = 25;

/// Result of one chunk run.
#[derive(Debug)]
pub struct ChunkOutcome {
    pub candidates: Vec<Candidate>,
    pub next_cursor: Option<String>,
    pub stats: ChunkStats,
}

/// One chunk execution over a driver. Borrowed state only; the engine holds
/// nothing between chunks.
pub struct ChunkEngine<'a> {
    driver: &'a dyn MailboxDriver,
    options: &'a ScanOptions,
    directory: &'a MerchantDirectory,
    overrides: &'a [UserOverride],
    query: String,
}

impl<'a> ChunkEngine<'a> {
    pub fn new(
        driver: &'a dyn MailboxDriver,
        options: &'a ScanOptions,
        directory: &'a MerchantDirectory,
        overrides: &'a [UserOverride],
        query: String,
    ) -> Self {
        Self {
            driver,
            options,
            directory,
            overrides,
            query,
        }
    }

    /// Run one chunk starting at `cursor`. Errors only when the very first
    /// list call fails; everything after that degrades to partial results.
    pub async fn run(
        &self,
        cursor: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ChunkOutcome, DriverError> {
        let started = Instant::now();
        let deadline = Deadline::after(self.options.chunk_budget());
        let mut stats = ChunkStats {
            engine_version: ENGINE_VERSION.to_string(),
            deadline_ms: self.options.chunk_ms,
            query: self.query.clone(),
            ..ChunkStats::default()
        };

        // Stage 1: list.
        let (ids, next_cursor) = self.list_ids(cursor, &deadline, &mut stats).await?;
        stats.listed = ids.len() as u32;

        // Stage 2: screen.
        let screened = self.screen(&ids, &deadline, &mut stats).await;
        stats.screened_in = screened.len() as u32;

        // Stage 3 + 4: full fetch and build.
        let (mut candidates, source_ids) = self
            .fetch_and_build(&screened, &deadline, now, &mut stats)
            .await;

        // Stage 5: clusters from metadata.
        let clusters = build_clusters(&screened, self.options.cluster_cap as usize);
        candidates.extend(clusters);
        stats.raw_matched = candidates.len() as u32;

        // Stage 6: aggregate, gate, dedupe.
        let aggregated = aggregate_chunk(candidates);
        let gated = strict_gate(aggregated, &mut stats.null_reasons);
        let mut final_candidates = dedupe_best_per_merchant(gated);

        // Stage 7: enrich amount-less candidates while time allows.
        self.enrich(&mut final_candidates, &source_ids, &deadline, now)
            .await;

        stats.matched = final_candidates.len() as u32;
        stats.took_ms = started.elapsed().as_millis() as u64;

        Ok(ChunkOutcome {
            candidates: final_candidates,
            next_cursor,
            stats,
        })
    }

    async fn list_ids(
        &self,
        cursor: Option<&str>,
        deadline: &Deadline,
        stats: &mut ChunkStats,
    ) -> Result<(Vec<String>, Option<String>), DriverError> {
        let list_budget = (self.options.page_size * MAX_LIST_PAGES_PER_CHUNK)
            .min(self.options.max_list_ids) as usize;

        let mut ids: Vec<String> = Vec::new();
        let mut cursor = cursor.map(str::to_string);
        let mut pages = 0u32;

        loop {
            if pages > 0 && (deadline.should_stop() || ids.len() >= list_budget) {
                break;
            }
            let page = match self.driver.list_page(cursor.as_deref(), deadline).await {
                Ok(page) => page,
                Err(err) if pages == 0 => return Err(err),
                Err(err) => {
                    log::warn!("list page {pages} failed, keeping partial listing: {err}");
                    *stats
                        .null_reasons
                        .entry("listError".to_string())
                        .or_default() += 1;
                    break;
                }
            };
            pages += 1;
            ids.extend(page.ids);
            cursor = page.next_cursor;
            if cursor.is_none() || pages >= MAX_LIST_PAGES_PER_CHUNK {
                break;
            }
        }

        ids.truncate(list_budget);
        Ok((ids, cursor))
    }

    async fn screen(
        &self,
        ids: &[String],
        deadline: &Deadline,
        stats: &mut ChunkStats,
    ) -> Vec<ScreenedMessage> {
        let concurrency = self.options.concurrency as usize;

        let mut results: Vec<(usize, Option<ScreenedMessage>, Option<&'static str>)> =
            futures::stream::iter(ids.iter().enumerate().map(|(index, id)| async move {
                if deadline.should_stop() {
                    return (index, None, None);
                }
                let meta = match self.driver.fetch_metadata(id, deadline).await {
                    Ok(meta) => meta,
                    Err(err) => {
                        log::debug!("metadata fetch {id} failed: {err}");
                        return (index, None, Some("fetchError"));
                    }
                };
                let from_domain = email_domain(&meta.from).unwrap_or_default();
                let verdict = classifier::quick_screen(&meta, &from_domain);
                if !verdict.ok {
                    let reason = match verdict.reason {
                        ScreenReason::Marketing => "screenMarketing",
                        _ => "screenHardNo",
                    };
                    return (index, None, Some(reason));
                }

                let haystack = build_haystack(&meta.subject, &meta.snippet, "");
                let surface = SenderSurface::from_meta(&meta, &[], &haystack);
                let resolved = resolve(&surface, self.directory, self.overrides);
                let flags = classifier::classify(&meta, "", &from_domain);
                (
                    index,
                    Some(ScreenedMessage {
                        meta,
                        resolved,
                        flags,
                    }),
                    None,
                )
            }))
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        // Restore listing order; "first N screened-in" must be stable.
        results.sort_by_key(|(index, _, _)| *index);

        let mut screened = Vec::new();
        for (_, message, drop_reason) in results {
            if message.is_some() || drop_reason.is_some() {
                stats.scanned += 1;
            }
            if let Some(reason) = drop_reason {
                *stats.null_reasons.entry(reason.to_string()).or_default() += 1;
            }
            if let Some(message) = message {
                screened.push(message);
            }
        }
        screened
    }

    async fn fetch_and_build(
        &self,
        screened: &[ScreenedMessage],
        deadline: &Deadline,
        now: DateTime<Utc>,
        stats: &mut ChunkStats,
    ) -> (Vec<Candidate>, HashMap<String, String>) {
        let concurrency = self.options.concurrency as usize;
        let to_fetch: Vec<&ScreenedMessage> = screened
            .iter()
            .take(self.options.full_fetch_cap as usize)
            .collect();

        let mut fetched: Vec<(usize, Option<crate::mailbox::FullMessage>)> =
            futures::stream::iter(to_fetch.iter().enumerate().map(|(index, message)| {
                let id = message.meta.id.clone();
                async move {
                    if deadline.should_stop() {
                        return (index, None);
                    }
                    match self.driver.fetch_full(&id, deadline).await {
                        Ok(full) => (index, Some(full)),
                        Err(err) => {
                            log::debug!("full fetch {id} failed: {err}");
                            (index, None)
                        }
                    }
                }
            }))
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;
        fetched.sort_by_key(|(index, _)| *index);

        let mut candidates: Vec<Candidate> = Vec::new();
        let mut source_ids: HashMap<String, String> = HashMap::new();
        let mut near_misses: Vec<NearMiss> = Vec::new();

        for (_, full) in fetched {
            let Some(full) = full else {
                *stats
                    .null_reasons
                    .entry("fetchError".to_string())
                    .or_default() += 1;
                continue;
            };
            stats.full_fetched += 1;

            if candidates.len() >= self.options.max_candidates as usize {
                break;
            }
            match build_candidate(&full, self.directory, self.overrides, now) {
                BuildOutcome::Built(candidate) => {
                    source_ids.insert(candidate.fingerprint.clone(), full.meta.id.clone());
                    candidates.push(*candidate);
                }
                BuildOutcome::Dropped(reason) => {
                    *stats
                        .null_reasons
                        .entry(reason.as_str().to_string())
                        .or_default() += 1;
                    if near_misses.len() < NEAR_MISS_CAP {
                        near_misses.push(near_miss(&full.meta, reason));
                    }
                }
            }
        }

        stats.near_misses = near_misses;
        (candidates, source_ids)
    }

    /// Second body fetch for up to 25 final candidates without an amount.
    /// Strictly time-boxed; an improved rebuild replaces the candidate.
    async fn enrich(
        &self,
        candidates: &mut [Candidate],
        source_ids: &HashMap<String, String>,
        deadline: &Deadline,
        now: DateTime<Utc>,
    ) {
        let mut enriched = 0usize;
        for candidate in candidates.iter_mut() {
            if enriched >= ENRICH_CAP || deadline.should_stop() {
                break;
            }
            if candidate.amount.is_some() {
                continue;
            }
            let Some(id) = source_ids.get(&candidate.fingerprint) else {
                continue;
            };
            let Ok(full) = self.driver.fetch_full(id, deadline).await else {
                continue;
            };
            enriched += 1;
            if let BuildOutcome::Built(rebuilt) =
                build_candidate(&full, self.directory, self.overrides, now)
            {
                if rebuilt.amount.is_some() {
                    let mut rebuilt = *rebuilt;
                    rebuilt
                        .reasons
                        .push("amount found on enrichment fetch".to_string());
                    *candidate = rebuilt;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::merchant::DirectoryEntry;
    use crate::mailbox::{FullMessage, ListPage, MessageBodies, MessageMeta};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MockDriver {
        pages: Vec<ListPage>,
        metas: HashMap<String, MessageMeta>,
        fulls: HashMap<String, FullMessage>,
        list_calls: AtomicU32,
    }

    impl MockDriver {
        fn new() -> Self {
            Self {
                pages: Vec::new(),
                metas: HashMap::new(),
                fulls: HashMap::new(),
                list_calls: AtomicU32::new(0),
            }
        }

        fn push_message(&mut self, meta: MessageMeta, text: &str) {
            let id = meta.id.clone();
            self.fulls.insert(
                id.clone(),
                FullMessage {
                    meta: meta.clone(),
                    bodies: MessageBodies {
                        text: text.to_string(),
                        html: String::new(),
                    },
                },
            );
            self.metas.insert(id, meta);
        }

        fn single_page(mut self) -> Self {
            let ids: Vec<String> = self.metas.keys().cloned().collect();
            let mut ids = ids;
            ids.sort();
            self.pages = vec![ListPage {
                ids,
                next_cursor: None,
            }];
            self
        }
    }

    #[async_trait]
    impl MailboxDriver for MockDriver {
        async fn list_page(
            &self,
            cursor: Option<&str>,
            _deadline: &Deadline,
        ) -> Result<ListPage, DriverError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            let index = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
            Ok(self.pages.get(index).cloned().unwrap_or_default())
        }

        async fn fetch_metadata(
            &self,
            id: &str,
            _deadline: &Deadline,
        ) -> Result<MessageMeta, DriverError> {
            self.metas
                .get(id)
                .cloned()
                .ok_or_else(|| DriverError::Protocol(format!("no meta {id}")))
        }

        async fn fetch_full(
            &self,
            id: &str,
            _deadline: &Deadline,
        ) -> Result<FullMessage, DriverError> {
            self.fulls
                .get(id)
                .cloned()
                .ok_or_else(|| DriverError::Protocol(format!("no body {id}")))
        }
    }

    fn meta(id: &str, from: &str, subject: &str, snippet: &str, date_ms: i64) -> MessageMeta {
        MessageMeta {
            id: id.to_string(),
            from: from.to_string(),
            subject: subject.to_string(),
            snippet: snippet.to_string(),
            date_ms: Some(date_ms),
            ..Default::default()
        }
    }

    fn directory() -> MerchantDirectory {
        MerchantDirectory {
            entries: vec![DirectoryEntry {
                canonical_name: "Netflix".to_string(),
                sender_emails: vec![],
                sender_domains: vec!["netflix.com".to_string()],
                keywords: vec!["netflix".to_string()],
            }],
        }
    }

    fn options() -> ScanOptions {
        ScanOptions::default().enforce_budgets()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 13, 9, 0, 0).unwrap()
    }

    async fn run_chunk(driver: &MockDriver, options: &ScanOptions) -> ChunkOutcome {
        let directory = directory();
        let engine = ChunkEngine::new(driver, options, &directory, &[], "test-query".to_string());
        engine.run(None, now()).await.expect("chunk runs")
    }

    #[tokio::test]
    async fn test_netflix_receipt_end_to_end() {
        let mut driver = MockDriver::new();
        driver.push_message(
            meta(
                "m1",
                "Netflix <info@account.netflix.com>",
                "Your Netflix billing",
                "You were charged $15.49",
                1_762_905_600_000,
            ),
            "You were charged $15.49 on Nov 12, 2025.\nYour plan renews on Dec 12, 2025.\nhttps://www.netflix.com/account",
        );
        let driver = driver.single_page();
        let options = options();

        let outcome = run_chunk(&driver, &options).await;
        assert_eq!(outcome.stats.listed, 1);
        assert_eq!(outcome.stats.screened_in, 1);
        assert_eq!(outcome.candidates.len(), 1);
        let candidate = &outcome.candidates[0];
        assert_eq!(candidate.merchant, "Netflix");
        assert_eq!(candidate.amount, Some(15.49));
        assert!(outcome.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_marketing_counts_null_reason() {
        let mut driver = MockDriver::new();
        let mut promo = meta(
            "m1",
            "promos@brand.com",
            "Limited time 20% off",
            "newsletter",
            1_762_905_600_000,
        );
        promo.list_id = Some("<promo.brand.com>".to_string());
        driver.push_message(promo, "Big sale! Join the newsletter for deals");
        let driver = driver.single_page();
        let options = options();

        let outcome = run_chunk(&driver, &options).await;
        assert!(outcome.candidates.is_empty());
        let marketing_drops = outcome
            .stats
            .null_reasons
            .get("screenMarketing")
            .or_else(|| outcome.stats.null_reasons.get("marketingHeavy"))
            .copied()
            .unwrap_or(0);
        assert!(marketing_drops >= 1, "stats: {:?}", outcome.stats.null_reasons);
    }

    #[tokio::test]
    async fn test_cluster_only_subscription() {
        let mut driver = MockDriver::new();
        let day = 86_400_000i64;
        let t0 = 1_750_000_000_000i64;
        for i in 0..6 {
            driver.push_message(
                meta(
                    &format!("m{i}"),
                    "billing@mailer.udemymail.com",
                    "Your receipt",
                    "",
                    t0 + i * 30 * day,
                ),
                "",
            );
        }
        let mut driver = driver.single_page();
        // Bodies never fetched: remove them to prove clustering is
        // metadata-only.
        driver.fulls.clear();
        let mut options = options();
        options.full_fetch_cap = 0;

        let outcome = run_chunk(&driver, &options).await;
        assert_eq!(outcome.candidates.len(), 1);
        let cluster = &outcome.candidates[0];
        assert_eq!(cluster.evidence_type, crate::models::EvidenceType::Cluster);
        assert_eq!(
            cluster.cadence_guess,
            Some(crate::models::Cadence::Monthly)
        );
        assert!(cluster.needs_confirm);
        assert!(cluster.confidence >= 55);
    }

    #[tokio::test]
    async fn test_list_failure_on_first_page_is_fatal() {
        struct FailingDriver;
        #[async_trait]
        impl MailboxDriver for FailingDriver {
            async fn list_page(
                &self,
                _cursor: Option<&str>,
                _deadline: &Deadline,
            ) -> Result<ListPage, DriverError> {
                Err(DriverError::Http {
                    status: 400,
                    body: "bad query".to_string(),
                })
            }
            async fn fetch_metadata(
                &self,
                _id: &str,
                _deadline: &Deadline,
            ) -> Result<MessageMeta, DriverError> {
                unreachable!()
            }
            async fn fetch_full(
                &self,
                _id: &str,
                _deadline: &Deadline,
            ) -> Result<FullMessage, DriverError> {
                unreachable!()
            }
        }

        let directory = directory();
        let options = options();
        let engine = ChunkEngine::new(
            &FailingDriver,
            &options,
            &directory,
            &[],
            "q".to_string(),
        );
        assert!(engine.run(None, now()).await.is_err());
    }

    #[tokio::test]
    async fn test_per_message_failures_are_isolated() {
        let mut driver = MockDriver::new();
        driver.push_message(
            meta(
                "m1",
                "Netflix <info@account.netflix.com>",
                "Your Netflix invoice",
                "You were charged $15.49",
                1_762_905_600_000,
            ),
            "You were charged $15.49. Receipt attached. https://netflix.com",
        );
        let mut driver = driver.single_page();
        // A second listed id with no backing message: its fetches fail.
        driver.pages[0].ids.push("ghost".to_string());
        let options = options();

        let outcome = run_chunk(&driver, &options).await;
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(
            outcome.stats.null_reasons.get("fetchError").copied(),
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_took_ms_within_deadline_bound() {
        let driver = MockDriver::new().single_page();
        let options = options();
        let outcome = run_chunk(&driver, &options).await;
        assert!(outcome.stats.took_ms <= options.chunk_ms + 1_500);
    }
}
