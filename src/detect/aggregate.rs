//! Candidate aggregation and deduplication.
//!
//! Two passes over a chunk's raw candidates: merge rows sharing a
//! fingerprint (keeping the max-confidence representative and pooling
//! evidence dates), then keep the single best candidate per merchant. A
//! strict gate drops non-subscription billing noise (wallet top-ups, ad
//! spend) and downgrades paused / payment-failed candidates to status cards.

use crate::detect::extract::infer_cadence_from_dates;
use crate::models::{Candidate, CandidateEventType, ConfidenceLabel, EvidenceSample};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Reason string attached when aggregation infers a cadence. Also the
/// idempotency guard: the +10 bonus is applied at most once per candidate.
const INFERRED_CADENCE_REASON: &str = "recurring cadence inferred from message dates";

/// Hard negatives that disqualify a candidate outright.
const GATE_PHRASES: &[&str] = &[
    "funds added",
    "ad spend",
    "campaign",
    "top up",
    "top-up",
    "wallet reload",
];

/// Candidate family for fingerprinting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintKind {
    Email,
    Cluster,
}

impl FingerprintKind {
    fn as_str(self) -> &'static str {
        match self {
            FingerprintKind::Email => "email",
            FingerprintKind::Cluster => "cluster",
        }
    }
}

/// Stable dedupe hash over the identifying candidate fields. Amounts are
/// rounded to cents so float noise cannot split a merchant.
pub fn fingerprint(
    kind: FingerprintKind,
    merchant: &str,
    sender_domain: &str,
    amount: Option<f64>,
    currency: Option<&str>,
    cadence: Option<crate::models::Cadence>,
) -> String {
    let cents = amount
        .map(|a| ((a * 100.0).round() as i64).to_string())
        .unwrap_or_else(|| "null".to_string());
    let currency = currency.map(str::to_uppercase).unwrap_or_else(|| "null".to_string());

    let mut hasher = Sha256::new();
    hasher.update(b"v=2|");
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(merchant.to_lowercase().as_bytes());
    hasher.update(b"|");
    hasher.update(sender_domain.to_lowercase().as_bytes());
    hasher.update(b"|");
    hasher.update(cents.as_bytes());
    hasher.update(b"|");
    hasher.update(currency.as_bytes());
    if kind == FingerprintKind::Cluster {
        hasher.update(b"|");
        hasher.update(cadence.map(|c| c.as_str()).unwrap_or("null").as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn sample_of(candidate: &Candidate) -> EvidenceSample {
    EvidenceSample {
        from: candidate.evidence.from.clone(),
        subject: candidate.evidence.subject.clone(),
        date_ms: candidate.evidence.date_ms,
    }
}

fn merge_samples(existing: &mut Vec<EvidenceSample>, incoming: Vec<EvidenceSample>) {
    for sample in incoming {
        let duplicate = existing
            .iter()
            .any(|s| s.date_ms == sample.date_ms && s.subject == sample.subject);
        if !duplicate {
            existing.push(sample);
        }
    }
    existing.sort_by_key(|s| std::cmp::Reverse(s.date_ms));
    existing.truncate(3);
}

/// Merge raw candidates sharing a fingerprint. Idempotent:
/// `aggregate_chunk(aggregate_chunk(x)) == aggregate_chunk(x)`.
pub fn aggregate_chunk(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut groups: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();
    for candidate in candidates {
        groups
            .entry(candidate.fingerprint.clone())
            .or_default()
            .push(candidate);
    }

    let mut out = Vec::with_capacity(groups.len());
    for (_, mut members) in groups {
        // Max confidence wins; newest evidence breaks ties.
        members.sort_by(|a, b| {
            b.confidence
                .cmp(&a.confidence)
                .then(b.evidence.date_ms.cmp(&a.evidence.date_ms))
        });
        let mut rep = members[0].clone();

        let mut dates: Vec<i64> = Vec::new();
        let mut samples: Vec<EvidenceSample> = Vec::new();
        for member in &members {
            dates.extend(member.evidence_dates.iter().copied());
            if member.evidence.date_ms > 0 && !dates.contains(&member.evidence.date_ms) {
                dates.push(member.evidence.date_ms);
            }
            samples.push(sample_of(member));
            merge_samples(&mut samples, member.evidence_samples.clone());
        }
        dates.sort_unstable();
        dates.dedup();
        rep.evidence_dates = dates;
        merge_samples(&mut rep.evidence_samples, samples);

        if rep.evidence_dates.len() >= 2 {
            if let Some(inferred) = infer_cadence_from_dates(&rep.evidence_dates) {
                if rep.cadence_guess.is_none() {
                    rep.cadence_guess = Some(inferred);
                }
                if !rep.reasons.iter().any(|r| r == INFERRED_CADENCE_REASON) {
                    rep.confidence = (rep.confidence + 10).min(100);
                    rep.reasons.push(INFERRED_CADENCE_REASON.to_string());
                }
            }
        }
        rep.confidence_label = ConfidenceLabel::from_confidence(rep.confidence);
        out.push(rep);
    }
    out
}

fn rank(candidate: &Candidate) -> i64 {
    let has_amount = i64::from(candidate.amount.is_some());
    let has_date = i64::from(candidate.next_date_guess.is_some());
    // Body-backed evidence outranks metadata-only clusters at equal score.
    let full_body_boost = i64::from(candidate.evidence_type != crate::models::EvidenceType::Cluster);
    candidate.event_type.priority() * 10_000
        + has_amount * 2_000
        + i64::from(candidate.confidence) * 100
        + has_date * 10
        + full_body_boost
}

/// Keep the best candidate per merchant, pooling the three most recent
/// evidence samples from the losers into the winner.
pub fn dedupe_best_per_merchant(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut groups: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();
    for candidate in candidates {
        groups
            .entry(candidate.merchant.to_lowercase())
            .or_default()
            .push(candidate);
    }

    let mut out = Vec::with_capacity(groups.len());
    for (_, mut members) in groups {
        members.sort_by(|a, b| {
            rank(b)
                .cmp(&rank(a))
                .then(b.evidence.date_ms.cmp(&a.evidence.date_ms))
        });
        let mut best = members[0].clone();
        let mut samples = best.evidence_samples.clone();
        for member in &members {
            merge_samples(&mut samples, vec![sample_of(member)]);
        }
        best.evidence_samples = samples;
        out.push(best);
    }
    out
}

/// Drop gated candidates (top-ups, ad spend, hard-negative phrases) and tag
/// paused / payment-failed candidates as status-only cards.
pub fn strict_gate(
    candidates: Vec<Candidate>,
    null_reasons: &mut BTreeMap<String, u32>,
) -> Vec<Candidate> {
    let mut out = Vec::with_capacity(candidates.len());
    for mut candidate in candidates {
        if matches!(
            candidate.event_type,
            CandidateEventType::TopUp | CandidateEventType::AdSpend | CandidateEventType::Promo
        ) {
            *null_reasons.entry("strictGate".to_string()).or_default() += 1;
            continue;
        }
        let text = format!(
            "{} {}",
            candidate.evidence.subject, candidate.evidence.snippet
        )
        .to_lowercase();
        if GATE_PHRASES.iter().any(|p| text.contains(p)) {
            *null_reasons.entry("strictGate".to_string()).or_default() += 1;
            continue;
        }
        if matches!(
            candidate.event_type,
            CandidateEventType::Paused | CandidateEventType::PaymentFailed
        ) {
            candidate.card_type = Some("status".to_string());
            candidate.exclude_from_spend = true;
        }
        out.push(candidate);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Cadence, Evidence, EvidenceType};

    fn candidate(merchant: &str, confidence: i32, date_ms: i64) -> Candidate {
        let fingerprint = fingerprint(
            FingerprintKind::Email,
            merchant,
            "example.com",
            Some(9.99),
            Some("USD"),
            None,
        );
        Candidate {
            fingerprint,
            merchant: merchant.to_string(),
            plan: None,
            amount: Some(9.99),
            currency: Some("USD".to_string()),
            cadence_guess: None,
            next_date_guess: None,
            confidence,
            confidence_label: ConfidenceLabel::from_confidence(confidence),
            evidence_type: EvidenceType::Transactional,
            reasons: vec![],
            evidence: Evidence {
                from: format!("billing@{}.com", merchant.to_lowercase()),
                subject: format!("{merchant} receipt"),
                snippet: String::new(),
                sender_email: format!("billing@{}.com", merchant.to_lowercase()),
                sender_domain: "example.com".to_string(),
                date_ms,
            },
            evidence_samples: vec![],
            needs_confirm: false,
            event_type: CandidateEventType::Receipt,
            card_type: None,
            exclude_from_spend: false,
            evidence_dates: vec![date_ms],
        }
    }

    #[test]
    fn test_fingerprint_stable_and_case_insensitive() {
        let a = fingerprint(
            FingerprintKind::Email,
            "Netflix",
            "Netflix.com",
            Some(15.49),
            Some("usd"),
            None,
        );
        let b = fingerprint(
            FingerprintKind::Email,
            "netflix",
            "netflix.com",
            Some(15.49),
            Some("USD"),
            None,
        );
        assert_eq!(a, b);

        let other = fingerprint(
            FingerprintKind::Email,
            "netflix",
            "netflix.com",
            Some(16.49),
            Some("USD"),
            None,
        );
        assert_ne!(a, other);
    }

    #[test]
    fn test_aggregate_keeps_max_confidence_and_pools_dates() {
        let day = 86_400_000i64;
        let t0 = 1_700_000_000_000i64;
        let mut low = candidate("Netflix", 50, t0);
        low.evidence_dates = vec![t0];
        let mut high = candidate("Netflix", 70, t0 + 30 * day);
        high.evidence_dates = vec![t0 + 30 * day, t0 + 60 * day];

        let merged = aggregate_chunk(vec![low, high]);
        assert_eq!(merged.len(), 1);
        let rep = &merged[0];
        // Monthly gaps inferred from pooled dates adds the +10 note.
        assert_eq!(rep.confidence, 80);
        assert_eq!(rep.cadence_guess, Some(Cadence::Monthly));
        assert_eq!(rep.evidence_dates.len(), 3);
    }

    #[test]
    fn test_aggregate_is_idempotent() {
        let day = 86_400_000i64;
        let t0 = 1_700_000_000_000i64;
        let mut a = candidate("Hulu", 60, t0);
        a.evidence_dates = vec![t0];
        let mut b = candidate("Hulu", 62, t0 + 30 * day);
        b.evidence_dates = vec![t0 + 30 * day];

        let once = aggregate_chunk(vec![a, b]);
        let twice = aggregate_chunk(once.clone());
        assert_eq!(once.len(), twice.len());
        assert_eq!(once[0].confidence, twice[0].confidence);
        assert_eq!(once[0].fingerprint, twice[0].fingerprint);
        assert_eq!(once[0].reasons, twice[0].reasons);
    }

    #[test]
    fn test_best_per_merchant_prefers_receipt_over_trial() {
        let t0 = 1_700_000_000_000i64;
        let receipt = candidate("Spotify", 60, t0);
        let mut trial = candidate("Spotify", 90, t0 + 1);
        trial.event_type = CandidateEventType::Trial;
        trial.fingerprint = "different".to_string();

        let best = dedupe_best_per_merchant(vec![trial, receipt]);
        assert_eq!(best.len(), 1);
        assert_eq!(best[0].event_type, CandidateEventType::Receipt);
        // Losers contribute evidence samples.
        assert!(best[0].evidence_samples.len() >= 2);
    }

    #[test]
    fn test_strict_gate_drops_and_tags() {
        let t0 = 1_700_000_000_000i64;
        let mut topup = candidate("Wallet", 80, t0);
        topup.event_type = CandidateEventType::TopUp;
        let mut adspend = candidate("Ads", 80, t0);
        adspend.evidence.subject = "Your ad spend summary".to_string();
        let mut failed = candidate("Hulu", 70, t0);
        failed.event_type = CandidateEventType::PaymentFailed;
        let keep = candidate("Netflix", 70, t0);

        let mut null_reasons = BTreeMap::new();
        let gated = strict_gate(vec![topup, adspend, failed, keep], &mut null_reasons);

        assert_eq!(gated.len(), 2);
        assert_eq!(null_reasons.get("strictGate"), Some(&2));
        let failed = gated.iter().find(|c| c.merchant == "Hulu").unwrap();
        assert_eq!(failed.card_type.as_deref(), Some("status"));
        assert!(failed.exclude_from_spend);
    }
}
