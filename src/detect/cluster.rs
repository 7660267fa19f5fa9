//! Cadence clustering over screened metadata.
//!
//! When bodies are never fetched (budget exhausted, or the sender only made
//! it through screening), recurring senders can still betray a subscription
//! through their timing. Messages are grouped per resolved sender domain and
//! a cluster with at least three dated messages and a stable cadence becomes
//! a `cluster` candidate that the user must confirm.

use crate::detect::aggregate::{FingerprintKind, fingerprint};
use crate::detect::classifier::MessageFlags;
use crate::detect::extract::{BILLING_KEYWORDS, infer_cadence_from_dates};
use crate::detect::merchant::MerchantMatch;
use crate::detect::normalize::{
    email_address, is_infra_domain, registrable_domain, strip_mail_prefixes,
};
use crate::mailbox::MessageMeta;
use crate::models::{
    Candidate, CandidateEventType, ConfidenceLabel, Evidence, EvidenceSample, EvidenceType,
};
use std::collections::BTreeMap;

/// Minimum dated messages for a cluster to exist.
const MIN_CLUSTER_SIZE: usize = 3;

/// Clusters scoring below this are discarded.
const MIN_CLUSTER_SCORE: i32 = 55;

/// One message that survived the quick screen, with its metadata-only
/// resolver and classifier results.
#[derive(Debug, Clone)]
pub struct ScreenedMessage {
    pub meta: MessageMeta,
    pub resolved: MerchantMatch,
    pub flags: MessageFlags,
}

fn group_key(message: &ScreenedMessage) -> String {
    let best = registrable_domain(&strip_mail_prefixes(&message.resolved.from_domain));
    if is_infra_domain(&best) {
        // ESP senders are split per concrete sender domain so two merchants
        // mailing through the same infrastructure never merge.
        format!("infra:{best}:{}", message.resolved.from_domain)
    } else {
        best
    }
}

fn score_cluster(members: &[&ScreenedMessage], cadence_present: bool, resolver_confidence: i32) -> i32 {
    let n = members.len() as f64;
    let mut score = (35.0f64).min((n + 1.0).log2() * 12.0);
    if cadence_present {
        score += 22.0;
    }

    let joined = members
        .iter()
        .map(|m| format!("{} {}", m.meta.subject, m.meta.snippet))
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let has_billing_keywords = BILLING_KEYWORDS.iter().any(|k| joined.contains(k));
    if has_billing_keywords {
        score += 18.0;
    }

    let transactional_ratio = members
        .iter()
        .filter(|m| m.flags.likely_transactional)
        .count() as f64
        / n;
    score += (15.0f64).min(20.0 * transactional_ratio);
    score += (20.0f64).min(0.35 * f64::from(resolver_confidence));

    let bulk_ratio = members.iter().filter(|m| m.flags.bulk_header).count() as f64 / n;
    if bulk_ratio > 0.8 && !has_billing_keywords {
        score -= 10.0;
    }

    (score.round() as i32).clamp(0, 100)
}

/// Build cluster candidates from screened metadata. At most `cap` clusters
/// are emitted, highest score first.
pub fn build_clusters(messages: &[ScreenedMessage], cap: usize) -> Vec<Candidate> {
    let mut groups: BTreeMap<String, Vec<&ScreenedMessage>> = BTreeMap::new();
    for message in messages {
        if message.resolved.from_domain.is_empty() {
            continue;
        }
        groups.entry(group_key(message)).or_default().push(message);
    }

    let mut clusters: Vec<Candidate> = Vec::new();
    for (_, mut members) in groups {
        members.retain(|m| m.meta.date_ms.is_some());
        if members.len() < MIN_CLUSTER_SIZE {
            continue;
        }
        members.sort_by_key(|m| m.meta.date_ms.unwrap_or(0));

        let dates: Vec<i64> = members.iter().filter_map(|m| m.meta.date_ms).collect();
        let cadence = infer_cadence_from_dates(&dates);

        // Best-resolved member names the cluster.
        let best = members
            .iter()
            .max_by_key(|m| m.resolved.confidence)
            .expect("cluster has members");
        let merchant = best.resolved.display_name().to_string();
        if merchant.is_empty() {
            continue;
        }

        let score = score_cluster(&members, cadence.is_some(), best.resolved.confidence);
        if score < MIN_CLUSTER_SCORE {
            continue;
        }

        let newest = members.last().expect("cluster has members");
        let sender_domain = best.resolved.from_domain.clone();
        let mut reasons = vec![
            format!("{} recurring messages from {}", members.len(), sender_domain),
        ];
        if let Some(cadence) = cadence {
            reasons.push(format!("{} cadence from message dates", cadence.as_str()));
        }
        reasons.push(format!(
            "merchant via {} ({})",
            best.resolved.reason.as_str(),
            best.resolved.confidence
        ));

        let samples: Vec<EvidenceSample> = members
            .iter()
            .rev()
            .take(3)
            .map(|m| EvidenceSample {
                from: m.meta.from.clone(),
                subject: m.meta.subject.clone(),
                date_ms: m.meta.date_ms.unwrap_or(0),
            })
            .collect();

        clusters.push(Candidate {
            fingerprint: fingerprint(
                FingerprintKind::Cluster,
                &merchant,
                &sender_domain,
                None,
                None,
                cadence,
            ),
            merchant,
            plan: None,
            amount: None,
            currency: None,
            cadence_guess: cadence,
            next_date_guess: None,
            confidence: score,
            confidence_label: ConfidenceLabel::from_confidence(score),
            evidence_type: EvidenceType::Cluster,
            reasons,
            evidence: Evidence {
                from: newest.meta.from.clone(),
                subject: newest.meta.subject.clone(),
                snippet: newest.meta.snippet.clone(),
                sender_email: email_address(&newest.meta.from).unwrap_or_default(),
                sender_domain,
                date_ms: newest.meta.date_ms.unwrap_or(0),
            },
            evidence_samples: samples,
            needs_confirm: true,
            event_type: CandidateEventType::BillingSignalNoAmount,
            card_type: None,
            exclude_from_spend: false,
            evidence_dates: dates,
        });
    }

    clusters.sort_by_key(|c| std::cmp::Reverse(c.confidence));
    clusters.truncate(cap);
    clusters
}
