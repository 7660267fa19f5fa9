//! Per-message candidate builder.
//!
//! Pure function from one fully-fetched message to either a scored
//! [`Candidate`] or a typed drop reason. No side effects; drop reasons are
//! counted by the chunk engine into `nullReasons`.

use crate::detect::aggregate::{FingerprintKind, fingerprint};
use crate::detect::classifier::{self, MessageFlags};
use crate::detect::extract::{
    Platform, date_to_ms, extract_amount, extract_cadence, extract_next_date, extract_plan,
    extract_platform_merchant, infer_cadence_from_dates, mentions_trial, platform_of,
};
use crate::detect::merchant::{
    self, MatchReason, MerchantDirectory, MerchantMatch, SenderSurface, UserOverride,
};
use crate::detect::normalize::{
    build_haystack, email_address, extract_link_domains, is_consumer_domain, normalize_body,
};
use crate::mailbox::FullMessage;
use crate::models::{
    Candidate, CandidateEventType, ConfidenceLabel, Evidence, EvidenceType,
};
use chrono::{DateTime, Utc};

/// Link domains scanned per message, at most.
const LINK_DOMAIN_CAP: usize = 200;

/// Confidence ceiling when no billing anchor (amount, renewal date, cadence,
/// trial) is present.
const ANCHORLESS_CAP: i32 = 55;

const TRIAL_FLOOR: i32 = 35;
const DEFAULT_FLOOR: i32 = 45;

/// Why a message produced no candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    MarketingHeavy,
    LowConfidence,
    NoSender,
}

impl DropReason {
    /// Key used in `nullReasons` counters.
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::MarketingHeavy => "marketingHeavy",
            DropReason::LowConfidence => "lowConfidence",
            DropReason::NoSender => "noSender",
        }
    }
}

/// Builder result: a candidate or an explained drop.
#[derive(Debug, Clone)]
pub enum BuildOutcome {
    Built(Box<Candidate>),
    Dropped(DropReason),
}

fn charge_confirmed(haystack: &str) -> bool {
    [
        "you were charged",
        "we charged",
        "payment successful",
        "payment received",
        "you paid",
        "receipt",
        "invoice",
    ]
    .iter()
    .any(|p| haystack.contains(p))
}

fn derive_event_type(
    haystack: &str,
    flags: &MessageFlags,
    trial: bool,
    has_amount: bool,
) -> CandidateEventType {
    if ["payment failed", "could not process", "was declined", "unable to charge"]
        .iter()
        .any(|p| haystack.contains(p))
    {
        return CandidateEventType::PaymentFailed;
    }
    if haystack.contains("subscription paused") || haystack.contains("membership paused") {
        return CandidateEventType::Paused;
    }
    if haystack.contains("cancellation confirmed")
        || haystack.contains("has been canceled")
        || haystack.contains("has been cancelled")
        || haystack.contains("subscription canceled")
    {
        return CandidateEventType::Cancellation;
    }
    if haystack.contains("funds added") || haystack.contains("top up") || haystack.contains("top-up")
    {
        return CandidateEventType::TopUp;
    }
    if haystack.contains("ad spend") || haystack.contains("campaign budget") {
        return CandidateEventType::AdSpend;
    }
    if trial {
        return CandidateEventType::Trial;
    }
    if has_amount && charge_confirmed(haystack) {
        return CandidateEventType::Receipt;
    }
    if haystack.contains("renews on")
        || haystack.contains("will renew")
        || haystack.contains("subscription renewed")
        || haystack.contains("will be charged")
    {
        return CandidateEventType::Renewal;
    }
    if flags.likely_transactional {
        if has_amount {
            return CandidateEventType::BillingSignal;
        }
        return CandidateEventType::BillingSignalNoAmount;
    }
    if flags.marketing_heavy {
        return CandidateEventType::Marketing;
    }
    CandidateEventType::Unknown
}

/// Build a candidate from one message, or explain why not.
pub fn build_candidate(
    message: &FullMessage,
    directory: &MerchantDirectory,
    overrides: &[UserOverride],
    now: DateTime<Utc>,
) -> BuildOutcome {
    let meta = &message.meta;
    let text = normalize_body(&message.bodies.text);
    let link_domains = extract_link_domains(&text, &message.bodies.html, LINK_DOMAIN_CAP);

    // Case-preserved surface for extractors, lowercased haystack for matching.
    let full_text = format!("{}\n{}\n{}", meta.subject, meta.snippet, text);
    let haystack = build_haystack(&meta.subject, &meta.snippet, &text);

    let surface = SenderSurface::from_meta(meta, &link_domains, &haystack);
    let from_domain = surface.from_domain.clone();
    let resolved: MerchantMatch = merchant::resolve(&surface, directory, overrides);
    let flags = classifier::classify(meta, &text, &from_domain);

    if flags.marketing_heavy && !flags.likely_transactional {
        return BuildOutcome::Dropped(DropReason::MarketingHeavy);
    }

    // Platform receipts: the aggregator is the sender, the merchant is in
    // the body.
    let platform: Option<Platform> = platform_of(&from_domain);
    let platform_merchant = platform.and_then(|_| extract_platform_merchant(&full_text));

    let mut merchant_name = resolved.display_name().to_string();
    if let Some(extracted) = platform_merchant.as_deref() {
        if extracted.len() >= 2 {
            merchant_name = extracted.to_string();
        }
    }
    if merchant_name.is_empty() {
        return BuildOutcome::Dropped(DropReason::NoSender);
    }

    let money = extract_amount(&full_text);
    let next_date = extract_next_date(&full_text, now);
    let plan = extract_plan(&full_text);
    let trial = mentions_trial(&haystack);

    // Cadence only when it is plausible the message is about billing.
    let mut cadence = if flags.likely_transactional || next_date.is_some() {
        extract_cadence(&full_text)
    } else {
        None
    };
    // The gap from message date to the announced renewal approximates the
    // billing period. Not applicable to trials; the trial end is not a cycle.
    if cadence.is_none() && !trial {
        if let (Some(date_ms), Some(next)) = (meta.date_ms, next_date) {
            cadence = infer_cadence_from_dates(&[date_ms, date_to_ms(next)]);
        }
    }

    let mut reasons: Vec<String> = Vec::new();
    let mut confidence = ((f64::from(resolved.confidence) * 0.6).min(60.0)).round() as i32;
    reasons.push(format!(
        "merchant via {} ({})",
        resolved.reason.as_str(),
        resolved.confidence
    ));

    if flags.likely_transactional {
        confidence += 12;
        reasons.push("transactional language".to_string());
    }
    if platform_merchant.is_some() {
        confidence += 10;
        reasons.push("platform receipt merchant".to_string());
    }
    if money.is_some() && flags.likely_transactional {
        confidence += 10;
        reasons.push("amount near billing keywords".to_string());
    }
    if next_date.is_some() {
        confidence += 8;
        reasons.push("next renewal date".to_string());
    }
    if cadence.is_some() {
        confidence += 4;
        reasons.push("billing cadence".to_string());
    }
    let strong_billing_proof =
        money.is_some() && (next_date.is_some() || flags.pos_hits >= 2);
    if resolved.reason == MatchReason::FallbackDomain && strong_billing_proof {
        confidence += 18;
        reasons.push("unknown sender with strong billing proof".to_string());
    }
    if flags.bulk_header {
        confidence -= 10;
        reasons.push("bulk mail headers".to_string());
    }
    if is_consumer_domain(&from_domain) {
        confidence -= 15;
        reasons.push("consumer sender domain".to_string());
    }
    if let Some(canonical) = resolved.canonical.as_deref() {
        if resolved.reason != MatchReason::Keywords
            && merchant::keyword_conflict(&haystack, directory, canonical)
        {
            confidence -= 30;
            reasons.push("conflicting merchant keywords".to_string());
        }
    }

    if money.is_none() && next_date.is_none() && cadence.is_none() && !trial {
        confidence = confidence.min(ANCHORLESS_CAP);
        reasons.push("no billing anchors".to_string());
    }
    confidence = confidence.clamp(0, 100);

    let floor = if trial { TRIAL_FLOOR } else { DEFAULT_FLOOR };
    if confidence < floor {
        return BuildOutcome::Dropped(DropReason::LowConfidence);
    }

    let evidence_type = if platform_merchant.is_some() {
        EvidenceType::PlatformReceipt
    } else if flags.likely_transactional {
        EvidenceType::Transactional
    } else if trial {
        EvidenceType::Trial
    } else {
        EvidenceType::Unknown
    };

    let event_type = derive_event_type(&haystack, &flags, trial, money.is_some());
    let sender_email = email_address(&meta.from).unwrap_or_default();
    let date_ms = meta.date_ms.unwrap_or(0);

    let fingerprint = fingerprint(
        FingerprintKind::Email,
        &merchant_name,
        &from_domain,
        money.as_ref().map(|m| m.amount),
        money.as_ref().map(|m| m.currency.as_str()),
        None,
    );

    let snippet = if meta.snippet.is_empty() {
        text.chars().take(140).collect()
    } else {
        meta.snippet.clone()
    };

    BuildOutcome::Built(Box::new(Candidate {
        fingerprint,
        merchant: merchant_name,
        plan,
        amount: money.as_ref().map(|m| m.amount),
        currency: money.map(|m| m.currency),
        cadence_guess: cadence,
        next_date_guess: next_date,
        confidence,
        confidence_label: ConfidenceLabel::from_confidence(confidence),
        evidence_type,
        reasons,
        evidence: Evidence {
            from: meta.from.clone(),
            subject: meta.subject.clone(),
            snippet,
            sender_email,
            sender_domain: from_domain,
            date_ms,
        },
        evidence_samples: Vec::new(),
        needs_confirm: resolved.canonical.is_none() || confidence < 55,
        event_type,
        card_type: None,
        exclude_from_spend: false,
        evidence_dates: if date_ms > 0 { vec![date_ms] } else { Vec::new() },
    }))
}

/// Build a low-PII near-miss sample for a dropped message.
pub fn near_miss(meta: &crate::mailbox::MessageMeta, reason: DropReason) -> crate::models::NearMiss {
    crate::models::NearMiss {
        sender_domain: crate::detect::normalize::email_domain(&meta.from).unwrap_or_default(),
        subject: meta.subject.chars().take(80).collect(),
        reason: reason.as_str().to_string(),
    }
}
