//! Transactional-versus-marketing classification.
//!
//! Two entry points: [`classify`] runs over the full message surface once
//! bodies are available, and [`quick_screen`] runs over metadata alone so the
//! chunk engine can skip body fetches for obvious marketing. Both are pure
//! phrase/header matchers; no network, no state.

use crate::detect::normalize::{build_haystack, domain_matches};
use crate::mailbox::MessageMeta;

/// Phrases that indicate a billing/receipt context.
const POSITIVE_PHRASES: &[&str] = &[
    "payment successful",
    "payment received",
    "payment confirmation",
    "we charged",
    "you were charged",
    "you paid",
    "invoice",
    "receipt",
    "order confirmation",
    "subscription renewed",
    "your subscription",
    "renews on",
    "renewal date",
    "next billing date",
    "billing statement",
    "amount due",
    "trial ends",
    "expires on",
    "thanks for subscribing",
];

/// Phrases that indicate marketing content.
const NEGATIVE_PHRASES: &[&str] = &[
    "newsletter",
    "promo",
    "sale",
    "discount",
    "% off",
    "limited time",
    "recommended for you",
    "deals",
    "free shipping",
    "new arrivals",
    "don't miss",
];

/// Strong transactional words checked individually.
const STRONG_BILLING_WORDS: &[&str] = &[
    "invoice",
    "receipt",
    "charged",
    "payment",
    "subscription renewed",
];

/// Classifier verdict flags for one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageFlags {
    /// Bulk-mail headers present (Precedence/Auto-Submitted/List-Id).
    pub bulk_header: bool,
    /// Bulk + negative phrases + zero positive signal.
    pub marketing_heavy: bool,
    /// The message looks like a charge/receipt/subscription event.
    pub likely_transactional: bool,
    /// Apple sender talking about purchases/subscriptions.
    pub apple_receipt_hint: bool,
    pub pos_hits: u32,
    pub neg_hits: u32,
}

/// Quick-screen outcome. `weak_signal` still passes so screening never
/// removes an entire page of results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenReason {
    Ok,
    HardNo,
    WeakSignal,
    Marketing,
}

impl ScreenReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ScreenReason::Ok => "ok",
            ScreenReason::HardNo => "hard_no",
            ScreenReason::WeakSignal => "weak_signal",
            ScreenReason::Marketing => "marketing",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScreenVerdict {
    pub ok: bool,
    pub reason: ScreenReason,
}

fn count_hits(haystack: &str, phrases: &[&str]) -> u32 {
    phrases.iter().filter(|p| haystack.contains(*p)).count() as u32
}

fn has_bulk_headers(meta: &MessageMeta) -> bool {
    // List-Unsubscribe alone is deliberately NOT bulk; many legitimate
    // receipts carry it.
    let precedence = meta.precedence.as_deref().unwrap_or("").to_lowercase();
    if ["bulk", "list", "junk"].iter().any(|v| precedence.contains(v)) {
        return true;
    }
    let auto = meta.auto_submitted.as_deref().unwrap_or("").to_lowercase();
    if auto.contains("auto-generated") || auto.contains("auto-replied") {
        return true;
    }
    meta.list_id.is_some()
}

/// Classify a message given its full surface.
pub fn classify(meta: &MessageMeta, text: &str, from_domain: &str) -> MessageFlags {
    let haystack = build_haystack(&meta.subject, &meta.snippet, text);

    let bulk_header = has_bulk_headers(meta);
    let pos_hits = count_hits(&haystack, POSITIVE_PHRASES);
    let neg_hits = count_hits(&haystack, NEGATIVE_PHRASES);

    let apple_receipt_hint = domain_matches(from_domain, "apple.com")
        && ["subscription", "purchase", "app store", "itunes", "receipt"]
            .iter()
            .any(|p| haystack.contains(p));

    let likely_transactional = apple_receipt_hint
        || pos_hits >= 2
        || STRONG_BILLING_WORDS.iter().any(|w| haystack.contains(w));

    let marketing_heavy = bulk_header && neg_hits >= 1 && pos_hits == 0 && !apple_receipt_hint;

    MessageFlags {
        bulk_header,
        marketing_heavy,
        likely_transactional,
        apple_receipt_hint,
        pos_hits,
        neg_hits,
    }
}

/// Metadata-only screen run before any body fetch. Uses from + subject +
/// snippet + headers; bodies are not available yet.
pub fn quick_screen(meta: &MessageMeta, from_domain: &str) -> ScreenVerdict {
    let from_lower = meta.from.to_lowercase();
    if from_lower.contains("mailer-daemon") || from_lower.contains("postmaster@") {
        return ScreenVerdict {
            ok: false,
            reason: ScreenReason::HardNo,
        };
    }

    let flags = classify(meta, "", from_domain);
    if flags.marketing_heavy {
        return ScreenVerdict {
            ok: false,
            reason: ScreenReason::Marketing,
        };
    }
    if flags.pos_hits == 0 && !flags.likely_transactional {
        return ScreenVerdict {
            ok: true,
            reason: ScreenReason::WeakSignal,
        };
    }
    ScreenVerdict {
        ok: true,
        reason: ScreenReason::Ok,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::MessageMeta;

    fn meta(from: &str, subject: &str, snippet: &str) -> MessageMeta {
        MessageMeta {
            id: "m1".to_string(),
            from: from.to_string(),
            reply_to: None,
            return_path: None,
            subject: subject.to_string(),
            snippet: snippet.to_string(),
            list_unsubscribe: None,
            list_id: None,
            precedence: None,
            auto_submitted: None,
            date_ms: Some(1_700_000_000_000),
        }
    }

    #[test]
    fn test_receipt_is_transactional() {
        let m = meta(
            "Netflix <info@account.netflix.com>",
            "Your Netflix billing",
            "You were charged $15.49",
        );
        let flags = classify(&m, "You were charged $15.49 on Nov 12, 2025", "account.netflix.com");
        assert!(flags.likely_transactional);
        assert!(!flags.marketing_heavy);
    }

    #[test]
    fn test_bulk_marketing_is_marketing_heavy() {
        let mut m = meta(
            "promos@brand.com",
            "Limited time 20% off",
            "our newsletter has deals",
        );
        m.list_id = Some("<promo.brand.com>".to_string());
        let flags = classify(&m, "", "brand.com");
        assert!(flags.bulk_header);
        assert!(flags.marketing_heavy);
        assert!(!flags.likely_transactional);
    }

    #[test]
    fn test_list_unsubscribe_alone_is_not_bulk() {
        let mut m = meta("billing@hulu.com", "Your receipt", "Thanks for your payment");
        m.list_unsubscribe = Some("<mailto:unsub@hulu.com>".to_string());
        let flags = classify(&m, "receipt for your subscription", "hulu.com");
        assert!(!flags.bulk_header);
    }

    #[test]
    fn test_apple_hint() {
        let m = meta(
            "Apple <no_reply@email.apple.com>",
            "Your receipt from Apple",
            "",
        );
        let flags = classify(&m, "App Store subscription receipt", "email.apple.com");
        assert!(flags.apple_receipt_hint);
        assert!(flags.likely_transactional);
    }

    #[test]
    fn test_quick_screen_lets_weak_signal_pass() {
        let m = meta("updates@service.io", "Your account", "account update");
        let verdict = quick_screen(&m, "service.io");
        assert!(verdict.ok);
        assert_eq!(verdict.reason, ScreenReason::WeakSignal);
    }

    #[test]
    fn test_quick_screen_blocks_marketing() {
        let mut m = meta("promos@brand.com", "Limited time 20% off", "newsletter");
        m.precedence = Some("bulk".to_string());
        let verdict = quick_screen(&m, "brand.com");
        assert!(!verdict.ok);
        assert_eq!(verdict.reason, ScreenReason::Marketing);
    }
}
