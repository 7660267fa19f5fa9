//! Field extractors: amount + currency, billing cadence, next renewal date,
//! plan label, and the real merchant behind platform receipts
//! (Apple / PayPal / Google Play).
//!
//! Extractors run on case-preserved normalized text so names like
//! `App: LinkedIn` keep their casing; matching itself is case-insensitive.

use crate::models::Cadence;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use regex::Regex;
use std::sync::OnceLock;

/// Extracted price.
#[derive(Debug, Clone, PartialEq)]
pub struct Money {
    pub amount: f64,
    pub currency: String,
}

/// Keywords whose proximity makes an amount billing-relevant. Also used by
/// the cluster builder over joined subjects/snippets.
pub const BILLING_KEYWORDS: &[&str] = &[
    "total",
    "charged",
    "you paid",
    "amount due",
    "invoice",
    "receipt",
    "renewal",
    "subscription",
    "payment",
];

/// Maximum distance between an amount and a billing keyword.
const KEYWORD_PROXIMITY: usize = 60;

const MIN_AMOUNT: f64 = 0.0;
const MAX_AMOUNT: f64 = 1_000_000.0;

/// How far after a renewal keyword a date may appear.
const DATE_WINDOW: usize = 100;

/// Acceptable renewal date range relative to now.
const DATE_PAST_SLACK_DAYS: i64 = 1;
const DATE_FUTURE_LIMIT_DAYS: i64 = 400;

fn symbol_amount_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(?P<sym>us\$|ca\$|c\$|au\$|a\$|nz\$|\$|€|£|₹)\s?(?P<num>\d{1,3}(?:[.,]\d{3})+(?:[.,]\d{1,2})?|\d+(?:[.,]\d{1,2})?)",
        )
        .expect("valid symbol amount regex")
    })
}

fn code_amount_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?P<code>usd|eur|gbp|cad|aud|nzd|chf|sek|nok|dkk|inr|jpy|brl|mxn)\b\s?(?P<num>\d{1,3}(?:[.,]\d{3})+(?:[.,]\d{1,2})?|\d+(?:[.,]\d{1,2})?)",
        )
        .expect("valid code amount regex")
    })
}

fn amount_code_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(?P<num>\d{1,3}(?:[.,]\d{3})+(?:[.,]\d{1,2})?|\d+(?:[.,]\d{1,2})?)\s?(?P<code>usd|eur|gbp|cad|aud|nzd|chf|sek|nok|dkk|inr|jpy|brl|mxn)\b",
        )
        .expect("valid amount code regex")
    })
}

fn symbol_currency(sym: &str) -> &'static str {
    match sym.to_lowercase().as_str() {
        "€" => "EUR",
        "£" => "GBP",
        "₹" => "INR",
        "ca$" | "c$" => "CAD",
        "au$" | "a$" => "AUD",
        "nz$" => "NZD",
        _ => "USD",
    }
}

/// Parse a raw numeric string, detecting the decimal convention from the
/// rightmost separator: `1.234,56` -> 1234.56, `1,299` -> 1299.
fn parse_decimal(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let rightmost = raw.rfind(['.', ','])?;
    let (head, tail) = raw.split_at(rightmost);
    let tail_digits = &tail[1..];
    let cleaned = if tail_digits.len() <= 2 {
        // Decimal separator; everything else is grouping.
        let mut head: String = head.chars().filter(|c| c.is_ascii_digit()).collect();
        head.push('.');
        head.push_str(tail_digits);
        head
    } else {
        raw.chars().filter(|c| c.is_ascii_digit()).collect()
    };
    cleaned.parse::<f64>().ok()
}

fn parse_plain(raw: &str) -> Option<f64> {
    if raw.contains(['.', ',']) {
        parse_decimal(raw)
    } else {
        raw.parse::<f64>().ok()
    }
}

/// Snap a byte index forward to the nearest char boundary.
fn snap_boundary(s: &str, mut index: usize) -> usize {
    index = index.min(s.len());
    while index < s.len() && !s.is_char_boundary(index) {
        index += 1;
    }
    index
}

fn near_billing_keyword(text_lower: &str, pos: usize) -> bool {
    let start = snap_boundary(text_lower, pos.saturating_sub(KEYWORD_PROXIMITY));
    let end = snap_boundary(text_lower, pos + KEYWORD_PROXIMITY);
    let window = &text_lower[start..end];
    BILLING_KEYWORDS.iter().any(|k| window.contains(k))
}

/// Extract the most billing-relevant amount from the text. Amounts near a
/// billing keyword win over the first match; implausible values are dropped.
pub fn extract_amount(text: &str) -> Option<Money> {
    let text_lower = text.to_lowercase();
    let mut matches: Vec<(usize, f64, String)> = Vec::new();

    for caps in symbol_amount_regex().captures_iter(text) {
        let pos = caps.get(0).map(|m| m.start()).unwrap_or(0);
        if let Some(amount) = parse_plain(&caps["num"]) {
            matches.push((pos, amount, symbol_currency(&caps["sym"]).to_string()));
        }
    }
    for re in [code_amount_regex(), amount_code_regex()] {
        for caps in re.captures_iter(text) {
            let pos = caps.get(0).map(|m| m.start()).unwrap_or(0);
            if let Some(amount) = parse_plain(&caps["num"]) {
                matches.push((pos, amount, caps["code"].to_uppercase()));
            }
        }
    }

    matches.retain(|(_, amount, _)| *amount > MIN_AMOUNT && *amount <= MAX_AMOUNT);
    matches.sort_by_key(|(pos, _, _)| *pos);

    matches
        .iter()
        .find(|(pos, _, _)| near_billing_keyword(&text_lower, *pos))
        .or_else(|| matches.first())
        .map(|(_, amount, currency)| Money {
            amount: *amount,
            currency: currency.clone(),
        })
}

/// Cadence keyword sets, checked shortest period first.
pub fn extract_cadence(text: &str) -> Option<Cadence> {
    static WEEKLY: OnceLock<Regex> = OnceLock::new();
    static MONTHLY: OnceLock<Regex> = OnceLock::new();
    static QUARTERLY: OnceLock<Regex> = OnceLock::new();
    static YEARLY: OnceLock<Regex> = OnceLock::new();

    let weekly = WEEKLY.get_or_init(|| {
        Regex::new(r"(?i)\b(weekly|per week|each week|every week)\b|/\s?week\b").unwrap()
    });
    let monthly = MONTHLY.get_or_init(|| {
        Regex::new(r"(?i)\b(monthly|per month|each month|every month)\b|/\s?(month|mo)\b").unwrap()
    });
    let quarterly = QUARTERLY.get_or_init(|| {
        Regex::new(r"(?i)\b(quarterly|per quarter|every 3 months)\b|/\s?quarter\b").unwrap()
    });
    let yearly = YEARLY.get_or_init(|| {
        Regex::new(r"(?i)\b(yearly|annual|annually|per year|every year)\b|/\s?(year|yr)\b").unwrap()
    });

    if weekly.is_match(text) {
        Some(Cadence::Weekly)
    } else if monthly.is_match(text) {
        Some(Cadence::Monthly)
    } else if quarterly.is_match(text) {
        Some(Cadence::Quarterly)
    } else if yearly.is_match(text) {
        Some(Cadence::Yearly)
    } else {
        None
    }
}

/// Infer a cadence from the median gap between event dates.
/// Tolerances: 7±2, 14±3, 30±6, 90±15, 365±45 days.
pub fn infer_cadence_from_dates(dates_ms: &[i64]) -> Option<Cadence> {
    if dates_ms.len() < 2 {
        return None;
    }
    let mut sorted: Vec<i64> = dates_ms.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    if sorted.len() < 2 {
        return None;
    }

    let mut gaps: Vec<f64> = sorted
        .windows(2)
        .map(|w| (w[1] - w[0]) as f64 / 86_400_000.0)
        .collect();
    gaps.sort_by(|a, b| a.partial_cmp(b).expect("gaps are finite"));
    let median = if gaps.len() % 2 == 1 {
        gaps[gaps.len() / 2]
    } else {
        (gaps[gaps.len() / 2 - 1] + gaps[gaps.len() / 2]) / 2.0
    };

    const BUCKETS: &[(f64, f64, Cadence)] = &[
        (7.0, 2.0, Cadence::Weekly),
        (14.0, 3.0, Cadence::Biweekly),
        (30.0, 6.0, Cadence::Monthly),
        (90.0, 15.0, Cadence::Quarterly),
        (365.0, 45.0, Cadence::Yearly),
    ];
    BUCKETS
        .iter()
        .find(|(center, tolerance, _)| (median - center).abs() <= *tolerance)
        .map(|(_, _, cadence)| *cadence)
}

fn renewal_keyword_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(renews|renewal|next billing|billed on|trial ends|valid until|expires)\b")
            .expect("valid renewal keyword regex")
    })
}

fn iso_date_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{4})-(\d{2})-(\d{2})").expect("valid iso date regex"))
}

fn month_name_date_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?\s+(\d{1,2}),?\s+(\d{4})")
            .expect("valid month name date regex")
    })
}

fn month_number(name: &str) -> Option<u32> {
    const MONTHS: &[&str] = &[
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    MONTHS
        .iter()
        .position(|m| name.to_lowercase().starts_with(m))
        .map(|i| i as u32 + 1)
}

fn first_date_in(window: &str) -> Option<NaiveDate> {
    let iso = iso_date_regex().captures(window).and_then(|caps| {
        NaiveDate::from_ymd_opt(
            caps[1].parse().ok()?,
            caps[2].parse().ok()?,
            caps[3].parse().ok()?,
        )
    });
    let named = month_name_date_regex().captures(window).and_then(|caps| {
        NaiveDate::from_ymd_opt(
            caps[3].parse().ok()?,
            month_number(&caps[1])?,
            caps[2].parse().ok()?,
        )
    });
    match (iso, named) {
        (Some(a), Some(b)) => {
            // Whichever appears first in the window.
            let a_pos = iso_date_regex().find(window).map(|m| m.start()).unwrap_or(0);
            let b_pos = month_name_date_regex()
                .find(window)
                .map(|m| m.start())
                .unwrap_or(0);
            Some(if a_pos <= b_pos { a } else { b })
        }
        (a, b) => a.or(b),
    }
}

/// Extract the next renewal/expiry date near a renewal keyword. Dates must
/// fall inside [now - 1 day, now + 400 days].
pub fn extract_next_date(text: &str, now: DateTime<Utc>) -> Option<NaiveDate> {
    let today = now.date_naive();
    let min = today - Duration::days(DATE_PAST_SLACK_DAYS);
    let max = today + Duration::days(DATE_FUTURE_LIMIT_DAYS);

    for keyword in renewal_keyword_regex().find_iter(text) {
        let start = keyword.end();
        let end = snap_boundary(text, start + DATE_WINDOW);
        if let Some(date) = first_date_in(&text[start..end]) {
            if date >= min && date <= max {
                return Some(date);
            }
        }
    }
    None
}

/// Extract a plan label: `Plan: Premium`, `Membership: Gold`, or a title
/// followed by a parenthesized cadence like `Standard (Monthly)`.
pub fn extract_plan(text: &str) -> Option<String> {
    static LABELED: OnceLock<Regex> = OnceLock::new();
    static TITLED: OnceLock<Regex> = OnceLock::new();

    let labeled = LABELED.get_or_init(|| {
        Regex::new(r"(?im)\b(?:plan|membership|subscription)\s*:\s*([^\r\n,;]{2,60})").unwrap()
    });
    let titled = TITLED.get_or_init(|| {
        Regex::new(r"([A-Z][A-Za-z0-9+&' ]{1,40})\s*\((Monthly|Yearly|Weekly)\)").unwrap()
    });

    if let Some(caps) = labeled.captures(text) {
        let value = caps[1].trim().to_string();
        if value.len() >= 2 {
            return Some(value);
        }
    }
    titled
        .captures(text)
        .map(|caps| format!("{} ({})", caps[1].trim(), &caps[2]))
}

/// Platforms that aggregate other merchants' billing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Apple,
    PayPal,
    GooglePlay,
}

/// Classify a sender domain as a billing platform.
pub fn platform_of(domain: &str) -> Option<Platform> {
    use crate::detect::normalize::domain_matches;
    if domain_matches(domain, "apple.com") || domain_matches(domain, "itunes.com") {
        Some(Platform::Apple)
    } else if domain_matches(domain, "paypal.com") {
        Some(Platform::PayPal)
    } else if domain_matches(domain, "google.com") || domain_matches(domain, "googleplay.com") {
        Some(Platform::GooglePlay)
    } else {
        None
    }
}

/// Extract the real merchant from a platform receipt body. Structured lines
/// (`App:`, `Subscription:`, `Developer:`) win over prose patterns.
pub fn extract_platform_merchant(text: &str) -> Option<String> {
    static LINES: OnceLock<Regex> = OnceLock::new();
    static PROSE: OnceLock<Regex> = OnceLock::new();

    let lines = LINES.get_or_init(|| {
        Regex::new(r"(?im)^\s*(?:app|subscription|developer)\s*:\s*([^\r\n]{2,80})").unwrap()
    });
    let prose = PROSE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:you paid to|payment to|subscription to)\s+([^\r\n,.]{2,60})").unwrap()
    });

    let raw = lines
        .captures(text)
        .map(|caps| caps[1].to_string())
        .or_else(|| prose.captures(text).map(|caps| caps[1].to_string()))?;

    // `App: LinkedIn: Network & Job Finder` -> the product name is the part
    // before the subtitle separator.
    let name = raw.split(':').next().unwrap_or(&raw).trim().to_string();
    (name.len() >= 2).then_some(name)
}

/// True when the text talks about a free trial.
pub fn mentions_trial(text_lower: &str) -> bool {
    text_lower.contains("free trial")
        || text_lower.contains("trial ends")
        || text_lower.contains("trial period")
        || text_lower.contains("your trial")
}

/// Helper for candidate dates: epoch ms for midnight UTC of a date.
pub fn date_to_ms(date: NaiveDate) -> i64 {
    NaiveDate::from_ymd_opt(date.year(), date.month(), date.day())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_amount_near_billing_keyword() {
        let money =
            extract_amount("You were charged $15.49 on Nov 12, 2025. Ref 99.99 widgets").unwrap();
        assert_eq!(money.amount, 15.49);
        assert_eq!(money.currency, "USD");
    }

    #[test]
    fn test_amount_prefixed_code() {
        let money = extract_amount("Subscription total: US$39.99/month").unwrap();
        assert_eq!(money.amount, 39.99);
        assert_eq!(money.currency, "USD");
    }

    #[test]
    fn test_amount_european_convention() {
        let money = extract_amount("Invoice total €1.234,56 due now").unwrap();
        assert_eq!(money.amount, 1234.56);
        assert_eq!(money.currency, "EUR");
    }

    #[test]
    fn test_amount_thousands_only() {
        let money = extract_amount("Payment received: $1,299").unwrap();
        assert_eq!(money.amount, 1299.0);
    }

    #[test]
    fn test_amount_rejects_implausible() {
        assert!(extract_amount("charged $0 today").is_none());
        assert!(extract_amount("charged $2000000 today").is_none());
    }

    #[test]
    fn test_cadence_order_week_before_year() {
        assert_eq!(
            extract_cadence("billed weekly, save vs the annual plan"),
            Some(Cadence::Weekly)
        );
        assert_eq!(extract_cadence("US$39.99/month"), Some(Cadence::Monthly));
        assert_eq!(extract_cadence("annual membership"), Some(Cadence::Yearly));
        assert_eq!(extract_cadence("one-time purchase"), None);
    }

    #[test]
    fn test_infer_cadence_monthly_gaps() {
        let day = 86_400_000i64;
        let dates: Vec<i64> = (0..6).map(|i| 1_700_000_000_000 + i * 30 * day).collect();
        assert_eq!(infer_cadence_from_dates(&dates), Some(Cadence::Monthly));
    }

    #[test]
    fn test_infer_cadence_biweekly_and_none() {
        let day = 86_400_000i64;
        let biweekly: Vec<i64> = (0..4).map(|i| 1_700_000_000_000 + i * 14 * day).collect();
        assert_eq!(infer_cadence_from_dates(&biweekly), Some(Cadence::Biweekly));

        let irregular = vec![0, 50 * day, 220 * day];
        assert_eq!(infer_cadence_from_dates(&irregular), None);
    }

    #[test]
    fn test_next_date_month_name() {
        let now = Utc.with_ymd_and_hms(2025, 11, 12, 12, 0, 0).unwrap();
        let date = extract_next_date("your plan renews on Dec 12, 2025", now).unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2025, 12, 12).unwrap());
    }

    #[test]
    fn test_next_date_iso_and_range_check() {
        let now = Utc.with_ymd_and_hms(2025, 12, 20, 0, 0, 0).unwrap();
        let date = extract_next_date("Renews on 2026-01-05", now).unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2026, 1, 5).unwrap());

        // Too far in the past.
        assert!(extract_next_date("renewal was 2020-01-01", now).is_none());
        // Date with no renewal keyword nearby.
        assert!(extract_next_date("order placed 2026-01-05", now).is_none());
    }

    #[test]
    fn test_plan_label() {
        assert_eq!(
            extract_plan("Plan: Premium Family\nTotal: $22.99").as_deref(),
            Some("Premium Family")
        );
        assert_eq!(
            extract_plan("Your Standard (Monthly) membership").as_deref(),
            Some("Standard (Monthly)")
        );
        assert!(extract_plan("no labels here").is_none());
    }

    #[test]
    fn test_platform_merchant_apple_line() {
        let body = "Receipt\nApp: LinkedIn: Network & Job Finder\nUS$39.99/month";
        assert_eq!(extract_platform_merchant(body).as_deref(), Some("LinkedIn"));
    }

    #[test]
    fn test_platform_merchant_prose() {
        assert_eq!(
            extract_platform_merchant("You paid to Spotify AB, thanks").as_deref(),
            Some("Spotify AB")
        );
        assert!(extract_platform_merchant("nothing structured").is_none());
    }

    #[test]
    fn test_platform_of() {
        assert_eq!(platform_of("email.apple.com"), Some(Platform::Apple));
        assert_eq!(platform_of("paypal.com"), Some(Platform::PayPal));
        assert_eq!(platform_of("play.google.com"), Some(Platform::GooglePlay));
        assert_eq!(platform_of("netflix.com"), None);
    }
}
