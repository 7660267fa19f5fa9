//! Merchant resolution.
//!
//! Maps a message's sender surface (from/reply-to/return-path addresses,
//! list-unsubscribe and link domains, free-text haystack) to a canonical
//! merchant using the directory and per-user overrides. First matching tier
//! wins; the score only accumulates within that tier.

use crate::detect::normalize::{
    self, domain_matches, email_address, email_domain, is_consumer_domain, is_infra_domain,
    pretty_label, strip_mail_prefixes,
};
use crate::mailbox::MessageMeta;

/// One directory row: a canonical merchant and the ways it shows up in mail.
#[derive(Debug, Clone, Default)]
pub struct DirectoryEntry {
    pub canonical_name: String,
    pub sender_emails: Vec<String>,
    pub sender_domains: Vec<String>,
    pub keywords: Vec<String>,
}

/// Read-only merchant directory snapshot.
#[derive(Debug, Clone, Default)]
pub struct MerchantDirectory {
    pub entries: Vec<DirectoryEntry>,
}

impl MerchantDirectory {
    fn by_sender_email(&self, email: &str) -> Option<&DirectoryEntry> {
        self.entries
            .iter()
            .find(|e| e.sender_emails.iter().any(|s| s.eq_ignore_ascii_case(email)))
    }

    fn by_domain(&self, domain: &str) -> Option<&DirectoryEntry> {
        self.entries
            .iter()
            .find(|e| e.sender_domains.iter().any(|d| domain_matches(domain, d)))
    }

    fn entry_matches_domain(&self, entry: &DirectoryEntry, domain: &str) -> bool {
        entry.sender_domains.iter().any(|d| domain_matches(domain, d))
    }
}

/// A user's manual merchant pin, keyed by sender email or sender domain.
#[derive(Debug, Clone)]
pub struct UserOverride {
    pub sender_email: Option<String>,
    pub sender_domain: Option<String>,
    pub canonical_name: String,
}

/// Which tier produced the match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchReason {
    OverrideEmail,
    OverrideDomain,
    SenderEmail,
    Domain,
    Keywords,
    FallbackDomain,
    NoMatch,
}

impl MatchReason {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchReason::OverrideEmail => "override-email",
            MatchReason::OverrideDomain => "override-domain",
            MatchReason::SenderEmail => "sender-email",
            MatchReason::Domain => "domain",
            MatchReason::Keywords => "keywords",
            MatchReason::FallbackDomain => "fallback-domain",
            MatchReason::NoMatch => "no-match",
        }
    }
}

/// Resolver output: canonical merchant (when known), a presentable fallback
/// label, and an explainable confidence.
#[derive(Debug, Clone)]
pub struct MerchantMatch {
    pub canonical: Option<String>,
    pub pretty_fallback: String,
    pub confidence: i32,
    pub reason: MatchReason,
    /// Signal names that contributed to the score, in order.
    pub signals: Vec<String>,
    pub from_domain: String,
}

impl MerchantMatch {
    /// Best displayable merchant name.
    pub fn display_name(&self) -> &str {
        self.canonical.as_deref().unwrap_or(&self.pretty_fallback)
    }
}

/// Normalized sender surface extracted from one message.
#[derive(Debug, Clone, Default)]
pub struct SenderSurface {
    pub from_email: Option<String>,
    pub from_domain: String,
    pub reply_to_domain: Option<String>,
    pub return_path_domain: Option<String>,
    pub list_unsubscribe_domains: Vec<String>,
    pub link_domains: Vec<String>,
    pub haystack: String,
}

impl SenderSurface {
    pub fn from_meta(meta: &MessageMeta, link_domains: &[String], haystack: &str) -> Self {
        let list_unsubscribe_domains = meta
            .list_unsubscribe
            .as_deref()
            .map(|v| normalize::extract_link_domains(v, "", 8))
            .unwrap_or_default();

        Self {
            from_email: email_address(&meta.from),
            from_domain: email_domain(&meta.from).unwrap_or_default(),
            reply_to_domain: meta.reply_to.as_deref().and_then(email_domain),
            return_path_domain: meta.return_path.as_deref().and_then(email_domain),
            list_unsubscribe_domains,
            link_domains: link_domains.to_vec(),
            haystack: haystack.to_string(),
        }
    }

    /// Every domain that could identify the sender, fromDomain first.
    fn candidate_domains(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        if !self.from_domain.is_empty() {
            out.push(self.from_domain.as_str());
        }
        for d in [&self.reply_to_domain, &self.return_path_domain] {
            if let Some(d) = d.as_deref() {
                if !out.contains(&d) {
                    out.push(d);
                }
            }
        }
        for d in &self.list_unsubscribe_domains {
            if !out.contains(&d.as_str()) {
                out.push(d.as_str());
            }
        }
        for d in &self.link_domains {
            if !out.contains(&d.as_str()) {
                out.push(d.as_str());
            }
        }
        out
    }
}

fn clamp(score: i32) -> i32 {
    score.clamp(0, 100)
}

/// Resolve the merchant behind one message. Tiers, first match wins:
/// user override by email, user override by domain, directory sender email,
/// directory domain, directory keywords, fallback pretty domain.
pub fn resolve(
    surface: &SenderSurface,
    directory: &MerchantDirectory,
    overrides: &[UserOverride],
) -> MerchantMatch {
    let from_domain = surface.from_domain.clone();
    let pretty_fallback = if from_domain.is_empty() {
        String::new()
    } else {
        pretty_label(&from_domain)
    };
    let base = |reason: MatchReason| MerchantMatch {
        canonical: None,
        pretty_fallback: pretty_fallback.clone(),
        confidence: 0,
        reason,
        signals: Vec::new(),
        from_domain: from_domain.clone(),
    };

    // Tier 1: exact sender-email override.
    if let Some(from_email) = surface.from_email.as_deref() {
        if let Some(ov) = overrides.iter().find(|o| {
            o.sender_email
                .as_deref()
                .is_some_and(|e| e.eq_ignore_ascii_case(from_email))
        }) {
            return MerchantMatch {
                canonical: Some(ov.canonical_name.clone()),
                confidence: 95,
                signals: vec!["override-sender-email".to_string()],
                ..base(MatchReason::OverrideEmail)
            };
        }
    }

    // Tier 2: override by any candidate domain.
    for domain in surface.candidate_domains() {
        if let Some(ov) = overrides.iter().find(|o| {
            o.sender_domain
                .as_deref()
                .is_some_and(|d| domain_matches(domain, d))
        }) {
            return MerchantMatch {
                canonical: Some(ov.canonical_name.clone()),
                confidence: 90,
                signals: vec![format!("override-domain:{domain}")],
                ..base(MatchReason::OverrideDomain)
            };
        }
    }

    // Tier 3: directory exact sender email, boosted when reply-to and
    // return-path point at the same merchant.
    if let Some(from_email) = surface.from_email.as_deref() {
        if let Some(entry) = directory.by_sender_email(from_email) {
            let mut score = 50;
            let mut signals = vec!["directory-sender-email".to_string()];
            if let Some(reply) = surface.reply_to_domain.as_deref() {
                if directory.entry_matches_domain(entry, reply) {
                    score += 12;
                    signals.push("reply-to-agrees".to_string());
                }
            }
            if let Some(ret) = surface.return_path_domain.as_deref() {
                if directory.entry_matches_domain(entry, ret) {
                    score += 12;
                    signals.push("return-path-agrees".to_string());
                }
            }
            return MerchantMatch {
                canonical: Some(entry.canonical_name.clone()),
                confidence: clamp(score),
                signals,
                ..base(MatchReason::SenderEmail)
            };
        }
    }

    // Tier 4: directory domain over candidate domains, fromDomain preferred.
    for (index, domain) in surface.candidate_domains().into_iter().enumerate() {
        if let Some(entry) = directory.by_domain(domain) {
            let mut score = if index == 0 { 72 } else { 58 };
            let mut signals = vec![format!("directory-domain:{domain}")];
            if surface
                .list_unsubscribe_domains
                .iter()
                .any(|d| directory.entry_matches_domain(entry, d))
            {
                score += 8;
                signals.push("list-unsubscribe-agrees".to_string());
            }
            if surface
                .link_domains
                .iter()
                .any(|d| directory.entry_matches_domain(entry, d))
            {
                score += 6;
                signals.push("link-domain-agrees".to_string());
            }
            if is_consumer_domain(&from_domain) {
                score -= 30;
                signals.push("consumer-from-domain".to_string());
            }
            return MerchantMatch {
                canonical: Some(entry.canonical_name.clone()),
                confidence: clamp(score),
                signals,
                ..base(MatchReason::Domain)
            };
        }
    }

    // Tier 5: keyword hits over the haystack.
    let keyword_best = directory
        .entries
        .iter()
        .filter_map(|entry| {
            let hits = entry
                .keywords
                .iter()
                .filter(|k| !k.is_empty() && surface.haystack.contains(k.to_lowercase().as_str()))
                .count() as i32;
            (hits > 0).then_some((entry, hits))
        })
        .max_by_key(|(_, hits)| *hits);
    if let Some((entry, hits)) = keyword_best {
        let mut score = (10 + 7 * hits).clamp(10, 38);
        let mut signals = vec![format!("keyword-hits:{hits}")];
        if is_consumer_domain(&from_domain) {
            score -= 10;
            signals.push("consumer-from-domain".to_string());
        }
        return MerchantMatch {
            canonical: Some(entry.canonical_name.clone()),
            confidence: clamp(score),
            signals,
            ..base(MatchReason::Keywords)
        };
    }

    // Tier 6: pretty fallback from a plausible merchant-owned domain.
    if !from_domain.is_empty()
        && !is_consumer_domain(&from_domain)
        && !is_infra_domain(&from_domain)
    {
        let label = pretty_label(&strip_mail_prefixes(&from_domain));
        return MerchantMatch {
            canonical: None,
            pretty_fallback: label,
            confidence: 35,
            signals: vec!["fallback-domain".to_string()],
            ..base(MatchReason::FallbackDomain)
        };
    }

    base(MatchReason::NoMatch)
}

/// True when another merchant's keywords hit the haystack strongly enough
/// (two or more) to contradict the resolved merchant.
pub fn keyword_conflict(
    haystack: &str,
    directory: &MerchantDirectory,
    resolved_canonical: &str,
) -> bool {
    directory.entries.iter().any(|entry| {
        entry.canonical_name != resolved_canonical
            && entry
                .keywords
                .iter()
                .filter(|k| !k.is_empty() && haystack.contains(k.to_lowercase().as_str()))
                .count()
                >= 2
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> MerchantDirectory {
        MerchantDirectory {
            entries: vec![
                DirectoryEntry {
                    canonical_name: "Netflix".to_string(),
                    sender_emails: vec!["info@account.netflix.com".to_string()],
                    sender_domains: vec!["netflix.com".to_string()],
                    keywords: vec!["netflix".to_string()],
                },
                DirectoryEntry {
                    canonical_name: "Spotify".to_string(),
                    sender_emails: vec![],
                    sender_domains: vec!["spotify.com".to_string()],
                    keywords: vec!["spotify premium".to_string()],
                },
            ],
        }
    }

    fn surface(from: &str) -> SenderSurface {
        SenderSurface {
            from_email: email_address(from),
            from_domain: email_domain(from).unwrap_or_default(),
            ..Default::default()
        }
    }

    #[test]
    fn test_override_email_wins_over_directory() {
        let overrides = vec![UserOverride {
            sender_email: Some("info@account.netflix.com".to_string()),
            sender_domain: None,
            canonical_name: "My Netflix".to_string(),
        }];
        let m = resolve(
            &surface("Netflix <info@account.netflix.com>"),
            &directory(),
            &overrides,
        );
        assert_eq!(m.canonical.as_deref(), Some("My Netflix"));
        assert_eq!(m.reason, MatchReason::OverrideEmail);
        assert_eq!(m.confidence, 95);
    }

    #[test]
    fn test_directory_sender_email() {
        let mut s = surface("Netflix <info@account.netflix.com>");
        s.reply_to_domain = Some("netflix.com".to_string());
        let m = resolve(&s, &directory(), &[]);
        assert_eq!(m.canonical.as_deref(), Some("Netflix"));
        assert_eq!(m.reason, MatchReason::SenderEmail);
        assert_eq!(m.confidence, 62);
    }

    #[test]
    fn test_directory_domain_suffix_match() {
        let m = resolve(&surface("billing@mail.spotify.com"), &directory(), &[]);
        assert_eq!(m.canonical.as_deref(), Some("Spotify"));
        assert_eq!(m.reason, MatchReason::Domain);
    }

    #[test]
    fn test_keyword_match_with_consumer_penalty() {
        let mut s = surface("someone@gmail.com");
        s.haystack = "your spotify premium receipt".to_string();
        let m = resolve(&s, &directory(), &[]);
        assert_eq!(m.canonical.as_deref(), Some("Spotify"));
        assert_eq!(m.reason, MatchReason::Keywords);
        assert_eq!(m.confidence, 7);
    }

    #[test]
    fn test_fallback_domain() {
        let m = resolve(&surface("billing@zetamail.io"), &directory(), &[]);
        assert!(m.canonical.is_none());
        assert_eq!(m.reason, MatchReason::FallbackDomain);
        assert_eq!(m.pretty_fallback, "Zetamail");
        assert_eq!(m.confidence, 35);
    }

    #[test]
    fn test_infra_domain_is_no_match() {
        let m = resolve(&surface("bounce@u1234.ct.sendgrid.net"), &directory(), &[]);
        assert_eq!(m.reason, MatchReason::NoMatch);
        assert_eq!(m.confidence, 0);
    }
}
