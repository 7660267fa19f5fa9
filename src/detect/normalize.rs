//! Sender and body normalization shared by the detection stack.
//!
//! Everything downstream (classifier, merchant resolver, extractors) works on
//! lowercased domains and whitespace-normalized text produced here. Domain
//! comparisons are suffix matches on label boundaries so `mail.example.com`
//! matches `example.com` but `notexample.com` does not.

use regex::Regex;
use std::sync::OnceLock;

/// Free mailbox providers. A match here is never a merchant identity and
/// carries scoring penalties in the resolver.
pub const CONSUMER_DOMAINS: &[&str] = &[
    "gmail.com",
    "googlemail.com",
    "yahoo.com",
    "ymail.com",
    "hotmail.com",
    "outlook.com",
    "live.com",
    "msn.com",
    "icloud.com",
    "me.com",
    "mac.com",
    "aol.com",
    "protonmail.com",
    "proton.me",
];

/// Mail-sending infrastructure (ESPs). Never a merchant identity.
pub const INFRA_DOMAINS: &[&str] = &[
    "sendgrid.net",
    "sendgrid.com",
    "mailgun.org",
    "mailgun.net",
    "amazonses.com",
    "list-manage.com",
    "mailchimp.com",
    "mandrillapp.com",
    "sparkpostmail.com",
    "postmarkapp.com",
    "mailjet.com",
];

/// Subdomain labels commonly prepended by mail systems; stripped before
/// pretty-label derivation and directory lookups.
const MAIL_PREFIXES: &[&str] = &["mail", "email", "em", "m", "news", "notify", "noreply"];

fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://([^/\s"'<>]+)"#).expect("valid url regex"))
}

/// Lowercased domain part of an address like `Name <user@host>` or `user@host`.
pub fn email_domain(addr: &str) -> Option<String> {
    let addr = addr.trim();
    let inner = match (addr.rfind('<'), addr.rfind('>')) {
        (Some(start), Some(end)) if start < end => &addr[start + 1..end],
        _ => addr,
    };
    let at = inner.rfind('@')?;
    let domain = inner[at + 1..].trim().trim_end_matches('.').to_lowercase();
    if domain.is_empty() { None } else { Some(domain) }
}

/// Lowercased bare address part of `Name <user@host>`.
pub fn email_address(addr: &str) -> Option<String> {
    let addr = addr.trim();
    let inner = match (addr.rfind('<'), addr.rfind('>')) {
        (Some(start), Some(end)) if start < end => &addr[start + 1..end],
        _ => addr,
    };
    if inner.contains('@') {
        Some(inner.trim().to_lowercase())
    } else {
        None
    }
}

/// True when `candidate` equals `root` or is a subdomain of it.
pub fn domain_matches(candidate: &str, root: &str) -> bool {
    let candidate = candidate.trim_end_matches('.');
    let root = root.trim_end_matches('.');
    candidate == root || candidate.ends_with(&format!(".{root}"))
}

pub fn is_consumer_domain(domain: &str) -> bool {
    CONSUMER_DOMAINS.iter().any(|d| domain_matches(domain, d))
}

pub fn is_infra_domain(domain: &str) -> bool {
    INFRA_DOMAINS.iter().any(|d| domain_matches(domain, d))
}

/// Strip leading mail-system labels: `mail.hulu.com` -> `hulu.com`.
/// Keeps at least two labels so bare registrable domains pass through.
pub fn strip_mail_prefixes(domain: &str) -> String {
    let mut labels: Vec<&str> = domain.split('.').collect();
    while labels.len() > 2 && MAIL_PREFIXES.contains(&labels[0]) {
        labels.remove(0);
    }
    labels.join(".")
}

/// Approximate registrable domain: last two labels, or three when the
/// second-level label is a common country-code second level.
pub fn registrable_domain(domain: &str) -> String {
    const SECOND_LEVELS: &[&str] = &["co", "com", "net", "org", "ac", "gov", "edu"];
    let labels: Vec<&str> = domain.split('.').collect();
    let keep = if labels.len() >= 3 && SECOND_LEVELS.contains(&labels[labels.len() - 2]) {
        3
    } else {
        2
    };
    if labels.len() <= keep {
        domain.to_string()
    } else {
        labels[labels.len() - keep..].join(".")
    }
}

/// Human label derived from a sender domain: `account.netflix.com` -> `Netflix`.
pub fn pretty_label(domain: &str) -> String {
    let base = registrable_domain(&strip_mail_prefixes(domain));
    let name = base.split('.').next().unwrap_or(&base);
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Normalize a message body for matching: NBSP to space, tabs/CR removed,
/// space runs collapsed. Newlines survive so line-oriented extraction
/// (platform receipt lines) keeps working.
pub fn normalize_body(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for ch in text.chars() {
        match ch {
            '\u{a0}' | '\t' | ' ' => pending_space = true,
            '\r' => {}
            '\n' => {
                pending_space = false;
                if !out.ends_with("\n\n") {
                    out.push('\n');
                }
            }
            _ => {
                if pending_space && !out.is_empty() && !out.ends_with('\n') {
                    out.push(' ');
                }
                pending_space = false;
                out.push(ch);
            }
        }
    }
    out.trim().to_string()
}

/// Extract unique, lowercased link domains from text and HTML bodies.
/// Capped to keep pathological marketing mails cheap.
pub fn extract_link_domains(text: &str, html: &str, cap: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for source in [text, html] {
        for caps in url_regex().captures_iter(source) {
            if out.len() >= cap {
                return out;
            }
            let host = caps[1]
                .split(':')
                .next()
                .unwrap_or("")
                .trim_start_matches("www.")
                .to_lowercase();
            if !host.is_empty() && host.contains('.') && !out.contains(&host) {
                out.push(host);
            }
        }
    }
    out
}

/// Lowercased haystack for phrase matching: subject, snippet, body.
pub fn build_haystack(subject: &str, snippet: &str, text: &str) -> String {
    let mut haystack = String::with_capacity(subject.len() + snippet.len() + text.len() + 2);
    haystack.push_str(subject);
    haystack.push('\n');
    haystack.push_str(snippet);
    haystack.push('\n');
    haystack.push_str(text);
    haystack.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_domain() {
        assert_eq!(
            email_domain("Netflix <info@account.netflix.com>"),
            Some("account.netflix.com".to_string())
        );
        assert_eq!(email_domain("user@Example.COM"), Some("example.com".to_string()));
        assert_eq!(email_domain("no-address-here"), None);
    }

    #[test]
    fn test_domain_matches_label_boundary() {
        assert!(domain_matches("mail.example.com", "example.com"));
        assert!(domain_matches("example.com", "example.com"));
        assert!(!domain_matches("notexample.com", "example.com"));
    }

    #[test]
    fn test_strip_mail_prefixes() {
        assert_eq!(strip_mail_prefixes("mail.hulu.com"), "hulu.com");
        assert_eq!(strip_mail_prefixes("em.spotify.com"), "spotify.com");
        assert_eq!(strip_mail_prefixes("mail.com"), "mail.com");
        assert_eq!(strip_mail_prefixes("news.mail.figma.com"), "figma.com");
    }

    #[test]
    fn test_pretty_label() {
        assert_eq!(pretty_label("account.netflix.com"), "Netflix");
        assert_eq!(pretty_label("billing.example.co.uk"), "Example");
        assert_eq!(pretty_label("spotify.com"), "Spotify");
    }

    #[test]
    fn test_consumer_and_infra_sets() {
        assert!(is_consumer_domain("gmail.com"));
        assert!(is_consumer_domain("smtp.yahoo.com"));
        assert!(is_infra_domain("u123.ct.sendgrid.net"));
        assert!(!is_infra_domain("netflix.com"));
    }

    #[test]
    fn test_normalize_body() {
        let raw = "You\u{a0}were charged\t $15.49\r\n\r\n\r\non  Nov 12";
        assert_eq!(normalize_body(raw), "You were charged $15.49\n\non Nov 12");
    }

    #[test]
    fn test_extract_link_domains_dedupes_and_caps() {
        let text = "visit https://www.netflix.com/account and https://netflix.com/help";
        let html = r#"<a href="https://assets.nflxext.com/x.png">img</a>"#;
        let domains = extract_link_domains(text, html, 200);
        assert_eq!(domains, vec!["netflix.com", "assets.nflxext.com"]);

        let capped = extract_link_domains(text, html, 1);
        assert_eq!(capped.len(), 1);
    }
}
