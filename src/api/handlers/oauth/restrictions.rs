//! Identifier allow/block policy applied before any federation side effect.

use regex::Regex;
use std::collections::HashSet;

/// Why an identifier was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestrictionViolation {
    NotAllowlisted,
    Blocklisted,
    DisposableDomain,
    Subaddress,
    Malformed,
}

impl RestrictionViolation {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotAllowlisted => "not_allowlisted",
            Self::Blocklisted => "blocklisted",
            Self::DisposableDomain => "disposable_domain",
            Self::Subaddress => "subaddress",
            Self::Malformed => "malformed",
        }
    }
}

/// Restriction settings. Entries are full addresses (`jane@example.com`),
/// bare domains (`example.com`) or wildcard domains (`*@example.com`).
#[derive(Debug, Clone, Default)]
pub struct Restrictions {
    allowlist: Vec<String>,
    blocklist: Vec<String>,
    block_disposable_domains: bool,
    disposable_domains: HashSet<String>,
    block_subaddresses: bool,
}

/// Basic email format check on already-normalized input.
fn valid_email(email_normalized: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email_normalized))
}

fn normalize_entry(entry: &str) -> String {
    let entry = entry.trim().to_lowercase();
    match entry.strip_prefix("*@") {
        Some(domain) => domain.to_string(),
        None => entry,
    }
}

impl Restrictions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_allowlist(mut self, entries: Vec<String>) -> Self {
        self.allowlist = entries.iter().map(|entry| normalize_entry(entry)).collect();
        self
    }

    #[must_use]
    pub fn with_blocklist(mut self, entries: Vec<String>) -> Self {
        self.blocklist = entries.iter().map(|entry| normalize_entry(entry)).collect();
        self
    }

    #[must_use]
    pub fn with_disposable_domains(mut self, domains: Vec<String>) -> Self {
        self.block_disposable_domains = true;
        self.disposable_domains = domains.iter().map(|d| d.trim().to_lowercase()).collect();
        self
    }

    #[must_use]
    pub fn with_block_subaddresses(mut self, block: bool) -> Self {
        self.block_subaddresses = block;
        self
    }

    /// Check an email address against the configured policy.
    ///
    /// # Errors
    /// Returns the first violated rule, checked in allowlist, blocklist,
    /// disposable, subaddress order.
    pub fn check_email(&self, email: &str) -> Result<(), RestrictionViolation> {
        let email = email.trim().to_lowercase();
        if !valid_email(&email) {
            return Err(RestrictionViolation::Malformed);
        }
        let Some((local, domain)) = email.split_once('@') else {
            return Err(RestrictionViolation::Malformed);
        };

        let matches = |entry: &String| entry == &email || entry == domain;

        if !self.allowlist.is_empty() && !self.allowlist.iter().any(matches) {
            return Err(RestrictionViolation::NotAllowlisted);
        }
        if self.blocklist.iter().any(matches) {
            return Err(RestrictionViolation::Blocklisted);
        }
        if self.block_disposable_domains && self.disposable_domains.contains(domain) {
            return Err(RestrictionViolation::DisposableDomain);
        }
        if self.block_subaddresses && local.contains('+') {
            return Err(RestrictionViolation::Subaddress);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_policy_allows_everything() {
        assert!(Restrictions::new().check_email("jane@example.com").is_ok());
    }

    #[test]
    fn allowlist_matches_address_or_domain() {
        let restrictions = Restrictions::new().with_allowlist(vec![
            "*@corp.example".to_string(),
            "guest@partner.example".to_string(),
        ]);
        assert!(restrictions.check_email("Jane@Corp.Example").is_ok());
        assert!(restrictions.check_email("guest@partner.example").is_ok());
        assert_eq!(
            restrictions.check_email("other@partner.example"),
            Err(RestrictionViolation::NotAllowlisted)
        );
    }

    #[test]
    fn blocklist_wins_over_defaults() {
        let restrictions = Restrictions::new().with_blocklist(vec!["spam.example".to_string()]);
        assert_eq!(
            restrictions.check_email("x@spam.example"),
            Err(RestrictionViolation::Blocklisted)
        );
        assert!(restrictions.check_email("x@ham.example").is_ok());
    }

    #[test]
    fn disposable_and_subaddress_rules() {
        let restrictions = Restrictions::new()
            .with_disposable_domains(vec!["mailinator.com".to_string()])
            .with_block_subaddresses(true);
        assert_eq!(
            restrictions.check_email("a@mailinator.com"),
            Err(RestrictionViolation::DisposableDomain)
        );
        assert_eq!(
            restrictions.check_email("a+tag@example.com"),
            Err(RestrictionViolation::Subaddress)
        );
    }

    #[test]
    fn malformed_addresses_are_refused() {
        let restrictions = Restrictions::new();
        assert_eq!(
            restrictions.check_email("no-at-sign"),
            Err(RestrictionViolation::Malformed)
        );
        assert_eq!(
            restrictions.check_email("@example.com"),
            Err(RestrictionViolation::Malformed)
        );
        for email in ["jane doe@example.com", "jane@localhost", "a@b@c", "jane@example."] {
            assert_eq!(
                restrictions.check_email(email),
                Err(RestrictionViolation::Malformed),
                "{email}"
            );
        }
    }
}
