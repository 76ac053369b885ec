//! Rule matching
//!
//! A stable filter over the caller's rule order: every active rule whose
//! subject filter occurs (case-insensitively) in the email subject is
//! returned, so one email can fan out to several destinations.

use crate::data::ForwardingRule;
use crate::mail::Email;

/// Return every rule that matches `email`, in input order.
pub fn match_rules<'r>(email: &Email, rules: &'r [ForwardingRule]) -> Vec<&'r ForwardingRule> {
    let subject = email.subject.to_lowercase();
    rules
        .iter()
        .filter(|rule| rule_matches(rule, &subject))
        .collect()
}

/// Match one rule against an already-lowercased subject.
///
/// A blank filter never matches; rules are validated on write, so this
/// only guards against rows edited outside the API.
fn rule_matches(rule: &ForwardingRule, lowercase_subject: &str) -> bool {
    if !rule.is_active || rule.subject_filter.trim().is_empty() {
        return false;
    }
    lowercase_subject.contains(&rule.subject_filter.to_lowercase())
}
