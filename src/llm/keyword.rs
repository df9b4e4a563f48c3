//! Deterministic keyword categorizer.
//!
//! First matching rule wins; no match → `"Other"`. Used in test mode so a
//! full run never reaches the network.

use async_trait::async_trait;
use regex::Regex;

use crate::config::FALLBACK_CATEGORY;
use crate::error::CollaboratorError;
use crate::llm::{Categorization, Categorizer};
use crate::pipeline::types::EmailRecord;

/// Which field a rule matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleField {
    Sender,
    Subject,
    /// Subject or body.
    Text,
}

#[derive(Debug, Clone)]
pub struct KeywordRule {
    pub regex: Regex,
    pub field: RuleField,
    pub category: String,
}

impl KeywordRule {
    fn matches(&self, email: &EmailRecord) -> bool {
        match self.field {
            RuleField::Sender => self.regex.is_match(&email.sender),
            RuleField::Subject => self.regex.is_match(&email.subject),
            RuleField::Text => {
                self.regex.is_match(&email.subject) || self.regex.is_match(&email.content)
            }
        }
    }
}

const DEFAULT_RULES: &[(&str, RuleField, &str)] = &[
    (r"(?i)\b(invoice|bill|payment due|statement)\b", RuleField::Subject, "Bills"),
    (
        r"(?i)\b(action required|please respond|urgent|asap)\b",
        RuleField::Text,
        "Response Needed / High Priority",
    ),
    (r"(?i)\bnewsletter\b", RuleField::Subject, "Newsletters"),
    (r"(?i)^(news|newsletter|digest)@", RuleField::Sender, "Newsletters"),
    (r"(?i)\b(shipped|delivered|tracking)\b", RuleField::Subject, "Notifications"),
    (r"(?i)\breceipt\b", RuleField::Subject, "Receipts"),
    (r"(?i)\b(flight|itinerary|booking|hotel)\b", RuleField::Subject, "Travel"),
    (r"(?i)(\bsale\b|\bdiscount\b|% off|\bpromo)", RuleField::Text, "Marketing"),
    (r"(?i)\b(lunch|dinner|birthday|party)\b", RuleField::Subject, "Personal"),
];

#[derive(Debug, Clone, Default)]
pub struct KeywordCategorizer {
    rules: Vec<KeywordRule>,
}

impl KeywordCategorizer {
    /// Rules covering the common inbox categories.
    pub fn default_rules() -> Result<Self, regex::Error> {
        let mut categorizer = Self::empty();
        for (pattern, field, category) in DEFAULT_RULES {
            categorizer.add_rule(pattern, *field, category)?;
        }
        Ok(categorizer)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn add_rule(
        &mut self,
        pattern: &str,
        field: RuleField,
        category: &str,
    ) -> Result<(), regex::Error> {
        self.rules.push(KeywordRule {
            regex: Regex::new(pattern)?,
            field,
            category: category.to_string(),
        });
        Ok(())
    }

    pub fn classify(&self, email: &EmailRecord) -> Categorization {
        match self.rules.iter().find(|rule| rule.matches(email)) {
            Some(rule) => Categorization {
                category: rule.category.clone(),
                rationale: Some(format!("matched /{}/", rule.regex.as_str())),
                confidence: Some(1.0),
            },
            None => Categorization {
                category: FALLBACK_CATEGORY.to_string(),
                rationale: Some("no keyword rule matched".into()),
                confidence: None,
            },
        }
    }
}

#[async_trait]
impl Categorizer for KeywordCategorizer {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn categorize(&self, email: &EmailRecord) -> Result<Categorization, CollaboratorError> {
        Ok(self.classify(email))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::memory::fixture_emails;

    #[test]
    fn fixture_categories() {
        let categorizer = KeywordCategorizer::default_rules().unwrap();
        let categories: Vec<String> = fixture_emails()
            .iter()
            .map(|e| categorizer.classify(e).category)
            .collect();
        assert_eq!(
            categories,
            vec![
                "Bills",
                "Personal",
                "Newsletters",
                "Notifications",
                "Response Needed / High Priority",
            ]
        );
    }

    #[test]
    fn unmatched_falls_to_other() {
        let categorizer = KeywordCategorizer::default_rules().unwrap();
        let email = EmailRecord::new("x", "Quarterly plans", "boss@work.test", "See doc.");
        let result = categorizer.classify(&email);
        assert_eq!(result.category, "Other");
        assert!(result.confidence.is_none());
    }

    #[test]
    fn custom_rules_take_their_place_in_order() {
        let mut categorizer = KeywordCategorizer::empty();
        categorizer
            .add_rule(r"(?i)standup", RuleField::Subject, "Work")
            .unwrap();
        assert!(categorizer.add_rule("(unclosed", RuleField::Subject, "X").is_err());
        let email = EmailRecord::new("x", "Daily standup notes", "a@b.test", "");
        assert_eq!(categorizer.classify(&email).category, "Work");
    }
}
