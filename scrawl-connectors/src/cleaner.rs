//! Text cleaning contract and the built-in rule cleaner
//!
//! Cleaning is deterministic and local: the same input and options always
//! produce the same output, which is what keeps the clean stage idempotent.

use crate::entities::CleaningOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Correction categories reported by a cleaner
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrectionKind {
    Spelling,
    Artifact,
    Spacing,
}

/// Cleaned text plus correction counts by category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanOutcome {
    pub text: String,
    pub corrections: BTreeMap<CorrectionKind, u32>,
}

/// Deterministic text cleaner
pub trait Cleaner: Send + Sync {
    /// Clean one snippet
    fn clean(&self, text: &str, options: &CleaningOptions) -> CleanOutcome;
}

/// Rule-based cleaner: artifact stripping, spacing normalization, and a
/// small substitution table for common OCR confusions
pub struct RuleCleaner {
    substitutions: Vec<(&'static str, &'static str)>,
}

impl RuleCleaner {
    /// Create a cleaner with the default substitution table
    pub fn new() -> Self {
        Self {
            // Frequent handwriting OCR confusions, checked word-wise
            substitutions: vec![
                ("teh", "the"),
                ("adn", "and"),
                ("wiht", "with"),
                ("taht", "that"),
                ("hte", "the"),
                ("recieve", "receive"),
                ("seperate", "separate"),
                ("definately", "definitely"),
            ],
        }
    }

    fn is_artifact(word: &str) -> bool {
        // Stray non-alphanumeric runs the OCR engine tends to emit on
        // smudges and sticky-note edges
        !word.is_empty() && word.chars().all(|c| !c.is_alphanumeric())
    }
}

impl Default for RuleCleaner {
    fn default() -> Self {
        Self::new()
    }
}

impl Cleaner for RuleCleaner {
    fn clean(&self, text: &str, options: &CleaningOptions) -> CleanOutcome {
        let mut corrections: BTreeMap<CorrectionKind, u32> = BTreeMap::new();
        let mut words: Vec<String> = Vec::new();

        for raw in text.split_whitespace() {
            let mut word = raw.to_string();

            if options.remove_artifacts && Self::is_artifact(&word) {
                *corrections.entry(CorrectionKind::Artifact).or_insert(0) += 1;
                continue;
            }

            if options.spell_check {
                let lower = word.to_lowercase();
                if let Some((_, fixed)) = self
                    .substitutions
                    .iter()
                    .find(|(wrong, _)| *wrong == lower.as_str())
                {
                    word = if word.chars().next().is_some_and(|c| c.is_uppercase()) {
                        let mut chars = fixed.chars();
                        match chars.next() {
                            Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                            None => fixed.to_string(),
                        }
                    } else {
                        fixed.to_string()
                    };
                    *corrections.entry(CorrectionKind::Spelling).or_insert(0) += 1;
                }
            }

            words.push(word);
        }

        let cleaned = if options.normalize_spacing {
            let joined = words.join(" ");
            if joined != text {
                *corrections.entry(CorrectionKind::Spacing).or_insert(0) += 1;
            }
            joined
        } else {
            // Preserve original spacing but with artifact words removed
            if corrections.contains_key(&CorrectionKind::Artifact)
                || corrections.contains_key(&CorrectionKind::Spelling)
            {
                words.join(" ")
            } else {
                text.to_string()
            }
        };

        CleanOutcome {
            text: cleaned,
            corrections,
        }
    }
}
