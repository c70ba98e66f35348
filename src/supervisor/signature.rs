//! Defect signatures for repeated-defect detection.
//!
//! Two defects are "the same" when their signatures are equal. What counts
//! as equal is deployment policy, so it is a strategy rather than a fixed
//! rule.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::collaborators::Defect;

/// Computes the identity of a defect for repeat counting.
pub trait SignatureStrategy: Send + Sync + std::fmt::Debug {
    fn signature(&self, defect: &Defect) -> String;
}

/// Category plus raw message text.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactSignature;

impl SignatureStrategy for ExactSignature {
    fn signature(&self, defect: &Defect) -> String {
        format!("{}:{}", defect.category, defect.message)
    }
}

/// Category plus message with volatile parts masked, hashed.
///
/// Masks hex addresses, quoted literals and numbers, lower-cases and
/// collapses whitespace, so "timeout after 3012ms" and "Timeout after
/// 2990ms" collide.
#[derive(Debug, Clone)]
pub struct NormalizedSignature {
    masks: Vec<(Regex, &'static str)>,
}

const MASKS: &[(&str, &str)] = &[
    (r"0x[0-9a-f]+", "<hex>"),
    (r#""[^"]*"|'[^']*'"#, "<str>"),
    (r"\d+", "<n>"),
    (r"\s+", " "),
];

impl Default for NormalizedSignature {
    fn default() -> Self {
        Self {
            masks: MASKS
                .iter()
                .filter_map(|(pattern, replacement)| {
                    Regex::new(pattern).ok().map(|re| (re, *replacement))
                })
                .collect(),
        }
    }
}

impl NormalizedSignature {
    /// Normalized message text before hashing.
    pub fn normalize(&self, message: &str) -> String {
        let mut text = message.to_lowercase();
        for (re, replacement) in &self.masks {
            text = re.replace_all(&text, *replacement).into_owned();
        }
        text.trim().to_string()
    }
}

impl SignatureStrategy for NormalizedSignature {
    fn signature(&self, defect: &Defect) -> String {
        let mut hasher = Sha256::new();
        hasher.update(defect.category.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(self.normalize(&defect.message).as_bytes());
        hex::encode(&hasher.finalize()[..8])
    }
}

/// Configurable choice of [`SignatureStrategy`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureMode {
    #[default]
    Exact,
    Normalized,
}

impl SignatureMode {
    pub fn strategy(self) -> Box<dyn SignatureStrategy> {
        match self {
            Self::Exact => Box::new(ExactSignature),
            Self::Normalized => Box::new(NormalizedSignature::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::DefectCategory;

    #[test]
    fn test_exact_signature_distinguishes_messages() {
        let a = Defect::new(DefectCategory::Runtime, "timeout after 3012ms");
        let b = Defect::new(DefectCategory::Runtime, "timeout after 2990ms");
        assert_ne!(ExactSignature.signature(&a), ExactSignature.signature(&b));
        assert_eq!(ExactSignature.signature(&a), ExactSignature.signature(&a.clone()));
    }

    #[test]
    fn test_exact_signature_includes_category() {
        let a = Defect::new(DefectCategory::Runtime, "boom");
        let b = Defect::new(DefectCategory::Network, "boom");
        assert_ne!(ExactSignature.signature(&a), ExactSignature.signature(&b));
    }

    #[test]
    fn test_normalized_signature_masks_volatile_parts() {
        let strategy = NormalizedSignature::default();
        let a = Defect::new(DefectCategory::Runtime, "Timeout after 3012ms at 0x7ffd1234");
        let b = Defect::new(DefectCategory::Runtime, "timeout   after 2990ms at 0xdeadbeef");
        assert_eq!(strategy.signature(&a), strategy.signature(&b));

        let c = Defect::new(DefectCategory::Runtime, "Cannot read property 'id' of undefined");
        let d = Defect::new(DefectCategory::Runtime, "Cannot read property 'name' of undefined");
        assert_eq!(strategy.signature(&c), strategy.signature(&d));
        assert_ne!(strategy.signature(&a), strategy.signature(&c));
    }

    #[test]
    fn test_normalize_text() {
        let strategy = NormalizedSignature::default();
        assert_eq!(
            strategy.normalize("GET /api/tickets/42 returned \"500\""),
            "get /api/tickets/<n> returned <str>"
        );
    }

    #[test]
    fn test_signature_mode_strategy() {
        let defect = Defect::new(DefectCategory::Markup, "missing alt on img 3");
        assert_eq!(
            SignatureMode::Exact.strategy().signature(&defect),
            "markup:missing alt on img 3"
        );
        assert_eq!(SignatureMode::Normalized.strategy().signature(&defect).len(), 16);
        assert_eq!(SignatureMode::default(), SignatureMode::Exact);
    }
}
