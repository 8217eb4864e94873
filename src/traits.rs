//! Behavioral trait registry.
//!
//! The taxonomy is a fixed, ordered set of trait codes. Every posterior is a
//! vector indexed by position in this registry, so the code→index map is
//! built once and item loadings are resolved through it on every kernel
//! call. Codes are opaque short strings at the boundary (`"T1"`–`"T12"`);
//! everything inside the engine works on indices.

use std::collections::HashMap;

/// The standard twelve-trait taxonomy for LLM profiling.
pub const STANDARD_TRAITS: &[(&str, &str)] = &[
    ("T1", "Analytic Accuracy"),
    ("T2", "Reasoning Stability"),
    ("T3", "Instruction and Format Control"),
    ("T4", "Epistemic Calibration"),
    ("T5", "Intent Understanding"),
    ("T6", "Grounded Truthfulness"),
    ("T7", "Consistency and Drift Resistance"),
    ("T8", "Refusal Correctness"),
    ("T9", "Jailbreak Robustness"),
    ("T10", "Safe Helpfulness"),
    ("T11", "Paraphrase and OOD Invariance"),
    ("T12", "Tool Discipline"),
];

/// Default critical subset: the traits the stopping policy demands
/// converged estimates for.
pub const DEFAULT_CRITICAL_TRAITS: &[&str] = &["T4", "T5", "T8", "T9", "T10"];

/// Fixed ordered set of trait codes with a precomputed code→index map.
#[derive(Debug, Clone)]
pub struct TraitRegistry {
    codes: Vec<String>,
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl TraitRegistry {
    /// Build a registry from (code, display name) pairs.
    pub fn new(traits: &[(&str, &str)]) -> Self {
        let codes: Vec<String> = traits.iter().map(|(c, _)| (*c).to_string()).collect();
        let names: Vec<String> = traits.iter().map(|(_, n)| (*n).to_string()).collect();
        let index = codes
            .iter()
            .enumerate()
            .map(|(i, c)| (c.clone(), i))
            .collect();
        Self {
            codes,
            names,
            index,
        }
    }

    /// The standard twelve-trait registry.
    pub fn standard() -> Self {
        Self::new(STANDARD_TRAITS)
    }

    /// Number of traits in the registry.
    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Ordered trait codes.
    pub fn codes(&self) -> &[String] {
        &self.codes
    }

    /// Position of a trait code, if registered.
    ///
    /// Loadings on codes absent from the registry are ignored by the
    /// kernel, so a `None` here is not an error.
    pub fn index_of(&self, code: &str) -> Option<usize> {
        self.index.get(code).copied()
    }

    /// Code at a registry position.
    pub fn code_at(&self, idx: usize) -> &str {
        &self.codes[idx]
    }

    /// Display name for a trait code, if registered.
    pub fn name_of(&self, code: &str) -> Option<&str> {
        self.index_of(code).map(|i| self.names[i].as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_has_twelve_traits() {
        let reg = TraitRegistry::standard();
        assert_eq!(reg.len(), 12);
        assert_eq!(reg.code_at(0), "T1");
        assert_eq!(reg.code_at(11), "T12");
    }

    #[test]
    fn index_lookup_matches_order() {
        let reg = TraitRegistry::standard();
        for (i, code) in reg.codes().iter().enumerate() {
            assert_eq!(reg.index_of(code), Some(i));
        }
        assert_eq!(reg.index_of("T99"), None);
    }

    #[test]
    fn default_critical_traits_are_registered() {
        let reg = TraitRegistry::standard();
        for code in DEFAULT_CRITICAL_TRAITS {
            assert!(reg.index_of(code).is_some(), "{code} missing from registry");
        }
    }

    #[test]
    fn names_resolve() {
        let reg = TraitRegistry::standard();
        assert_eq!(reg.name_of("T4"), Some("Epistemic Calibration"));
        assert_eq!(reg.name_of("T13"), None);
    }
}
