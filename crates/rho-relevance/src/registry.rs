//! String-keyed rule registry.
//!
//! Assignments may refer to rules by name; names resolve here at dispatch
//! time, so an unknown name only surfaces when a kernel node actually
//! asks for it. Lookups are case-sensitive.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use rho_core::{Result, RhoError};

use crate::rules::RuleKind;

static RULES: Lazy<BTreeMap<&'static str, RuleKind>> = Lazy::new(|| {
    BTreeMap::from([
        ("Z", RuleKind::Z),
        ("Epsilon", RuleKind::epsilon()),
        // Short alias for Epsilon.
        ("E", RuleKind::epsilon()),
        ("WSquare", RuleKind::WSquare),
        ("Flat", RuleKind::Flat),
        ("A1B1", RuleKind::alpha1_beta1()),
        ("Boxed", RuleKind::Boxed { low: -1.0, high: 1.0 }),
    ])
});

/// Resolve a rule name to its parameterized kind.
pub fn lookup(name: &str) -> Result<RuleKind> {
    RULES
        .get(name)
        .copied()
        .ok_or_else(|| RhoError::UnknownRule(name.to_string()))
}

/// Registered rule names, sorted.
pub fn names() -> Vec<&'static str> {
    RULES.keys().copied().collect()
}
