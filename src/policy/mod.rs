pub mod condition;
pub mod document;
pub mod errors;
pub mod loader;
pub mod query;
pub mod types;

use serde_json::Value;
use std::collections::HashMap;
use types::CompiledRule;

/// Fully compiled policy, loaded from a single module or a bundle.
/// Immutable after construction; configuration changes require a new gate.
#[derive(Debug, Default)]
pub struct CompiledPolicy {
    /// package name -> rule name -> all bodies of that rule
    pub packages: HashMap<String, HashMap<String, CompiledRule>>,
    /// Merged data documents, always a JSON object
    pub data: Value,
    /// Number of modules that contributed to this policy
    pub module_count: usize,
}

impl CompiledPolicy {
    pub fn rule(&self, package: &str, rule: &str) -> Option<&CompiledRule> {
        self.packages.get(package)?.get(rule)
    }

    pub fn rule_count(&self) -> usize {
        self.packages.values().map(|rules| rules.len()).sum()
    }
}
