//! Catalog key resolution when several servers advertise the same tool name.

use serde::{Deserialize, Serialize};

/// Configuration tag selecting a [`ConflictStrategy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategyKind {
    UseOriginalName,
    #[default]
    PrefixClientName,
    SuffixClientName,
    AutoIncrement,
}

impl ConflictStrategyKind {
    pub fn build(self) -> Box<dyn ConflictStrategy> {
        match self {
            ConflictStrategyKind::UseOriginalName => Box::new(UseOriginalName),
            ConflictStrategyKind::PrefixClientName => Box::new(PrefixClientName),
            ConflictStrategyKind::SuffixClientName => Box::new(SuffixClientName),
            ConflictStrategyKind::AutoIncrement => Box::new(AutoIncrement),
        }
    }
}

/// Produces the catalog key for a tool. `is_taken` reports whether a key is
/// already registered; strategies that do not search for a free key ignore it
/// and let the registry report the conflict.
pub trait ConflictStrategy: Send + Sync {
    fn kind(&self) -> ConflictStrategyKind;

    fn resolve(&self, client: &str, tool: &str, is_taken: &dyn Fn(&str) -> bool) -> String;
}

pub struct UseOriginalName;

impl ConflictStrategy for UseOriginalName {
    fn kind(&self) -> ConflictStrategyKind {
        ConflictStrategyKind::UseOriginalName
    }

    fn resolve(&self, _client: &str, tool: &str, _is_taken: &dyn Fn(&str) -> bool) -> String {
        tool.to_string()
    }
}

pub struct PrefixClientName;

impl ConflictStrategy for PrefixClientName {
    fn kind(&self) -> ConflictStrategyKind {
        ConflictStrategyKind::PrefixClientName
    }

    fn resolve(&self, client: &str, tool: &str, _is_taken: &dyn Fn(&str) -> bool) -> String {
        if client.is_empty() {
            tool.to_string()
        } else {
            format!("{client}_{tool}")
        }
    }
}

pub struct SuffixClientName;

impl ConflictStrategy for SuffixClientName {
    fn kind(&self) -> ConflictStrategyKind {
        ConflictStrategyKind::SuffixClientName
    }

    fn resolve(&self, client: &str, tool: &str, _is_taken: &dyn Fn(&str) -> bool) -> String {
        if client.is_empty() {
            tool.to_string()
        } else {
            format!("{tool}_{client}")
        }
    }
}

/// `search`, then `search_1`, `search_2`, ... until a free key is found.
pub struct AutoIncrement;

impl ConflictStrategy for AutoIncrement {
    fn kind(&self) -> ConflictStrategyKind {
        ConflictStrategyKind::AutoIncrement
    }

    fn resolve(&self, _client: &str, tool: &str, is_taken: &dyn Fn(&str) -> bool) -> String {
        if !is_taken(tool) {
            return tool.to_string();
        }
        let mut counter = 1u32;
        loop {
            let candidate = format!("{tool}_{counter}");
            if !is_taken(&candidate) {
                return candidate;
            }
            counter += 1;
        }
    }
}
