//! Layered permission checks for MCP tools.
//!
//! Evaluation order, first decision wins: custom rules by descending priority,
//! the policy set for the tool's catalog key, the policy set for the owning
//! client, then the default policy. Results are cached per principal and tool.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::tool::RemoteTool;

/// Trust level at or above which a principal counts as an operator.
pub const OP_LEVEL: u8 = 2;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);
const CLEANUP_EVERY: u64 = 100;

/// Caller identity supplied by the host.
pub trait Principal: Send + Sync {
    fn id(&self) -> &str;

    fn permission_level(&self) -> u8;

    fn display_name(&self) -> &str {
        self.id()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticPrincipal {
    pub id: String,
    pub level: u8,
}

impl StaticPrincipal {
    pub fn new(id: impl Into<String>, level: u8) -> Self {
        Self {
            id: id.into(),
            level,
        }
    }
}

impl Principal for StaticPrincipal {
    fn id(&self) -> &str {
        &self.id
    }

    fn permission_level(&self) -> u8 {
        self.level
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionPolicy {
    AllowAll,
    DenyAll,
    /// Principal level must be at least [`OP_LEVEL`].
    OpOnly,
    /// Only rules decide; reaching this policy denies.
    Custom,
}

impl PermissionPolicy {
    /// Accepts `ALLOW_ALL`, `allow-all`, `allow_all` and friends.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let normalized = tag.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "allow_all" => Some(PermissionPolicy::AllowAll),
            "deny_all" => Some(PermissionPolicy::DenyAll),
            "op_only" => Some(PermissionPolicy::OpOnly),
            "custom" => Some(PermissionPolicy::Custom),
            _ => None,
        }
    }

    pub fn permits(self, principal: &dyn Principal) -> bool {
        match self {
            PermissionPolicy::AllowAll => true,
            PermissionPolicy::DenyAll => false,
            PermissionPolicy::OpOnly => principal.permission_level() >= OP_LEVEL,
            PermissionPolicy::Custom => false,
        }
    }
}

/// A custom rule. Rules are consulted only when [`applies_to`] matches;
/// an `Err` from [`evaluate`] denies.
///
/// [`applies_to`]: PermissionRule::applies_to
/// [`evaluate`]: PermissionRule::evaluate
pub trait PermissionRule: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn priority(&self) -> i32;

    fn applies_to(&self, principal: &dyn Principal, tool: &RemoteTool) -> bool;

    fn evaluate(&self, principal: &dyn Principal, tool: &RemoteTool) -> Result<bool, String>;
}

/// Matches tools by server-side name and/or client name with full-match
/// regular expressions and requires a minimum trust level.
#[derive(Debug, Clone)]
pub struct PatternRule {
    name: String,
    description: String,
    priority: i32,
    tool_pattern: Option<Regex>,
    client_pattern: Option<Regex>,
    min_level: u8,
}

impl PatternRule {
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            priority,
            tool_pattern: None,
            client_pattern: None,
            min_level: OP_LEVEL,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn tool_pattern(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.tool_pattern = Some(full_match(pattern)?);
        Ok(self)
    }

    pub fn client_pattern(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.client_pattern = Some(full_match(pattern)?);
        Ok(self)
    }

    pub fn min_level(mut self, level: u8) -> Self {
        self.min_level = level;
        self
    }
}

fn full_match(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})$"))
}

impl PermissionRule for PatternRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn applies_to(&self, _principal: &dyn Principal, tool: &RemoteTool) -> bool {
        let tool_matches = self
            .tool_pattern
            .as_ref()
            .is_none_or(|pattern| pattern.is_match(&tool.name));
        let client_matches = self
            .client_pattern
            .as_ref()
            .is_none_or(|pattern| pattern.is_match(&tool.client_name));
        tool_matches && client_matches
    }

    fn evaluate(&self, principal: &dyn Principal, _tool: &RemoteTool) -> Result<bool, String> {
        Ok(principal.permission_level() >= self.min_level)
    }
}

/// Operator-only rules for tools whose names suggest administration,
/// process execution or file access.
pub fn administrative_rules() -> Vec<PatternRule> {
    let seeds = [
        (
            "admin_tools",
            100,
            r"(?i).*(?:admin|manage|delete|remove|destroy|kill).*",
            "administrative and destructive tools require operator level",
        ),
        (
            "dangerous_tools",
            90,
            r"(?i).*(?:execute|command|shell|script|system).*",
            "process execution tools require operator level",
        ),
        (
            "file_tools",
            80,
            r"(?i).*(?:file|write|read|upload|download).*",
            "file access tools require operator level",
        ),
    ];
    seeds
        .into_iter()
        .filter_map(|(name, priority, pattern, description)| {
            PatternRule::new(name, priority)
                .describe(description)
                .tool_pattern(pattern)
                .ok()
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionStatistics {
    pub default_policy: PermissionPolicy,
    pub strict_mode: bool,
    pub tool_policies: usize,
    pub client_policies: usize,
    pub rules: usize,
    pub cache_entries: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

struct PolicyState {
    default_policy: PermissionPolicy,
    tool_policies: HashMap<String, PermissionPolicy>,
    client_policies: HashMap<String, PermissionPolicy>,
    rules: Vec<Arc<dyn PermissionRule>>,
}

struct CacheEntry {
    allowed: bool,
    stored_at: Instant,
    tool: String,
    client: String,
}

#[derive(Default)]
struct PermissionCache {
    entries: HashMap<String, CacheEntry>,
    insertions: u64,
}

pub struct PermissionEngine {
    state: RwLock<PolicyState>,
    cache: Mutex<PermissionCache>,
    cache_ttl: Duration,
    strict: AtomicBool,
    /// Bumped on every cache clear; decisions evaluated under an older
    /// generation are not stored.
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for PermissionEngine {
    fn default() -> Self {
        Self::new(PermissionPolicy::AllowAll)
    }
}

impl PermissionEngine {
    pub fn new(default_policy: PermissionPolicy) -> Self {
        Self::with_cache_ttl(default_policy, DEFAULT_CACHE_TTL)
    }

    pub fn with_cache_ttl(default_policy: PermissionPolicy, cache_ttl: Duration) -> Self {
        Self {
            state: RwLock::new(PolicyState {
                default_policy,
                tool_policies: HashMap::new(),
                client_policies: HashMap::new(),
                rules: Vec::new(),
            }),
            cache: Mutex::new(PermissionCache::default()),
            cache_ttl,
            strict: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, PolicyState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, PolicyState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_cache(&self) -> MutexGuard<'_, PermissionCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn check(&self, principal: &dyn Principal, tool: &RemoteTool) -> bool {
        let key = cache_key(principal.id(), &tool.full_name);
        if let Some(allowed) = self.cached(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return allowed;
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let generation = self.generation.load(Ordering::SeqCst);
        let allowed = self.evaluate(principal, tool);
        debug!(
            principal = %principal.id(),
            tool = %tool.full_name,
            allowed,
            "Evaluated MCP tool permission"
        );
        self.store(key, allowed, tool, generation);
        allowed
    }

    fn evaluate(&self, principal: &dyn Principal, tool: &RemoteTool) -> bool {
        let state = self.read_state();

        for rule in &state.rules {
            if !rule.applies_to(principal, tool) {
                continue;
            }
            return match rule.evaluate(principal, tool) {
                Ok(allowed) => allowed,
                Err(err) => {
                    warn!(rule = %rule.name(), tool = %tool.full_name, error = %err, "Permission rule failed; denying");
                    false
                }
            };
        }

        if let Some(policy) = state.tool_policies.get(&tool.full_name) {
            return policy.permits(principal);
        }
        if let Some(policy) = state.client_policies.get(&tool.client_name) {
            return policy.permits(principal);
        }

        let default_policy = match state.default_policy {
            PermissionPolicy::AllowAll if self.strict.load(Ordering::SeqCst) => {
                PermissionPolicy::DenyAll
            }
            policy => policy,
        };
        default_policy.permits(principal)
    }

    fn cached(&self, key: &str) -> Option<bool> {
        let mut cache = self.lock_cache();
        let entry = cache.entries.get(key)?;
        if entry.stored_at.elapsed() < self.cache_ttl {
            return Some(entry.allowed);
        }
        cache.entries.remove(key);
        None
    }

    fn store(&self, key: String, allowed: bool, tool: &RemoteTool, generation: u64) {
        let mut cache = self.lock_cache();
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(tool = %tool.full_name, "Permission cache cleared during evaluation; not caching");
            return;
        }
        cache.entries.insert(
            key,
            CacheEntry {
                allowed,
                stored_at: Instant::now(),
                tool: tool.full_name.clone(),
                client: tool.client_name.clone(),
            },
        );
        cache.insertions += 1;
        if cache.insertions % CLEANUP_EVERY == 0 {
            let ttl = self.cache_ttl;
            cache
                .entries
                .retain(|_, entry| entry.stored_at.elapsed() < ttl);
        }
    }

    pub fn set_default_policy(&self, policy: PermissionPolicy) {
        self.write_state().default_policy = policy;
        self.clear_cache();
    }

    pub fn default_policy(&self) -> PermissionPolicy {
        self.read_state().default_policy
    }

    pub fn set_strict_mode(&self, strict: bool) {
        self.strict.store(strict, Ordering::SeqCst);
        self.clear_cache();
    }

    pub fn is_strict(&self) -> bool {
        self.strict.load(Ordering::SeqCst)
    }

    pub fn set_tool_policy(&self, tool_full_name: &str, policy: PermissionPolicy) {
        self.write_state()
            .tool_policies
            .insert(tool_full_name.to_string(), policy);
        self.clear_cache();
    }

    pub fn remove_tool_policy(&self, tool_full_name: &str) -> Option<PermissionPolicy> {
        let removed = self.write_state().tool_policies.remove(tool_full_name);
        self.clear_cache();
        removed
    }

    pub fn set_client_policy(&self, client: &str, policy: PermissionPolicy) {
        self.write_state()
            .client_policies
            .insert(client.to_string(), policy);
        self.clear_cache();
    }

    pub fn remove_client_policy(&self, client: &str) -> Option<PermissionPolicy> {
        let removed = self.write_state().client_policies.remove(client);
        self.clear_cache();
        removed
    }

    /// Rules with equal priority keep insertion order.
    pub fn add_rule(&self, rule: Arc<dyn PermissionRule>) {
        {
            let mut state = self.write_state();
            state.rules.push(rule);
            state
                .rules
                .sort_by_key(|rule| std::cmp::Reverse(rule.priority()));
        }
        self.clear_cache();
    }

    pub fn remove_rule(&self, name: &str) -> bool {
        let removed = {
            let mut state = self.write_state();
            let before = state.rules.len();
            state.rules.retain(|rule| rule.name() != name);
            state.rules.len() != before
        };
        if removed {
            self.clear_cache();
        }
        removed
    }

    pub fn rule_names(&self) -> Vec<String> {
        self.read_state()
            .rules
            .iter()
            .map(|rule| rule.name().to_string())
            .collect()
    }

    /// Locks the cache and invalidates in-flight evaluations.
    fn invalidate(&self) -> MutexGuard<'_, PermissionCache> {
        let cache = self.lock_cache();
        self.generation.fetch_add(1, Ordering::SeqCst);
        cache
    }

    pub fn clear_cache(&self) {
        self.invalidate().entries.clear();
    }

    pub fn clear_tool_cache(&self, tool_full_name: &str) {
        self.invalidate()
            .entries
            .retain(|_, entry| entry.tool != tool_full_name);
    }

    pub fn clear_client_cache(&self, client: &str) {
        self.invalidate()
            .entries
            .retain(|_, entry| entry.client != client);
    }

    pub fn statistics(&self) -> PermissionStatistics {
        let state = self.read_state();
        PermissionStatistics {
            default_policy: state.default_policy,
            strict_mode: self.is_strict(),
            tool_policies: state.tool_policies.len(),
            client_policies: state.client_policies.len(),
            rules: state.rules.len(),
            cache_entries: self.lock_cache().entries.len(),
            cache_hits: self.hits.load(Ordering::Relaxed),
            cache_misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

fn cache_key(principal_id: &str, tool_full_name: &str) -> String {
    format!("{principal_id}:{tool_full_name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;

    struct CountingRule {
        name: &'static str,
        priority: i32,
        target: &'static str,
        decision: Result<bool, String>,
        calls: Arc<AtomicUsize>,
    }

    impl CountingRule {
        fn new(name: &'static str, priority: i32, target: &'static str, decision: bool) -> Self {
            Self {
                name,
                priority,
                target,
                decision: Ok(decision),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl PermissionRule for CountingRule {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "test rule"
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn applies_to(&self, _principal: &dyn Principal, tool: &RemoteTool) -> bool {
            tool.name == self.target
        }

        fn evaluate(&self, _principal: &dyn Principal, _tool: &RemoteTool) -> Result<bool, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.decision.clone()
        }
    }

    fn player() -> StaticPrincipal {
        StaticPrincipal::new("steve", 0)
    }

    fn operator() -> StaticPrincipal {
        StaticPrincipal::new("alex", OP_LEVEL)
    }

    #[test]
    fn deny_all_default_denies_everything_unconfigured() {
        let engine = PermissionEngine::new(PermissionPolicy::DenyAll);
        assert!(!engine.check(&player(), &RemoteTool::new("acme", "search")));
        assert!(!engine.check(&operator(), &RemoteTool::new("other", "fetch")));
    }

    #[test]
    fn matching_rule_overrides_default() {
        let engine = PermissionEngine::new(PermissionPolicy::DenyAll);
        engine.add_rule(Arc::new(CountingRule::new("allow-search", 50, "search", true)));

        assert!(engine.check(&player(), &RemoteTool::new("acme", "search")));
        assert!(!engine.check(&player(), &RemoteTool::new("acme", "fetch")));
    }

    #[test]
    fn higher_priority_rule_wins() {
        let engine = PermissionEngine::new(PermissionPolicy::AllowAll);
        engine.add_rule(Arc::new(CountingRule::new("low", 1, "search", true)));
        engine.add_rule(Arc::new(CountingRule::new("high", 10, "search", false)));

        assert_eq!(engine.rule_names(), vec!["high", "low"]);
        assert!(!engine.check(&operator(), &RemoteTool::new("acme", "search")));
    }

    #[test]
    fn failing_rule_denies() {
        let engine = PermissionEngine::new(PermissionPolicy::AllowAll);
        let mut rule = CountingRule::new("broken", 5, "search", true);
        rule.decision = Err("lookup failed".to_string());
        engine.add_rule(Arc::new(rule));

        assert!(!engine.check(&operator(), &RemoteTool::new("acme", "search")));
    }

    #[test]
    fn tool_policy_beats_client_policy_beats_default() {
        let engine = PermissionEngine::new(PermissionPolicy::AllowAll);
        let search = RemoteTool::new("acme", "search");
        let fetch = RemoteTool::new("acme", "fetch");

        engine.set_client_policy("acme", PermissionPolicy::DenyAll);
        assert!(!engine.check(&player(), &search));

        engine.set_tool_policy(&search.full_name, PermissionPolicy::OpOnly);
        assert!(!engine.check(&player(), &search));
        assert!(engine.check(&operator(), &search));
        assert!(!engine.check(&operator(), &fetch));
    }

    #[test]
    fn custom_policy_denies_without_matching_rule() {
        let engine = PermissionEngine::new(PermissionPolicy::Custom);
        assert!(!engine.check(&operator(), &RemoteTool::new("acme", "search")));
    }

    #[test]
    fn strict_mode_turns_allow_all_default_into_deny() {
        let engine = PermissionEngine::new(PermissionPolicy::AllowAll);
        let tool = RemoteTool::new("acme", "search");
        assert!(engine.check(&player(), &tool));

        engine.set_strict_mode(true);
        assert!(!engine.check(&player(), &tool));

        engine.set_tool_policy(&tool.full_name, PermissionPolicy::AllowAll);
        assert!(engine.check(&player(), &tool));
    }

    #[test]
    fn cached_result_is_reused_within_ttl() {
        let engine = PermissionEngine::new(PermissionPolicy::DenyAll);
        let rule = CountingRule::new("count", 1, "search", true);
        let calls = rule.calls.clone();
        engine.add_rule(Arc::new(rule));
        let tool = RemoteTool::new("acme", "search");

        assert!(engine.check(&player(), &tool));
        assert!(engine.check(&player(), &tool));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.statistics().cache_hits, 1);
    }

    #[test]
    fn expired_entry_is_reevaluated() {
        let engine =
            PermissionEngine::with_cache_ttl(PermissionPolicy::DenyAll, Duration::from_millis(20));
        let rule = CountingRule::new("count", 1, "search", true);
        let calls = rule.calls.clone();
        engine.add_rule(Arc::new(rule));
        let tool = RemoteTool::new("acme", "search");

        engine.check(&player(), &tool);
        std::thread::sleep(Duration::from_millis(40));
        engine.check(&player(), &tool);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn policy_change_forces_reevaluation_within_ttl() {
        let engine = PermissionEngine::new(PermissionPolicy::AllowAll);
        let tool = RemoteTool::new("acme", "search");
        assert!(engine.check(&player(), &tool));

        engine.set_default_policy(PermissionPolicy::DenyAll);
        assert!(!engine.check(&player(), &tool));
    }

    /// Allows after both barriers are passed, holding the caller inside
    /// `evaluate` in between.
    struct GateRule {
        entered: Arc<Barrier>,
        release: Arc<Barrier>,
    }

    impl PermissionRule for GateRule {
        fn name(&self) -> &str {
            "gate"
        }

        fn description(&self) -> &str {
            "blocks until released"
        }

        fn priority(&self) -> i32 {
            1
        }

        fn applies_to(&self, _principal: &dyn Principal, _tool: &RemoteTool) -> bool {
            true
        }

        fn evaluate(&self, _principal: &dyn Principal, _tool: &RemoteTool) -> Result<bool, String> {
            self.entered.wait();
            self.release.wait();
            Ok(true)
        }
    }

    #[test]
    fn decision_in_flight_during_rule_removal_is_not_cached() {
        let engine = Arc::new(PermissionEngine::new(PermissionPolicy::DenyAll));
        let entered = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        engine.add_rule(Arc::new(GateRule {
            entered: entered.clone(),
            release: release.clone(),
        }));
        let tool = RemoteTool::new("acme", "search");

        let checker = {
            let engine = engine.clone();
            let tool = tool.clone();
            thread::spawn(move || engine.check(&player(), &tool))
        };
        entered.wait();

        let remover = {
            let engine = engine.clone();
            thread::spawn(move || engine.remove_rule("gate"))
        };
        // Give the remover time to queue on the write lock.
        thread::sleep(Duration::from_millis(50));
        release.wait();

        assert!(checker.join().expect("checker"));
        assert!(remover.join().expect("remover"));
        assert!(!engine.check(&player(), &tool));
        assert_eq!(engine.statistics().rules, 0);
    }

    #[test]
    fn scoped_cache_clears_only_touch_their_scope() {
        let engine = PermissionEngine::new(PermissionPolicy::AllowAll);
        let search = RemoteTool::new("acme", "search");
        let fetch = RemoteTool::new("acme", "fetch");
        let other = RemoteTool::new("globex", "search");
        for tool in [&search, &fetch, &other] {
            engine.check(&player(), tool);
        }
        assert_eq!(engine.statistics().cache_entries, 3);

        engine.clear_tool_cache(&search.full_name);
        assert_eq!(engine.statistics().cache_entries, 2);

        engine.clear_client_cache("acme");
        assert_eq!(engine.statistics().cache_entries, 1);
    }

    #[test]
    fn administrative_rules_gate_sensitive_names() {
        let engine = PermissionEngine::new(PermissionPolicy::AllowAll);
        for rule in administrative_rules() {
            engine.add_rule(Arc::new(rule));
        }
        assert_eq!(
            engine.rule_names(),
            vec!["admin_tools", "dangerous_tools", "file_tools"]
        );

        let delete = RemoteTool::new("acme", "deleteUser");
        let shell = RemoteTool::new("acme", "run_shell");
        let read = RemoteTool::new("files", "read");
        let search = RemoteTool::new("acme", "search");

        for tool in [&delete, &shell, &read] {
            assert!(!engine.check(&player(), tool), "{}", tool.name);
            assert!(engine.check(&operator(), tool), "{}", tool.name);
        }
        assert!(engine.check(&player(), &search));
    }

    #[test]
    fn pattern_rule_can_scope_by_client() {
        let rule = PatternRule::new("acme-only", 1)
            .client_pattern("acme")
            .expect("valid pattern");
        assert!(rule.applies_to(&player(), &RemoteTool::new("acme", "anything")));
        assert!(!rule.applies_to(&player(), &RemoteTool::new("acme2", "anything")));
    }

    #[test]
    fn policy_tags_parse_loosely() {
        assert_eq!(
            PermissionPolicy::from_tag("OP_ONLY"),
            Some(PermissionPolicy::OpOnly)
        );
        assert_eq!(
            PermissionPolicy::from_tag("allow-all"),
            Some(PermissionPolicy::AllowAll)
        );
        assert_eq!(PermissionPolicy::from_tag("INHERIT_CLIENT"), None);
    }
}
