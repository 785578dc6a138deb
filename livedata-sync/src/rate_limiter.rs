//! Rate limiting for method calls and subscriptions.
//!
//! A [`Rule`] describes which invocations it applies to, one [`RuleMatcher`]
//! per dimension. Each rule owns a counter per distinct combination of the
//! dimensions it constrains; every counter of a rule resets together once
//! the rule's interval has elapsed since its last reset.
//!
//! ```text
//!  invocation ──► rule 1 matches? ──► counter["name:x|user:u1"] += 1
//!             └─► rule 2 matches? ──► counter["conn:c9"] += 1
//!                                         │
//!                         any counter over its limit ⇒ rejected
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

pub const DEFAULT_NUM_REQUESTS: u32 = 10;
pub const DEFAULT_INTERVAL_MS: u64 = 1000;

/// Kind of invocation being limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvocationType {
    Method,
    Subscription,
}

impl InvocationType {
    fn as_str(self) -> &'static str {
        match self {
            InvocationType::Method => "method",
            InvocationType::Subscription => "subscription",
        }
    }
}

/// How a rule constrains one dimension of an invocation.
#[derive(Clone, Default)]
pub enum RuleMatcher {
    /// Matches every value and does not split counters.
    #[default]
    Any,
    Exact(String),
    /// Matches when the predicate returns true; counters are kept per value.
    Matcher(Arc<dyn Fn(Option<&str>) -> bool + Send + Sync>),
}

impl fmt::Debug for RuleMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleMatcher::Any => f.write_str("Any"),
            RuleMatcher::Exact(v) => f.debug_tuple("Exact").field(v).finish(),
            RuleMatcher::Matcher(_) => f.write_str("Matcher(..)"),
        }
    }
}

impl RuleMatcher {
    pub fn matcher(f: impl Fn(Option<&str>) -> bool + Send + Sync + 'static) -> Self {
        RuleMatcher::Matcher(Arc::new(f))
    }

    fn matches(&self, value: Option<&str>) -> bool {
        match self {
            RuleMatcher::Any => true,
            RuleMatcher::Exact(expected) => value == Some(expected.as_str()),
            RuleMatcher::Matcher(f) => f(value),
        }
    }

    fn is_any(&self) -> bool {
        matches!(self, RuleMatcher::Any)
    }
}

/// Which invocations a rule applies to. `type_: None` matches both kinds.
#[derive(Debug, Clone, Default)]
pub struct Rule {
    pub type_: Option<InvocationType>,
    pub name: RuleMatcher,
    pub user_id: RuleMatcher,
    pub connection_id: RuleMatcher,
    pub client_address: RuleMatcher,
}

/// One invocation presented to the limiter.
#[derive(Debug, Clone)]
pub struct RateLimitInput {
    pub type_: InvocationType,
    pub name: String,
    pub user_id: Option<String>,
    pub connection_id: String,
    pub client_address: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitReply {
    pub allowed: bool,
    pub time_to_reset: Duration,
    pub num_invocations_left: u32,
}

struct RuleState {
    rule: Rule,
    num_requests: u32,
    interval: Duration,
    counters: HashMap<String, u32>,
    last_reset: Instant,
}

impl RuleState {
    fn matches(&self, input: &RateLimitInput) -> bool {
        self.rule.type_.map_or(true, |t| t == input.type_)
            && self.rule.name.matches(Some(&input.name))
            && self.rule.user_id.matches(input.user_id.as_deref())
            && self.rule.connection_id.matches(Some(&input.connection_id))
            && self.rule.client_address.matches(Some(&input.client_address))
    }

    // Only constrained dimensions go into the key, so an `Any` dimension
    // shares one counter across all of its values.
    fn key(&self, input: &RateLimitInput) -> String {
        let mut key = String::new();
        if self.rule.type_.is_some() {
            key.push_str("type:");
            key.push_str(input.type_.as_str());
            key.push('|');
        }
        let dims: [(&str, &RuleMatcher, Option<&str>); 4] = [
            ("name", &self.rule.name, Some(&input.name)),
            ("user", &self.rule.user_id, input.user_id.as_deref()),
            ("conn", &self.rule.connection_id, Some(&input.connection_id)),
            ("addr", &self.rule.client_address, Some(&input.client_address)),
        ];
        for (label, matcher, value) in dims {
            if !matcher.is_any() {
                key.push_str(label);
                key.push(':');
                key.push_str(value.unwrap_or(""));
                key.push('|');
            }
        }
        key
    }

    fn reset_if_due(&mut self, now: Instant) {
        if now.duration_since(self.last_reset) >= self.interval {
            self.counters.clear();
            self.last_reset = now;
        }
    }

    fn time_to_reset(&self, now: Instant) -> Duration {
        self.interval.saturating_sub(now.duration_since(self.last_reset))
    }
}

/// Counters for every registered rule.
#[derive(Default)]
pub struct RateLimiter {
    rules: HashMap<Uuid, RuleState>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter").field("rules", &self.rules.len()).finish()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `num_requests` matching invocations per `interval_ms`.
    pub fn add_rule(&mut self, rule: Rule, num_requests: u32, interval_ms: u64) -> Uuid {
        self.add_rule_at(rule, num_requests, interval_ms, Instant::now())
    }

    pub fn add_rule_at(&mut self, rule: Rule, num_requests: u32, interval_ms: u64, now: Instant) -> Uuid {
        let id = Uuid::new_v4();
        self.rules.insert(
            id,
            RuleState {
                rule,
                num_requests,
                interval: Duration::from_millis(interval_ms),
                counters: HashMap::new(),
                last_reset: now,
            },
        );
        id
    }

    pub fn remove_rule(&mut self, id: Uuid) -> bool {
        self.rules.remove(&id).is_some()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Count one invocation against every matching rule.
    pub fn increment(&mut self, input: &RateLimitInput) {
        self.increment_at(input, Instant::now())
    }

    pub fn increment_at(&mut self, input: &RateLimitInput, now: Instant) {
        for state in self.rules.values_mut() {
            if !state.matches(input) {
                continue;
            }
            state.reset_if_due(now);
            let key = state.key(input);
            *state.counters.entry(key).or_insert(0) += 1;
        }
    }

    /// Whether the invocations counted so far are within every matching
    /// rule. Does not count anything itself.
    pub fn check(&mut self, input: &RateLimitInput) -> RateLimitReply {
        self.check_at(input, Instant::now())
    }

    pub fn check_at(&mut self, input: &RateLimitInput, now: Instant) -> RateLimitReply {
        let mut reply = RateLimitReply { allowed: true, time_to_reset: Duration::ZERO, num_invocations_left: u32::MAX };
        for state in self.rules.values_mut() {
            if !state.matches(input) {
                continue;
            }
            state.reset_if_due(now);
            let count = state.counters.get(&state.key(input)).copied().unwrap_or(0);
            let left = state.num_requests.saturating_sub(count);
            reply.num_invocations_left = reply.num_invocations_left.min(left);
            if count > state.num_requests {
                reply.allowed = false;
                reply.time_to_reset = reply.time_to_reset.max(state.time_to_reset(now));
            }
        }
        reply
    }
}
