//! Quota limiter over rolling windows
//!
//! What this module provides
//! - Admission control before any provider call: request count and token count
//!   per (principal, provider, model) over one or more rolling windows
//! - Usage recording once actual token counts are known
//! - A read-only snapshot of limits, usage and remaining budget
//!
//! Implementation strategy
//! - Each key keeps a log of request instants and token events; logs are
//!   pruned to the longest configured window on every access
//! - Admission checks and the request reservation happen under one lock, so
//!   concurrent turns cannot both take the last slot
//! - Time comes from `tokio::time::Instant`, which tests can pause and advance

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::config::{QuotaConfig, QuotaRule};
use crate::types::{Principal, Usage};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuotaKey {
    pub principal: String,
    pub provider: String,
    pub model: String,
}

impl QuotaKey {
    pub fn new(principal: &Principal, provider: &str, model: &str) -> Self {
        Self {
            principal: principal.id.clone(),
            provider: provider.to_string(),
            model: model.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Deny { reason: String },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

#[derive(Debug, Default)]
struct QuotaCounter {
    requests: VecDeque<Instant>,
    tokens: VecDeque<(Instant, u64)>,
}

fn window_start(now: Instant, window: Duration) -> Option<Instant> {
    now.checked_sub(window)
}

impl QuotaCounter {
    fn prune(&mut self, now: Instant, horizon: Duration) {
        let Some(cutoff) = window_start(now, horizon) else {
            return;
        };
        while self.requests.front().is_some_and(|at| *at <= cutoff) {
            self.requests.pop_front();
        }
        while self.tokens.front().is_some_and(|(at, _)| *at <= cutoff) {
            self.tokens.pop_front();
        }
    }

    fn requests_in(&self, now: Instant, window: Duration) -> u64 {
        match window_start(now, window) {
            Some(cutoff) => self.requests.iter().filter(|at| **at > cutoff).count() as u64,
            None => self.requests.len() as u64,
        }
    }

    fn tokens_in(&self, now: Instant, window: Duration) -> u64 {
        let cutoff = window_start(now, window);
        self.tokens
            .iter()
            .filter(|(at, _)| cutoff.map_or(true, |c| *at > c))
            .map(|(_, n)| *n)
            .sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaWindowSnapshot {
    pub window_secs: u64,
    pub max_requests: Option<u64>,
    pub used_requests: u64,
    pub remaining_requests: Option<u64>,
    pub max_tokens: Option<u64>,
    pub used_tokens: u64,
    pub remaining_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaSnapshot {
    pub enabled: bool,
    pub principal: String,
    pub class: String,
    pub provider: String,
    pub model: String,
    pub windows: Vec<QuotaWindowSnapshot>,
}

pub struct QuotaLimiter {
    enabled: bool,
    default_class: String,
    classes: BTreeMap<String, Vec<QuotaRule>>,
    counters: Mutex<HashMap<QuotaKey, QuotaCounter>>,
}

impl QuotaLimiter {
    pub fn new(config: &QuotaConfig) -> Self {
        Self {
            enabled: config.enabled,
            default_class: config.default_class.clone(),
            classes: config.classes.clone(),
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// A limiter that admits everything.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            default_class: String::new(),
            classes: BTreeMap::new(),
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn class_of<'a>(&'a self, principal: &'a Principal) -> &'a str {
        if self.classes.contains_key(&principal.class) {
            &principal.class
        } else {
            &self.default_class
        }
    }

    fn rules_for(&self, principal: &Principal) -> &[QuotaRule] {
        self.classes
            .get(self.class_of(principal))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn horizon(rules: &[QuotaRule]) -> Duration {
        rules
            .iter()
            .map(QuotaRule::window)
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn counters(&self) -> std::sync::MutexGuard<'_, HashMap<QuotaKey, QuotaCounter>> {
        self.counters.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Admit one request; an allowed request is counted immediately.
    pub fn admit(
        &self,
        principal: &Principal,
        provider: &str,
        model: &str,
        estimated_tokens: u64,
    ) -> Admission {
        self.evaluate(principal, provider, model, estimated_tokens, true)
    }

    /// Re-check only the token budget, without counting a request.
    pub fn check_tokens(&self, principal: &Principal, provider: &str, model: &str) -> Admission {
        self.evaluate(principal, provider, model, 0, false)
    }

    fn evaluate(
        &self,
        principal: &Principal,
        provider: &str,
        model: &str,
        estimated_tokens: u64,
        count_request: bool,
    ) -> Admission {
        if !self.enabled {
            return Admission::Allow;
        }
        let rules = self.rules_for(principal);
        if rules.is_empty() {
            return Admission::Allow;
        }
        let now = Instant::now();
        let key = QuotaKey::new(principal, provider, model);
        let mut counters = self.counters();
        let counter = counters.entry(key).or_default();
        counter.prune(now, Self::horizon(rules));

        for rule in rules {
            let window = rule.window();
            if count_request {
                if let Some(max) = rule.max_requests {
                    let used = counter.requests_in(now, window);
                    if used >= max {
                        return Admission::Deny {
                            reason: format!(
                                "request limit reached for {provider}/{model}: {used}/{max} per {}s",
                                rule.window_secs
                            ),
                        };
                    }
                }
            }
            if let Some(max) = rule.max_tokens {
                let used = counter.tokens_in(now, window);
                if used >= max || used + estimated_tokens > max {
                    return Admission::Deny {
                        reason: format!(
                            "token limit reached for {provider}/{model}: {used}/{max} per {}s",
                            rule.window_secs
                        ),
                    };
                }
            }
        }
        if count_request {
            counter.requests.push_back(now);
        }
        Admission::Allow
    }

    /// Record the tokens a call actually consumed.
    pub fn record(&self, principal: &Principal, provider: &str, model: &str, usage: &Usage) {
        if !self.enabled || usage.total_tokens == 0 {
            return;
        }
        let now = Instant::now();
        let key = QuotaKey::new(principal, provider, model);
        debug!(principal = %principal.id, provider, model, tokens = usage.total_tokens, "quota usage recorded");
        self.counters()
            .entry(key)
            .or_default()
            .tokens
            .push_back((now, usage.total_tokens));
    }

    pub fn snapshot(&self, principal: &Principal, provider: &str, model: &str) -> QuotaSnapshot {
        let rules = self.rules_for(principal);
        let now = Instant::now();
        let key = QuotaKey::new(principal, provider, model);
        let mut counters = self.counters();
        let windows = match counters.get_mut(&key) {
            Some(counter) => {
                counter.prune(now, Self::horizon(rules));
                rules
                    .iter()
                    .map(|rule| window_snapshot(rule, Some(counter), now))
                    .collect()
            }
            None => rules.iter().map(|rule| window_snapshot(rule, None, now)).collect(),
        };
        QuotaSnapshot {
            enabled: self.enabled,
            principal: principal.id.clone(),
            class: self.class_of(principal).to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            windows,
        }
    }
}

fn window_snapshot(rule: &QuotaRule, counter: Option<&QuotaCounter>, now: Instant) -> QuotaWindowSnapshot {
    let window = rule.window();
    let used_requests = counter.map_or(0, |c| c.requests_in(now, window));
    let used_tokens = counter.map_or(0, |c| c.tokens_in(now, window));
    QuotaWindowSnapshot {
        window_secs: rule.window_secs,
        max_requests: rule.max_requests,
        used_requests,
        remaining_requests: rule.max_requests.map(|m| m.saturating_sub(used_requests)),
        max_tokens: rule.max_tokens,
        used_tokens,
        remaining_tokens: rule.max_tokens.map(|m| m.saturating_sub(used_tokens)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter(max_requests: Option<u64>, max_tokens: Option<u64>) -> QuotaLimiter {
        let mut classes = BTreeMap::new();
        classes.insert(
            "default".to_string(),
            vec![QuotaRule {
                window_secs: 60,
                max_requests,
                max_tokens,
            }],
        );
        QuotaLimiter::new(&QuotaConfig {
            enabled: true,
            default_class: "default".into(),
            classes,
        })
    }

    fn alice() -> Principal {
        Principal::new("alice", "free")
    }

    #[tokio::test(start_paused = true)]
    async fn request_window_rolls() {
        let q = limiter(Some(2), None);
        assert!(q.admit(&alice(), "openai", "gpt", 0).is_allowed());
        assert!(q.admit(&alice(), "openai", "gpt", 0).is_allowed());
        let denied = q.admit(&alice(), "openai", "gpt", 0);
        assert!(matches!(denied, Admission::Deny { ref reason } if reason.contains("2/2")));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(q.admit(&alice(), "openai", "gpt", 0).is_allowed());
    }

    #[tokio::test]
    async fn keys_are_isolated_per_provider_and_model() {
        let q = limiter(Some(1), None);
        assert!(q.admit(&alice(), "openai", "gpt", 0).is_allowed());
        assert!(!q.admit(&alice(), "openai", "gpt", 0).is_allowed());
        assert!(q.admit(&alice(), "deepseek", "chat", 0).is_allowed());
        assert!(q.admit(&Principal::new("bob", "free"), "openai", "gpt", 0).is_allowed());
    }

    #[tokio::test]
    async fn recorded_tokens_close_the_budget() {
        let q = limiter(None, Some(100));
        assert!(q.admit(&alice(), "openai", "gpt", 10).is_allowed());
        q.record(&alice(), "openai", "gpt", &Usage::new(60, 20, 80));
        assert!(q.check_tokens(&alice(), "openai", "gpt").is_allowed());
        assert!(!q.admit(&alice(), "openai", "gpt", 30).is_allowed());
        q.record(&alice(), "openai", "gpt", &Usage::new(10, 10, 20));
        assert!(!q.check_tokens(&alice(), "openai", "gpt").is_allowed());

        let snap = q.snapshot(&alice(), "openai", "gpt");
        assert_eq!(snap.class, "default");
        assert_eq!(snap.windows[0].used_tokens, 100);
        assert_eq!(snap.windows[0].remaining_tokens, Some(0));
    }

    #[tokio::test]
    async fn concurrent_admissions_never_exceed_the_limit() {
        let q = Arc::new(limiter(Some(10), None));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let q = q.clone();
            handles.push(tokio::spawn(async move {
                q.admit(&alice(), "openai", "gpt", 0).is_allowed()
            }));
        }
        let mut allowed = 0;
        for h in handles {
            if h.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
        assert_eq!(q.snapshot(&alice(), "openai", "gpt").windows[0].used_requests, 10);
    }

    #[tokio::test]
    async fn concurrent_records_are_not_lost() {
        let q = Arc::new(limiter(None, Some(1_000_000)));
        let mut handles = Vec::new();
        for _ in 0..100 {
            let q = q.clone();
            handles.push(tokio::spawn(async move {
                q.record(&alice(), "openai", "gpt", &Usage::new(1, 1, 2));
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(q.snapshot(&alice(), "openai", "gpt").windows[0].used_tokens, 200);
    }

    #[test]
    fn disabled_limiter_admits_everything() {
        let q = QuotaLimiter::disabled();
        for _ in 0..100 {
            assert!(q.admit(&alice(), "openai", "gpt", 1_000_000).is_allowed());
        }
    }
}
