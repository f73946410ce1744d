//! Provider failover: candidate selection and per-failure decisions
//!
//! What this module provides
//! - `FailoverPolicy::select(primary)`: the primary followed by its configured
//!   fallbacks, de-duplicated
//! - `FailoverPolicy::on_failure(...)`: retry the same candidate after a delay,
//!   advance to the next one, or give up
//! - `FailoverPlan`: the per-turn cursor over those candidates
//!
//! Transient errors (timeouts, rate limits, 5xx, connection failures) retry the
//! same candidate with exponential backoff until the attempt cap; fatal errors
//! advance immediately. Running out of candidates is `Exhausted`.

pub mod backoff;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::config::OrchestratorConfig;
use crate::provider::ProviderError;
pub use backoff::{Backoff, BackoffKind};

/// A provider/model pair the turn may call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Candidate {
    pub provider: String,
    pub model: String,
}

impl Candidate {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }

    pub fn label(&self) -> String {
        format!("{}/{}", self.provider, self.model)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverDecision {
    RetrySameAfter(Duration),
    Advance,
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct FailoverPolicy {
    enabled: bool,
    chains: BTreeMap<String, Vec<String>>,
    default_chain: Vec<String>,
    max_attempts: u32,
    backoff: Backoff,
    default_models: BTreeMap<String, String>,
}

impl FailoverPolicy {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        let f = &config.failover;
        Self {
            enabled: f.enabled,
            chains: f.chains.clone(),
            default_chain: f.default_chain.clone(),
            max_attempts: f.max_attempts.max(1),
            backoff: Backoff::exponential(
                Duration::from_millis(f.initial_backoff_ms),
                f.backoff_factor,
                Duration::from_millis(f.max_backoff_ms),
            ),
            default_models: config
                .providers
                .iter()
                .map(|(name, p)| (name.clone(), p.default_model.clone()))
                .collect(),
        }
    }

    /// Resolve `provider/model` or a bare provider name.
    fn parse(&self, spec: &str) -> Option<Candidate> {
        let spec = spec.trim();
        if spec.is_empty() {
            return None;
        }
        match spec.split_once('/') {
            Some((provider, model)) if !model.is_empty() => Some(Candidate::new(provider, model)),
            _ => {
                let provider = spec.trim_end_matches('/');
                let model = self.default_models.get(provider)?;
                Some(Candidate::new(provider, model.clone()))
            }
        }
    }

    /// Ordered candidates for a turn whose primary is `primary`.
    pub fn select(&self, primary: &Candidate) -> Vec<Candidate> {
        let mut candidates = vec![primary.clone()];
        if !self.enabled {
            return candidates;
        }
        let chain = self
            .chains
            .get(&primary.label())
            .or_else(|| self.chains.get(&primary.provider))
            .unwrap_or(&self.default_chain);
        for candidate in chain.iter().filter_map(|spec| self.parse(spec)) {
            if !candidates.contains(&candidate) {
                candidates.push(candidate);
            }
        }
        candidates
    }

    /// Decide what follows a failure after `attempts` calls on the current candidate.
    pub fn on_failure(&self, attempts: u32, error: &ProviderError, has_next: bool) -> FailoverDecision {
        if error.is_transient() && attempts < self.max_attempts {
            return FailoverDecision::RetrySameAfter(
                self.backoff.delay_for_retry(attempts.saturating_sub(1)),
            );
        }
        if has_next {
            FailoverDecision::Advance
        } else {
            FailoverDecision::Exhausted
        }
    }

    pub fn plan(&self, primary: Candidate) -> FailoverPlan {
        let candidates = self.select(&primary);
        FailoverPlan {
            policy: self.clone(),
            tried: vec![primary.label()],
            candidates,
            index: 0,
            attempts: 1,
        }
    }
}

/// Cursor over one turn's candidates.
#[derive(Debug, Clone)]
pub struct FailoverPlan {
    policy: FailoverPolicy,
    candidates: Vec<Candidate>,
    index: usize,
    /// Calls made on the current candidate, including the one in flight.
    attempts: u32,
    tried: Vec<String>,
}

impl FailoverPlan {
    pub fn primary(&self) -> &Candidate {
        &self.candidates[0]
    }

    pub fn current(&self) -> Option<&Candidate> {
        self.candidates.get(self.index)
    }

    pub fn attempt(&self) -> u32 {
        self.attempts
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    /// Whether the current candidate differs from the primary.
    pub fn is_fallback(&self) -> bool {
        self.index > 0
    }

    /// Labels of every candidate tried so far, in order.
    pub fn chain(&self) -> &[String] {
        &self.tried
    }

    /// Apply the policy to a failure of the current candidate and move the cursor.
    pub fn on_failure(&mut self, error: &ProviderError) -> FailoverDecision {
        let has_next = self.index + 1 < self.candidates.len();
        let decision = self.policy.on_failure(self.attempts, error, has_next);
        match decision {
            FailoverDecision::RetrySameAfter(_) => self.attempts += 1,
            FailoverDecision::Advance => self.advance(),
            FailoverDecision::Exhausted => self.index = self.candidates.len(),
        }
        decision
    }

    /// Move past the current candidate without calling it again.
    pub fn skip(&mut self) -> FailoverDecision {
        if self.index + 1 < self.candidates.len() {
            self.advance();
            FailoverDecision::Advance
        } else {
            self.index = self.candidates.len();
            FailoverDecision::Exhausted
        }
    }

    /// Restart attempt counting for the next call on the current candidate.
    pub fn reset_attempts(&mut self) {
        self.attempts = 1;
    }

    fn advance(&mut self) {
        self.index += 1;
        self.attempts = 1;
        if let Some(next) = self.candidates.get(self.index) {
            self.tried.push(next.label());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::provider::ProviderErrorKind;

    fn policy() -> FailoverPolicy {
        let config = ConfigBuilder::new()
            .fallback_chain("openai/gpt-4o", vec!["deepseek".into(), "openai/gpt-4o".into()])
            .fallback_chain("gemini", vec!["openai/gpt-4o-mini".into()])
            .retry(2, Duration::from_millis(100))
            .build();
        FailoverPolicy::from_config(&config)
    }

    fn transient() -> ProviderError {
        ProviderError::new(ProviderErrorKind::Server, "503")
    }

    fn fatal() -> ProviderError {
        ProviderError::new(ProviderErrorKind::Auth, "bad key")
    }

    #[test]
    fn select_expands_and_dedupes() {
        let p = policy();
        let c = p.select(&Candidate::new("openai", "gpt-4o"));
        assert_eq!(
            c,
            vec![
                Candidate::new("openai", "gpt-4o"),
                Candidate::new("deepseek", "deepseek-chat")
            ]
        );
        // provider-level chain
        let c = p.select(&Candidate::new("gemini", "gemini-2.0-flash"));
        assert_eq!(c[1], Candidate::new("openai", "gpt-4o-mini"));
        // no chain at all
        assert_eq!(p.select(&Candidate::new("deepseek", "deepseek-chat")).len(), 1);
    }

    #[test]
    fn disabled_failover_keeps_only_the_primary() {
        let config = ConfigBuilder::new()
            .fallback_chain("openai", vec!["deepseek".into()])
            .failover_enabled(false)
            .build();
        let p = FailoverPolicy::from_config(&config);
        assert_eq!(p.select(&Candidate::new("openai", "gpt-4o")).len(), 1);
    }

    #[test]
    fn transient_retries_then_advances_then_exhausts() {
        let mut plan = policy().plan(Candidate::new("openai", "gpt-4o"));
        assert_eq!(
            plan.on_failure(&transient()),
            FailoverDecision::RetrySameAfter(Duration::from_millis(100))
        );
        assert_eq!(plan.attempt(), 2);
        assert_eq!(plan.on_failure(&transient()), FailoverDecision::Advance);
        assert_eq!(plan.current().unwrap().provider, "deepseek");
        assert!(plan.is_fallback());
        assert_eq!(plan.on_failure(&fatal()), FailoverDecision::Exhausted);
        assert!(plan.current().is_none());
        assert_eq!(plan.chain(), ["openai/gpt-4o", "deepseek/deepseek-chat"]);
    }

    #[test]
    fn fatal_errors_skip_retries() {
        let mut plan = policy().plan(Candidate::new("openai", "gpt-4o"));
        assert_eq!(plan.on_failure(&fatal()), FailoverDecision::Advance);
        assert_eq!(plan.attempt(), 1);
    }

    #[test]
    fn skip_moves_without_retrying() {
        let mut plan = policy().plan(Candidate::new("openai", "gpt-4o"));
        assert_eq!(plan.skip(), FailoverDecision::Advance);
        assert_eq!(plan.skip(), FailoverDecision::Exhausted);
    }
}
