//! Registry of named circuit breakers, one per provider/route.
//!
//! The provider router (component H) and the ops snapshot (component J)
//! both need a shared view of every breaker keyed by provider id; this
//! registry is that shared view.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

/// Registry keyed by provider id (`chat_primary`, `search_web`, ...).
#[derive(Default, Clone, Debug)]
pub struct CircuitBreakerRegistry {
    inner: Arc<Mutex<HashMap<String, CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the breaker for `provider`, creating it with `config` on first
    /// use. Subsequent calls ignore `config` and return the existing
    /// instance — configuration is fixed at first registration.
    pub fn get_or_create(&self, provider: &str, config: CircuitBreakerConfig) -> CircuitBreaker {
        let mut map = self.inner.lock().unwrap();
        map.entry(provider.to_string())
            .or_insert_with(|| CircuitBreaker::new(provider.to_string(), config))
            .clone()
    }

    pub fn get(&self, provider: &str) -> Option<CircuitBreaker> {
        self.inner.lock().unwrap().get(provider).cloned()
    }

    /// Reset a registered breaker by provider id. Returns an error if the
    /// provider has never been registered.
    pub fn reset(&self, provider: &str) -> Result<(), String> {
        match self.get(provider) {
            Some(cb) => {
                cb.reset();
                Ok(())
            }
            None => Err(format!("circuit breaker not registered for provider: {provider}")),
        }
    }

    /// Snapshot of every registered breaker's state, for the ops endpoint.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let map = self.inner.lock().unwrap();
        let mut entries: Vec<(String, CircuitState)> =
            map.iter().map(|(k, v)| (k.clone(), v.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
