// src/config.rs
use std::time::Duration;

use crate::money::Currency;

/// Engine tuning knobs. Store connection details live with the adapter, not
/// here.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Retries after a store-signaled serialization conflict. Business
    /// failures are never retried.
    pub max_retries: u32,
    /// Base backoff between retries; doubles per attempt.
    pub retry_backoff: Duration,
    /// Deadline applied to every operation unless the caller overrides it.
    pub operation_deadline: Duration,
    /// Default rolling window for per-key spend ceilings.
    pub spend_window: Duration,
    /// Hard cap for list_transactions page sizes.
    pub max_page_size: u32,
    /// Currencies accepted beyond the built-ins.
    pub extra_currencies: Vec<Currency>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: Duration::from_millis(25),
            operation_deadline: Duration::from_secs(10),
            spend_window: Duration::from_secs(24 * 60 * 60),
            max_page_size: 100,
            extra_currencies: Vec::new(),
        }
    }
}

impl LedgerConfig {
    /// Resolve a currency code against the built-ins plus any registered
    /// extras.
    pub fn currency(&self, code: &str) -> Option<Currency> {
        Currency::get(code).or_else(|| {
            self.extra_currencies
                .iter()
                .find(|c| c.code == code)
                .cloned()
        })
    }
}
