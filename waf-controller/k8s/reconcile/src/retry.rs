use std::time::Duration;

use ahash::AHashMap as HashMap;
use parking_lot::Mutex;

const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Identifies a reconciled resource for retry accounting.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

/// Per-resource exponential backoff, doubling from 1s and bounded at 60s.
/// Reset whenever a reconcile succeeds.
#[derive(Debug, Default)]
pub struct RetryBackoff {
    attempts: Mutex<HashMap<ResourceId, u32>>,
}

impl RetryBackoff {
    pub fn next_delay(&self, id: ResourceId) -> Duration {
        let mut attempts = self.attempts.lock();
        let failures = attempts.entry(id).or_insert(0);
        let delay = BASE_DELAY.saturating_mul(1 << (*failures).min(6));
        *failures = failures.saturating_add(1);
        delay.min(MAX_DELAY)
    }

    pub fn reset(&self, id: &ResourceId) {
        self.attempts.lock().remove(id);
    }
}
