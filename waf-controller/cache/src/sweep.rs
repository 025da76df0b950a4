use std::time::Duration;

use tracing::{error, info};

use crate::SharedRuleSetCache;

/// Garbage collection bounds for the ruleset cache.
#[derive(Clone, Copy, Debug)]
pub struct GcConfig {
    /// How often to check for and remove stale entries.
    pub interval: Duration,

    /// Maximum age of a non-latest entry before it is considered stale.
    pub max_age: Duration,

    /// Maximum total size of all cached rules, in bytes.
    pub max_size: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            max_age: Duration::from_secs(24 * 60 * 60),
            max_size: 100 * 1024 * 1024,
        }
    }
}

/// Periodically removes stale cache entries using two strategies: entries
/// older than `max_age`, then the oldest entries while the cache exceeds
/// `max_size`. The latest entry of every key is always retained, so the size
/// bound is best-effort; when it cannot be met the overage is logged for the
/// operator. Exits when the shutdown drain fires.
pub async fn sweep(cache: SharedRuleSetCache, config: GcConfig, drain: drain::Watch) {
    let start = tokio::time::Instant::now() + config.interval;
    let mut ticks = tokio::time::interval_at(start, config.interval);
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let signaled = drain.signaled();
    tokio::pin!(signaled);

    loop {
        tokio::select! {
            _ = ticks.tick() => {
                let pruned = cache.prune(config.max_age);
                if pruned > 0 {
                    info!(count = pruned, max_age = ?config.max_age, "pruned stale cache entries by age");
                }

                if cache.total_size() > config.max_size {
                    let pruned = cache.prune_by_size(config.max_size);
                    if pruned > 0 {
                        info!(
                            count = pruned,
                            max_size = config.max_size,
                            current_size = cache.total_size(),
                            "pruned cache entries by size",
                        );
                    }

                    let size = cache.total_size();
                    if size > config.max_size {
                        error!(
                            current_size = size,
                            max_size = config.max_size,
                            overage = size - config.max_size,
                            "cache size exceeds maximum even after pruning; latest entries alone are over the limit",
                        );
                    }
                }
            }

            handle = &mut signaled => {
                drop(handle);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RuleSetCache;
    use chrono::Utc;

    #[tokio::test(start_paused = true)]
    async fn prunes_stale_entries_on_tick() {
        let cache = RuleSetCache::shared();
        cache.put("ns/a", "old");
        cache.put("ns/a", "new");
        cache.set_entry_timestamp("ns/a", 0, Utc::now() - chrono::Duration::hours(48));

        let (signal, watch) = drain::channel();
        let config = GcConfig {
            interval: Duration::from_secs(60),
            max_age: Duration::from_secs(24 * 60 * 60),
            max_size: 100,
        };
        let sweeper = tokio::spawn(sweep(cache.clone(), config, watch));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(cache.count_entries("ns/a"), 1);
        assert_eq!(cache.get("ns/a").unwrap().rules, "new");

        signal.drain().await;
        sweeper.await.expect("sweeper must exit cleanly");
    }

    #[tokio::test(start_paused = true)]
    async fn enforces_size_bound_but_keeps_latest() {
        let cache = RuleSetCache::shared();
        cache.put("ns/a", "x".repeat(64));
        cache.put("ns/a", "y".repeat(64));

        let (signal, watch) = drain::channel();
        let config = GcConfig {
            interval: Duration::from_secs(60),
            max_age: Duration::from_secs(24 * 60 * 60),
            max_size: 100,
        };
        let sweeper = tokio::spawn(sweep(cache.clone(), config, watch));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(cache.count_entries("ns/a"), 1);
        assert_eq!(cache.total_size(), 64);

        signal.drain().await;
        sweeper.await.expect("sweeper must exit cleanly");
    }

    #[tokio::test(start_paused = true)]
    async fn stops_promptly_on_drain() {
        let cache = RuleSetCache::shared();
        let (signal, watch) = drain::channel();
        let sweeper = tokio::spawn(sweep(cache, GcConfig::default(), watch));

        signal.drain().await;
        sweeper.await.expect("sweeper must exit cleanly");
    }
}
