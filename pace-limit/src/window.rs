//! Sliding-window usage log.
//!
//! Grants are kept as timestamped entries weighted by token count. An entry
//! stops counting once it is `window` seconds old. This is a true sliding log
//! rather than a fixed-window counter, so two bursts straddling a boundary
//! cannot add up to twice the limit.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::config::saturating_secs;

/// One grant: `tokens` taken at unix time `at` (seconds).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub(crate) struct UsageEntry {
    pub(crate) at: f64,
    pub(crate) tokens: u32,
}

/// Entries ordered by `at`, oldest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct UsageLog {
    entries: VecDeque<UsageEntry>,
}

impl UsageLog {
    pub(crate) fn from_entries(entries: impl IntoIterator<Item = UsageEntry>) -> Self {
        let mut entries: Vec<UsageEntry> = entries.into_iter().collect();
        entries.sort_by(|a, b| a.at.total_cmp(&b.at));
        Self {
            entries: entries.into(),
        }
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &UsageEntry> {
        self.entries.iter()
    }

    /// Drop everything that has aged out of the window ending at `now`.
    pub(crate) fn prune(&mut self, now: f64, window: f64) {
        let cutoff = now - window;
        while self.entries.front().is_some_and(|e| e.at <= cutoff) {
            self.entries.pop_front();
        }
    }

    /// Tokens currently counted against the limit.
    pub(crate) fn count(&self) -> u64 {
        self.entries.iter().map(|e| u64::from(e.tokens)).sum()
    }

    pub(crate) fn record(&mut self, now: f64, tokens: u32) {
        // Clocks may step backwards between processes; keep the log ordered.
        let at = self.entries.back().map_or(now, |last| now.max(last.at));
        self.entries.push_back(UsageEntry { at, tokens });
    }

    /// Time until enough entries expire for `tokens` more to fit under `limit`.
    ///
    /// Assumes the log has been pruned at `now`.
    pub(crate) fn time_until_capacity(&self, now: f64, window: f64, limit: u32, tokens: u32) -> Duration {
        let limit = u64::from(limit);
        let mut count = self.count();
        let needed = u64::from(tokens);
        if count + needed <= limit {
            return Duration::ZERO;
        }
        for entry in &self.entries {
            count -= u64::from(entry.tokens);
            if count + needed <= limit {
                return saturating_secs(entry.at + window - now);
            }
        }
        saturating_secs(window)
    }

    /// Time until the whole window has drained.
    pub(crate) fn time_to_reset(&self, now: f64, window: f64) -> Duration {
        self.entries
            .back()
            .map_or(Duration::ZERO, |last| {
                saturating_secs(last.at + window - now)
            })
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}
