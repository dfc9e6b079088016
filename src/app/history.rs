use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleOutcome {
    Succeeded,
    Failed,
    Cancelled,
    Restored,
}

/// One finished cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRecord {
    pub source: String,
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: CycleOutcome,
    pub error_category: Option<&'static str>,
    pub error: Option<String>,
    pub attempts: Option<u32>,
    pub points: Option<usize>,
}

/// Bounded in-memory log of finished cycles, oldest evicted first.
pub struct FetchHistory {
    limit: usize,
    entries: Mutex<VecDeque<FetchRecord>>,
}

impl FetchHistory {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            entries: Mutex::new(VecDeque::with_capacity(limit)),
        }
    }

    pub fn record(&self, entry: FetchRecord) {
        let mut entries = self.entries.lock().expect("history lock poisoned");
        if entries.len() == self.limit {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Entries for `source`, newest first.
    pub fn for_source(&self, source: &str) -> Vec<FetchRecord> {
        let entries = self.entries.lock().expect("history lock poisoned");
        entries
            .iter()
            .rev()
            .filter(|entry| entry.source == source)
            .cloned()
            .collect()
    }

    pub fn recent(&self, count: usize) -> Vec<FetchRecord> {
        let entries = self.entries.lock().expect("history lock poisoned");
        entries.iter().rev().take(count).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("history lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(source: &str, cycle: u64) -> FetchRecord {
        let now = Utc::now();
        FetchRecord {
            source: source.to_string(),
            cycle,
            started_at: now,
            finished_at: now,
            outcome: CycleOutcome::Succeeded,
            error_category: None,
            error: None,
            attempts: Some(1),
            points: Some(1),
        }
    }

    #[test]
    fn evicts_oldest_beyond_limit() {
        let history = FetchHistory::new(3);
        for cycle in 1..=5 {
            history.record(entry("a", cycle));
        }

        let cycles: Vec<u64> = history.recent(10).iter().map(|e| e.cycle).collect();
        assert_eq!(cycles, vec![5, 4, 3]);
    }

    #[test]
    fn filters_by_source_newest_first() {
        let history = FetchHistory::new(10);
        history.record(entry("a", 1));
        history.record(entry("b", 2));
        history.record(entry("a", 3));

        let cycles: Vec<u64> = history.for_source("a").iter().map(|e| e.cycle).collect();
        assert_eq!(cycles, vec![3, 1]);
        assert_eq!(history.len(), 3);
    }
}
