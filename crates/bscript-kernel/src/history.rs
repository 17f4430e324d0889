use std::collections::VecDeque;

use crate::reply::HistoryEntry;

/// Bounded in-memory execution history, oldest first.
#[derive(Debug, Clone)]
pub struct History {
    entries: VecDeque<HistoryEntry>,
    limit: usize,
}

impl History {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit,
        }
    }

    pub fn record(&mut self, entry: HistoryEntry) {
        if self.limit == 0 {
            return;
        }
        while self.entries.len() >= self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// The `last_n` most recent entries (optionally of one session), oldest first.
    pub fn tail(&self, session: Option<&str>, last_n: usize) -> Vec<HistoryEntry> {
        let mut tail: Vec<HistoryEntry> = self
            .entries
            .iter()
            .rev()
            .filter(|entry| session.is_none_or(|s| entry.session == s))
            .take(last_n)
            .cloned()
            .collect();
        tail.reverse();
        tail
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(session: &str, counter: u64) -> HistoryEntry {
        HistoryEntry {
            session: session.into(),
            execution_counter: counter,
            code: format!("x = {counter}"),
        }
    }

    #[test]
    fn evicts_oldest_beyond_limit() {
        let mut history = History::new(2);
        history.record(entry("A", 1));
        history.record(entry("A", 2));
        history.record(entry("A", 3));
        let counters: Vec<u64> = history
            .tail(None, 10)
            .iter()
            .map(|e| e.execution_counter)
            .collect();
        assert_eq!(counters, vec![2, 3]);
    }

    #[test]
    fn tail_filters_by_session() {
        let mut history = History::new(10);
        history.record(entry("A", 1));
        history.record(entry("B", 1));
        history.record(entry("A", 2));
        history.record(entry("A", 3));
        let tail = history.tail(Some("A"), 2);
        assert_eq!(tail, vec![entry("A", 2), entry("A", 3)]);
        assert_eq!(history.tail(Some("C"), 5), Vec::new());
    }

    #[test]
    fn zero_limit_keeps_nothing() {
        let mut history = History::new(0);
        history.record(entry("A", 1));
        assert!(history.is_empty());
    }
}
