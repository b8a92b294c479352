//! Lazy-clear "new updates since last read" counters

use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
enum Counter {
    Count(usize),
    /// Distinct keys, so repeated updates to one entry count once
    Keys(HashSet<String>),
}

impl Counter {
    fn len(&self) -> usize {
        match self {
            Counter::Count(n) => *n,
            Counter::Keys(keys) => keys.len(),
        }
    }

    fn reset(&mut self) {
        match self {
            Counter::Count(n) => *n = 0,
            Counter::Keys(keys) => keys.clear(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct UpdateTracker {
    by_symbol: HashMap<String, Counter>,
    clear_by_symbol: HashSet<String>,
    all: usize,
    clear_all: bool,
}

impl UpdateTracker {
    /// Count one appended item; `key` deduplicates within the symbol
    pub(crate) fn record(&mut self, symbol: Option<&str>, key: Option<&str>) {
        if self.clear_all {
            self.clear_all = false;
            self.clear_by_symbol.clear();
            self.by_symbol.clear();
            self.all = 0;
        }

        let Some(symbol) = symbol else {
            self.all += 1;
            return;
        };

        if self.clear_by_symbol.remove(symbol) {
            if let Some(counter) = self.by_symbol.get_mut(symbol) {
                counter.reset();
            }
        }

        let counter = self
            .by_symbol
            .entry(symbol.to_string())
            .or_insert_with(|| match key {
                Some(_) => Counter::Keys(HashSet::new()),
                None => Counter::Count(0),
            });

        let is_new = match (counter, key) {
            (Counter::Keys(keys), Some(key)) => keys.insert(key.to_string()),
            (Counter::Keys(_), None) => true,
            (Counter::Count(n), _) => {
                *n += 1;
                true
            }
        };
        if is_new {
            self.all += 1;
        }
    }

    /// Effective slice length for a reader; marks the partition as read
    pub(crate) fn get_limit(&mut self, symbol: Option<&str>, limit: Option<usize>) -> Option<usize> {
        let new_updates = match symbol {
            None => {
                self.clear_all = true;
                Some(self.all)
            }
            Some(symbol) => {
                self.clear_by_symbol.insert(symbol.to_string());
                self.by_symbol.get(symbol).map(Counter::len)
            }
        };
        match (new_updates, limit) {
            (None, limit) => limit,
            (Some(n), Some(limit)) => Some(n.min(limit)),
            (Some(n), None) => Some(n),
        }
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }
}
