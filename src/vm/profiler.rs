use std::collections::HashMap;

use serde::Serialize;

/// Default number of entries after which a function counts as hot.
pub const DEFAULT_HOT_THRESHOLD: u64 = 50;

/// Lightweight execution profiler feeding the JIT trigger.
///
/// Tracks two counters per function: entries (incremented on `CALL` to a
/// user function) and backward branches (incremented whenever a `JMP*`
/// resolves to a lower instruction index within the same function).
#[derive(Debug, Clone)]
pub struct Profiler {
    threshold: u64,
    entries: HashMap<u64, u64>,
    backward_branches: HashMap<u64, u64>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_HOT_THRESHOLD)
    }

    pub fn with_threshold(threshold: u64) -> Self {
        Self {
            threshold: threshold.max(1),
            entries: HashMap::new(),
            backward_branches: HashMap::new(),
        }
    }

    /// Records one function entry, returning the updated count.
    pub fn record_entry(&mut self, function_id: u64) -> u64 {
        let count = self.entries.entry(function_id).or_insert(0);
        *count += 1;
        *count
    }

    pub fn record_backward_branch(&mut self, function_id: u64) {
        *self.backward_branches.entry(function_id).or_insert(0) += 1;
    }

    pub fn entry_count(&self, function_id: u64) -> u64 {
        self.entries.get(&function_id).copied().unwrap_or(0)
    }

    pub fn backward_branch_count(&self, function_id: u64) -> u64 {
        self.backward_branches
            .get(&function_id)
            .copied()
            .unwrap_or(0)
    }

    /// Hot once the entry count exceeds the threshold.
    pub fn is_hot(&self, function_id: u64) -> bool {
        self.entry_count(function_id) > self.threshold
    }

    /// Ids of all currently hot functions, unordered.
    pub fn hot_set(&self) -> Vec<u64> {
        self.entries
            .iter()
            .filter(|(_, &count)| count > self.threshold)
            .map(|(&id, _)| id)
            .collect()
    }

    pub fn snapshot(&self) -> ProfileSnapshot {
        let mut functions: Vec<FunctionProfile> = self
            .entries
            .keys()
            .chain(self.backward_branches.keys())
            .copied()
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .map(|id| FunctionProfile {
                function_id: id,
                entries: self.entry_count(id),
                backward_branches: self.backward_branch_count(id),
                hot: self.is_hot(id),
            })
            .collect();
        functions.sort_by(|a, b| {
            (b.entries + b.backward_branches).cmp(&(a.entries + a.backward_branches))
        });
        ProfileSnapshot {
            threshold: self.threshold,
            functions,
        }
    }
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

/// Post-run profiler report, serializable for the CLI's JSON output.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileSnapshot {
    pub threshold: u64,
    pub functions: Vec<FunctionProfile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionProfile {
    pub function_id: u64,
    pub entries: u64,
    pub backward_branches: u64,
    pub hot: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hot_after_threshold_is_exceeded() {
        let mut profiler = Profiler::with_threshold(3);
        for _ in 0..3 {
            profiler.record_entry(7);
        }
        assert!(!profiler.is_hot(7));
        profiler.record_entry(7);
        assert!(profiler.is_hot(7));
        assert_eq!(profiler.hot_set(), vec![7]);
    }

    #[test]
    fn counters_are_independent_per_function() {
        let mut profiler = Profiler::with_threshold(1);
        profiler.record_entry(0);
        profiler.record_backward_branch(1);
        assert_eq!(profiler.entry_count(0), 1);
        assert_eq!(profiler.entry_count(1), 0);
        assert_eq!(profiler.backward_branch_count(1), 1);
    }

    #[test]
    fn snapshot_orders_by_total_hotness() {
        let mut profiler = Profiler::with_threshold(1);
        profiler.record_entry(0);
        for _ in 0..5 {
            profiler.record_entry(2);
        }
        let snapshot = profiler.snapshot();
        assert_eq!(snapshot.functions[0].function_id, 2);
        assert!(snapshot.functions[0].hot);
    }
}
