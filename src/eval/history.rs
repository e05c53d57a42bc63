//! Bounded history of evaluation records.

use std::collections::VecDeque;
use std::sync::Arc;

use super::info::EvaluationInfo;

/// Keeps the most recent evaluation records, evicting the oldest beyond the
/// configured capacity. Records are shared, never copied or mutated.
pub struct EvaluationHistory {
    capacity: usize,
    records: std::sync::Mutex<VecDeque<Arc<EvaluationInfo>>>,
}

impl EvaluationHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: std::sync::Mutex::new(VecDeque::new()),
        }
    }

    /// Append a finalized record.
    pub fn record(&self, info: Arc<EvaluationInfo>) {
        let Ok(mut records) = self.records.lock() else {
            return;
        };
        records.push_back(info);
        while records.len() > self.capacity {
            records.pop_front();
        }
    }

    /// All retained records, oldest first.
    pub fn snapshot(&self) -> Vec<Arc<EvaluationInfo>> {
        self.records
            .lock()
            .map(|records| records.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
