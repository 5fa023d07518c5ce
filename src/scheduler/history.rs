//! Bounded log of executed transactions.

use super::txn::TxnReport;
use std::collections::VecDeque;

#[derive(Debug)]
pub struct TxnHistory {
    capacity: usize,
    records: VecDeque<TxnReport>,
}

impl TxnHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Append a report, evicting the oldest beyond capacity.
    pub fn record(&mut self, report: TxnReport) {
        if self.capacity == 0 {
            return;
        }
        while self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(report);
    }

    /// Reports, oldest first.
    pub fn reports(&self) -> Vec<TxnReport> {
        self.records.iter().cloned().collect()
    }

    pub fn get(&self, seq: u64) -> Option<&TxnReport> {
        self.records.iter().find(|r| r.seq == seq)
    }

    pub fn latest(&self) -> Option<&TxnReport> {
        self.records.back()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
