//! Attendance deduplication for one capture session.

use crate::types::{AttendanceRecord, AttendanceStatus};
use chrono::Local;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct SessionState {
    records: Vec<AttendanceRecord>,
    marked: HashSet<String>,
    delta: Vec<String>,
}

/// Records the first sighting of each label since the last reset.
///
/// Single writer (the capture loop), any number of readers. Every read
/// returns an owned copy taken under the lock.
#[derive(Default)]
pub struct AttendanceSession {
    state: Mutex<SessionState>,
}

impl AttendanceSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `label` present unless it already is. Returns `true` on first mark.
    pub fn mark_if_new(&self, label: &str) -> bool {
        let mut state = self.lock();
        mark(&mut state, label)
    }

    /// Mark every label seen during one capture tick.
    ///
    /// Returns the newly marked labels. When there are any they replace the
    /// live delta; a tick with nothing new leaves the previous delta visible.
    pub fn mark_tick<'a, I>(&self, labels: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut state = self.lock();
        let mut fresh = Vec::new();
        for label in labels {
            if mark(&mut state, label) {
                fresh.push(label.to_string());
            }
        }
        if !fresh.is_empty() {
            state.delta = fresh.clone();
        }
        fresh
    }

    /// All records of this session, in marking order.
    pub fn snapshot(&self) -> Vec<AttendanceRecord> {
        self.lock().records.clone()
    }

    /// Labels newly marked by the most recent tick that marked anything.
    pub fn recent_delta(&self) -> Vec<String> {
        self.lock().delta.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&self) {
        *self.lock() = SessionState::default();
        tracing::debug!("attendance session reset");
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn mark(state: &mut SessionState, label: &str) -> bool {
    if state.marked.contains(label) {
        return false;
    }
    let record = AttendanceRecord {
        label: label.to_string(),
        marked_at: Local::now(),
        status: AttendanceStatus::Present,
    };
    tracing::info!(label, time = %record.marked_at.format("%H:%M:%S"), "marked present");
    state.marked.insert(label.to_string());
    state.records.push(record);
    true
}
