//! Bounded, append-only record of the worker's recent tool invocations.
//!
//! Cleared after every successful injection so each supervisor turn sees
//! only the work the worker has done since the previous turn.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

const SNIPPET_LIMIT: usize = 150;

#[derive(Debug, Clone, Serialize)]
pub struct ToolHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub tool_name: String,
    pub input: serde_json::Value,
    pub output_snippet: String,
    pub error: Option<String>,
}

pub struct ToolHistoryRing {
    capacity: usize,
    entries: VecDeque<ToolHistoryEntry>,
}

impl ToolHistoryRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn append(
        &mut self,
        tool_name: impl Into<String>,
        input: serde_json::Value,
        output: &str,
        error: Option<String>,
    ) {
        let output_snippet = truncate(output, SNIPPET_LIMIT);
        self.entries.push_back(ToolHistoryEntry {
            timestamp: Utc::now(),
            tool_name: tool_name.into(),
            input,
            output_snippet,
            error,
        });
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// Returns the last `n` entries, oldest first (i.e. newest-last).
    pub fn recent(&self, n: usize) -> Vec<ToolHistoryEntry> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn error_count(&self) -> usize {
        self.entries.iter().filter(|e| e.error.is_some()).count()
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max_chars).collect();
        out.push('…');
        out
    }
}
