//! Queue of statements that must run after a batch of structural changes.

use std::collections::HashSet;

/// A queued statement and the tables of the change that queued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deferred {
    pub sql: String,
    pub tables: Vec<String>,
}

/// Deduplicating, insertion-ordered statement queue.
///
/// Statements are keyed by their normalized text: runs of whitespace collapse
/// to one space and a trailing `;` is ignored. The first spelling seen, and
/// the tables it was queued with, are what gets replayed.
#[derive(Debug, Default, Clone)]
pub struct DeferredQueue {
    statements: Vec<Deferred>,
    seen: HashSet<String>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `sql` unless an equivalent statement is already queued.
    /// Returns whether it was added.
    pub fn push(&mut self, sql: &str, tables: &[String]) -> bool {
        let key = normalize(sql);
        if key.is_empty() || !self.seen.insert(key) {
            return false;
        }
        self.statements.push(Deferred {
            sql: sql.trim().to_string(),
            tables: tables.to_vec(),
        });
        true
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.statements.iter().map(|deferred| deferred.sql.as_str())
    }

    /// Empties the queue, returning statements in first-seen order.
    pub fn drain(&mut self) -> Vec<Deferred> {
        self.seen.clear();
        std::mem::take(&mut self.statements)
    }
}

pub fn normalize(sql: &str) -> String {
    let collapsed = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.trim_end_matches(';').trim_end().to_string()
}
