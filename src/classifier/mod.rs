//! # Table Classifier
//!
//! Decides whether a table lives once in the shared schema or once per tenant
//! schema. Explicit allowlists win (shared before partitioned); otherwise a
//! table is shared when it has at least one foreign key, every foreign key
//! resolves to a shared table, and every other column is an auto-generated key.

pub mod graph;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{PoisonError, RwLock};

use serde::Serialize;

use crate::config::TenancyConfig;
use crate::error::TenancyError;
use crate::models::REGISTRY_TABLES;

pub use graph::{ColumnInfo, ManyToMany, SchemaGraph, TableInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableClass {
    Shared,
    Partitioned,
}

impl fmt::Display for TableClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableClass::Shared => f.write_str("shared"),
            TableClass::Partitioned => f.write_str("partitioned"),
        }
    }
}

/// Result of one walk step: the class plus whether a cycle was hit below it.
#[derive(Debug, Clone, Copy)]
struct Walk {
    class: TableClass,
    tainted: bool,
}

impl Walk {
    fn clean(class: TableClass) -> Self {
        Self {
            class,
            tainted: false,
        }
    }
}

pub struct TableClassifier {
    graph: SchemaGraph,
    shared: BTreeSet<String>,
    partitioned: BTreeSet<String>,
    memo: RwLock<HashMap<String, TableClass>>,
}

impl TableClassifier {
    pub fn new(
        graph: SchemaGraph,
        shared: impl IntoIterator<Item = String>,
        partitioned: impl IntoIterator<Item = String>,
    ) -> Self {
        let mut shared: BTreeSet<String> = shared.into_iter().collect();
        shared.extend(REGISTRY_TABLES.iter().map(|t| t.to_string()));

        Self {
            graph,
            shared,
            partitioned: partitioned.into_iter().collect(),
            memo: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(graph: SchemaGraph, settings: &TenancyConfig) -> Self {
        Self::new(
            graph,
            settings.shared_tables.iter().cloned(),
            settings.partitioned_tables.iter().cloned(),
        )
    }

    pub fn graph(&self) -> &SchemaGraph {
        &self.graph
    }

    /// Classifies one table by name. Join tables absent from the graph are
    /// resolved through their owning tables.
    pub fn classify(&self, table: &str) -> TableClass {
        let mut visited = HashSet::new();
        let walk = self.walk(table, &mut visited);
        tracing::trace!(table, class = %walk.class, tainted = walk.tainted, "table classified");
        walk.class
    }

    /// Shared only when every table is shared. An empty set is partitioned.
    pub fn classify_all<'a, I>(&self, tables: I) -> TableClass
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut any = false;
        for table in tables {
            any = true;
            if self.classify(table) == TableClass::Partitioned {
                return TableClass::Partitioned;
            }
        }
        if any {
            TableClass::Shared
        } else {
            TableClass::Partitioned
        }
    }

    pub fn is_shared(&self, table: &str) -> bool {
        self.classify(table) == TableClass::Shared
    }

    /// Drops memoised results, e.g. after the graph's source schemas changed.
    pub fn clear_memo(&self) {
        self.memo
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn explicit(&self, table: &str) -> Option<TableClass> {
        if self.shared.contains(table) {
            Some(TableClass::Shared)
        } else if self.partitioned.contains(table) {
            Some(TableClass::Partitioned)
        } else {
            None
        }
    }

    fn memoised(&self, table: &str) -> Option<TableClass> {
        self.memo
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .copied()
    }

    fn remember(&self, table: &str, class: TableClass) {
        self.memo
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table.to_string(), class);
    }

    fn walk(&self, table: &str, visited: &mut HashSet<String>) -> Walk {
        if let Some(class) = self.explicit(table) {
            return Walk::clean(class);
        }
        if let Some(class) = self.memoised(table) {
            return Walk::clean(class);
        }
        if !visited.insert(table.to_string()) {
            let cycle = TenancyError::ClassificationCycle {
                table: table.to_string(),
            };
            tracing::warn!(table, error = %cycle, "classification cycle, treating as partitioned");
            return Walk {
                class: TableClass::Partitioned,
                tainted: true,
            };
        }

        let walk = match self.graph.table(table) {
            Some(info) => self.walk_columns(info, visited),
            None => match self.graph.join_sides(table) {
                Some((left, right)) => {
                    let left = self.walk(left, visited);
                    if left.class == TableClass::Partitioned {
                        left
                    } else {
                        let right = self.walk(right, visited);
                        Walk {
                            class: right.class,
                            tainted: left.tainted || right.tainted,
                        }
                    }
                }
                None => Walk::clean(TableClass::Partitioned),
            },
        };

        if !walk.tainted {
            self.remember(table, walk.class);
        }
        walk
    }

    fn walk_columns(&self, info: &TableInfo, visited: &mut HashSet<String>) -> Walk {
        let mut foreign_keys = 0usize;
        let mut tainted = false;

        for column in &info.columns {
            match &column.references {
                Some(target) => {
                    foreign_keys += 1;
                    let target = self.walk(target, visited);
                    tainted |= target.tainted;
                    if target.class == TableClass::Partitioned {
                        return Walk {
                            class: TableClass::Partitioned,
                            tainted,
                        };
                    }
                }
                None if column.primary_key || column.auto_generated => {}
                None => {
                    return Walk {
                        class: TableClass::Partitioned,
                        tainted,
                    };
                }
            }
        }

        let class = if foreign_keys > 0 {
            TableClass::Shared
        } else {
            TableClass::Partitioned
        };
        Walk { class, tainted }
    }
}
