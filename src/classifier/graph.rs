//! Column and foreign-key graph the classifier walks.

use std::collections::BTreeMap;

use sea_orm::{ConnectionTrait, DbErr, FromQueryResult, Statement, Value};

use crate::namespace::SchemaName;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub primary_key: bool,
    /// Identity, serial or generated column
    pub auto_generated: bool,
    /// Table this column references through a foreign key
    pub references: Option<String>,
}

impl ColumnInfo {
    pub fn primary_key(name: &str) -> Self {
        Self {
            name: name.to_string(),
            primary_key: true,
            auto_generated: true,
            references: None,
        }
    }

    pub fn foreign_key(name: &str, target: &str) -> Self {
        Self {
            name: name.to_string(),
            primary_key: false,
            auto_generated: false,
            references: Some(target.to_string()),
        }
    }

    pub fn data(name: &str) -> Self {
        Self {
            name: name.to_string(),
            primary_key: false,
            auto_generated: false,
            references: None,
        }
    }
}

/// A many-to-many field whose join table is created implicitly as
/// `{owner}_{field}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManyToMany {
    pub field: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub many_to_many: Vec<ManyToMany>,
}

impl TableInfo {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            columns: Vec::new(),
            many_to_many: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnInfo) -> Self {
        self.columns.push(column);
        self
    }

    pub fn many_to_many(mut self, field: &str, target: &str) -> Self {
        self.many_to_many.push(ManyToMany {
            field: field.to_string(),
            target: target.to_string(),
        });
        self
    }

    pub fn foreign_keys(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().filter_map(|c| c.references.as_deref())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchemaGraph {
    tables: BTreeMap<String, TableInfo>,
}

impl SchemaGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: TableInfo) -> Self {
        self.insert(table);
        self
    }

    pub fn insert(&mut self, table: TableInfo) {
        self.tables.insert(table.name.clone(), table);
    }

    pub fn table(&self, name: &str) -> Option<&TableInfo> {
        self.tables.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Resolves a join table name to the two tables it connects.
    ///
    /// The owner is the longest known table name that prefixes `name` followed
    /// by `_`. The other side is the declared many-to-many target for the
    /// remaining suffix, or the suffix itself when it names a known table.
    pub fn join_sides(&self, name: &str) -> Option<(&str, &str)> {
        let owner = self
            .tables
            .keys()
            .filter(|candidate| {
                name.len() > candidate.len() + 1
                    && name.starts_with(candidate.as_str())
                    && name.as_bytes()[candidate.len()] == b'_'
            })
            .max_by_key(|candidate| candidate.len())?;

        let suffix = &name[owner.len() + 1..];
        let info = &self.tables[owner];

        if let Some(m2m) = info.many_to_many.iter().find(|m| m.field == suffix) {
            return Some((owner.as_str(), m2m.target.as_str()));
        }

        self.tables
            .get_key_value(suffix)
            .map(|(other, _)| (owner.as_str(), other.as_str()))
    }

    /// Introspects the tables of `schemas` from `pg_catalog`. A table present
    /// in more than one schema is merged by name.
    pub async fn load<C>(conn: &C, schemas: &[&SchemaName]) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut graph = SchemaGraph::new();
        if schemas.is_empty() {
            return Ok(graph);
        }

        let placeholders = (1..=schemas.len())
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            r#"SELECT c.relname AS table_name,
       a.attname AS column_name,
       COALESCE(pk.is_pk, false) AS primary_key,
       (a.attidentity <> '' OR a.attgenerated <> ''
        OR COALESCE(pg_get_expr(d.adbin, d.adrelid) LIKE 'nextval(%', false)) AS auto_generated,
       fk.relname AS referenced_table
FROM pg_catalog.pg_class c
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
JOIN pg_catalog.pg_attribute a ON a.attrelid = c.oid AND a.attnum > 0 AND NOT a.attisdropped
LEFT JOIN pg_catalog.pg_attrdef d ON d.adrelid = c.oid AND d.adnum = a.attnum
LEFT JOIN LATERAL (
    SELECT true AS is_pk FROM pg_catalog.pg_constraint con
    WHERE con.conrelid = c.oid AND con.contype = 'p' AND a.attnum = ANY (con.conkey)
    LIMIT 1
) pk ON true
LEFT JOIN LATERAL (
    SELECT rc.relname FROM pg_catalog.pg_constraint con
    JOIN pg_catalog.pg_class rc ON rc.oid = con.confrelid
    WHERE con.conrelid = c.oid AND con.contype = 'f' AND a.attnum = ANY (con.conkey)
    LIMIT 1
) fk ON true
WHERE n.nspname IN ({placeholders}) AND c.relkind IN ('r', 'p')
ORDER BY c.relname, a.attnum"#
        );

        let values = schemas
            .iter()
            .map(|schema| Value::from(schema.as_str()))
            .collect::<Vec<_>>();
        let stmt = Statement::from_sql_and_values(conn.get_database_backend(), sql, values);

        for row in CatalogColumn::find_by_statement(stmt).all(conn).await? {
            let table = graph
                .tables
                .entry(row.table_name.clone())
                .or_insert_with(|| TableInfo::new(&row.table_name));
            if table.columns.iter().any(|c| c.name == row.column_name) {
                continue;
            }
            table.columns.push(ColumnInfo {
                name: row.column_name,
                primary_key: row.primary_key,
                auto_generated: row.auto_generated,
                references: row.referenced_table,
            });
        }

        tracing::debug!(tables = graph.len(), "schema graph loaded");
        Ok(graph)
    }
}

#[derive(Debug, FromQueryResult)]
struct CatalogColumn {
    table_name: String,
    column_name: String,
    primary_key: bool,
    auto_generated: bool,
    referenced_table: Option<String>,
}
