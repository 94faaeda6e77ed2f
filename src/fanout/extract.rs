//! Table-name recognition for raw DDL text.
//!
//! This is pattern matching over the statement head only, not parsing. A
//! statement that matches nothing yields no tables and is fanned out.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Kind of structural operation a change performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    CreateTable,
    AlterTable,
    DropTable,
    AddColumn,
    AlterColumn,
    DropColumn,
    CreateIndex,
    DropIndex,
    AddConstraint,
    DropConstraint,
    CreateTrigger,
    DropTrigger,
    CreateView,
    DropView,
    /// Not recognised
    Other,
}

/// Matches a possibly schema-qualified, possibly quoted relation name.
const NAME: &str = r#"((?:"[^"]+"|[A-Za-z_][A-Za-z0-9_$]*)(?:\s*\.\s*(?:"[^"]+"|[A-Za-z_][A-Za-z0-9_$]*))?)"#;

struct Pattern {
    kind: ChangeKind,
    regex: Regex,
}

fn pattern(kind: ChangeKind, head: &str) -> Pattern {
    let regex = Regex::new(&format!(r"(?is)^\s*{}", head.replace("{NAME}", NAME)))
        .expect("Invalid DDL pattern");
    Pattern { kind, regex }
}

static PATTERNS: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    vec![
        pattern(
            ChangeKind::CreateTable,
            r"create\s+(?:(?:global\s+|local\s+)?(?:temporary|temp)\s+|unlogged\s+)?table\s+(?:if\s+not\s+exists\s+)?{NAME}",
        ),
        pattern(
            ChangeKind::DropTable,
            r"drop\s+table\s+(?:if\s+exists\s+)?{NAME}",
        ),
        pattern(
            ChangeKind::CreateIndex,
            r"create\s+(?:unique\s+)?index\s+(?:concurrently\s+)?(?:(?:if\s+not\s+exists\s+)?(?:{NAME}\s+)?)?on\s+(?:only\s+)?{NAME}",
        ),
        pattern(
            ChangeKind::AddConstraint,
            r"alter\s+table\s+(?:if\s+exists\s+)?(?:only\s+)?{NAME}\s+add\s+(?:constraint\s+\S+\s+)?(?:unique|check|primary\s+key|foreign\s+key|exclude)\b",
        ),
        pattern(
            ChangeKind::DropConstraint,
            r"alter\s+table\s+(?:if\s+exists\s+)?(?:only\s+)?{NAME}\s+drop\s+constraint",
        ),
        pattern(
            ChangeKind::AddColumn,
            r"alter\s+table\s+(?:if\s+exists\s+)?(?:only\s+)?{NAME}\s+add\s+(?:column\s+)?",
        ),
        pattern(
            ChangeKind::DropColumn,
            r"alter\s+table\s+(?:if\s+exists\s+)?(?:only\s+)?{NAME}\s+drop\s+(?:column\s+)?",
        ),
        pattern(
            ChangeKind::AlterColumn,
            r"alter\s+table\s+(?:if\s+exists\s+)?(?:only\s+)?{NAME}\s+alter\s+",
        ),
        pattern(
            ChangeKind::AlterTable,
            r"alter\s+table\s+(?:if\s+exists\s+)?(?:only\s+)?{NAME}",
        ),
        pattern(
            ChangeKind::CreateTrigger,
            r"create\s+(?:or\s+replace\s+)?(?:constraint\s+)?trigger\s+{NAME}\s+.*?\s+on\s+{NAME}",
        ),
        pattern(
            ChangeKind::DropTrigger,
            r"drop\s+trigger\s+(?:if\s+exists\s+)?{NAME}\s+on\s+{NAME}",
        ),
        pattern(
            ChangeKind::CreateView,
            r"create\s+(?:or\s+replace\s+)?(?:(?:temporary|temp)\s+)?(?:materialized\s+)?view\s+(?:if\s+not\s+exists\s+)?{NAME}",
        ),
        pattern(
            ChangeKind::DropView,
            r"drop\s+(?:materialized\s+)?view\s+(?:if\s+exists\s+)?{NAME}",
        ),
        pattern(ChangeKind::DropIndex, r"drop\s+index\s+"),
    ]
});

/// Recognises the operation and the table a raw DDL statement targets.
pub fn extract(sql: &str) -> (ChangeKind, Vec<String>) {
    for pattern in PATTERNS.iter() {
        let Some(captures) = pattern.regex.captures(sql) else {
            continue;
        };
        // The table is always the last captured name: index and trigger
        // patterns capture their own name first.
        let table = captures
            .iter()
            .skip(1)
            .flatten()
            .last()
            .map(|m| unqualify(m.as_str()));
        return (pattern.kind, table.into_iter().collect());
    }
    (ChangeKind::Other, Vec::new())
}

/// Strips the schema qualifier and identifier quotes from a relation name.
pub fn unqualify(name: &str) -> String {
    let last = name.rsplit('.').next().unwrap_or(name).trim();
    match last.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        Some(quoted) => quoted.replace("\"\"", "\""),
        None => last.to_ascii_lowercase(),
    }
}
