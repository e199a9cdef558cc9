//! Change analysis: turning a completed write into [`Change`] records.
//!
//! Three entry points:
//! - [`analyze_write`] for callers that know the source, operation and keys
//! - [`infer_mutation_changes`] for mutation functions, reading the written
//!   row id and organization from the function's input and output
//! - [`analyze_sql`] for raw statements, a best-effort regex extraction of
//!   table, operation, `id` keys, column list and organization scope
//!
//! Organization scope is only ever taken from a column or field named
//! `organization_id` / `organizationId`.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use ripple_core::{Change, ChangeOperation};
use serde::Serialize;
use serde_json::Value;

const ORGANIZATION_FIELDS: [&str; 2] = ["organizationId", "organization_id"];

/// Build a change for a write the caller already understands.
pub fn analyze_write<I, K>(
    source: &str,
    operation: ChangeOperation,
    keys: I,
    organization_id: Option<&str>,
) -> Change
where
    I: IntoIterator<Item = K>,
    K: Into<String>,
{
    let change = Change::new(source, operation, keys.into_iter().map(Into::into).collect());
    match organization_id {
        Some(org) if !org.is_empty() => change.with_organization(org),
        _ => change,
    }
}

/// One change per source a mutation writes.
///
/// Keys come from the output's `id` (or the ids of an output array);
/// organization from the input first, then the output.
pub fn infer_mutation_changes(
    sources: &BTreeSet<String>,
    operation: ChangeOperation,
    input: &Value,
    output: &Value,
) -> Vec<Change> {
    let keys = output_keys(output);
    let organization = organization_of(input).or_else(|| organization_of(output));

    sources
        .iter()
        .map(|source| analyze_write(source, operation, keys.clone(), organization.as_deref()))
        .collect()
}

fn output_keys(output: &Value) -> Vec<String> {
    match output {
        Value::Array(items) => items.iter().filter_map(id_of).collect(),
        other => id_of(other).into_iter().collect(),
    }
}

fn id_of(value: &Value) -> Option<String> {
    scalar_string(value.get("id")?)
}

fn organization_of(value: &Value) -> Option<String> {
    let value = match value {
        Value::Array(items) => items.first()?,
        other => other,
    };
    ORGANIZATION_FIELDS
        .iter()
        .find_map(|field| value.get(*field).and_then(scalar_string))
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// SQL
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SqlVerb {
    Select,
    Insert,
    Update,
    Delete,
}

impl SqlVerb {
    pub fn operation(&self) -> Option<ChangeOperation> {
        match self {
            SqlVerb::Select => None,
            SqlVerb::Insert => Some(ChangeOperation::Create),
            SqlVerb::Update => Some(ChangeOperation::Update),
            SqlVerb::Delete => Some(ChangeOperation::Delete),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SqlAnalysis {
    pub table: String,
    pub verb: SqlVerb,
    /// Values compared to `id` in the WHERE clause (or inserted as `id`)
    pub keys: Vec<String>,
    /// Columns written (INSERT column list or UPDATE SET targets)
    pub columns: Vec<String>,
    pub organization_id: Option<String>,
}

impl SqlAnalysis {
    /// The change this statement makes. `None` for reads.
    pub fn to_change(&self) -> Option<Change> {
        let operation = self.verb.operation()?;
        Some(analyze_write(
            &self.table,
            operation,
            self.keys.clone(),
            self.organization_id.as_deref(),
        ))
    }
}

static INSERT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?is)^\s*insert\s+into\s+(?:[\w"]+\.)?"?(\w+)"?\s*(?:\(([^)]*)\))?\s*(?:values\s*\(([^)]*)\))?"#,
    )
    .expect("valid INSERT pattern")
});

static UPDATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)^\s*update\s+(?:[\w"]+\.)?"?(\w+)"?\s+set\s+(.*?)(?:\s+where\s+(.*))?$"#)
        .expect("valid UPDATE pattern")
});

static DELETE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)^\s*delete\s+from\s+(?:[\w"]+\.)?"?(\w+)"?(?:\s+where\s+(.*))?"#)
        .expect("valid DELETE pattern")
});

static SELECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)^\s*select\s+.*?\s+from\s+(?:[\w"]+\.)?"?(\w+)"?"#)
        .expect("valid SELECT pattern")
});

static ID_EQ_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:^|\W)"?id"?\s*=\s*('(?:[^']*)'|[\w-]+)"#).expect("valid id pattern")
});

static ID_IN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:^|\W)"?id"?\s+in\s*\(([^)]*)\)"#).expect("valid id list pattern")
});

static ORG_EQ_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)"?organization_?id"?\s*=\s*('(?:[^']*)'|[\w-]+)"#)
        .expect("valid organization pattern")
});

static SET_COLUMN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:^|,)\s*"?(\w+)"?\s*="#).expect("valid SET column pattern")
});

/// Best-effort analysis of a single SQL statement.
pub fn analyze_sql(statement: &str) -> Option<SqlAnalysis> {
    let statement = statement.trim().trim_end_matches(';');

    if let Some(caps) = INSERT_RE.captures(statement) {
        let table = caps.get(1)?.as_str().to_string();
        let columns = caps
            .get(2)
            .map(|c| split_list(c.as_str()))
            .unwrap_or_default();
        let values = caps
            .get(3)
            .map(|v| split_list(v.as_str()))
            .unwrap_or_default();

        let value_of = |name: &str| -> Option<String> {
            columns
                .iter()
                .position(|c| c.eq_ignore_ascii_case(name))
                .and_then(|i| values.get(i).cloned())
        };
        let keys = value_of("id").into_iter().collect();
        let organization_id = value_of("organization_id").or_else(|| value_of("organizationid"));

        return Some(SqlAnalysis {
            table,
            verb: SqlVerb::Insert,
            keys,
            columns,
            organization_id,
        });
    }

    if let Some(caps) = UPDATE_RE.captures(statement) {
        let table = caps.get(1)?.as_str().to_string();
        let set_clause = caps.get(2).map_or("", |m| m.as_str());
        let where_clause = caps.get(3).map_or("", |m| m.as_str());
        let columns = SET_COLUMN_RE
            .captures_iter(set_clause)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect();

        return Some(SqlAnalysis {
            table,
            verb: SqlVerb::Update,
            keys: where_keys(where_clause),
            columns,
            organization_id: where_organization(where_clause),
        });
    }

    if let Some(caps) = DELETE_RE.captures(statement) {
        let table = caps.get(1)?.as_str().to_string();
        let where_clause = caps.get(2).map_or("", |m| m.as_str());
        return Some(SqlAnalysis {
            table,
            verb: SqlVerb::Delete,
            keys: where_keys(where_clause),
            columns: Vec::new(),
            organization_id: where_organization(where_clause),
        });
    }

    if let Some(caps) = SELECT_RE.captures(statement) {
        return Some(SqlAnalysis {
            table: caps.get(1)?.as_str().to_string(),
            verb: SqlVerb::Select,
            keys: Vec::new(),
            columns: Vec::new(),
            organization_id: None,
        });
    }

    None
}

fn where_keys(clause: &str) -> Vec<String> {
    let mut keys: Vec<String> = ID_EQ_RE
        .captures_iter(clause)
        .filter_map(|c| c.get(1).map(|m| unquote(m.as_str())))
        .collect();
    for caps in ID_IN_RE.captures_iter(clause) {
        if let Some(list) = caps.get(1) {
            keys.extend(split_list(list.as_str()));
        }
    }
    keys
}

fn where_organization(clause: &str) -> Option<String> {
    ORG_EQ_RE
        .captures(clause)
        .and_then(|c| c.get(1))
        .map(|m| unquote(m.as_str()))
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|item| unquote(item.trim()))
        .filter(|item| !item.is_empty())
        .collect()
}

fn unquote(value: &str) -> String {
    value
        .trim()
        .trim_matches(|c| c == '\'' || c == '"' || c == '`')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_analyze_write() {
        let change = analyze_write("posts", ChangeOperation::Create, ["p1"], Some("org1"));
        assert_eq!(change.source_name, "posts");
        assert_eq!(change.affected_keys, vec!["p1"]);
        assert_eq!(change.organization_id.as_deref(), Some("org1"));

        let unscoped = analyze_write("posts", ChangeOperation::Delete, Vec::<String>::new(), Some(""));
        assert!(unscoped.organization_id.is_none());
    }

    #[test]
    fn test_infer_mutation_changes() {
        let sources: BTreeSet<String> = ["posts".to_string()].into();
        let input = json!({"title": "Hello", "organizationId": "org1"});
        let output = json!({"id": "p1", "title": "Hello", "organizationId": "org1"});

        let changes = infer_mutation_changes(&sources, ChangeOperation::Create, &input, &output);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].source_name, "posts");
        assert_eq!(changes[0].affected_keys, vec!["p1"]);
        assert_eq!(changes[0].organization_id.as_deref(), Some("org1"));
    }

    #[test]
    fn test_infer_from_output_array_and_snake_case() {
        let sources: BTreeSet<String> = ["users".to_string(), "audit".to_string()].into();
        let output = json!([
            {"id": 1, "organization_id": "org2"},
            {"id": 2, "organization_id": "org2"}
        ]);
        let changes =
            infer_mutation_changes(&sources, ChangeOperation::Update, &json!({}), &output);
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.affected_keys == vec!["1", "2"]));
        assert!(
            changes
                .iter()
                .all(|c| c.organization_id.as_deref() == Some("org2"))
        );
    }

    #[test]
    fn test_sql_insert() {
        let analysis = analyze_sql(
            "INSERT INTO posts (id, title, organization_id) VALUES ('p1', 'Hi', 'org1');",
        )
        .unwrap();
        assert_eq!(analysis.table, "posts");
        assert_eq!(analysis.verb, SqlVerb::Insert);
        assert_eq!(analysis.columns, vec!["id", "title", "organization_id"]);
        assert_eq!(analysis.keys, vec!["p1"]);
        assert_eq!(analysis.organization_id.as_deref(), Some("org1"));

        let change = analysis.to_change().unwrap();
        assert_eq!(change.operation, ChangeOperation::Create);
    }

    #[test]
    fn test_sql_update_with_where() {
        let analysis = analyze_sql(
            r#"update "public"."users" set name = 'Ada', email='a@b.c' where id = 42 and organization_id = 'org1'"#,
        )
        .unwrap();
        assert_eq!(analysis.table, "users");
        assert_eq!(analysis.verb, SqlVerb::Update);
        assert_eq!(analysis.columns, vec!["name", "email"]);
        assert_eq!(analysis.keys, vec!["42"]);
        assert_eq!(analysis.organization_id.as_deref(), Some("org1"));
    }

    #[test]
    fn test_sql_delete_id_list() {
        let analysis = analyze_sql("DELETE FROM posts WHERE id IN ('a', 'b')").unwrap();
        assert_eq!(analysis.verb, SqlVerb::Delete);
        assert_eq!(analysis.keys, vec!["a", "b"]);
        assert!(analysis.organization_id.is_none());
        assert_eq!(
            analysis.to_change().unwrap().operation,
            ChangeOperation::Delete
        );
    }

    #[test]
    fn test_sql_author_id_is_not_a_key() {
        let analysis = analyze_sql("DELETE FROM posts WHERE author_id = 'u1'").unwrap();
        assert!(analysis.keys.is_empty());
    }

    #[test]
    fn test_sql_select_produces_no_change() {
        let analysis = analyze_sql("SELECT * FROM posts WHERE id = 1").unwrap();
        assert_eq!(analysis.verb, SqlVerb::Select);
        assert_eq!(analysis.table, "posts");
        assert!(analysis.to_change().is_none());
    }

    #[test]
    fn test_sql_unrecognized() {
        assert!(analyze_sql("VACUUM").is_none());
        assert!(analyze_sql("").is_none());
    }
}
