//! Translation of [`QueryConditions`] into a parameterized `WHERE` clause.

use std::sync::LazyLock;

use libsql::Value;
use refkb_shared::{QueryConditions, RefKbError, Result};
use regex::Regex;

/// Columns matched directly; any other key is looked up in `extra`.
const KNOWN_COLUMNS: &[&str] = &["id", "title", "source_type", "source_id", "attachment_url"];

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));

/// A `WHERE` body (without the keyword) and its positional parameters.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct SqlFilter {
    pub clause: String,
    pub values: Vec<Value>,
}

impl SqlFilter {
    fn push(&mut self, predicate: String) {
        if !self.clause.is_empty() {
            self.clause.push_str(" AND ");
        }
        self.clause.push_str(&predicate);
    }

    fn bind(&mut self, value: Value) -> usize {
        self.values.push(value);
        self.values.len()
    }
}

pub(crate) fn build_filter(conditions: &QueryConditions) -> Result<SqlFilter> {
    let mut filter = SqlFilter::default();

    if let Some(range) = &conditions.date_range {
        if let (Some(start), Some(end)) = (range.start, range.end) {
            if start > end {
                return Err(RefKbError::validation(format!(
                    "date_range start {start} is after end {end}"
                )));
            }
        }
        if let Some(start) = range.start {
            let n = filter.bind(Value::Text(start.format("%Y-%m-%d").to_string()));
            filter.push(format!("date(created_at) >= ?{n}"));
        }
        if let Some(end) = range.end {
            let n = filter.bind(Value::Text(end.format("%Y-%m-%d").to_string()));
            filter.push(format!("date(created_at) <= ?{n}"));
        }
    }

    if let Some(keywords) = conditions.keywords.as_deref().map(str::trim) {
        if !keywords.is_empty() {
            let n = filter.bind(Value::Text(format!("%{}%", escape_like(keywords))));
            filter.push(format!(
                "(title LIKE ?{n} ESCAPE '\\' OR content LIKE ?{n} ESCAPE '\\')"
            ));
        }
    }

    for (key, value) in &conditions.equals {
        if !IDENTIFIER.is_match(key) {
            return Err(RefKbError::validation(format!(
                "invalid condition field name: {key:?}"
            )));
        }
        let target = if KNOWN_COLUMNS.contains(&key.as_str()) {
            key.clone()
        } else {
            format!("json_extract(extra, '$.{key}')")
        };

        match scalar(key, value)? {
            Value::Null => filter.push(format!("{target} IS NULL")),
            bound => {
                let n = filter.bind(bound);
                filter.push(format!("{target} = ?{n}"));
            }
        }
    }

    Ok(filter)
}

fn scalar(key: &str, value: &serde_json::Value) -> Result<Value> {
    use serde_json::Value as J;
    Ok(match value {
        J::Null => Value::Null,
        J::Bool(b) => Value::Integer(i64::from(*b)),
        J::String(s) => Value::Text(s.clone()),
        J::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => Value::Real(n.as_f64().unwrap_or_default()),
        },
        J::Array(_) | J::Object(_) => {
            return Err(RefKbError::validation(format!(
                "condition {key:?} must be a scalar value"
            )));
        }
    })
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
