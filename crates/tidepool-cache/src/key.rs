//! Cache key derivation and lexical write-statement detection.
//!
//! Keys are the whitespace-collapsed query text, a newline, then the
//! parameters as compact JSON. Literal values stay in the key, so
//! `WHERE id = 1` and `WHERE id = 2` are distinct entries.

use std::sync::LazyLock;

use regex::Regex;

use tidepool_core::Value;

const SEPARATOR: char = '\n';

static WRITE_KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(INSERT|UPDATE|DELETE|REPLACE|MERGE|UPSERT|TRUNCATE|CREATE|ALTER|DROP|GRANT|REVOKE)\b",
    )
    .expect("write keyword pattern is valid")
});

/// Derive the cache key for `query` run with `params`.
pub fn derive_key(query: &str, params: &[Value]) -> String {
    let mut key = normalize_query(query);
    key.push(SEPARATOR);
    key.push_str(&Value::Array(params.to_vec()).to_string());
    key
}

/// The query part of a key built by [`derive_key`]; plain keys are returned
/// unchanged. Compact JSON never contains a raw newline, so the parameters
/// start after the last separator even when a literal spans lines.
pub fn query_of(key: &str) -> &str {
    match key.rsplit_once(SEPARATOR) {
        Some((query, params)) if params.starts_with('[') => query,
        _ => key,
    }
}

/// Trim and collapse runs of whitespace outside quoted literals.
pub fn normalize_query(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;
    for c in query.trim().chars() {
        match quote {
            Some(q) => {
                out.push(c);
                if c == q {
                    quote = None;
                }
            }
            None if c.is_whitespace() => pending_space = true,
            None => {
                if pending_space {
                    out.push(' ');
                    pending_space = false;
                }
                if c == '\'' || c == '"' || c == '`' {
                    quote = Some(c);
                }
                out.push(c);
            }
        }
    }
    out
}

/// Whether `sql` modifies data or schema. Keywords inside quoted literals,
/// quoted identifiers, and comments are ignored.
pub fn is_write_statement(sql: &str) -> bool {
    WRITE_KEYWORD.is_match(&strip_literals_and_comments(sql))
}

fn strip_literals_and_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' | '`' => {
                // Doubled quotes inside a literal re-enter the literal on the
                // next iteration, which strips them the same way.
                for inner in chars.by_ref() {
                    if inner == c {
                        break;
                    }
                }
                out.push(' ');
            }
            '-' if chars.peek() == Some(&'-') => {
                for inner in chars.by_ref() {
                    if inner == '\n' {
                        break;
                    }
                }
                out.push(' ');
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for inner in chars.by_ref() {
                    if prev == '*' && inner == '/' {
                        break;
                    }
                    prev = inner;
                }
                out.push(' ');
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_collapses_whitespace_and_keeps_literals() {
        let a = derive_key("SELECT *\n  FROM users\tWHERE id = 1", &[]);
        let b = derive_key("  SELECT * FROM users WHERE id = 1 ", &[]);
        let c = derive_key("SELECT * FROM users WHERE id = 2", &[]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn key_depends_on_param_order() {
        let a = derive_key("SELECT $1, $2", &[json!(1), json!("x")]);
        let b = derive_key("SELECT $1, $2", &[json!("x"), json!(1)]);
        assert_ne!(a, b);
        assert_eq!(query_of(&a), "SELECT $1, $2");
    }

    #[test]
    fn query_of_keeps_newlines_inside_literals() {
        let key = derive_key("SELECT 'a\nb'; DELETE FROM t", &[json!("x\ny")]);
        assert_eq!(query_of(&key), "SELECT 'a\nb'; DELETE FROM t");
        assert!(is_write_statement(query_of(&key)));
        assert_eq!(query_of("plain\nkey"), "plain\nkey");
    }

    #[test]
    fn whitespace_inside_literals_is_preserved() {
        assert_eq!(
            normalize_query("SELECT 'a   b'  FROM t"),
            "SELECT 'a   b' FROM t"
        );
    }

    #[test]
    fn detects_write_statements() {
        assert!(is_write_statement("INSERT INTO users VALUES (1)"));
        assert!(is_write_statement("  update users set name = 'x'"));
        assert!(is_write_statement("WITH gone AS (DELETE FROM t RETURNING *) SELECT * FROM gone"));
        assert!(is_write_statement("truncate table audit"));
        assert!(!is_write_statement("SELECT * FROM users"));
    }

    #[test]
    fn ignores_keywords_in_literals_and_comments() {
        assert!(!is_write_statement("SELECT 'DELETE FROM users' AS text"));
        assert!(!is_write_statement("SELECT 1 -- drop table users"));
        assert!(!is_write_statement("SELECT /* INSERT */ 1"));
        assert!(!is_write_statement("SELECT updated_at FROM users"));
    }
}
