//! SQL migration definitions for the reference database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: reference_items",
            sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Report references selected for knowledge-base builds
CREATE TABLE IF NOT EXISTS reference_items (
    id             TEXT PRIMARY KEY,
    title          TEXT NOT NULL,
    content        TEXT NOT NULL DEFAULT '',
    source_type    TEXT NOT NULL,
    source_id      TEXT,
    attachment_url TEXT,
    extra          TEXT NOT NULL DEFAULT '{}',
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Index reference_items by creation time and source",
            sql: r#"
CREATE INDEX IF NOT EXISTS idx_reference_items_created ON reference_items(created_at DESC, id DESC);
CREATE INDEX IF NOT EXISTS idx_reference_items_source ON reference_items(source_type, source_id);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
