//! Rendering records into uploadable Markdown documents.
//!
//! Records without a downloaded attachment are published as a Markdown file
//! with a frontmatter block. The file name doubles as the ledger identity, so
//! it is derived from the record id alone and stays stable across runs.

use std::path::{Path, PathBuf};

use chrono::SecondsFormat;
use refkb_fetch::file_stem_for_id;
use refkb_gateway::{MetadataField, MetadataValue};
use refkb_shared::{EnrichedRecord, RefKbError, ReferenceRecord, Result};
use serde_json::{Value, json};
use tracing::debug;

/// File name used when a record is rendered to Markdown. Distinct record
/// ids always give distinct names.
pub fn document_file_name(record: &ReferenceRecord) -> String {
    format!("{}.md", file_stem_for_id(&record.id))
}

/// Render an enriched record as a Markdown document.
pub fn render_markdown(item: &EnrichedRecord) -> String {
    let record = &item.record;
    let mut out = String::from("---\n");
    push_field(&mut out, "title", &record.title);
    push_field(&mut out, "record_id", &record.id);
    push_field(&mut out, "source_type", &record.source_type);
    if let Some(source_id) = record.source_id.as_deref() {
        push_field(&mut out, "source_id", source_id);
    }
    push_field(
        &mut out,
        "created_at",
        &record.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    );
    if let Some(url) = record.attachment_url() {
        push_field(&mut out, "attachment_url", url);
    }
    out.push_str("---\n\n");

    out.push_str(&format!("# {}\n\n", record.title.trim()));

    if let Some(summary) = item.summary.as_deref().filter(|s| !s.is_empty()) {
        for line in summary.lines() {
            out.push_str(&format!("> {line}\n"));
        }
        out.push('\n');
    }

    let body = record.content.trim();
    if !body.is_empty() {
        out.push_str(body);
        out.push_str("\n\n");
    }

    if !record.extra.is_empty() {
        out.push_str("## Attributes\n\n");
        for (key, value) in &record.extra {
            out.push_str(&format!("- **{key}**: {}\n", display_value(value)));
        }
        out.push('\n');
    }

    if let Some(meta) = &item.api_metadata {
        let pretty = serde_json::to_string_pretty(meta).unwrap_or_else(|_| meta.to_string());
        out.push_str("## Source metadata\n\n```json\n");
        out.push_str(&pretty);
        out.push_str("\n```\n");
    }

    out.trim_end().to_string() + "\n"
}

/// Render `item` into `dir` and return the written path.
pub async fn write_document(dir: &Path, item: &EnrichedRecord) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| RefKbError::io(dir, e))?;
    let path = dir.join(document_file_name(&item.record));
    tokio::fs::write(&path, render_markdown(item))
        .await
        .map_err(|e| RefKbError::io(&path, e))?;
    debug!(path = %path.display(), record_id = %item.record.id, "wrote document");
    Ok(path)
}

/// Metadata values for `record`, one per known dataset field.
///
/// Fields without a value on the record are skipped. `published_time` is
/// sent as a Unix timestamp; everything else as a string.
pub fn metadata_values(record: &ReferenceRecord, fields: &[MetadataField]) -> Vec<MetadataValue> {
    fields
        .iter()
        .filter_map(|field| {
            let value = match field.name.as_str() {
                "published_time" => json!(record.created_at.timestamp()),
                "title" => json!(record.title),
                "source_type" => json!(record.source_type),
                "source_id" => json!(record.source_id.as_deref()?),
                other => match record.extra.get(other)? {
                    Value::Null => return None,
                    v => json!(display_value(v)),
                },
            };
            Some(MetadataValue {
                id: field.id.clone(),
                name: field.name.clone(),
                value,
            })
        })
        .collect()
}

fn push_field(out: &mut String, key: &str, value: &str) {
    // JSON string literals are valid YAML scalars.
    out.push_str(&format!("{key}: {}\n", Value::from(value)));
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
