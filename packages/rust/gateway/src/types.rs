//! Wire types for the knowledge-base API.

use serde::{Deserialize, Serialize};

/// A dataset (knowledge base) on the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub permission: Option<String>,
    #[serde(default)]
    pub indexing_technique: Option<String>,
    #[serde(default)]
    pub document_count: u64,
}

/// One page of [`Dataset`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetPage {
    #[serde(default)]
    pub data: Vec<Dataset>,
    #[serde(default)]
    pub has_more: bool,
}

/// A document inside a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub indexing_status: Option<String>,
    #[serde(default)]
    pub word_count: Option<u64>,
    #[serde(default)]
    pub created_at: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct DocumentPage {
    #[serde(default)]
    pub data: Vec<Document>,
    #[serde(default)]
    pub has_more: bool,
}

/// A metadata field defined on a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataField {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct MetadataListing {
    #[serde(default)]
    pub doc_metadata: Vec<MetadataField>,
}

/// One field value attached to a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataValue {
    pub id: String,
    pub name: String,
    pub value: serde_json::Value,
}

/// Metadata assignment for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub document_id: String,
    pub metadata_list: Vec<MetadataValue>,
}

/// Outcome of creating one dataset metadata field.
#[derive(Debug)]
pub struct FieldOutcome {
    pub name: String,
    pub result: refkb_shared::Result<MetadataField>,
}

/// Service-side type of a metadata field, chosen by name.
pub fn field_type_for(name: &str) -> &'static str {
    if name == "published_time" {
        "time"
    } else {
        "string"
    }
}
