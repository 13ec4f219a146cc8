//! Knowledge-base gateway: typed dataset, document and metadata operations.
//!
//! A thin mapping onto [`Transport`] calls. The gateway holds no retry policy
//! of its own; transport failures surface unchanged as [`RefKbError::Api`].

mod process;
mod types;

use std::path::Path;

use refkb_shared::{ApiError, ApiErrorKind, RefKbError, Result};
use refkb_transport::{Transport, UploadFile};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

pub use process::{ProcessMode, Segmentation, process_rule};
pub use types::{
    Dataset, DatasetPage, Document, DocumentMetadata, FieldOutcome, MetadataField, MetadataValue,
    field_type_for,
};

use types::{DocumentPage, MetadataListing};

/// Page size used when walking paginated listings.
const PAGE_LIMIT: u32 = 100;

/// Typed client for the remote knowledge-base service.
#[derive(Debug, Clone)]
pub struct KnowledgeBaseGateway {
    transport: Transport,
}

impl KnowledgeBaseGateway {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    // -----------------------------------------------------------------------
    // Datasets
    // -----------------------------------------------------------------------

    /// Create a dataset and return its id.
    #[instrument(skip_all, fields(name = %name))]
    pub async fn create_dataset(
        &self,
        name: &str,
        description: Option<&str>,
        permission: &str,
        indexing_technique: &str,
    ) -> Result<String> {
        if name.trim().is_empty() {
            return Err(RefKbError::validation("dataset name must not be empty"));
        }

        let mut payload = json!({
            "name": name,
            "permission": permission,
            "indexing_technique": indexing_technique,
        });
        if let Some(description) = description {
            payload["description"] = json!(description);
        }

        let endpoint = "/v1/datasets";
        let body = self.transport.post_json(endpoint, &payload).await?;
        let id = string_field(&body, &["id"], "POST", endpoint)?;
        info!(dataset_id = %id, "dataset created");
        Ok(id)
    }

    pub async fn list_datasets(&self, page: u32, limit: u32) -> Result<DatasetPage> {
        let endpoint = "/v1/datasets";
        let body = self
            .transport
            .get(
                endpoint,
                &[("page", page.to_string()), ("limit", limit.to_string())],
            )
            .await?;
        decode(body, "GET", endpoint)
    }

    /// Walk the dataset listing until a dataset with this exact name turns up.
    pub async fn find_dataset_by_name(&self, name: &str) -> Result<Option<Dataset>> {
        let mut page = 1;
        loop {
            let listing = self.list_datasets(page, PAGE_LIMIT).await?;
            if let Some(found) = listing.data.iter().find(|d| d.name == name) {
                return Ok(Some(found.clone()));
            }
            if listing.data.is_empty() || !listing.has_more {
                return Ok(None);
            }
            page += 1;
        }
    }

    pub async fn get_dataset(&self, dataset_id: &str) -> Result<Dataset> {
        let endpoint = format!("/v1/datasets/{dataset_id}");
        let body = self.transport.get(&endpoint, &[]).await?;
        decode(body, "GET", &endpoint)
    }

    /// Patch name and/or description of a dataset.
    pub async fn update_dataset(
        &self,
        dataset_id: &str,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<Dataset> {
        let mut payload = serde_json::Map::new();
        if let Some(name) = name {
            payload.insert("name".into(), json!(name));
        }
        if let Some(description) = description {
            payload.insert("description".into(), json!(description));
        }
        let endpoint = format!("/v1/datasets/{dataset_id}");
        let body = self
            .transport
            .patch_json(&endpoint, &Value::Object(payload))
            .await?;
        decode(body, "PATCH", &endpoint)
    }

    pub async fn delete_dataset(&self, dataset_id: &str) -> Result<()> {
        let endpoint = format!("/v1/datasets/{dataset_id}");
        self.transport.delete(&endpoint).await?;
        info!(%dataset_id, "dataset deleted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Documents
    // -----------------------------------------------------------------------

    /// Upload a local file as a new document; returns the document id.
    ///
    /// The process mode is validated before the file is read or any
    /// request is sent.
    #[instrument(skip_all, fields(dataset_id = %dataset_id, file = %file_path.display()))]
    pub async fn create_document_by_file(
        &self,
        dataset_id: &str,
        file_path: &Path,
        indexing_technique: &str,
        process_mode: &str,
        segmentation: &Segmentation,
    ) -> Result<String> {
        let rule = process_rule(process_mode.parse()?, segmentation)?;
        let file = UploadFile::from_path(file_path).await?;
        let data = json!({
            "indexing_technique": indexing_technique,
            "process_rule": rule,
        });

        let endpoint = format!("/v1/datasets/{dataset_id}/document/create-by-file");
        let body = self.transport.post_file(&endpoint, &file, &data).await?;
        let document_id = string_field(&body, &["document", "id"], "POST", &endpoint)?;
        debug!(%document_id, "document created");
        Ok(document_id)
    }

    /// Replace the file behind an existing document; returns the document id.
    #[instrument(skip_all, fields(dataset_id = %dataset_id, document_id = %document_id))]
    pub async fn update_document_by_file(
        &self,
        dataset_id: &str,
        document_id: &str,
        file_path: &Path,
        name: Option<&str>,
        indexing_technique: &str,
        process_mode: &str,
        segmentation: &Segmentation,
    ) -> Result<String> {
        let rule = process_rule(process_mode.parse()?, segmentation)?;
        let file = UploadFile::from_path(file_path).await?;
        let mut data = json!({
            "indexing_technique": indexing_technique,
            "process_rule": rule,
        });
        if let Some(name) = name {
            data["name"] = json!(name);
        }

        let endpoint = format!("/v1/datasets/{dataset_id}/documents/{document_id}/update-by-file");
        let body = self.transport.post_file(&endpoint, &file, &data).await?;
        let updated = string_field(&body, &["document", "id"], "POST", &endpoint)?;
        debug!(document_id = %updated, "document updated");
        Ok(updated)
    }

    /// Every document in a dataset, concatenated across pages in order.
    pub async fn list_documents(&self, dataset_id: &str) -> Result<Vec<Document>> {
        let endpoint = format!("/v1/datasets/{dataset_id}/documents");
        let mut documents = Vec::new();
        let mut page = 1u32;

        loop {
            let body = self
                .transport
                .get(
                    &endpoint,
                    &[("page", page.to_string()), ("limit", PAGE_LIMIT.to_string())],
                )
                .await?;
            let listing: DocumentPage = decode(body, "GET", &endpoint)?;
            if listing.data.is_empty() {
                break;
            }
            documents.extend(listing.data);
            if !listing.has_more {
                break;
            }
            page += 1;
        }

        debug!(%dataset_id, count = documents.len(), pages = page, "listed documents");
        Ok(documents)
    }

    pub async fn get_document(&self, dataset_id: &str, document_id: &str) -> Result<Document> {
        let endpoint = format!("/v1/datasets/{dataset_id}/documents/{document_id}");
        let body = self.transport.get(&endpoint, &[]).await?;
        decode(body, "GET", &endpoint)
    }

    pub async fn delete_document(&self, dataset_id: &str, document_id: &str) -> Result<()> {
        let endpoint = format!("/v1/datasets/{dataset_id}/documents/{document_id}");
        self.transport.delete(&endpoint).await?;
        Ok(())
    }

    /// Indexing progress for an upload batch or a single document, as returned.
    pub async fn get_indexing_status(&self, dataset_id: &str, batch_or_document: &str) -> Result<Value> {
        let endpoint =
            format!("/v1/datasets/{dataset_id}/documents/{batch_or_document}/indexing-status");
        Ok(self.transport.get(&endpoint, &[]).await?)
    }

    // -----------------------------------------------------------------------
    // Metadata
    // -----------------------------------------------------------------------

    /// Create dataset metadata fields, one call per field, in order.
    ///
    /// A failed field does not stop or undo the others.
    pub async fn add_dataset_metadata(&self, dataset_id: &str, fields: &[String]) -> Vec<FieldOutcome> {
        let endpoint = format!("/v1/datasets/{dataset_id}/metadata");
        let mut outcomes = Vec::with_capacity(fields.len());

        for name in fields {
            let payload = json!({"type": field_type_for(name), "name": name});
            let result = match self.transport.post_json(&endpoint, &payload).await {
                Ok(body) => decode::<MetadataField>(body, "POST", &endpoint),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = &result {
                warn!(%dataset_id, field = %name, error = %e, "failed to create metadata field");
            }
            outcomes.push(FieldOutcome {
                name: name.clone(),
                result,
            });
        }

        outcomes
    }

    pub async fn list_dataset_metadata(&self, dataset_id: &str) -> Result<Vec<MetadataField>> {
        let endpoint = format!("/v1/datasets/{dataset_id}/metadata");
        let body = self.transport.get(&endpoint, &[]).await?;
        let listing: MetadataListing = decode(body, "GET", &endpoint)?;
        Ok(listing.doc_metadata)
    }

    /// Attach metadata values to many documents in one call.
    pub async fn add_document_metadata(
        &self,
        dataset_id: &str,
        entries: &[DocumentMetadata],
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let endpoint = format!("/v1/datasets/{dataset_id}/documents/metadata");
        let payload = json!({"operation_data": entries});
        self.transport.post_json(&endpoint, &payload).await?;
        debug!(%dataset_id, documents = entries.len(), "document metadata attached");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

fn malformed(method: &str, endpoint: &str, detail: String) -> RefKbError {
    ApiError::new(
        ApiErrorKind::Unclassified { status: None },
        method,
        endpoint,
        detail,
    )
    .into()
}

fn decode<T: DeserializeOwned>(body: Value, method: &str, endpoint: &str) -> Result<T> {
    serde_json::from_value(body)
        .map_err(|e| malformed(method, endpoint, format!("unexpected response shape: {e}")))
}

fn string_field(body: &Value, path: &[&str], method: &str, endpoint: &str) -> Result<String> {
    path.iter()
        .try_fold(body, |value, key| value.get(key))
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| malformed(method, endpoint, format!("response missing {}", path.join("."))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    use refkb_shared::TransportConfig;
    use refkb_transport::RetryPolicy;
    use uuid::Uuid;
    use wiremock::matchers::{body_json, body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway(server: &MockServer) -> KnowledgeBaseGateway {
        let config = TransportConfig {
            base_url: server.uri(),
            timeout: Duration::from_secs(5),
            max_retries: 1,
            max_backoff: Duration::from_millis(10),
            default_retry_after: Duration::from_millis(1),
        };
        let transport = Transport::new(&config, "test-key")
            .expect("transport")
            .with_policy(RetryPolicy {
                max_retries: 1,
                max_backoff: Duration::from_millis(10),
                default_retry_after: Duration::from_millis(1),
                backoff_unit: Duration::from_millis(1),
            });
        KnowledgeBaseGateway::new(transport)
    }

    fn temp_file(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("refkb_gw_{}.md", Uuid::now_v7()));
        std::fs::write(&path, contents).expect("write temp file");
        path
    }

    #[tokio::test]
    async fn create_dataset_posts_defaults() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/datasets"))
            .and(body_json(json!({
                "name": "reports",
                "permission": "only_me",
                "indexing_technique": "high_quality"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "ds-1", "name": "reports"})))
            .expect(1)
            .mount(&server)
            .await;

        let id = gateway(&server)
            .create_dataset("reports", None, "only_me", "high_quality")
            .await
            .expect("create");
        assert_eq!(id, "ds-1");
    }

    #[tokio::test]
    async fn empty_dataset_name_is_rejected_locally() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = gateway(&server)
            .create_dataset("  ", None, "only_me", "high_quality")
            .await
            .unwrap_err();
        assert!(matches!(err, RefKbError::Validation { .. }));
    }

    #[tokio::test]
    async fn invalid_process_mode_sends_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        // The file does not exist either; validation must win.
        let err = gateway(&server)
            .create_document_by_file(
                "ds-1",
                Path::new("/nonexistent/report.pdf"),
                "high_quality",
                "semantic",
                &Segmentation::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RefKbError::Validation { .. }));
    }

    #[tokio::test]
    async fn create_document_returns_document_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/datasets/ds-1/document/create-by-file"))
            .and(body_string_contains("\"mode\":\"custom\""))
            .and(body_string_contains("\"indexing_technique\":\"economy\""))
            .and(body_string_contains("Battery outlook"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "document": {"id": "doc-9", "name": "r-1.md"},
                "batch": "batch-1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let file = temp_file("# Battery outlook");
        let id = gateway(&server)
            .create_document_by_file("ds-1", &file, "economy", "custom", &Segmentation::default())
            .await
            .expect("create document");
        assert_eq!(id, "doc-9");
        let _ = std::fs::remove_file(file);
    }

    #[tokio::test]
    async fn create_document_without_id_is_an_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"batch": "b"})))
            .mount(&server)
            .await;

        let file = temp_file("body");
        let err = gateway(&server)
            .create_document_by_file("ds-1", &file, "high_quality", "automatic", &Segmentation::default())
            .await
            .unwrap_err();
        let api = err.as_api().expect("api error");
        assert!(api.detail.contains("document.id"));
        let _ = std::fs::remove_file(file);
    }

    #[tokio::test]
    async fn update_document_sends_name() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/datasets/ds-1/documents/doc-1/update-by-file"))
            .and(body_string_contains("\"name\":\"r-1.md\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"document": {"id": "doc-1"}})))
            .expect(1)
            .mount(&server)
            .await;

        let file = temp_file("updated");
        let id = gateway(&server)
            .update_document_by_file(
                "ds-1",
                "doc-1",
                &file,
                Some("r-1.md"),
                "high_quality",
                "automatic",
                &Segmentation::default(),
            )
            .await
            .expect("update");
        assert_eq!(id, "doc-1");
        let _ = std::fs::remove_file(file);
    }

    #[tokio::test]
    async fn list_documents_walks_pages_in_order() {
        let server = MockServer::start().await;
        for (page, ids, more) in [
            ("1", vec!["a", "b"], true),
            ("2", vec!["c"], true),
            ("3", vec!["d"], false),
        ] {
            let data: Vec<Value> = ids.iter().map(|id| json!({"id": id, "name": id})).collect();
            Mock::given(method("GET"))
                .and(path("/v1/datasets/ds-1/documents"))
                .and(query_param("page", page))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": data, "has_more": more})))
                .expect(1)
                .mount(&server)
                .await;
        }

        let docs = gateway(&server).list_documents("ds-1").await.expect("list");
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn list_documents_stops_on_empty_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [{"id": "a"}], "has_more": true})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [], "has_more": true})))
            .expect(1)
            .mount(&server)
            .await;

        let docs = gateway(&server).list_documents("ds-1").await.expect("list");
        assert_eq!(docs.len(), 1);
    }

    #[tokio::test]
    async fn dataset_metadata_is_one_call_per_field() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/datasets/ds-1/metadata"))
            .and(body_json(json!({"type": "string", "name": "author"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "m-1", "name": "author", "type": "string"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/datasets/ds-1/metadata"))
            .and(body_json(json!({"type": "string", "name": "source_type"})))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({"message": "duplicate name"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/datasets/ds-1/metadata"))
            .and(body_json(json!({"type": "time", "name": "published_time"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "m-3", "name": "published_time", "type": "time"})))
            .expect(1)
            .mount(&server)
            .await;

        let fields: Vec<String> = ["author", "source_type", "published_time"]
            .into_iter()
            .map(String::from)
            .collect();
        let outcomes = gateway(&server).add_dataset_metadata("ds-1", &fields).await;

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].result.as_ref().unwrap().id, "m-1");
        assert!(outcomes[1].result.is_err());
        assert_eq!(outcomes[2].result.as_ref().unwrap().field_type, "time");
    }

    #[tokio::test]
    async fn document_metadata_is_batched() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/datasets/ds-1/documents/metadata"))
            .and(body_json(json!({"operation_data": [{
                "document_id": "doc-1",
                "metadata_list": [{"id": "m-1", "name": "author", "value": "Lin"}]
            }]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "success"})))
            .expect(1)
            .mount(&server)
            .await;

        let entries = vec![DocumentMetadata {
            document_id: "doc-1".into(),
            metadata_list: vec![MetadataValue {
                id: "m-1".into(),
                name: "author".into(),
                value: json!("Lin"),
            }],
        }];
        let gw = gateway(&server);
        gw.add_document_metadata("ds-1", &entries).await.expect("attach");
        gw.add_document_metadata("ds-1", &[]).await.expect("empty is a no-op");
    }

    #[tokio::test]
    async fn find_dataset_by_name_paginates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/datasets"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "ds-1", "name": "other"}], "has_more": true
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/datasets"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "ds-2", "name": "reports", "document_count": 12}], "has_more": false
            })))
            .mount(&server)
            .await;

        let gw = gateway(&server);
        let found = gw.find_dataset_by_name("reports").await.expect("find");
        assert_eq!(found.map(|d| d.document_count), Some(12));
        assert_eq!(gw.find_dataset_by_name("missing").await.expect("find"), None);
    }

    #[tokio::test]
    async fn list_dataset_metadata_reads_doc_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/datasets/ds-1/metadata"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "doc_metadata": [{"id": "m-1", "name": "author", "type": "string", "use_count": 3}],
                "built_in_field_enabled": false
            })))
            .mount(&server)
            .await;

        let fields = gateway(&server).list_dataset_metadata("ds-1").await.expect("list");
        assert_eq!(fields, vec![MetadataField {
            id: "m-1".into(),
            name: "author".into(),
            field_type: "string".into(),
        }]);
    }

    #[tokio::test]
    async fn not_found_propagates_unchanged() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "Dataset not found"})))
            .expect(1)
            .mount(&server)
            .await;

        let err = gateway(&server).get_dataset("nope").await.unwrap_err();
        let api = err.as_api().expect("api error");
        assert_eq!(api.kind, ApiErrorKind::Unclassified { status: Some(404) });
        assert_eq!(api.endpoint, "/v1/datasets/nope");
    }
}
