//! Record enrichment and attachment download stages.
//!
//! Both stages run one task per record through a window of at most
//! `concurrency` spawned tasks, joined in input order. Failures are logged
//! and leave the record as it was.

use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};

use refkb_fetch::{EnrichmentClient, api_link, scratch_path};
use refkb_shared::{EnrichedRecord, ReferenceRecord};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::builder::BuildProgress;

/// Marker appended to truncated summaries.
pub const ELLIPSIS: &str = "...";

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// Bounded summary of `content`, measured in chars.
///
/// Content within `max_chars` is returned unchanged. Longer content is cut at
/// `max_chars`, snapped back to the last whitespace at or after 80% of
/// `max_chars` (or left as a hard cut when there is none), trimmed, and
/// suffixed with [`ELLIPSIS`].
pub fn summarize(content: &str, max_chars: usize) -> String {
    let Some((cut, _)) = content.char_indices().nth(max_chars) else {
        return content.to_string();
    };
    let window = &content[..cut];
    let floor = (max_chars * 4).div_ceil(5);

    let snap = window
        .char_indices()
        .enumerate()
        .filter(|(pos, (_, c))| *pos >= floor && c.is_whitespace())
        .map(|(_, (byte, _))| byte)
        .last();

    let kept = match snap {
        Some(byte) => &window[..byte],
        None => window,
    };
    format!("{}{ELLIPSIS}", kept.trim())
}

/// The auxiliary API link for a record: `extra.api_url`, else
/// `api_base_url` joined with `source_id`.
pub fn api_link_for(record: &ReferenceRecord, api_base_url: Option<&str>) -> Option<String> {
    if let Some(url) = record
        .extra
        .get("api_url")
        .and_then(|v| v.as_str())
        .filter(|u| !u.trim().is_empty())
    {
        return Some(url.to_string());
    }
    let base = api_base_url?;
    let source_id = record.source_id.as_deref().filter(|s| !s.is_empty())?;
    api_link(base, source_id)
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// Enrich every record with API metadata and a summary.
pub(crate) async fn enrich_records(
    records: Vec<ReferenceRecord>,
    client: &EnrichmentClient,
    api_base_url: Option<&str>,
    summary_max_chars: usize,
    concurrency: usize,
    token: &CancellationToken,
    progress: &dyn BuildProgress,
) -> Vec<EnrichedRecord> {
    let items = records.into_iter().map(EnrichedRecord::from).collect();
    let client = client.clone();
    let api_base_url = api_base_url.map(str::to_owned);

    fan_out(items, concurrency, token, progress, move |mut item| {
        let client = client.clone();
        let link = api_link_for(&item.record, api_base_url.as_deref());
        async move {
            if let Some(link) = link {
                match client.get_json(&link, &[]).await {
                    Ok(meta) => item.api_metadata = Some(meta),
                    Err(e) => warn!(record_id = %item.record.id, error = %e, "enrichment fetch failed"),
                }
            }
            if !item.record.content.trim().is_empty() {
                item.summary = Some(summarize(&item.record.content, summary_max_chars));
            }
            item
        }
    })
    .await
}

/// Download each record's attachment into `run_dir`.
pub(crate) async fn fetch_attachments(
    records: Vec<EnrichedRecord>,
    client: &EnrichmentClient,
    run_dir: &Path,
    concurrency: usize,
    token: &CancellationToken,
    progress: &dyn BuildProgress,
) -> Vec<EnrichedRecord> {
    let client = client.clone();
    let run_dir = run_dir.to_path_buf();

    fan_out(records, concurrency, token, progress, move |mut item| {
        let client = client.clone();
        let target: Option<(String, PathBuf)> = item
            .record
            .attachment_url()
            .map(|url| (url.to_string(), scratch_path(&run_dir, &item.record.id, url)));
        async move {
            if let Some((url, dest)) = target {
                match client.download(&url, &dest).await {
                    Ok(bytes) => {
                        debug!(record_id = %item.record.id, bytes, "attachment fetched");
                        item.local_attachment_path = Some(dest);
                    }
                    Err(e) => warn!(record_id = %item.record.id, error = %e, "attachment download failed"),
                }
            }
            item
        }
    })
    .await
}

/// Run `work` over every item with at most `concurrency` in flight.
///
/// Tasks are spawned only as the window has room, so memory held by the
/// stage is bounded by `concurrency`, not by the input size. Items reached
/// after cancellation pass through untouched. Output order matches input
/// order.
async fn fan_out<F, Fut>(
    items: Vec<EnrichedRecord>,
    concurrency: usize,
    token: &CancellationToken,
    progress: &dyn BuildProgress,
    work: F,
) -> Vec<EnrichedRecord>
where
    F: Fn(EnrichedRecord) -> Fut,
    Fut: Future<Output = EnrichedRecord> + Send + 'static,
{
    let window = concurrency.max(1);
    let total = items.len();
    let mut pending = items.into_iter();
    // (record to fall back on if the task dies, running task)
    let mut in_flight: VecDeque<(EnrichedRecord, Option<JoinHandle<EnrichedRecord>>)> =
        VecDeque::with_capacity(window);
    let mut out = Vec::with_capacity(total);

    loop {
        while in_flight.len() < window {
            let Some(item) = pending.next() else { break };
            if token.is_cancelled() {
                in_flight.push_back((item, None));
            } else {
                let fallback = item.clone();
                in_flight.push_back((fallback, Some(tokio::spawn(work(item)))));
            }
        }

        let Some((fallback, handle)) = in_flight.pop_front() else {
            break;
        };
        let record = match handle {
            Some(handle) => match handle.await {
                Ok(record) => record,
                Err(e) => {
                    warn!(record_id = %fallback.record.id, error = %e, "worker task failed");
                    fallback
                }
            },
            None => fallback,
        };
        progress.record_enriched(&record.record.id, out.len() + 1, total);
        out.push(record);
    }
    out
}
