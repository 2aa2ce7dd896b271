//! Ingestion Pipeline Module
//!
//! Glue between the stages: size cap, decompression, decoding, compliance
//! evaluation and the idempotent save. Callers hand in raw attachment bytes
//! together with a name used only for logging and error reports.

use crate::compliance::evaluate;
use crate::config::Config;
use crate::decoder::decode;
use crate::decompress::decompress;
use crate::error::{DmarcError, Result};
use crate::models::{Report, SaveOutcome};
use crate::store::Store;
use rayon::prelude::*;
use serde::Serialize;

/// A raw attachment as handed over by the mailbox fetcher.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub data: Vec<u8>,
}

/// Per-batch tally. Failed attachments are listed by name with the error text.
#[derive(Debug, Default, Serialize)]
pub struct IngestSummary {
    pub inserted: usize,
    pub skipped: usize,
    pub failed: Vec<(String, String)>,
}

/// Turns raw attachment bytes into an evaluated [`Report`].
///
/// Input larger than `config.max_file_size` is refused with `SizeExceeded`
/// before any decompression happens.
pub fn decode_and_evaluate(bytes: &[u8], config: &Config) -> Result<Report> {
    if bytes.len() > config.max_file_size {
        return Err(DmarcError::SizeExceeded(format!(
            "Input of {} bytes exceeds limit of {} bytes",
            bytes.len(),
            config.max_file_size
        )));
    }
    let xml = decompress(bytes, config)?;
    let report = decode(&xml)?;
    Ok(evaluate(report))
}

/// Decodes one attachment and saves it.
pub async fn ingest(store: &Store, name: &str, bytes: &[u8], config: &Config) -> Result<SaveOutcome> {
    let report = decode_and_evaluate(bytes, config).map_err(|e| {
        log::warn!("Failed to parse {}: {}", name, e);
        e
    })?;
    store.save(&report).await.map_err(|e| {
        log::warn!("Failed to save report {} from {}: {}", report.metadata.report_id, name, e);
        e
    })
}

/// Ingests a batch of attachments.
///
/// Attachments are decoded in parallel on the blocking pool and then saved one
/// at a time. A bad attachment is recorded in the summary and the batch
/// continues; a storage failure that is not specific to one report aborts the
/// batch.
pub async fn ingest_batch(store: &Store, attachments: &[Attachment], config: &Config) -> Result<IngestSummary> {
    let batch = attachments.to_vec();
    let decode_config = config.clone();
    let decoded: Vec<(String, Result<Report>)> = tokio::task::spawn_blocking(move || {
        batch
            .into_par_iter()
            .map(|a| {
                let result = decode_and_evaluate(&a.data, &decode_config);
                (a.name, result)
            })
            .collect()
    })
    .await
    .map_err(|e| DmarcError::Io(std::io::Error::other(e)))?;

    let mut summary = IngestSummary::default();
    for (name, result) in decoded {
        let name = name.as_str();
        let report = match result {
            Ok(report) => report,
            Err(e) => {
                log::warn!("Failed to parse {}: {}", name, e);
                summary.failed.push((name.to_string(), e.to_string()));
                continue;
            }
        };
        match store.save(&report).await {
            Ok(SaveOutcome::Inserted(_)) => summary.inserted += 1,
            Ok(SaveOutcome::Skipped) => summary.skipped += 1,
            Err(e) if e.is_item_failure() => {
                log::warn!("Failed to save report {} from {}: {}", report.metadata.report_id, name, e);
                summary.failed.push((name.to_string(), e.to_string()));
            }
            Err(e) => return Err(e),
        }
    }
    log::info!(
        "Processed {} attachments: {} inserted, {} duplicates, {} failed",
        attachments.len(),
        summary.inserted,
        summary.skipped,
        summary.failed.len()
    );
    Ok(summary)
}
