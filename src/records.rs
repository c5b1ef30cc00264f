//! Record commands for the `exg` CLI.
//!
//! Each `run_*` function opens the configured database, performs one
//! operation through the store or gateway, and prints the result to stdout.
//! Conflicts and lost claims are reported as errors so the process exits
//! non-zero.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use extraction_guard_core::cache::{document_fingerprint, FallbackCache};
use extraction_guard_core::consistency::check_record;
use extraction_guard_core::models::{NewRecord, ProcessingState, RecordId};
use extraction_guard_core::store::{require_record, RecordStore};

use crate::completion::create_client;
use crate::config::Config;
use crate::db;
use crate::fallback::{FallbackOrchestrator, FallbackSettings};
use crate::gateway::{human_patch, GatewayError, ReviewGateway};
use crate::pipeline::{process_record, AnalysisFile, PipelineOutcome};
use crate::sqlite_store::SqliteRecordStore;

async fn open_store(config: &Config) -> Result<Arc<SqliteRecordStore>> {
    let pool = db::connect(config).await?;
    Ok(Arc::new(SqliteRecordStore::new(pool)))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Parse a comma-separated state list such as `PROCESSING,EXTRACTED`.
pub fn parse_states(list: &str) -> Result<BTreeSet<ProcessingState>> {
    let states = list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<ProcessingState>().map_err(anyhow::Error::msg))
        .collect::<Result<BTreeSet<_>>>()?;
    if states.is_empty() {
        bail!("at least one source state is required");
    }
    Ok(states)
}

fn gateway_err(e: GatewayError) -> anyhow::Error {
    match e {
        GatewayError::Conflict(c) => anyhow::anyhow!(
            "{}: {} (current version {}, state {})",
            c.code.as_str(),
            c.message,
            c.current_version,
            c.current_state
        ),
        other => other.into(),
    }
}

/// Insert a new PENDING record from a JSON file.
///
/// When `document` is given its SHA-256 fingerprint replaces any
/// fingerprint in the file.
pub async fn run_ingest(config: &Config, file: &Path, document: Option<&Path>) -> Result<RecordId> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read record file: {}", file.display()))?;
    let mut record: NewRecord = serde_json::from_str(&content)
        .with_context(|| format!("Invalid record file: {}", file.display()))?;

    if let Some(document) = document {
        let bytes = std::fs::read(document)
            .with_context(|| format!("Failed to read document: {}", document.display()))?;
        record.document_fingerprint = document_fingerprint(&bytes);
    }
    if record.document_fingerprint.is_empty() {
        bail!("record has no document_fingerprint; pass --document to compute one");
    }

    let store = open_store(config).await?;
    let id = store.insert_record(&record).await?;
    store.pool().close().await;

    tracing::info!(record = %id, "record ingested");
    println!("{}", id);
    Ok(id)
}

pub async fn run_show(config: &Config, id: &str) -> Result<()> {
    let store = open_store(config).await?;
    let record = require_record(store.as_ref(), &RecordId::from(id)).await?;
    store.pool().close().await;
    print_json(&record)
}

pub async fn run_claim(config: &Config, id: &str) -> Result<()> {
    let store = open_store(config).await?;
    let gateway = ReviewGateway::new(store.clone());
    let result = gateway.claim(&RecordId::from(id)).await;
    store.pool().close().await;
    result.map_err(gateway_err)?;
    println!("claimed {}", id);
    Ok(())
}

pub async fn run_transition(config: &Config, id: &str, from: &str, to: &str) -> Result<()> {
    let from = parse_states(from)?;
    let to: ProcessingState = to.parse().map_err(anyhow::Error::msg)?;

    let store = open_store(config).await?;
    let gateway = ReviewGateway::new(store.clone());
    let result = gateway.transition(&RecordId::from(id), &from, to).await;
    store.pool().close().await;
    result.map_err(gateway_err)?;
    println!("{} -> {}", id, to);
    Ok(())
}

/// Apply a reviewer edit: `fields` is a JSON object of `{name: value|null}`.
pub async fn run_patch(config: &Config, id: &str, expected_version: u64, fields: &str) -> Result<()> {
    let value: Value = serde_json::from_str(fields).context("--fields must be JSON")?;
    let Some(fields) = value.as_object() else {
        bail!("--fields must be a JSON object");
    };
    let patch = human_patch(fields, None)?;

    let store = open_store(config).await?;
    let gateway = ReviewGateway::new(store.clone());
    let result = gateway
        .apply_patch(&RecordId::from(id), expected_version, patch)
        .await;
    store.pool().close().await;
    let applied = result.map_err(gateway_err)?;
    print_json(&applied)
}

pub async fn run_check(config: &Config, id: &str) -> Result<()> {
    let store = open_store(config).await?;
    let record = require_record(store.as_ref(), &RecordId::from(id)).await?;
    store.pool().close().await;

    let report = check_record(&record, config.consistency.tolerance);
    print_json(&report)?;
    if !report.all_valid {
        for warning in report.warnings() {
            eprintln!("warning: {}", warning);
        }
    }
    Ok(())
}

/// Build the orchestrator from config, or `None` when fallback is off.
pub fn build_orchestrator(config: &Config) -> Result<Option<FallbackOrchestrator>> {
    if !config.fallback.enabled || !config.completion.is_enabled() {
        return Ok(None);
    }
    let client = create_client(&config.completion, &config.fallback)?;
    let cache = FallbackCache::new(
        Duration::from_secs(config.fallback.cache.ttl_secs),
        config.fallback.cache.capacity,
    );
    Ok(Some(FallbackOrchestrator::new(
        Arc::from(client),
        Arc::new(cache),
        FallbackSettings::from(&config.fallback),
    )))
}

/// Run one record through the extraction pipeline using a saved analysis.
///
/// The orchestrator, and with it the fallback cache, is dropped on return.
pub async fn run_process(config: &Config, id: &str, analysis: &Path) -> Result<()> {
    let orchestrator = build_orchestrator(config)?;
    let extractor = AnalysisFile::new(analysis);

    let store = open_store(config).await?;
    let result = process_record(
        store.as_ref(),
        orchestrator.as_ref(),
        &extractor,
        &RecordId::from(id),
        config.consistency.tolerance,
    )
    .await;
    store.pool().close().await;

    let outcome = result?;
    print_json(&outcome)?;
    match outcome {
        PipelineOutcome::NotClaimed => bail!("record {} could not be claimed", id),
        PipelineOutcome::Failed { reason } => bail!("extraction failed: {}", reason),
        PipelineOutcome::Requeued { .. } | PipelineOutcome::Extracted { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_states() {
        let states = parse_states("processing, EXTRACTED").unwrap();
        assert!(states.contains(&ProcessingState::Processing));
        assert!(states.contains(&ProcessingState::Extracted));
        assert!(parse_states("").is_err());
        assert!(parse_states("DONE").is_err());
    }
}
