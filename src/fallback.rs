//! Fallback orchestrator for low-confidence fields.
//!
//! # Algorithm
//!
//! 1. Partition fields below the confidence threshold (and fields reported
//!    missing) into the static [`FieldGroup`]s; groups with nothing to ask
//!    about are skipped.
//! 2. Key each group by document fingerprint, group id, and a snapshot token
//!    of the values being sent. A cache hit skips the external call.
//! 3. Dispatch groups with at most `max_in_flight` calls outstanding.
//! 4. A rate-limit response trips the halt signal: groups not yet dispatched
//!    are skipped, in-flight groups run to completion.
//! 5. Timeouts, 5xx and transport errors retry with exponential backoff up
//!    to `max_attempts`; an exhausted group fails alone.
//! 6. Every suggestion is validated against its field kind; invalid or
//!    non-canonical entries are dropped and logged.
//! 7. Accepted suggestions merge only where they strictly raise confidence.
//!
//! Phases per attempt:
//!
//! ```text
//! NOT_STARTED → GROUPING → (per group) CACHE_CHECK → CALLING → MERGING → DONE
//!                                            └── rate limit ──▶ HALTED
//! ```
//!
//! The outcome is always returned, including on partial failure. Nothing in
//! here touches the record store.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

use extraction_guard_core::cache::{snapshot_token, CacheKey, FallbackCache};
use extraction_guard_core::fields::{partition_for_fallback, CanonicalField, FieldGroup, GroupBatch};
use extraction_guard_core::merge::{merge_suggestions, MergeResult};
use extraction_guard_core::models::{FieldData, FieldMap};
use extraction_guard_core::validate::{screen_suggestions, ValidatedSuggestion};

use crate::completion::{CompletionClient, CompletionError, CompletionRequest};
use crate::config::FallbackConfig;

/// Tuning knobs, decoupled from the TOML config.
#[derive(Debug, Clone)]
pub struct FallbackSettings {
    pub confidence_threshold: f64,
    pub max_in_flight: usize,
    pub max_attempts: u32,
    pub call_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub excerpt_chars: usize,
}

impl From<&FallbackConfig> for FallbackSettings {
    fn from(config: &FallbackConfig) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            max_in_flight: config.max_in_flight.max(1),
            max_attempts: config.max_attempts.max(1),
            call_timeout: config.call_timeout(),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            excerpt_chars: config.excerpt_chars,
        }
    }
}

impl FallbackSettings {
    /// Delay before retry number `attempt` (1-based): base, 2×base, 4×base…
    /// capped at `backoff_max`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

/// Input for one fallback attempt.
#[derive(Debug, Clone, Default)]
pub struct FallbackRequest {
    pub document_fingerprint: String,
    pub fields: FieldMap,
    /// Fields the document-analysis step expected but could not find.
    pub missing: BTreeSet<CanonicalField>,
    /// Document text; only a bounded, redacted excerpt is ever sent.
    pub excerpt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FallbackPhase {
    NotStarted,
    Grouping,
    CacheCheck,
    Calling,
    Merging,
    Done,
    Halted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GroupStatus {
    Succeeded {
        cached: bool,
        accepted: usize,
        rejected: usize,
    },
    Failed {
        reason: String,
    },
    RateLimited,
    SkippedByHalt,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupReport {
    pub group: FieldGroup,
    pub attempts: u32,
    /// Last phase this group reached.
    pub phase: FallbackPhase,
    #[serde(flatten)]
    pub status: GroupStatus,
}

/// What the caller gets back, always, even on partial failure.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackOutcome {
    pub phase: FallbackPhase,
    /// Groups actually dispatched (cache hits included).
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub rate_limited: usize,
    pub skipped_by_halt: usize,
    pub groups: Vec<GroupReport>,
    pub merge: MergeResult,
    /// Validation messages for dropped suggestions.
    pub rejected: Vec<String>,
}

impl FallbackOutcome {
    fn empty(phase: FallbackPhase) -> Self {
        Self {
            phase,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            rate_limited: 0,
            skipped_by_halt: 0,
            groups: Vec::new(),
            merge: MergeResult::default(),
            rejected: Vec::new(),
        }
    }

    /// Groups that did not complete because of the halt, including the one
    /// that was rate limited.
    pub fn halted_groups(&self) -> usize {
        self.rate_limited + self.skipped_by_halt
    }

    pub fn is_partial(&self) -> bool {
        self.failed > 0 || self.halted_groups() > 0
    }

    pub fn report(&self, group: FieldGroup) -> Option<&GroupReport> {
        self.groups.iter().find(|r| r.group == group)
    }
}

/// Shared halt flag. Set once by the first rate-limited group, checked
/// before every dispatch.
#[derive(Debug, Clone, Default)]
struct HaltSignal(Arc<AtomicBool>);

impl HaltSignal {
    fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_halted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct FallbackOrchestrator {
    client: Arc<dyn CompletionClient>,
    cache: Arc<FallbackCache>,
    settings: FallbackSettings,
}

/// Everything one spawned group task owns.
struct GroupJob {
    batch: GroupBatch,
    cache_key: CacheKey,
    request: CompletionRequest,
    client: Arc<dyn CompletionClient>,
    cache: Arc<FallbackCache>,
    settings: FallbackSettings,
    halt: HaltSignal,
}

struct GroupRun {
    report: GroupReport,
    accepted: Vec<ValidatedSuggestion>,
    rejected: Vec<String>,
}

impl FallbackOrchestrator {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        cache: Arc<FallbackCache>,
        settings: FallbackSettings,
    ) -> Self {
        Self {
            client,
            cache,
            settings,
        }
    }

    pub fn settings(&self) -> &FallbackSettings {
        &self.settings
    }

    /// Run one fallback attempt over `request`.
    pub async fn run(&self, request: &FallbackRequest) -> FallbackOutcome {
        tracing::debug!(phase = ?FallbackPhase::Grouping, "partitioning low-confidence fields");
        let batches = partition_for_fallback(
            &request.fields,
            &request.missing,
            self.settings.confidence_threshold,
        );
        if batches.is_empty() {
            return FallbackOutcome::empty(FallbackPhase::Done);
        }

        let excerpt = sanitize_excerpt(&request.excerpt, self.settings.excerpt_chars);
        let semaphore = Arc::new(Semaphore::new(self.settings.max_in_flight));
        let halt = HaltSignal::default();
        let mut tasks = JoinSet::new();
        let mut dispatched: BTreeSet<FieldGroup> = BTreeSet::new();
        let mut reports = Vec::new();
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();

        for batch in batches {
            let group = batch.group;
            let permit = match dispatch_permit(&semaphore, group).await {
                Ok(permit) => permit,
                Err(report) => {
                    reports.push(report);
                    continue;
                }
            };
            if halt.is_halted() {
                tracing::info!(group = %group, "halted: not dispatching group");
                reports.push(skipped_report(group));
                continue;
            }

            let job = self.job(batch, request, &excerpt, halt.clone());
            tracing::debug!(group = %group, "dispatching group");
            tasks.spawn(async move {
                let run = run_group(job).await;
                drop(permit);
                run
            });
            dispatched.insert(group);
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(run) => {
                    dispatched.remove(&run.report.group);
                    accepted.extend(run.accepted);
                    rejected.extend(run.rejected);
                    reports.push(run.report);
                }
                Err(e) => tracing::error!(error = %e, "group task aborted"),
            }
        }
        // Whatever is left panicked or was aborted before reporting.
        for group in dispatched {
            reports.push(failed(group, 0, "task aborted".to_string()).report);
        }

        // Merge in group order so the result never depends on completion
        // timing.
        reports.sort_by_key(|r| r.group);
        accepted.sort_by_key(|s: &ValidatedSuggestion| s.field.group());
        tracing::debug!(phase = ?FallbackPhase::Merging, suggestions = accepted.len(), "merging");
        let merge = merge_suggestions(&request.fields, &accepted);

        let mut outcome = FallbackOutcome::empty(if halt.is_halted() {
            FallbackPhase::Halted
        } else {
            FallbackPhase::Done
        });
        for report in &reports {
            match report.status {
                GroupStatus::Succeeded { .. } => outcome.succeeded += 1,
                GroupStatus::Failed { .. } => outcome.failed += 1,
                GroupStatus::RateLimited => outcome.rate_limited += 1,
                GroupStatus::SkippedByHalt => outcome.skipped_by_halt += 1,
            }
        }
        outcome.attempted = reports.len() - outcome.skipped_by_halt;
        outcome.groups = reports;
        outcome.merge = merge;
        outcome.rejected = rejected;

        tracing::info!(
            phase = ?outcome.phase,
            attempted = outcome.attempted,
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            halted = outcome.halted_groups(),
            merged = outcome.merge.applied.len(),
            "fallback finished"
        );
        outcome
    }

    fn job(
        &self,
        batch: GroupBatch,
        request: &FallbackRequest,
        excerpt: &str,
        halt: HaltSignal,
    ) -> GroupJob {
        let sent: BTreeMap<String, Value> = batch
            .fields
            .iter()
            .map(|f| {
                let value = request
                    .fields
                    .get(f)
                    .map(|v| plain_value(&v.data))
                    .unwrap_or(Value::Null);
                (f.as_str().to_string(), value)
            })
            .collect();

        GroupJob {
            cache_key: CacheKey::new(
                request.document_fingerprint.clone(),
                batch.group,
                snapshot_token(&sent),
            ),
            request: CompletionRequest {
                group: batch.group,
                fields: sent,
                excerpt: excerpt.to_string(),
            },
            batch,
            client: self.client.clone(),
            cache: self.cache.clone(),
            settings: self.settings.clone(),
            halt,
        }
    }
}

/// A closed semaphore fails the group; it was never halted.
async fn dispatch_permit(
    semaphore: &Arc<Semaphore>,
    group: FieldGroup,
) -> Result<OwnedSemaphorePermit, GroupReport> {
    semaphore.clone().acquire_owned().await.map_err(|_| {
        tracing::error!(group = %group, "dispatch semaphore closed");
        failed(group, 0, "dispatch closed".to_string()).report
    })
}

fn skipped_report(group: FieldGroup) -> GroupReport {
    GroupReport {
        group,
        attempts: 0,
        phase: FallbackPhase::NotStarted,
        status: GroupStatus::SkippedByHalt,
    }
}

async fn run_group(job: GroupJob) -> GroupRun {
    let group = job.batch.group;

    if let Some(hit) = job.cache.get(&job.cache_key) {
        tracing::debug!(group = %group, phase = ?FallbackPhase::CacheCheck, "cache hit");
        return screen(&job, &hit.payload, true, 0);
    }

    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = tokio::time::timeout(job.settings.call_timeout, job.client.complete(&job.request))
            .await
            .unwrap_or(Err(CompletionError::Timeout));

        match result {
            Ok(payload) => return screen(&job, &payload, false, attempt),
            Err(CompletionError::RateLimited) => {
                job.halt.trigger();
                tracing::warn!(group = %group, attempt, "rate limited; halting further dispatch");
                return GroupRun {
                    report: GroupReport {
                        group,
                        attempts: attempt,
                        phase: FallbackPhase::Halted,
                        status: GroupStatus::RateLimited,
                    },
                    accepted: Vec::new(),
                    rejected: Vec::new(),
                };
            }
            Err(e) if e.is_retryable() && attempt < job.settings.max_attempts => {
                let delay = job.settings.backoff(attempt);
                tracing::warn!(group = %group, attempt, error = %e, delay_ms = delay.as_millis() as u64, "retrying group");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                tracing::warn!(group = %group, attempt, error = %e, "group failed");
                return failed(group, attempt, e.to_string());
            }
        }
    }
}

/// Validate a payload, cache it when it is well-formed and came from the
/// service, and build the group's report.
fn screen(job: &GroupJob, payload: &Value, cached: bool, attempts: u32) -> GroupRun {
    let group = job.batch.group;
    let Some(screened) = screen_suggestions(&job.batch.fields, payload) else {
        tracing::warn!(group = %group, "completion response is not a JSON object");
        return failed(group, attempts, "response is not a JSON object".to_string());
    };

    if !cached {
        job.cache.insert(job.cache_key.clone(), payload.clone());
    }
    for rejection in &screened.rejected {
        tracing::warn!(group = %group, reason = %rejection, "dropping suggestion");
    }

    GroupRun {
        report: GroupReport {
            group,
            attempts,
            phase: FallbackPhase::Merging,
            status: GroupStatus::Succeeded {
                cached,
                accepted: screened.accepted.len(),
                rejected: screened.rejected.len(),
            },
        },
        accepted: screened.accepted,
        rejected: screened.rejected.iter().map(|r| r.to_string()).collect(),
    }
}

fn failed(group: FieldGroup, attempts: u32, reason: String) -> GroupRun {
    GroupRun {
        report: GroupReport {
            group,
            attempts,
            phase: FallbackPhase::Calling,
            status: GroupStatus::Failed { reason },
        },
        accepted: Vec::new(),
        rejected: Vec::new(),
    }
}

/// The value as the completion service sees it: no kind tags.
fn plain_value(data: &FieldData) -> Value {
    match data {
        FieldData::Text(s) => Value::String(s.clone()),
        FieldData::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
        FieldData::Amount(a) => serde_json::json!(a),
        FieldData::Address(a) => serde_json::to_value(a).unwrap_or(Value::Null),
    }
}

/// Minimum run of digits treated as an account or card number.
const REDACT_DIGITS: usize = 12;

/// Truncate to `max_chars` and mask long digit runs.
pub fn sanitize_excerpt(text: &str, max_chars: usize) -> String {
    let truncated: String = text.chars().take(max_chars).collect();
    let mut out = String::with_capacity(truncated.len());
    let mut run = String::new();

    let flush = |run: &mut String, out: &mut String| {
        if run.len() >= REDACT_DIGITS {
            out.push_str("[redacted]");
        } else {
            out.push_str(run);
        }
        run.clear();
    };

    for c in truncated.chars() {
        if c.is_ascii_digit() {
            run.push(c);
        } else {
            flush(&mut run, &mut out);
            out.push(c);
        }
    }
    flush(&mut run, &mut out);
    out
}
