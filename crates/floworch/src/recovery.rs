// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Durable state: write-ahead log, snapshots, and crash recovery.
//!
//! Each execution owns one directory under the orchestrator's state dir:
//!
//! ```text
//! {state_dir}/{execution_id}/
//!   definition.json   flow definition pinned at plan time
//!   snapshot.bin      rolling snapshot (FSNP header + bincode payload)
//!   wal.log           append-only framed transition records
//! ```
//!
//! A transition becomes "applied" only once its WAL record is durable;
//! the scheduler funnels every state mutation through
//! [`apply_transition`], the same fold replay uses, so a recovered
//! context is bit-identical to the pre-crash one up to the last durable
//! record.
//!
//! Snapshot files carry a 20-byte integrity header (magic, format
//! version, CRC32, payload length) and are written via temp file + fsync
//! + atomic rename. WAL records are individually framed with their own
//! CRC so a torn tail is detected and truncated at the last valid record.

use crate::address::{BranchPath, ExecutionId, MemoryAddress};
use crate::context::{BranchStatus, ExecutionContext, ExecutionStatus, StepStatus};
use crate::definition::FlowDefinition;
use crate::error::{Error, ErrorClass, ErrorCode, ErrorRecord, Result, Severity};
use crate::topology::FlowTopology;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Magic bytes identifying a floworch snapshot file: "FSNP"
const SNAPSHOT_MAGIC: &[u8; 4] = b"FSNP";

/// Current snapshot format version.
const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Header size: magic(4) + version(4) + crc32(4) + length(8) = 20 bytes
const SNAPSHOT_HEADER_SIZE: usize = 20;

/// WAL frame header: length(4) + crc32(4)
const WAL_FRAME_HEADER: usize = 8;

/// One state transition, appended to the WAL before it is applied.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Transition {
    /// Execution planned; carries the full initial context.
    Planned {
        /// The freshly built context.
        context: Box<ExecutionContext>,
    },
    /// Execution-level status change.
    StatusChanged {
        /// The new status.
        status: ExecutionStatus,
    },
    /// A command was published for a step.
    StepDispatched {
        /// Node name.
        node: String,
        /// Correlation id of the command.
        correlation_id: Uuid,
        /// 1-based dispatch attempt.
        attempt: u32,
    },
    /// A step's successful result was accepted.
    StepCompleted {
        /// Node name.
        node: String,
        /// Address the output was written under.
        address: MemoryAddress,
        /// Schema of the payload.
        schema: String,
        /// The payload bytes, kept so recovery can repopulate memory.
        payload: Vec<u8>,
        /// Completion time, for merge ordering.
        completed_at: DateTime<Utc>,
    },
    /// A step failed terminally.
    StepFailed {
        /// Node name.
        node: String,
        /// The failure.
        error: ErrorRecord,
    },
    /// A step's deadline elapsed without a result.
    StepTimedOut {
        /// Node name.
        node: String,
        /// The attempt that timed out.
        attempt: u32,
    },
    /// A retry was scheduled after a retriable failure.
    RetryScheduled {
        /// Node name.
        node: String,
        /// The upcoming attempt number.
        attempt: u32,
        /// Backoff delay chosen.
        delay_ms: u64,
    },
    /// A branch's status changed.
    BranchStatusChanged {
        /// Branch path.
        branch: BranchPath,
        /// The new status.
        status: BranchStatus,
        /// Completion time for terminal statuses.
        at: Option<DateTime<Utc>>,
    },
    /// A merge fired at a convergent exporter.
    MergeFired {
        /// Exporter node.
        exporter: String,
        /// Address the merged input was written under.
        address: MemoryAddress,
        /// Schema of the merged payload.
        schema: String,
        /// The merged payload bytes.
        payload: Vec<u8>,
        /// Audit summary (JSON text).
        summary: String,
    },
    /// Execution completed.
    Completed {
        /// Terminal timestamp.
        at: DateTime<Utc>,
    },
    /// Execution failed or was cancelled.
    Failed {
        /// Terminal error, if one was recorded.
        error: Option<ErrorRecord>,
        /// Terminal timestamp.
        at: DateTime<Utc>,
    },
}

/// A framed WAL record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WalRecord {
    /// Monotonic sequence number, 1-based.
    pub seq: u64,
    /// The transition.
    pub transition: Transition,
}

/// Apply one transition to a context. This is the single fold both the
/// live scheduler and WAL replay use; applying the same prefix twice
/// always yields the same context.
pub fn apply_transition(context: &mut ExecutionContext, topo: &FlowTopology, transition: &Transition) {
    match transition {
        Transition::Planned { context: initial } => {
            *context = (**initial).clone();
        }
        Transition::StatusChanged { status } => {
            context.status = *status;
        }
        Transition::StepDispatched {
            node,
            correlation_id,
            attempt,
        } => {
            if let Some(step) = context.step_mut(node) {
                step.status = StepStatus::InFlight;
                step.attempts = *attempt;
                step.correlation_id = Some(*correlation_id);
            }
        }
        Transition::StepCompleted {
            node,
            address,
            completed_at,
            ..
        } => {
            if let Some(step) = context.step_mut(node) {
                step.status = StepStatus::Completed;
                step.output_address = Some(address.clone());
                step.completed_at = Some(*completed_at);
                step.correlation_id = None;
            }
            let branch = address.branch_path.clone();
            if let Some(ctx) = context.branch_mut(&branch) {
                if !ctx.memory_addresses.contains(address) {
                    ctx.memory_addresses.push(address.clone());
                }
            }
            for consumer in topo.successors(node) {
                if let Some(step) = context.step_mut(consumer) {
                    step.remaining_deps = step.remaining_deps.saturating_sub(1);
                    if step.remaining_deps == 0 && step.status == StepStatus::Waiting {
                        step.status = StepStatus::Ready;
                    }
                }
            }
        }
        Transition::StepFailed { node, error } => {
            if let Some(step) = context.step_mut(node) {
                step.status = StepStatus::Failed;
                step.last_error = Some(error.clone());
                step.correlation_id = None;
            }
            let branch = context
                .step(node)
                .map(|s| s.step_id.branch_path.clone());
            if let Some(branch) = branch {
                if let Some(ctx) = context.branch_mut(&branch) {
                    ctx.error_history.push(error.clone());
                }
            }
        }
        Transition::StepTimedOut { node, .. } => {
            if let Some(step) = context.step_mut(node) {
                step.status = StepStatus::TimedOut;
                step.correlation_id = None;
            }
        }
        Transition::RetryScheduled { node, .. } => {
            if let Some(step) = context.step_mut(node) {
                step.status = StepStatus::Retrying;
                step.correlation_id = None;
            }
        }
        Transition::BranchStatusChanged { branch, status, at } => {
            if let Some(ctx) = context.branch_mut(branch) {
                ctx.status = *status;
                if status.is_terminal() {
                    ctx.completed_at = *at;
                }
            }
        }
        Transition::MergeFired { exporter, address, .. } => {
            if let Some(step) = context.step_mut(exporter) {
                step.remaining_deps = 0;
                if !step.status.is_terminal() {
                    step.status = StepStatus::Ready;
                }
            }
            let branch = address.branch_path.clone();
            if let Some(ctx) = context.branch_mut(&branch) {
                if !ctx.memory_addresses.contains(address) {
                    ctx.memory_addresses.push(address.clone());
                }
            }
        }
        Transition::Completed { at } => {
            context.status = ExecutionStatus::Completed;
            context.finished_at = Some(*at);
        }
        Transition::Failed { error, at } => {
            context.status = ExecutionStatus::Failed;
            context.finished_at = Some(*at);
            if context.error.is_none() {
                context.error = error.clone();
            }
        }
    }
}

// ============================================================================
// Snapshot file integrity
// ============================================================================

fn wrap_snapshot(data: &[u8]) -> Vec<u8> {
    let checksum = crc32fast::hash(data);
    let mut out = Vec::with_capacity(SNAPSHOT_HEADER_SIZE + data.len());
    out.extend_from_slice(SNAPSHOT_MAGIC);
    out.extend_from_slice(&SNAPSHOT_FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&checksum.to_le_bytes());
    out.extend_from_slice(&(data.len() as u64).to_le_bytes());
    out.extend_from_slice(data);
    out
}

fn unwrap_snapshot<'a>(data: &'a [u8], path: &Path) -> Result<&'a [u8]> {
    let corrupt = |reason: String| Error::CorruptState {
        path: path.display().to_string(),
        reason,
    };
    if data.len() < SNAPSHOT_HEADER_SIZE {
        return Err(corrupt(format!(
            "file too small: {} bytes (minimum {})",
            data.len(),
            SNAPSHOT_HEADER_SIZE
        )));
    }
    if &data[0..4] != SNAPSHOT_MAGIC {
        return Err(corrupt("bad magic bytes".to_string()));
    }
    let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if version > SNAPSHOT_FORMAT_VERSION {
        return Err(corrupt(format!(
            "unsupported format version {version} (supported up to {SNAPSHOT_FORMAT_VERSION})"
        )));
    }
    let stored_crc = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
    let declared_len = u64::from_le_bytes([
        data[12], data[13], data[14], data[15], data[16], data[17], data[18], data[19],
    ]);
    let payload = &data[SNAPSHOT_HEADER_SIZE..];
    if declared_len != payload.len() as u64 {
        return Err(corrupt(format!(
            "length mismatch: declared {declared_len}, actual {}",
            payload.len()
        )));
    }
    let computed = crc32fast::hash(payload);
    if stored_crc != computed {
        return Err(corrupt(format!(
            "checksum mismatch: stored 0x{stored_crc:08X}, computed 0x{computed:08X}"
        )));
    }
    Ok(payload)
}

/// Snapshot payload: the context plus the WAL sequence it reflects.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Snapshot {
    wal_seq: u64,
    context: ExecutionContext,
}

/// Atomic file write: temp file, fsync, rename, best-effort dir fsync.
async fn atomic_write_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let temp_name = format!(
        ".{}.{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        Uuid::new_v4()
    );
    let temp_path = path.with_file_name(&temp_name);

    let mut file = tokio::fs::File::create(&temp_path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    tokio::fs::rename(&temp_path, path).await?;

    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            if let Ok(dir) = tokio::fs::File::open(parent).await {
                let _ = dir.sync_all().await;
            }
        }
    }
    Ok(())
}

// ============================================================================
// WAL writer / reader
// ============================================================================

/// Append-only writer for one execution's WAL stream.
#[derive(Debug)]
pub struct WalWriter {
    file: tokio::fs::File,
    next_seq: u64,
}

impl WalWriter {
    /// Open (or create) a WAL for appending, continuing after `last_seq`.
    pub async fn open(path: &Path, last_seq: u64) -> Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            file,
            next_seq: last_seq + 1,
        })
    }

    /// Append one transition and make it durable. Returns its sequence
    /// number.
    pub async fn append(&mut self, transition: &Transition) -> Result<u64> {
        let seq = self.next_seq;
        let record = WalRecord {
            seq,
            transition: transition.clone(),
        };
        let body = bincode::serialize(&record)?;
        let mut frame = Vec::with_capacity(WAL_FRAME_HEADER + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        frame.extend_from_slice(&body);
        self.file.write_all(&frame).await?;
        self.file.sync_data().await?;
        self.next_seq += 1;
        Ok(seq)
    }

    /// Sequence number the next append will use.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }
}

/// Read a WAL stream, tolerating a torn or corrupt tail. Returns the
/// valid prefix and whether anything was truncated.
pub fn read_wal(path: &Path) -> Result<(Vec<WalRecord>, bool)> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), false)),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    let mut offset = 0usize;
    let mut truncated = false;
    while offset + WAL_FRAME_HEADER <= data.len() {
        let len = u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]) as usize;
        let stored_crc = u32::from_le_bytes([
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ]);
        let body_start = offset + WAL_FRAME_HEADER;
        let Some(body_end) = body_start.checked_add(len).filter(|end| *end <= data.len()) else {
            truncated = true;
            break;
        };
        let body = &data[body_start..body_end];
        if crc32fast::hash(body) != stored_crc {
            truncated = true;
            break;
        }
        match bincode::deserialize::<WalRecord>(body) {
            Ok(record) => records.push(record),
            Err(_) => {
                truncated = true;
                break;
            }
        }
        offset = body_end;
    }
    if offset < data.len() && !truncated {
        truncated = true;
    }
    if truncated {
        tracing::warn!(
            wal = %path.display(),
            valid_records = records.len(),
            "WAL has a corrupt or torn tail; truncating at last valid record"
        );
    }
    Ok((records, truncated))
}

// ============================================================================
// Recovery manager
// ============================================================================

/// A payload recovery restored for the memory store.
#[derive(Clone, Debug)]
pub struct MemoryRestore {
    /// Address to restore under.
    pub address: MemoryAddress,
    /// Schema of the payload.
    pub schema: String,
    /// The payload bytes.
    pub payload: Vec<u8>,
}

/// Everything needed to resume one execution.
pub struct RecoveredExecution {
    /// The pinned definition.
    pub definition: FlowDefinition,
    /// Context rebuilt from snapshot + WAL.
    pub context: ExecutionContext,
    /// Payloads of completed steps, for repopulating the memory store.
    pub restores: Vec<MemoryRestore>,
    /// Exporters whose merge already fired before the crash.
    pub merges_fired: Vec<String>,
    /// Last durable WAL sequence.
    pub last_seq: u64,
    /// Whether a corrupt WAL tail was truncated.
    pub wal_truncated: bool,
}

/// Journal handle held by a running execution's scheduler.
#[derive(Debug)]
pub struct ExecutionJournal {
    wal: WalWriter,
    snapshot_path: PathBuf,
    snapshot_interval: u32,
    appended_since_snapshot: u32,
}

impl ExecutionJournal {
    /// Append a transition durably; returns its sequence number.
    pub async fn record(&mut self, transition: &Transition) -> Result<u64> {
        let seq = self.wal.append(transition).await?;
        self.appended_since_snapshot += 1;
        Ok(seq)
    }

    /// Write a snapshot if the interval elapsed since the last one.
    pub async fn maybe_snapshot(&mut self, context: &ExecutionContext) -> Result<bool> {
        if self.appended_since_snapshot < self.snapshot_interval {
            return Ok(false);
        }
        self.snapshot(context).await?;
        Ok(true)
    }

    /// Write a snapshot unconditionally.
    pub async fn snapshot(&mut self, context: &ExecutionContext) -> Result<()> {
        let snapshot = Snapshot {
            wal_seq: self.wal.next_seq() - 1,
            context: context.clone(),
        };
        let payload = bincode::serialize(&snapshot)?;
        atomic_write_file(&self.snapshot_path, &wrap_snapshot(&payload)).await?;
        self.appended_since_snapshot = 0;
        tracing::debug!(
            execution_id = %context.execution_id,
            wal_seq = snapshot.wal_seq,
            "snapshot written"
        );
        Ok(())
    }
}

/// Owns the state directory; builds journals and restores executions.
pub struct RecoveryManager {
    base: PathBuf,
    snapshot_interval: u32,
}

impl RecoveryManager {
    /// A manager rooted at `base`.
    pub fn new(base: impl Into<PathBuf>, snapshot_interval: u32) -> Self {
        Self {
            base: base.into(),
            snapshot_interval: snapshot_interval.max(1),
        }
    }

    fn execution_dir(&self, execution_id: ExecutionId) -> PathBuf {
        self.base.join(execution_id.to_string())
    }

    /// Create the durable home of a new execution: directory, pinned
    /// definition, WAL with the `Planned` record already appended.
    pub async fn init_execution(
        &self,
        definition: &FlowDefinition,
        context: &ExecutionContext,
    ) -> Result<ExecutionJournal> {
        let dir = self.execution_dir(context.execution_id);
        tokio::fs::create_dir_all(&dir).await?;

        let definition_json = serde_json::to_vec_pretty(definition)?;
        atomic_write_file(&dir.join("definition.json"), &definition_json).await?;

        let mut wal = WalWriter::open(&dir.join("wal.log"), 0).await?;
        wal.append(&Transition::Planned {
            context: Box::new(context.clone()),
        })
        .await?;

        Ok(ExecutionJournal {
            wal,
            snapshot_path: dir.join("snapshot.bin"),
            snapshot_interval: self.snapshot_interval,
            appended_since_snapshot: 0,
        })
    }

    /// Reopen the journal of a recovered execution for further appends.
    pub async fn reopen_journal(&self, execution_id: ExecutionId, last_seq: u64) -> Result<ExecutionJournal> {
        let dir = self.execution_dir(execution_id);
        let wal = WalWriter::open(&dir.join("wal.log"), last_seq).await?;
        Ok(ExecutionJournal {
            wal,
            snapshot_path: dir.join("snapshot.bin"),
            snapshot_interval: self.snapshot_interval,
            appended_since_snapshot: 0,
        })
    }

    /// Execution ids with durable state on disk.
    pub fn list_executions(&self) -> Result<Vec<ExecutionId>> {
        let mut ids = Vec::new();
        let entries = match std::fs::read_dir(&self.base) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<ExecutionId>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Restore one execution from its durable state.
    ///
    /// The snapshot is an optimization: if it is missing or corrupt the
    /// whole WAL is replayed from the `Planned` record instead, and the
    /// corruption is logged rather than fatal.
    pub fn load_execution(&self, execution_id: ExecutionId) -> Result<RecoveredExecution> {
        let dir = self.execution_dir(execution_id);

        let definition: FlowDefinition = serde_json::from_slice(
            &std::fs::read(dir.join("definition.json")).map_err(|e| Error::Recovery {
                execution_id: execution_id.to_string(),
                reason: format!("definition unreadable: {e}"),
            })?,
        )
        .map_err(|e| Error::Recovery {
            execution_id: execution_id.to_string(),
            reason: format!("definition unparsable: {e}"),
        })?;

        let topo = crate::topology::derive(&definition).map_err(|e| Error::Recovery {
            execution_id: execution_id.to_string(),
            reason: format!("topology underivable: {e}"),
        })?;

        let (records, wal_truncated) = read_wal(&dir.join("wal.log"))?;
        if records.is_empty() {
            return Err(Error::Recovery {
                execution_id: execution_id.to_string(),
                reason: "WAL holds no valid records".to_string(),
            });
        }

        // Prefer the snapshot as the replay base; fall back to the full
        // WAL when it is missing or fails its integrity check.
        let snapshot_path = dir.join("snapshot.bin");
        let mut base: Option<Snapshot> = None;
        match std::fs::read(&snapshot_path) {
            Ok(data) => match unwrap_snapshot(&data, &snapshot_path)
                .and_then(|payload| bincode::deserialize::<Snapshot>(payload).map_err(Error::from))
            {
                Ok(snapshot) => base = Some(snapshot),
                Err(e) => tracing::warn!(
                    execution_id = %execution_id,
                    error = %e,
                    "snapshot unusable; replaying full WAL"
                ),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                execution_id = %execution_id,
                error = %e,
                "snapshot unreadable; replaying full WAL"
            ),
        }

        let (mut context, replay_from) = match base {
            Some(snapshot) => (snapshot.context, snapshot.wal_seq),
            None => {
                let Transition::Planned { context } = &records[0].transition else {
                    return Err(Error::Recovery {
                        execution_id: execution_id.to_string(),
                        reason: "WAL does not start with a Planned record".to_string(),
                    });
                };
                ((**context).clone(), records[0].seq)
            }
        };

        for record in records.iter().filter(|r| r.seq > replay_from) {
            apply_transition(&mut context, &topo, &record.transition);
        }
        let last_seq = records.last().map(|r| r.seq).unwrap_or(0);

        // Collect payloads of steps still marked completed, plus merged
        // exporter inputs, so the memory store can be repopulated.
        let mut latest: HashMap<String, MemoryRestore> = HashMap::new();
        let mut merges_fired: Vec<String> = Vec::new();
        for record in &records {
            match &record.transition {
                Transition::StepCompleted {
                    node,
                    address,
                    schema,
                    payload,
                    ..
                } => {
                    latest.insert(
                        format!("step:{node}"),
                        MemoryRestore {
                            address: address.clone(),
                            schema: schema.clone(),
                            payload: payload.clone(),
                        },
                    );
                }
                Transition::MergeFired {
                    exporter,
                    address,
                    schema,
                    payload,
                    ..
                } => {
                    if !merges_fired.contains(exporter) {
                        merges_fired.push(exporter.clone());
                    }
                    latest.insert(
                        format!("merge:{exporter}"),
                        MemoryRestore {
                            address: address.clone(),
                            schema: schema.clone(),
                            payload: payload.clone(),
                        },
                    );
                }
                _ => {}
            }
        }
        let restores = latest.into_values().collect();

        Ok(RecoveredExecution {
            definition,
            context,
            restores,
            merges_fired,
            last_seq,
            wal_truncated,
        })
    }

    /// Delete an execution's durable state after terminal cleanup.
    pub async fn remove_execution(&self, execution_id: ExecutionId) -> Result<()> {
        let dir = self.execution_dir(execution_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// The error record emitted as a compensation event when an execution
    /// cannot be restored.
    pub fn unrecoverable_record(execution_id: ExecutionId, reason: &str) -> ErrorRecord {
        ErrorRecord::new(
            ErrorCode::new(ErrorClass::RecoveryError, "UNRECOVERABLE"),
            Severity::Critical,
            "recovery-manager",
            format!("execution {execution_id} could not be restored: {reason}"),
        )
    }
}

/// Grants or denies dispatch rights to this orchestrator replica.
///
/// Election itself is externalized to a consensus store; in-process
/// deployments use [`AlwaysLeader`]. Schedulers check leadership before
/// every dispatch, so losing it quiesces command publication without
/// tearing running state down.
pub trait LeaderElector: Send + Sync {
    /// Whether this replica currently holds leadership.
    fn is_leader(&self) -> bool;
}

/// Single-replica elector: always the leader.
#[derive(Default)]
pub struct AlwaysLeader;

impl LeaderElector for AlwaysLeader {
    fn is_leader(&self) -> bool {
        true
    }
}
