//! Durable file store
//!
//! Two files side by side:
//! - `<name>.json`: the assignment table as one JSON document. Every
//!   mutation rewrites it with an atomic temp-file + rename so a crash
//!   mid-write never leaves a truncated document.
//! - `<stem>.usage.jsonl`: the usage log, one JSON record per line, only
//!   ever appended to.
//!
//! Each file has its own tokio Mutex, so usage appends never contend with
//! admissions. An in-memory change is rolled back (or never applied) when
//! the write fails.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    AssignmentMap, AssignmentStore, DeviceAssignment, InsertOutcome, StoreFuture, StoreSnapshot,
    UsageRecord, count_all, tally_by_key, tail,
};
use crate::error::{Error, Result};

/// On-disk layout of the assignment table.
#[derive(Deserialize)]
struct Document {
    #[serde(default)]
    assignments: Vec<DeviceAssignment>,
}

#[derive(Serialize)]
struct DocumentRef<'a> {
    assignments: Vec<&'a DeviceAssignment>,
}

/// File-backed store. The files are the source of truth across restarts.
pub struct FileStore {
    path: PathBuf,
    usage_path: PathBuf,
    assignments: Mutex<AssignmentMap>,
    usage: Mutex<Vec<UsageRecord>>,
}

impl FileStore {
    /// Load the store from `path`; the usage log lives next to it.
    ///
    /// Missing files are a cold start: the store begins empty and both
    /// files are created immediately so later loads take the normal path.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let assignments = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| unavailable("reading store file", e))?;
            let document: Document = serde_json::from_str(&contents)
                .map_err(|e| unavailable("parsing store file", e))?;

            let mut assignments = AssignmentMap::new();
            for assignment in document.assignments {
                assignments
                    .entry(assignment.user_id.clone())
                    .or_default()
                    .insert(assignment.device_id.clone(), assignment);
            }
            assignments
        } else {
            info!(path = %path.display(), "store file not found, starting empty");
            let assignments = AssignmentMap::new();
            write_atomic(&path, &assignments).await?;
            assignments
        };

        let usage_path = usage_log_path(&path);
        let usage = load_usage_log(&usage_path).await?;

        info!(
            path = %path.display(),
            usage_log = %usage_path.display(),
            assignments = count_all(&assignments),
            usage_records = usage.len(),
            "loaded pool store"
        );

        Ok(Self {
            path,
            usage_path,
            assignments: Mutex::new(assignments),
            usage: Mutex::new(usage),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn usage_path(&self) -> &Path {
        &self.usage_path
    }
}

impl AssignmentStore for FileStore {
    fn backend(&self) -> &'static str {
        "file"
    }

    fn find_assignment<'a>(
        &'a self,
        user_id: &'a str,
        device_id: &'a str,
    ) -> StoreFuture<'a, Option<DeviceAssignment>> {
        Box::pin(async move {
            let assignments = self.assignments.lock().await;
            Ok(assignments
                .get(user_id)
                .and_then(|devices| devices.get(device_id))
                .cloned())
        })
    }

    fn insert_assignment_if_absent(
        &self,
        assignment: DeviceAssignment,
    ) -> StoreFuture<'_, InsertOutcome> {
        Box::pin(async move {
            let mut assignments = self.assignments.lock().await;
            let user_id = assignment.user_id.clone();
            let device_id = assignment.device_id.clone();

            let devices = assignments.entry(user_id.clone()).or_default();
            if let Some(existing) = devices.get(&device_id) {
                return Ok(InsertOutcome::Existing(existing.clone()));
            }
            devices.insert(device_id.clone(), assignment);

            if let Err(e) = write_atomic(&self.path, &assignments).await {
                warn!(user_id = %user_id, error = %e, "persisting assignment failed, rolling back");
                if let Some(devices) = assignments.get_mut(&user_id) {
                    devices.remove(&device_id);
                    if devices.is_empty() {
                        assignments.remove(&user_id);
                    }
                }
                return Err(e);
            }
            Ok(InsertOutcome::Inserted)
        })
    }

    fn touch_assignment(&self, assignment: DeviceAssignment) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut assignments = self.assignments.lock().await;
            let user_id = assignment.user_id.clone();
            let device_id = assignment.device_id.clone();

            let previous = assignments
                .entry(user_id.clone())
                .or_default()
                .insert(device_id.clone(), assignment);

            if let Err(e) = write_atomic(&self.path, &assignments).await {
                warn!(user_id = %user_id, error = %e, "persisting assignment refresh failed, rolling back");
                if let Some(devices) = assignments.get_mut(&user_id) {
                    match previous {
                        Some(previous) => {
                            devices.insert(device_id, previous);
                        }
                        None => {
                            devices.remove(&device_id);
                        }
                    }
                    if devices.is_empty() {
                        assignments.remove(&user_id);
                    }
                }
                return Err(e);
            }
            Ok(())
        })
    }

    fn count_devices<'a>(&'a self, user_id: &'a str) -> StoreFuture<'a, usize> {
        Box::pin(async move {
            let assignments = self.assignments.lock().await;
            Ok(assignments.get(user_id).map_or(0, HashMap::len))
        })
    }

    fn count_devices_per_key(&self) -> StoreFuture<'_, HashMap<String, usize>> {
        Box::pin(async move { Ok(tally_by_key(&*self.assignments.lock().await)) })
    }

    fn append_usage(&self, record: UsageRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut line = Vec::new();
            serde_json::to_writer(&mut line, &record)
                .map_err(|e| unavailable("serializing usage record", e))?;
            line.push(b'\n');

            // Held across the write so file order matches memory order.
            let mut usage = self.usage.lock().await;
            let mut file = open_usage_log(&self.usage_path).await?;
            if let Err(e) = write_line(&mut file, &line).await {
                warn!(error = %e, "appending usage record failed");
                return Err(e);
            }
            usage.push(record);
            Ok(())
        })
    }

    fn snapshot(&self, recent: usize) -> StoreFuture<'_, StoreSnapshot> {
        Box::pin(async move {
            let assignment_count = count_all(&*self.assignments.lock().await);
            let usage = self.usage.lock().await;
            Ok(StoreSnapshot {
                assignment_count,
                usage_record_count: usage.len(),
                recent_usage: tail(&usage, recent),
            })
        })
    }
}

fn unavailable(context: &str, e: impl std::fmt::Display) -> Error {
    Error::StoreUnavailable(format!("{context}: {e}"))
}

/// `pool.json` -> `pool.usage.jsonl` in the same directory.
fn usage_log_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".into());
    path.with_file_name(format!("{stem}.usage.jsonl"))
}

/// Open the usage log for appending, creating it owner-only if missing.
async fn open_usage_log(path: &Path) -> Result<tokio::fs::File> {
    let mut options = tokio::fs::OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    options.mode(0o600);
    options
        .open(path)
        .await
        .map_err(|e| unavailable("opening usage log", e))
}

async fn write_line(file: &mut tokio::fs::File, line: &[u8]) -> Result<()> {
    file.write_all(line)
        .await
        .map_err(|e| unavailable("appending usage log", e))?;
    file.flush()
        .await
        .map_err(|e| unavailable("flushing usage log", e))
}

/// Read every complete record from the usage log.
///
/// Appends always end in a newline, so a final line without one is an
/// interrupted write: it is dropped and truncated away so the next append
/// starts on a clean line. A malformed complete line is corruption.
async fn load_usage_log(path: &Path) -> Result<Vec<UsageRecord>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            open_usage_log(path).await?;
            return Ok(Vec::new());
        }
        Err(e) => return Err(unavailable("reading usage log", e)),
    };

    let mut records = Vec::new();
    let mut complete_len = 0usize;
    for (index, line) in contents.split_inclusive('\n').enumerate() {
        if !line.ends_with('\n') {
            warn!(
                path = %path.display(),
                dropped_bytes = line.len(),
                "usage log ends in a partial record, truncating"
            );
            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(path)
                .await
                .map_err(|e| unavailable("opening usage log for repair", e))?;
            file.set_len(complete_len as u64)
                .await
                .map_err(|e| unavailable("truncating usage log", e))?;
            break;
        }
        complete_len += line.len();

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record = serde_json::from_str(trimmed)
            .map_err(|e| unavailable(&format!("parsing usage log line {}", index + 1), e))?;
        records.push(record);
    }
    Ok(records)
}

/// Write the assignment table atomically.
///
/// Writes a temporary file next to the target, then renames it over the
/// target. The file holds user and device identifiers, so it is created
/// with 0600 permissions on unix.
async fn write_atomic(path: &Path, assignments: &AssignmentMap) -> Result<()> {
    let mut rows: Vec<&DeviceAssignment> = assignments.values().flat_map(HashMap::values).collect();
    rows.sort_by(|a, b| (&a.user_id, &a.device_id).cmp(&(&b.user_id, &b.device_id)));

    let json = serde_json::to_string_pretty(&DocumentRef { assignments: rows })
        .map_err(|e| unavailable("serializing store", e))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::StoreUnavailable("store path has no parent directory".into()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".into());
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| unavailable("writing temp store file", e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| unavailable("setting store file permissions", e))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| unavailable("renaming temp store file", e))?;

    debug!(path = %path.display(), "persisted assignment table");
    Ok(())
}
