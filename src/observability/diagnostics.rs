//! Framework worker table and the `/threads` dump.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::Serialize;

/// What a framework task does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerRole {
    Accept,
    PushExporter,
    ConsoleExporter,
    ShutdownHook,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Running,
    Stopped,
}

/// One row of the worker table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerInfo {
    pub id: u64,
    pub name: String,
    pub role: WorkerRole,
    pub state: WorkerState,
    pub started_at_ms: u64,
}

/// Long-lived tasks spawned by the framework, keyed by registration id.
#[derive(Debug, Clone, Default)]
pub struct WorkerTable {
    workers: Arc<DashMap<u64, WorkerInfo>>,
    next_id: Arc<AtomicU64>,
}

impl WorkerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a running worker. It is marked stopped when the guard drops.
    pub fn register(&self, name: impl Into<String>, role: WorkerRole) -> WorkerGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let info = WorkerInfo {
            id,
            name: name.into(),
            role,
            state: WorkerState::Running,
            started_at_ms: unix_millis(),
        };
        tracing::trace!(worker = %info.name, role = ?role, "Worker started");
        self.workers.insert(id, info);
        WorkerGuard {
            table: self.clone(),
            id,
        }
    }

    /// Rows ordered by registration.
    pub fn list(&self) -> Vec<WorkerInfo> {
        let mut rows: Vec<WorkerInfo> = self.workers.iter().map(|e| e.value().clone()).collect();
        rows.sort_by_key(|row| row.id);
        rows
    }

    pub fn running(&self) -> usize {
        self.workers
            .iter()
            .filter(|e| e.value().state == WorkerState::Running)
            .count()
    }
}

/// Marks its worker stopped on drop.
#[derive(Debug)]
pub struct WorkerGuard {
    table: WorkerTable,
    id: u64,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if let Some(mut row) = self.table.workers.get_mut(&self.id) {
            row.state = WorkerState::Stopped;
            tracing::trace!(worker = %row.name, "Worker stopped");
        }
    }
}

/// Tokio runtime figures at capture time.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStats {
    pub workers: usize,
    pub alive_tasks: usize,
}

/// JSON body of `/threads`.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadDump {
    pub captured_at_ms: u64,
    pub runtime: Option<RuntimeStats>,
    pub workers: Vec<WorkerInfo>,
}

impl ThreadDump {
    pub fn capture(table: &WorkerTable) -> Self {
        let runtime = tokio::runtime::Handle::try_current().ok().map(|handle| {
            let metrics = handle.metrics();
            RuntimeStats {
                workers: metrics.num_workers(),
                alive_tasks: metrics.num_alive_tasks(),
            }
        });
        Self {
            captured_at_ms: unix_millis(),
            runtime,
            workers: table.list(),
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_marks_worker_stopped() {
        let table = WorkerTable::new();
        let guard = table.register("accept-http", WorkerRole::Accept);
        assert_eq!(table.running(), 1);

        drop(guard);
        let rows = table.list();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, WorkerState::Stopped);
        assert_eq!(table.running(), 0);
    }

    #[tokio::test]
    async fn dump_includes_runtime_and_workers() {
        let table = WorkerTable::new();
        let _hook = table.register("shutdown-hook", WorkerRole::ShutdownHook);
        let dump = ThreadDump::capture(&table);
        assert!(dump.runtime.is_some());
        let json = serde_json::to_value(&dump).unwrap();
        assert_eq!(json["workers"][0]["role"], "shutdown-hook");
        assert_eq!(json["workers"][0]["state"], "running");
    }
}
