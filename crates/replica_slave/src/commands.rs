//! Administrative commands.
//!
//! Commands reply with a [`CommandReply`] whose JSON form carries the
//! integer `ok` flag callers test for truthiness, plus a `reason` that
//! tells a refused `resync` apart.

use crate::error::{RejectReason, ReplError};
use crate::resync::{ResyncRequest, ResyncTrigger};
use crate::state::ReplStateHandle;
use crate::stats::{OpCounters, SnapshotRing, Top, UsageKind};
use replica_storage::{StorageEngine, StorageResult};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;

const MB: u64 = 1024 * 1024;

/// Reply to an admin command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReply {
    /// Whether the command succeeded.
    pub ok: bool,
    /// Failure description.
    pub errmsg: Option<String>,
    /// Why a resync was refused.
    pub reason: Option<RejectReason>,
    /// Command-specific fields.
    pub body: Map<String, Value>,
}

impl CommandReply {
    /// A successful reply.
    pub fn success(body: Map<String, Value>) -> Self {
        Self {
            ok: true,
            errmsg: None,
            reason: None,
            body,
        }
    }

    /// A failed reply.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            errmsg: Some(message.into()),
            reason: None,
            body: Map::new(),
        }
    }

    /// A refused resync.
    pub fn rejected(reason: RejectReason) -> Self {
        Self {
            ok: false,
            errmsg: Some(format!("resync rejected: {reason}")),
            reason: Some(reason),
            body: Map::new(),
        }
    }

    /// Renders the reply with `ok` as `0` or `1`.
    pub fn to_json(&self) -> Value {
        let mut out = self.body.clone();
        out.insert("ok".into(), json!(u8::from(self.ok)));
        if let Some(errmsg) = &self.errmsg {
            out.insert("errmsg".into(), json!(errmsg));
        }
        if let Some(reason) = self.reason {
            out.insert("reason".into(), json!(reason.as_str()));
        }
        Value::Object(out)
    }
}

enum Role {
    /// Not replicating from anyone.
    Standalone,
    Slave {
        state: Arc<ReplStateHandle>,
        trigger: Arc<dyn ResyncTrigger>,
    },
}

/// Dispatcher for `resync`, `serverStatus`, `listDatabases` and `top`.
pub struct AdminCommands {
    storage: Arc<dyn StorageEngine>,
    role: Role,
    top: Arc<Top>,
    counters: Arc<OpCounters>,
    usage: Arc<SnapshotRing>,
    started: Instant,
}

impl AdminCommands {
    /// Commands for a node that does not replicate from a master, such as
    /// the master itself. `resync` is always refused with `not-slave`.
    pub fn standalone(storage: Arc<dyn StorageEngine>) -> Self {
        Self {
            storage,
            role: Role::Standalone,
            top: Arc::new(Top::new()),
            counters: Arc::new(OpCounters::new()),
            usage: Arc::new(SnapshotRing::new(2)),
            started: Instant::now(),
        }
    }

    /// Commands for a slave.
    pub fn slave(
        storage: Arc<dyn StorageEngine>,
        state: Arc<ReplStateHandle>,
        trigger: Arc<dyn ResyncTrigger>,
        top: Arc<Top>,
        counters: Arc<OpCounters>,
        usage: Arc<SnapshotRing>,
    ) -> Self {
        Self {
            storage,
            role: Role::Slave { state, trigger },
            top,
            counters,
            usage,
            started: Instant::now(),
        }
    }

    /// Runs a command by name.
    pub fn run(&self, name: &str) -> CommandReply {
        self.counters.record(UsageKind::Command);
        let reply = match name {
            "resync" => self.resync(),
            "serverStatus" => self.server_status(),
            "listDatabases" => self.list_databases(),
            "top" => Ok(self.top_totals()),
            other => Ok(CommandReply::error(format!("no such cmd: {other}"))),
        };
        reply.unwrap_or_else(|e| CommandReply::error(e.to_string()))
    }

    /// Requests a manual resync.
    pub fn resync(&self) -> StorageResult<CommandReply> {
        let Role::Slave { trigger, .. } = &self.role else {
            return Ok(CommandReply::rejected(RejectReason::NotSlave));
        };
        Ok(match trigger.request_resync(ResyncRequest::manual()) {
            Ok(()) => CommandReply::success(Map::new()),
            Err(ReplError::ResyncRejected(reason)) => CommandReply::rejected(reason),
            Err(e) => CommandReply::error(e.to_string()),
        })
    }

    /// Reports replication status, mapped size, op counters and recent usage.
    pub fn server_status(&self) -> StorageResult<CommandReply> {
        let mut body = Map::new();
        body.insert("uptime".into(), json!(self.started.elapsed().as_secs()));
        body.insert("repl".into(), self.repl_status());

        let mapped = self.storage.total_size()?;
        body.insert("mem".into(), json!({ "mapped": mapped.div_ceil(MB) }));
        body.insert("opcounters".into(), json!(self.counters.snapshot()));

        let usage = match self.usage.compute_delta(0) {
            Some(delta) => json!({
                "elapsed": delta.elapsed_micros,
                "writeLocked": delta.write_locked_micros,
                "percentWriteLocked": delta.percent_write_locked(),
                "global": delta.global,
                "namespaces": delta.usage,
            }),
            None => Value::Null,
        };
        body.insert("usage".into(), usage);

        Ok(CommandReply::success(body))
    }

    fn repl_status(&self) -> Value {
        match &self.role {
            Role::Standalone => json!({ "ismaster": true }),
            Role::Slave { state, .. } => {
                let state = state.snapshot();
                json!({
                    "ismaster": false,
                    "mode": state.mode.as_str(),
                    "source": state.sync_source.to_string(),
                    "lastApplied": state.last_applied.to_string(),
                    "syncing": state.syncing_databases,
                    "invalid": state.invalid_databases,
                    "gap": state.gap.map(|gap| json!({
                        "requested": gap.requested.to_string(),
                        "oldestRetained": gap.oldest_retained.to_string(),
                    })),
                    "fault": state.fault,
                    "initialized": state.initialized,
                })
            }
        }
    }

    /// Lists databases with their approximate sizes.
    pub fn list_databases(&self) -> StorageResult<CommandReply> {
        let mut databases = Vec::new();
        let mut total = 0;
        for name in self.storage.database_names()? {
            let size = self.storage.database_size(&name)?;
            let empty = self.storage.snapshot(&name)?.data.document_count() == 0;
            total += size;
            databases.push(json!({
                "name": name,
                "sizeOnDisk": size,
                "empty": empty,
            }));
        }

        let mut body = Map::new();
        body.insert("databases".into(), Value::Array(databases));
        body.insert("totalSize".into(), json!(total));
        Ok(CommandReply::success(body))
    }

    /// Reports usage per namespace since startup.
    pub fn top_totals(&self) -> CommandReply {
        let mut totals = match json!(self.top.usage()) {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        totals.insert("global".into(), json!(self.top.global()));

        let mut body = Map::new();
        body.insert("totals".into(), Value::Object(totals));
        CommandReply::success(body)
    }
}
