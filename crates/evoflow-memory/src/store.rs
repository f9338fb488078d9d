use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use evoflow_core::error::{EvoflowError, Result};
use evoflow_core::message::{Message, MessagePatch};
use evoflow_core::payload::Payload;
use evoflow_core::store::{
    InvocationRecord, InvocationUpdate, NodeInvocationRecord, NodeSummary, NodeVersionRecord,
    WorkflowVersionRecord,
};
use evoflow_core::traits::WorkflowStore;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS workflows (
        workflow_id TEXT PRIMARY KEY,
        description TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS workflow_versions (
        wf_version_id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL REFERENCES workflows(workflow_id),
        generation INTEGER NOT NULL,
        parent_ids TEXT NOT NULL,
        operator TEXT NOT NULL,
        config TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_versions_workflow
        ON workflow_versions(workflow_id, generation);

    CREATE TABLE IF NOT EXISTS workflow_invocations (
        workflow_invocation_id TEXT PRIMARY KEY,
        wf_version_id TEXT,
        prompt TEXT NOT NULL,
        started_at TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'running',
        usd_cost REAL,
        final_output TEXT,
        fitness REAL,
        feedback TEXT,
        finished_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_invocations_version
        ON workflow_invocations(wf_version_id);

    CREATE TABLE IF NOT EXISTS node_versions (
        node_version_id TEXT PRIMARY KEY,
        wf_version_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        config TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS node_invocations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        node_invocation_id TEXT NOT NULL UNIQUE,
        workflow_invocation_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        summary TEXT NOT NULL,
        usd_cost REAL NOT NULL,
        failed INTEGER NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_node_invocations_node
        ON node_invocations(node_id, id);

    CREATE TABLE IF NOT EXISTS messages (
        message_id TEXT PRIMARY KEY,
        workflow_invocation_id TEXT NOT NULL,
        from_node_id TEXT NOT NULL,
        to_node_id TEXT NOT NULL,
        origin_invocation_id TEXT,
        seq INTEGER NOT NULL,
        payload TEXT NOT NULL,
        reply_to TEXT,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_messages_invocation
        ON messages(workflow_invocation_id, seq);
";

fn db(e: rusqlite::Error) -> EvoflowError {
    EvoflowError::Database(e.to_string())
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// SQLite-backed [`WorkflowStore`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EvoflowError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db)?;
        conn.execute_batch(SCHEMA).map_err(db)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db)?;
        conn.execute_batch(SCHEMA).map_err(db)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| EvoflowError::Database(e.to_string()))
    }

    pub fn load_workflow_version(&self, wf_version_id: &str) -> Result<Option<WorkflowVersionRecord>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT wf_version_id, workflow_id, generation, parent_ids, operator, config, created_at
                 FROM workflow_versions WHERE wf_version_id = ?1",
                params![wf_version_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()
            .map_err(db)?;

        let Some((wf_version_id, workflow_id, generation, parents, operator, config, created)) = row
        else {
            return Ok(None);
        };
        Ok(Some(WorkflowVersionRecord {
            wf_version_id,
            workflow_id,
            generation,
            parent_ids: serde_json::from_str(&parents)?,
            operator,
            config: serde_json::from_str(&config)?,
            created_at: parse_time(&created),
        }))
    }

    /// The version of `workflow_id` with the highest recorded fitness, and that fitness.
    pub fn best_version(&self, workflow_id: &str) -> Result<Option<(String, f64)>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT v.wf_version_id, MAX(i.fitness) AS best
             FROM workflow_versions v
             JOIN workflow_invocations i ON i.wf_version_id = v.wf_version_id
             WHERE v.workflow_id = ?1 AND i.fitness IS NOT NULL
             GROUP BY v.wf_version_id
             ORDER BY best DESC
             LIMIT 1",
            params![workflow_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(db)
    }

    /// Messages of one invocation in sequence order.
    pub fn invocation_messages(&self, workflow_invocation_id: &str) -> Result<Vec<Message>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT message_id, from_node_id, to_node_id, origin_invocation_id, seq,
                        payload, reply_to, created_at
                 FROM messages
                 WHERE workflow_invocation_id = ?1
                 ORDER BY seq ASC",
            )
            .map_err(db)?;

        let rows = stmt
            .query_map(params![workflow_invocation_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .map_err(db)?;

        let mut messages = Vec::new();
        for row in rows {
            let (message_id, from, to, origin, seq, payload, reply_to, created) = row.map_err(db)?;
            let payload: Payload = serde_json::from_str(&payload)?;
            messages.push(Message {
                message_id,
                from_node_id: from,
                to_node_id: to,
                origin_invocation_id: origin,
                seq: seq as u64,
                payload,
                created_at: parse_time(&created),
                reply_to,
                workflow_invocation_id: workflow_invocation_id.to_string(),
            });
        }
        Ok(messages)
    }

    /// Status, fitness and feedback of one invocation.
    pub fn invocation_outcome(
        &self,
        workflow_invocation_id: &str,
    ) -> Result<Option<(String, Option<f64>, Option<String>)>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT status, fitness, feedback FROM workflow_invocations
             WHERE workflow_invocation_id = ?1",
            params![workflow_invocation_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .map_err(db)
    }
}

impl WorkflowStore for SqliteStore {
    fn ensure_workflow_exists(
        &self,
        workflow_id: String,
        description: String,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "INSERT OR IGNORE INTO workflows (workflow_id, description, created_at)
                 VALUES (?1, ?2, ?3)",
                params![workflow_id, description, Utc::now().to_rfc3339()],
            )
            .map_err(db)?;
            Ok(())
        })
    }

    fn create_workflow_version(&self, record: WorkflowVersionRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let parents = serde_json::to_string(&record.parent_ids)?;
            let config = serde_json::to_string(&record.config)?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT OR REPLACE INTO workflow_versions
                 (wf_version_id, workflow_id, generation, parent_ids, operator, config, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.wf_version_id,
                    record.workflow_id,
                    record.generation,
                    parents,
                    record.operator,
                    config,
                    record.created_at.to_rfc3339(),
                ],
            )
            .map_err(db)?;
            Ok(())
        })
    }

    fn create_workflow_invocation(&self, record: InvocationRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO workflow_invocations
                 (workflow_invocation_id, wf_version_id, prompt, started_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.workflow_invocation_id,
                    record.wf_version_id,
                    record.prompt,
                    record.started_at.to_rfc3339(),
                ],
            )
            .map_err(db)?;
            Ok(())
        })
    }

    fn update_workflow_invocation(
        &self,
        workflow_invocation_id: String,
        update: InvocationUpdate,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let changed = conn
                .execute(
                    "UPDATE workflow_invocations
                     SET status = ?2, usd_cost = ?3, final_output = ?4,
                         fitness = COALESCE(?5, fitness), feedback = COALESCE(?6, feedback),
                         finished_at = ?7
                     WHERE workflow_invocation_id = ?1",
                    params![
                        workflow_invocation_id,
                        update.status.as_str(),
                        update.usd_cost,
                        update.final_output,
                        update.fitness,
                        update.feedback,
                        update.finished_at.to_rfc3339(),
                    ],
                )
                .map_err(db)?;
            if changed == 0 {
                return Err(EvoflowError::Database(format!(
                    "unknown workflow invocation {}",
                    workflow_invocation_id
                )));
            }
            Ok(())
        })
    }

    fn save_node_version(&self, record: NodeVersionRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let config = serde_json::to_string(&record.config)?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT OR REPLACE INTO node_versions (node_version_id, wf_version_id, node_id, config)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.node_version_id,
                    record.wf_version_id,
                    record.config.node_id,
                    config,
                ],
            )
            .map_err(db)?;
            Ok(())
        })
    }

    fn save_node_invocation(&self, record: NodeInvocationRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO node_invocations
                 (node_invocation_id, workflow_invocation_id, node_id, summary, usd_cost, failed, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.node_invocation_id,
                    record.workflow_invocation_id,
                    record.node_id,
                    record.summary,
                    record.usd_cost,
                    record.failed,
                    record.created_at.to_rfc3339(),
                ],
            )
            .map_err(db)?;
            Ok(())
        })
    }

    fn save_message(&self, message: Message) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let payload = serde_json::to_string(&message.payload)?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO messages
                 (message_id, workflow_invocation_id, from_node_id, to_node_id,
                  origin_invocation_id, seq, payload, reply_to, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    message.message_id,
                    message.workflow_invocation_id,
                    message.from_node_id,
                    message.to_node_id,
                    message.origin_invocation_id,
                    message.seq as i64,
                    payload,
                    message.reply_to,
                    message.created_at.to_rfc3339(),
                ],
            )
            .map_err(db)?;
            Ok(())
        })
    }

    fn update_message(
        &self,
        message_id: String,
        patch: MessagePatch,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let payload = patch.payload.as_ref().map(serde_json::to_string).transpose()?;
            let conn = self.lock()?;
            let changed = conn
                .execute(
                    "UPDATE messages
                     SET payload = COALESCE(?2, payload), to_node_id = COALESCE(?3, to_node_id)
                     WHERE message_id = ?1",
                    params![message_id, payload, patch.to_node_id],
                )
                .map_err(db)?;
            if changed == 0 {
                return Err(EvoflowError::Database(format!("unknown message {}", message_id)));
            }
            Ok(())
        })
    }

    fn retrieve_node_summaries(
        &self,
        node_id: String,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<NodeSummary>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT node_invocation_id, node_id, summary, created_at
                     FROM node_invocations
                     WHERE node_id = ?1
                     ORDER BY id DESC
                     LIMIT ?2",
                )
                .map_err(db)?;

            let rows = stmt
                .query_map(params![node_id, limit as i64], |row| {
                    let created: String = row.get(3)?;
                    Ok(NodeSummary {
                        node_invocation_id: row.get(0)?,
                        node_id: row.get(1)?,
                        summary: row.get(2)?,
                        created_at: parse_time(&created),
                    })
                })
                .map_err(db)?;

            let mut summaries = Vec::new();
            for row in rows {
                summaries.push(row.map_err(db)?);
            }
            Ok(summaries)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evoflow_core::store::InvocationStatus;
    use evoflow_test_utils::linear_workflow;

    fn version(id: &str) -> WorkflowVersionRecord {
        WorkflowVersionRecord {
            wf_version_id: id.into(),
            workflow_id: "wf".into(),
            generation: 1,
            parent_ids: vec!["p".into()],
            operator: "mutation".into(),
            config: linear_workflow(),
            created_at: Utc::now(),
        }
    }

    fn invocation(id: &str, version: &str) -> InvocationRecord {
        InvocationRecord {
            workflow_invocation_id: id.into(),
            wf_version_id: Some(version.into()),
            prompt: "task".into(),
            started_at: Utc::now(),
        }
    }

    fn finished(fitness: Option<f64>) -> InvocationUpdate {
        InvocationUpdate {
            status: InvocationStatus::Completed,
            usd_cost: 0.01,
            final_output: Some("42".into()),
            fitness,
            feedback: fitness.map(|_| "good".to_string()),
            finished_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_version_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        store.ensure_workflow_exists("wf".into(), "demo".into()).await.unwrap();
        store.ensure_workflow_exists("wf".into(), "again".into()).await.unwrap();
        store.create_workflow_version(version("v1")).await.unwrap();

        let loaded = store.load_workflow_version("v1").unwrap().unwrap();
        assert_eq!(loaded.config, linear_workflow());
        assert_eq!(loaded.parent_ids, vec!["p"]);
        assert!(store.load_workflow_version("missing").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fitness_survives_later_status_update() {
        let store = SqliteStore::in_memory().unwrap();
        store.ensure_workflow_exists("wf".into(), "demo".into()).await.unwrap();
        store.create_workflow_version(version("v1")).await.unwrap();
        store.create_workflow_version(version("v2")).await.unwrap();
        store.create_workflow_invocation(invocation("i1", "v1")).await.unwrap();
        store.create_workflow_invocation(invocation("i2", "v2")).await.unwrap();

        store.update_workflow_invocation("i1".into(), finished(Some(40.0))).await.unwrap();
        store.update_workflow_invocation("i2".into(), finished(Some(75.0))).await.unwrap();
        store.update_workflow_invocation("i2".into(), finished(None)).await.unwrap();

        let (status, fitness, feedback) = store.invocation_outcome("i2").unwrap().unwrap();
        assert_eq!(status, "completed");
        assert_eq!(fitness, Some(75.0));
        assert_eq!(feedback.as_deref(), Some("good"));
        assert_eq!(store.best_version("wf").unwrap(), Some(("v2".to_string(), 75.0)));

        assert!(store
            .update_workflow_invocation("nope".into(), finished(None))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_messages_and_patches() {
        let store = SqliteStore::in_memory().unwrap();
        let entry = Message::entry("a", "hello", 0, "inv");
        let reply = Message::new("a", "b", Some("ni".into()), 1, Payload::sequential("next"), "inv")
            .with_reply_to(entry.message_id.clone());
        store.save_message(reply.clone()).await.unwrap();
        store.save_message(entry.clone()).await.unwrap();

        store
            .update_message(
                reply.message_id.clone(),
                MessagePatch {
                    payload: Some(Payload::sequential("patched")),
                    to_node_id: None,
                },
            )
            .await
            .unwrap();

        let messages = store.invocation_messages("inv").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].message_id, entry.message_id);
        assert_eq!(messages[1].payload, Payload::sequential("patched"));
        assert_eq!(messages[1].to_node_id, "b");
        assert_eq!(messages[1].reply_to.as_deref(), Some(entry.message_id.as_str()));
    }

    #[tokio::test]
    async fn test_summaries_newest_first() {
        let store = SqliteStore::in_memory().unwrap();
        for i in 0..4 {
            store
                .save_node_invocation(NodeInvocationRecord {
                    node_invocation_id: format!("n{}", i),
                    workflow_invocation_id: "inv".into(),
                    node_id: "solver".into(),
                    summary: format!("run {}", i),
                    usd_cost: 0.0,
                    failed: false,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let summaries = store.retrieve_node_summaries("solver".into(), 2).await.unwrap();
        let texts: Vec<&str> = summaries.iter().map(|s| s.summary.as_str()).collect();
        assert_eq!(texts, vec!["run 3", "run 2"]);
    }

    #[tokio::test]
    async fn test_file_store_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("evoflow.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.ensure_workflow_exists("wf".into(), "demo".into()).await.unwrap();
            store.create_workflow_version(version("v1")).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert!(store.load_workflow_version("v1").unwrap().is_some());
    }
}
