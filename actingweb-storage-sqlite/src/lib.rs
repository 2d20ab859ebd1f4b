//! SQLite-backed [`StorageAdapter`] implementation.
//!
//! Schema migration follows the teacher's `policy/store.rs` pattern: a
//! single `execute_batch` of `CREATE TABLE IF NOT EXISTS` statements run at
//! open time, no migration framework. The connection is wrapped in a
//! `parking_lot::Mutex` and every call hops onto `spawn_blocking`, since
//! rusqlite itself is synchronous.

use std::path::Path;
use std::sync::Arc;

use actingweb_core::error::{ActingWebError, Result};
use actingweb_core::storage::{StorageAdapter, WriteOutcome};
use actingweb_core::types::{Attribute, Diff, Subscription, Trust};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS trusts (
    actor_id TEXT NOT NULL,
    peer_id TEXT NOT NULL,
    data TEXT NOT NULL,
    PRIMARY KEY (actor_id, peer_id)
);

CREATE TABLE IF NOT EXISTS subscriptions (
    actor_id TEXT NOT NULL,
    peer_id TEXT NOT NULL,
    subscription_id TEXT NOT NULL,
    data TEXT NOT NULL,
    PRIMARY KEY (actor_id, peer_id, subscription_id)
);

CREATE TABLE IF NOT EXISTS diffs (
    actor_id TEXT NOT NULL,
    subscription_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    blob TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    PRIMARY KEY (actor_id, subscription_id, sequence)
);

CREATE TABLE IF NOT EXISTS attributes (
    actor_id TEXT NOT NULL,
    bucket TEXT NOT NULL,
    name TEXT NOT NULL,
    data TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (actor_id, bucket, name)
);
"#;

fn storage_err(context: &str, err: rusqlite::Error) -> ActingWebError {
    ActingWebError::Storage(format!("{context}: {err}"))
}

fn json_err(context: &str, err: serde_json::Error) -> ActingWebError {
    ActingWebError::Storage(format!("{context}: {err}"))
}

/// Durable [`StorageAdapter`] over a single SQLite file (or `:memory:`).
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| storage_err("opening database", e))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| storage_err("opening in-memory database", e))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| storage_err("running schema migration", e))?;
        debug!("sqlite storage schema ready");
        Ok(SqliteStorage {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await
        .map_err(|e| ActingWebError::Storage(format!("blocking task panicked: {e}")))?
    }
}

#[async_trait]
impl StorageAdapter for SqliteStorage {
    async fn get_trust(&self, actor_id: &str, peer_id: &str) -> Result<Option<Trust>> {
        let actor_id = actor_id.to_string();
        let peer_id = peer_id.to_string();
        self.with_conn(move |conn| {
            let row: Option<String> = conn
                .query_row(
                    "SELECT data FROM trusts WHERE actor_id = ?1 AND peer_id = ?2",
                    params![actor_id, peer_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| storage_err("get_trust", e))?;
            row.map(|json| serde_json::from_str(&json).map_err(|e| json_err("get_trust", e)))
                .transpose()
        })
        .await
    }

    async fn list_trusts(&self, actor_id: &str) -> Result<Vec<Trust>> {
        let actor_id = actor_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT data FROM trusts WHERE actor_id = ?1")
                .map_err(|e| storage_err("list_trusts", e))?;
            let rows = stmt
                .query_map(params![actor_id], |row| row.get::<_, String>(0))
                .map_err(|e| storage_err("list_trusts", e))?;
            let mut out = Vec::new();
            for row in rows {
                let json = row.map_err(|e| storage_err("list_trusts", e))?;
                out.push(serde_json::from_str(&json).map_err(|e| json_err("list_trusts", e))?);
            }
            Ok(out)
        })
        .await
    }

    async fn put_trust(&self, trust: Trust) -> Result<()> {
        let json = serde_json::to_string(&trust).map_err(|e| json_err("put_trust", e))?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO trusts (actor_id, peer_id, data) VALUES (?1, ?2, ?3)
                 ON CONFLICT(actor_id, peer_id) DO UPDATE SET data = excluded.data",
                params![trust.actor_id, trust.peer_id, json],
            )
            .map_err(|e| storage_err("put_trust", e))?;
            Ok(())
        })
        .await
    }

    async fn delete_trust(&self, actor_id: &str, peer_id: &str) -> Result<()> {
        let actor_id = actor_id.to_string();
        let peer_id = peer_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM trusts WHERE actor_id = ?1 AND peer_id = ?2",
                params![actor_id, peer_id],
            )
            .map_err(|e| storage_err("delete_trust", e))?;
            Ok(())
        })
        .await
    }

    async fn get_subscription(
        &self,
        actor_id: &str,
        peer_id: &str,
        subscription_id: &str,
    ) -> Result<Option<Subscription>> {
        let actor_id = actor_id.to_string();
        let peer_id = peer_id.to_string();
        let subscription_id = subscription_id.to_string();
        self.with_conn(move |conn| {
            let row: Option<String> = conn
                .query_row(
                    "SELECT data FROM subscriptions WHERE actor_id = ?1 AND peer_id = ?2 AND subscription_id = ?3",
                    params![actor_id, peer_id, subscription_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| storage_err("get_subscription", e))?;
            row.map(|json| serde_json::from_str(&json).map_err(|e| json_err("get_subscription", e)))
                .transpose()
        })
        .await
    }

    async fn list_subscriptions(&self, actor_id: &str) -> Result<Vec<Subscription>> {
        let actor_id = actor_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT data FROM subscriptions WHERE actor_id = ?1")
                .map_err(|e| storage_err("list_subscriptions", e))?;
            let rows = stmt
                .query_map(params![actor_id], |row| row.get::<_, String>(0))
                .map_err(|e| storage_err("list_subscriptions", e))?;
            let mut out = Vec::new();
            for row in rows {
                let json = row.map_err(|e| storage_err("list_subscriptions", e))?;
                out.push(serde_json::from_str(&json).map_err(|e| json_err("list_subscriptions", e))?);
            }
            Ok(out)
        })
        .await
    }

    async fn list_subscriptions_for_peer(
        &self,
        actor_id: &str,
        peer_id: &str,
    ) -> Result<Vec<Subscription>> {
        let actor_id = actor_id.to_string();
        let peer_id = peer_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT data FROM subscriptions WHERE actor_id = ?1 AND peer_id = ?2")
                .map_err(|e| storage_err("list_subscriptions_for_peer", e))?;
            let rows = stmt
                .query_map(params![actor_id, peer_id], |row| row.get::<_, String>(0))
                .map_err(|e| storage_err("list_subscriptions_for_peer", e))?;
            let mut out = Vec::new();
            for row in rows {
                let json = row.map_err(|e| storage_err("list_subscriptions_for_peer", e))?;
                out.push(serde_json::from_str(&json).map_err(|e| json_err("list_subscriptions_for_peer", e))?);
            }
            Ok(out)
        })
        .await
    }

    async fn put_subscription(&self, subscription: Subscription) -> Result<()> {
        let json = serde_json::to_string(&subscription).map_err(|e| json_err("put_subscription", e))?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO subscriptions (actor_id, peer_id, subscription_id, data) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(actor_id, peer_id, subscription_id) DO UPDATE SET data = excluded.data",
                params![
                    subscription.actor_id,
                    subscription.peer_id,
                    subscription.subscription_id,
                    json
                ],
            )
            .map_err(|e| storage_err("put_subscription", e))?;
            Ok(())
        })
        .await
    }

    async fn delete_subscription(
        &self,
        actor_id: &str,
        peer_id: &str,
        subscription_id: &str,
    ) -> Result<()> {
        let actor_id = actor_id.to_string();
        let peer_id = peer_id.to_string();
        let subscription_id = subscription_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction().map_err(|e| storage_err("delete_subscription", e))?;
            tx.execute(
                "DELETE FROM subscriptions WHERE actor_id = ?1 AND peer_id = ?2 AND subscription_id = ?3",
                params![actor_id, peer_id, subscription_id],
            )
            .map_err(|e| storage_err("delete_subscription", e))?;
            tx.execute(
                "DELETE FROM diffs WHERE actor_id = ?1 AND subscription_id = ?2",
                params![actor_id, subscription_id],
            )
            .map_err(|e| storage_err("delete_subscription", e))?;
            tx.commit().map_err(|e| storage_err("delete_subscription", e))?;
            Ok(())
        })
        .await
    }

    async fn increment_sequence(
        &self,
        actor_id: &str,
        peer_id: &str,
        subscription_id: &str,
    ) -> Result<u64> {
        let actor_id = actor_id.to_string();
        let peer_id = peer_id.to_string();
        let subscription_id = subscription_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction().map_err(|e| storage_err("increment_sequence", e))?;
            let json: String = tx
                .query_row(
                    "SELECT data FROM subscriptions WHERE actor_id = ?1 AND peer_id = ?2 AND subscription_id = ?3",
                    params![actor_id, peer_id, subscription_id],
                    |row| row.get(0),
                )
                .map_err(|e| storage_err("increment_sequence: no such subscription", e))?;
            let mut sub: Subscription = serde_json::from_str(&json).map_err(|e| json_err("increment_sequence", e))?;
            sub.sequence += 1;
            let updated = serde_json::to_string(&sub).map_err(|e| json_err("increment_sequence", e))?;
            tx.execute(
                "UPDATE subscriptions SET data = ?1 WHERE actor_id = ?2 AND peer_id = ?3 AND subscription_id = ?4",
                params![updated, actor_id, peer_id, subscription_id],
            )
            .map_err(|e| storage_err("increment_sequence", e))?;
            tx.commit().map_err(|e| storage_err("increment_sequence", e))?;
            Ok(sub.sequence)
        })
        .await
    }

    async fn decrement_sequence(
        &self,
        actor_id: &str,
        peer_id: &str,
        subscription_id: &str,
    ) -> Result<()> {
        let actor_id = actor_id.to_string();
        let peer_id = peer_id.to_string();
        let subscription_id = subscription_id.to_string();
        self.with_conn(move |conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT data FROM subscriptions WHERE actor_id = ?1 AND peer_id = ?2 AND subscription_id = ?3",
                    params![actor_id, peer_id, subscription_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| storage_err("decrement_sequence", e))?;
            let Some(json) = json else { return Ok(()) };
            let mut sub: Subscription = serde_json::from_str(&json).map_err(|e| json_err("decrement_sequence", e))?;
            sub.sequence = sub.sequence.saturating_sub(1);
            let updated = serde_json::to_string(&sub).map_err(|e| json_err("decrement_sequence", e))?;
            conn.execute(
                "UPDATE subscriptions SET data = ?1 WHERE actor_id = ?2 AND peer_id = ?3 AND subscription_id = ?4",
                params![updated, actor_id, peer_id, subscription_id],
            )
            .map_err(|e| storage_err("decrement_sequence", e))?;
            Ok(())
        })
        .await
    }

    async fn put_diff(&self, diff: Diff) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO diffs (actor_id, subscription_id, sequence, blob, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(actor_id, subscription_id, sequence) DO UPDATE SET blob = excluded.blob, timestamp = excluded.timestamp",
                params![diff.actor_id, diff.subscription_id, diff.sequence as i64, diff.blob, diff.timestamp],
            )
            .map_err(|e| storage_err("put_diff", e))?;
            Ok(())
        })
        .await
    }

    async fn list_diffs_after(
        &self,
        actor_id: &str,
        subscription_id: &str,
        after_sequence: u64,
    ) -> Result<Vec<Diff>> {
        let actor_id = actor_id.to_string();
        let subscription_id = subscription_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT sequence, blob, timestamp FROM diffs
                     WHERE actor_id = ?1 AND subscription_id = ?2 AND sequence > ?3
                     ORDER BY sequence ASC",
                )
                .map_err(|e| storage_err("list_diffs_after", e))?;
            let rows = stmt
                .query_map(
                    params![actor_id, subscription_id, after_sequence as i64],
                    |row| {
                        Ok(Diff {
                            actor_id: actor_id.clone(),
                            subscription_id: subscription_id.clone(),
                            sequence: row.get::<_, i64>(0)? as u64,
                            blob: row.get(1)?,
                            timestamp: row.get(2)?,
                        })
                    },
                )
                .map_err(|e| storage_err("list_diffs_after", e))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(|e| storage_err("list_diffs_after", e))?);
            }
            Ok(out)
        })
        .await
    }

    async fn clear_diffs(&self, actor_id: &str, subscription_id: &str) -> Result<()> {
        let actor_id = actor_id.to_string();
        let subscription_id = subscription_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM diffs WHERE actor_id = ?1 AND subscription_id = ?2",
                params![actor_id, subscription_id],
            )
            .map_err(|e| storage_err("clear_diffs", e))?;
            Ok(())
        })
        .await
    }

    async fn get_attr(&self, actor_id: &str, bucket: &str, name: &str) -> Result<Option<Attribute>> {
        let actor_id = actor_id.to_string();
        let bucket = bucket.to_string();
        let name = name.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT data, timestamp, version FROM attributes WHERE actor_id = ?1 AND bucket = ?2 AND name = ?3",
                params![actor_id, bucket, name],
                |row| {
                    let json: String = row.get(0)?;
                    Ok((json, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
                },
            )
            .optional()
            .map_err(|e| storage_err("get_attr", e))?
            .map(|(json, timestamp, version)| {
                Ok(Attribute {
                    data: serde_json::from_str(&json).map_err(|e| json_err("get_attr", e))?,
                    timestamp,
                    version: version as u64,
                })
            })
            .transpose()
        })
        .await
    }

    async fn list_bucket(&self, actor_id: &str, bucket: &str) -> Result<Vec<(String, Attribute)>> {
        let actor_id = actor_id.to_string();
        let bucket = bucket.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT name, data, timestamp, version FROM attributes WHERE actor_id = ?1 AND bucket = ?2",
                )
                .map_err(|e| storage_err("list_bucket", e))?;
            let rows = stmt
                .query_map(params![actor_id, bucket], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })
                .map_err(|e| storage_err("list_bucket", e))?;
            let mut out = Vec::new();
            for row in rows {
                let (name, json, timestamp, version) = row.map_err(|e| storage_err("list_bucket", e))?;
                out.push((
                    name,
                    Attribute {
                        data: serde_json::from_str(&json).map_err(|e| json_err("list_bucket", e))?,
                        timestamp,
                        version: version as u64,
                    },
                ));
            }
            Ok(out)
        })
        .await
    }

    async fn set_attr(
        &self,
        actor_id: &str,
        bucket: &str,
        name: &str,
        data: serde_json::Value,
    ) -> Result<()> {
        let actor_id = actor_id.to_string();
        let bucket = bucket.to_string();
        let name = name.to_string();
        self.with_conn(move |conn| {
            let json = serde_json::to_string(&data).map_err(|e| json_err("set_attr", e))?;
            let timestamp = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO attributes (actor_id, bucket, name, data, timestamp, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1)
                 ON CONFLICT(actor_id, bucket, name)
                 DO UPDATE SET data = excluded.data, timestamp = excluded.timestamp, version = attributes.version + 1",
                params![actor_id, bucket, name, json, timestamp],
            )
            .map_err(|e| storage_err("set_attr", e))?;
            Ok(())
        })
        .await
    }

    async fn set_attr_if_version(
        &self,
        actor_id: &str,
        bucket: &str,
        name: &str,
        data: serde_json::Value,
        expected_version: u64,
    ) -> Result<WriteOutcome> {
        let actor_id = actor_id.to_string();
        let bucket = bucket.to_string();
        let name = name.to_string();
        self.with_conn(move |conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| storage_err("set_attr_if_version", e))?;
            let current: Option<i64> = tx
                .query_row(
                    "SELECT version FROM attributes WHERE actor_id = ?1 AND bucket = ?2 AND name = ?3",
                    params![actor_id, bucket, name],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| storage_err("set_attr_if_version", e))?;
            let current_version = current.unwrap_or(0) as u64;
            if current_version != expected_version {
                return Ok(WriteOutcome::Conflict);
            }
            let json = serde_json::to_string(&data).map_err(|e| json_err("set_attr_if_version", e))?;
            let timestamp = Utc::now().to_rfc3339();
            tx.execute(
                "INSERT INTO attributes (actor_id, bucket, name, data, timestamp, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1)
                 ON CONFLICT(actor_id, bucket, name)
                 DO UPDATE SET data = excluded.data, timestamp = excluded.timestamp, version = attributes.version + 1",
                params![actor_id, bucket, name, json, timestamp],
            )
            .map_err(|e| storage_err("set_attr_if_version", e))?;
            tx.commit().map_err(|e| storage_err("set_attr_if_version", e))?;
            Ok(WriteOutcome::Ok)
        })
        .await
    }

    async fn delete_attr(&self, actor_id: &str, bucket: &str, name: &str) -> Result<()> {
        let actor_id = actor_id.to_string();
        let bucket = bucket.to_string();
        let name = name.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM attributes WHERE actor_id = ?1 AND bucket = ?2 AND name = ?3",
                params![actor_id, bucket, name],
            )
            .map_err(|e| storage_err("delete_attr", e))?;
            Ok(())
        })
        .await
    }

    async fn delete_bucket(&self, actor_id: &str, bucket: &str) -> Result<()> {
        let actor_id = actor_id.to_string();
        let bucket = bucket.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM attributes WHERE actor_id = ?1 AND bucket = ?2",
                params![actor_id, bucket],
            )
            .map_err(|e| storage_err("delete_bucket", e))?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actingweb_core::types::{EstablishedVia, Granularity};

    fn trust(actor: &str, peer: &str) -> Trust {
        Trust {
            actor_id: actor.into(),
            peer_id: peer.into(),
            base_uri: "https://peer.example".into(),
            secret: "s".into(),
            peer_type: "urn:actingweb:example:app".into(),
            relationship: "friend".into(),
            approved: true,
            peer_approved: false,
            verified: false,
            verification_token: None,
            established_via: EstablishedVia::Trust,
            client: Default::default(),
            desc: String::new(),
        }
    }

    #[tokio::test]
    async fn trust_roundtrip_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.sqlite3");

        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage.put_trust(trust("a1", "p1")).await.unwrap();
        }

        let storage = SqliteStorage::open(&path).unwrap();
        let got = storage.get_trust("a1", "p1").await.unwrap();
        assert!(got.is_some());
        assert_eq!(got.unwrap().peer_id, "p1");
    }

    #[tokio::test]
    async fn sequence_increment_persists_and_rolls_back() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .put_subscription(Subscription {
                actor_id: "a1".into(),
                peer_id: "p1".into(),
                subscription_id: "sub1".into(),
                is_callback: false,
                target: "properties".into(),
                subtarget: None,
                resource: None,
                granularity: Granularity::High,
                sequence: 0,
            })
            .await
            .unwrap();

        let seq = storage.increment_sequence("a1", "p1", "sub1").await.unwrap();
        assert_eq!(seq, 1);
        storage.decrement_sequence("a1", "p1", "sub1").await.unwrap();
        let sub = storage.get_subscription("a1", "p1", "sub1").await.unwrap().unwrap();
        assert_eq!(sub.sequence, 0);
    }

    #[tokio::test]
    async fn conditional_write_detects_conflict() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .set_attr("a1", "bucket", "name", serde_json::json!({"v": 1}))
            .await
            .unwrap();
        let outcome = storage
            .set_attr_if_version("a1", "bucket", "name", serde_json::json!({"v": 2}), 0)
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Conflict);
        let outcome = storage
            .set_attr_if_version("a1", "bucket", "name", serde_json::json!({"v": 2}), 1)
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Ok);
    }

    #[tokio::test]
    async fn delete_subscription_clears_its_diffs() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .put_subscription(Subscription {
                actor_id: "a1".into(),
                peer_id: "p1".into(),
                subscription_id: "sub1".into(),
                is_callback: false,
                target: "properties".into(),
                subtarget: None,
                resource: None,
                granularity: Granularity::High,
                sequence: 1,
            })
            .await
            .unwrap();
        storage
            .put_diff(Diff {
                actor_id: "a1".into(),
                subscription_id: "sub1".into(),
                sequence: 1,
                blob: "{}".into(),
                timestamp: Utc::now().to_rfc3339(),
            })
            .await
            .unwrap();

        storage.delete_subscription("a1", "p1", "sub1").await.unwrap();
        let diffs = storage.list_diffs_after("a1", "sub1", 0).await.unwrap();
        assert!(diffs.is_empty());
    }
}
