//! Sync database: one sqlite file per sync pair
//!
//! The `node` table is the source of truth for "what was last in sync".
//! Reads go through [`DbCache`]; during a pass the executor is the only
//! writer and mirrors every committed row into the cache.

use crate::shared::{DbNodeId, NodeId, NodeKind, ReplicaSide, SyncError, SyncResult};
use sea_orm::ActiveValue::{NotSet, Set};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectOptions, ConnectionTrait, Database as SeaDatabase,
    DatabaseBackend, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Statement,
    TransactionTrait,
};
use sea_orm_migration::MigratorTrait;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub mod cache;
pub mod entities;
pub mod migration;

pub use cache::{DbCache, DbNode};

/// Per-kind node lists persisted in `sync_node`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum SyncNodeKind {
    Undecided,
    Blacklist,
    Whitelist,
    TmpBlacklist,
}

impl SyncNodeKind {
    fn as_i32(self) -> i32 {
        match self {
            Self::Undecided => 0,
            Self::Blacklist => 1,
            Self::Whitelist => 2,
            Self::TmpBlacklist => 3,
        }
    }
}

/// Result of inserting a node row.
#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(DbNodeId),
    /// A unique constraint rejected the row (stale id from an undetected
    /// delete-then-create).
    UniqueViolation,
}

/// Handle on the sync-pair database.
pub struct SyncDb {
    conn: DatabaseConnection,
}

impl SyncDb {
    /// Open (or create) the database file and run pending migrations.
    pub async fn open(path: &Path) -> SyncResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let db = Self::connect(&url).await?;
        info!(path = %path.display(), "Sync database ready");
        Ok(db)
    }

    /// Fresh in-memory database, used by tests.
    pub async fn in_memory() -> SyncResult<Self> {
        Self::connect("sqlite::memory:").await
    }

    async fn connect(url: &str) -> SyncResult<Self> {
        let mut opt = ConnectOptions::new(url.to_string());
        // A single connection: the executor is the sole writer during a pass
        // and the PRAGMAs below are per-connection.
        opt.max_connections(1)
            .connect_timeout(Duration::from_secs(8))
            .sqlx_logging(false);

        let conn = SeaDatabase::connect(opt).await.map_err(SyncError::from)?;
        for pragma in [
            "PRAGMA journal_mode=WAL",
            "PRAGMA synchronous=NORMAL",
            "PRAGMA foreign_keys=ON",
            "PRAGMA temp_store=MEMORY",
        ] {
            conn.execute(Statement::from_string(DatabaseBackend::Sqlite, pragma))
                .await
                .map_err(SyncError::from)?;
        }
        migration::Migrator::up(&conn, None)
            .await
            .map_err(SyncError::from)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &DatabaseConnection {
        &self.conn
    }

    /// Load every node row into a fresh cache. The root row is created on
    /// first use from the two replica root ids.
    pub async fn load_cache(
        &self,
        local_root_id: &NodeId,
        remote_root_id: &NodeId,
    ) -> SyncResult<DbCache> {
        let rows = entities::node::Entity::find()
            .all(&self.conn)
            .await
            .map_err(SyncError::from)?;

        let mut nodes: Vec<DbNode> = rows.into_iter().map(model_to_node).collect();
        if !nodes.iter().any(|n| n.is_root()) {
            let root = DbNode {
                db_id: 0,
                parent_db_id: None,
                local_id: Some(local_root_id.clone()),
                remote_id: Some(remote_root_id.clone()),
                local_name: String::new(),
                remote_name: String::new(),
                kind: NodeKind::Directory,
                size: 0,
                created_at_local: None,
                created_at_remote: None,
                last_mod_local: None,
                last_mod_remote: None,
                checksum: None,
                syncing: false,
            };
            match self.insert_node(&root).await? {
                InsertOutcome::Inserted(db_id) => nodes.push(DbNode { db_id, ..root }),
                InsertOutcome::UniqueViolation => return Err(SyncError::db()),
            }
        }
        DbCache::from_nodes(nodes).ok_or_else(SyncError::data)
    }

    /// Insert a row; `node.db_id` is ignored and the assigned id returned.
    pub async fn insert_node(&self, node: &DbNode) -> SyncResult<InsertOutcome> {
        let model = entities::node::ActiveModel {
            db_id: NotSet,
            parent_db_id: Set(node.parent_db_id),
            local_id: Set(node.local_id.clone()),
            remote_id: Set(node.remote_id.clone()),
            local_name: Set(node.local_name.clone()),
            remote_name: Set(node.remote_name.clone()),
            kind: Set(node.kind.as_i32()),
            size: Set(node.size),
            created_at_local: Set(node.created_at_local),
            created_at_remote: Set(node.created_at_remote),
            last_mod_local: Set(node.last_mod_local),
            last_mod_remote: Set(node.last_mod_remote),
            checksum: Set(node.checksum.clone()),
            syncing: Set(node.syncing),
        };
        match model.insert(&self.conn).await {
            Ok(inserted) => Ok(InsertOutcome::Inserted(inserted.db_id)),
            Err(err) if is_unique_violation(&err) => Ok(InsertOutcome::UniqueViolation),
            Err(err) => Err(err.into()),
        }
    }

    /// Rewrite a full row.
    pub async fn update_node(&self, node: &DbNode) -> SyncResult {
        let model = entities::node::ActiveModel {
            db_id: Set(node.db_id),
            parent_db_id: Set(node.parent_db_id),
            local_id: Set(node.local_id.clone()),
            remote_id: Set(node.remote_id.clone()),
            local_name: Set(node.local_name.clone()),
            remote_name: Set(node.remote_name.clone()),
            kind: Set(node.kind.as_i32()),
            size: Set(node.size),
            created_at_local: Set(node.created_at_local),
            created_at_remote: Set(node.created_at_remote),
            last_mod_local: Set(node.last_mod_local),
            last_mod_remote: Set(node.last_mod_remote),
            checksum: Set(node.checksum.clone()),
            syncing: Set(node.syncing),
        };
        model.update(&self.conn).await.map_err(SyncError::from)?;
        Ok(())
    }

    /// Delete a row; children go with it through the cascading foreign key.
    pub async fn delete_node(&self, db_id: DbNodeId) -> SyncResult {
        entities::node::Entity::delete_by_id(db_id)
            .exec(&self.conn)
            .await
            .map_err(SyncError::from)?;
        Ok(())
    }

    /// Node ids recorded under the given list kind.
    pub async fn sync_nodes(&self, kind: SyncNodeKind) -> SyncResult<HashSet<(ReplicaSide, NodeId)>> {
        let rows = entities::sync_node::Entity::find()
            .filter(entities::sync_node::Column::Kind.eq(kind.as_i32()))
            .all(&self.conn)
            .await
            .map_err(SyncError::from)?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let side = if row.side == 0 {
                    ReplicaSide::Local
                } else {
                    ReplicaSide::Remote
                };
                (side, row.node_id)
            })
            .collect())
    }

    /// Replace the whole list of one kind.
    pub async fn set_sync_nodes(
        &self,
        kind: SyncNodeKind,
        nodes: &HashSet<(ReplicaSide, NodeId)>,
    ) -> SyncResult {
        let txn = self.conn.begin().await.map_err(SyncError::from)?;
        entities::sync_node::Entity::delete_many()
            .filter(entities::sync_node::Column::Kind.eq(kind.as_i32()))
            .exec(&txn)
            .await
            .map_err(SyncError::from)?;
        for (side, node_id) in nodes {
            let model = entities::sync_node::ActiveModel {
                id: NotSet,
                node_id: Set(node_id.clone()),
                side: Set(match side {
                    ReplicaSide::Local => 0,
                    ReplicaSide::Remote => 1,
                }),
                kind: Set(kind.as_i32()),
            };
            model.insert(&txn).await.map_err(SyncError::from)?;
        }
        txn.commit().await.map_err(SyncError::from)?;
        Ok(())
    }

    pub async fn app_state(&self, key: &str) -> SyncResult<Option<String>> {
        let row = entities::app_state::Entity::find_by_id(key.to_string())
            .one(&self.conn)
            .await
            .map_err(SyncError::from)?;
        Ok(row.map(|row| row.value))
    }

    pub async fn set_app_state(&self, key: &str, value: &str) -> SyncResult {
        let existing = entities::app_state::Entity::find_by_id(key.to_string())
            .one(&self.conn)
            .await
            .map_err(SyncError::from)?;
        match existing {
            Some(row) => {
                let mut model: entities::app_state::ActiveModel = row.into();
                model.value = Set(value.to_string());
                model.update(&self.conn).await.map_err(SyncError::from)?;
            }
            None => {
                let model = entities::app_state::ActiveModel {
                    key: Set(key.to_string()),
                    value: Set(value.to_string()),
                };
                model.insert(&self.conn).await.map_err(SyncError::from)?;
            }
        }
        Ok(())
    }

    /// Paths the user excluded from synchronization.
    pub async fn selective_sync_exclusions(&self) -> SyncResult<Vec<String>> {
        let rows = entities::selective_sync::Entity::find()
            .filter(entities::selective_sync::Column::Excluded.eq(true))
            .all(&self.conn)
            .await
            .map_err(SyncError::from)?;
        Ok(rows.into_iter().map(|row| row.path).collect())
    }

    pub async fn set_selective_sync_exclusions(&self, paths: &[String]) -> SyncResult {
        let txn = self.conn.begin().await.map_err(SyncError::from)?;
        entities::selective_sync::Entity::delete_many()
            .exec(&txn)
            .await
            .map_err(SyncError::from)?;
        for path in paths {
            let model = entities::selective_sync::ActiveModel {
                id: NotSet,
                path: Set(path.clone()),
                excluded: Set(true),
            };
            model.insert(&txn).await.map_err(SyncError::from)?;
        }
        txn.commit().await.map_err(SyncError::from)?;
        Ok(())
    }
}

fn model_to_node(model: entities::node::Model) -> DbNode {
    DbNode {
        db_id: model.db_id,
        parent_db_id: model.parent_db_id,
        local_id: model.local_id,
        remote_id: model.remote_id,
        local_name: model.local_name,
        remote_name: model.remote_name,
        kind: NodeKind::from_i32(model.kind),
        size: model.size,
        created_at_local: model.created_at_local,
        created_at_remote: model.created_at_remote,
        last_mod_local: model.last_mod_local,
        last_mod_remote: model.last_mod_remote,
        checksum: model.checksum,
        syncing: model.syncing,
    }
}

fn is_unique_violation(err: &DbErr) -> bool {
    err.to_string().to_ascii_uppercase().contains("UNIQUE")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn child(parent: DbNodeId, name: &str, local: &str, remote: &str) -> DbNode {
        DbNode {
            db_id: 0,
            parent_db_id: Some(parent),
            local_id: Some(local.into()),
            remote_id: Some(remote.into()),
            local_name: name.into(),
            remote_name: name.into(),
            kind: NodeKind::File,
            size: 4,
            created_at_local: Some(1),
            created_at_remote: Some(1),
            last_mod_local: Some(2),
            last_mod_remote: Some(2),
            checksum: None,
            syncing: false,
        }
    }

    #[tokio::test]
    async fn load_cache_creates_root_once() {
        let db = SyncDb::in_memory().await.unwrap();
        let cache = db
            .load_cache(&"lroot".to_string(), &"rroot".to_string())
            .await
            .unwrap();
        assert_eq!(cache.len(), 1);

        let again = db
            .load_cache(&"lroot".to_string(), &"rroot".to_string())
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again.root_db_id(), cache.root_db_id());
    }

    #[tokio::test]
    async fn insert_detects_duplicate_replica_id() {
        let db = SyncDb::in_memory().await.unwrap();
        let cache = db
            .load_cache(&"lroot".to_string(), &"rroot".to_string())
            .await
            .unwrap();
        let root = cache.root_db_id();

        let outcome = db.insert_node(&child(root, "a.txt", "l1", "r1")).await.unwrap();
        let InsertOutcome::Inserted(db_id) = outcome else {
            panic!("first insert must succeed");
        };
        assert!(db_id > 0);

        let outcome = db.insert_node(&child(root, "b.txt", "l1", "r2")).await.unwrap();
        assert_eq!(outcome, InsertOutcome::UniqueViolation);
    }

    #[tokio::test]
    async fn delete_cascades_to_children() {
        let db = SyncDb::in_memory().await.unwrap();
        let cache = db
            .load_cache(&"lroot".to_string(), &"rroot".to_string())
            .await
            .unwrap();
        let root = cache.root_db_id();

        let mut dir = child(root, "docs", "l-dir", "r-dir");
        dir.kind = NodeKind::Directory;
        let InsertOutcome::Inserted(dir_id) = db.insert_node(&dir).await.unwrap() else {
            panic!("insert failed");
        };
        db.insert_node(&child(dir_id, "a.txt", "l1", "r1")).await.unwrap();

        db.delete_node(dir_id).await.unwrap();
        let cache = db
            .load_cache(&"lroot".to_string(), &"rroot".to_string())
            .await
            .unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn sync_node_lists_round_trip() {
        let db = SyncDb::in_memory().await.unwrap();
        let mut set = HashSet::new();
        set.insert((ReplicaSide::Local, "l1".to_string()));
        set.insert((ReplicaSide::Remote, "r9".to_string()));

        db.set_sync_nodes(SyncNodeKind::TmpBlacklist, &set).await.unwrap();
        assert_eq!(db.sync_nodes(SyncNodeKind::TmpBlacklist).await.unwrap(), set);
        assert!(db.sync_nodes(SyncNodeKind::Whitelist).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn app_state_upserts() {
        let db = SyncDb::in_memory().await.unwrap();
        assert_eq!(db.app_state("pass").await.unwrap(), None);
        db.set_app_state("pass", "complete").await.unwrap();
        db.set_app_state("pass", "restart").await.unwrap();
        assert_eq!(db.app_state("pass").await.unwrap(), Some("restart".into()));
    }
}
