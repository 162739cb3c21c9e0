use crate::domain::ports::{Store, StoreError};
use log::info;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use stevedore_shared::{Container, Node};

/// SQLite-backed store. Each entity kind lives in its own `id -> JSON` table,
/// so the row payloads carry exactly the wire encoding of the entities.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if missing) the database at `path`; `:memory:` gives
    /// an ephemeral store for tests. The pool is pinned to one connection:
    /// that serializes writers, and a pooled `:memory:` database would
    /// otherwise hand every connection its own empty database.
    pub async fn connect(path: &str) -> Result<Self, StoreError> {
        info!("Opening state database at {path}");
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = SqliteStore { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS containers (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

impl Store for SqliteStore {
    async fn save_container(&self, container: &Container) -> Result<(), StoreError> {
        let data = serde_json::to_string(container)?;
        sqlx::query(
            r#"
            INSERT INTO containers (id, data) VALUES (?, ?)
            ON CONFLICT(id) DO UPDATE SET data = excluded.data
            "#,
        )
        .bind(&container.id)
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_container(&self, id: &str) -> Result<Container, StoreError> {
        let row = sqlx::query("SELECT data FROM containers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;

        let data: String = row.get("data");
        Ok(serde_json::from_str(&data)?)
    }

    async fn list_containers(&self) -> Result<Vec<Container>, StoreError> {
        let rows = sqlx::query("SELECT data FROM containers ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let data: String = row.get("data");
                serde_json::from_str(&data).map_err(StoreError::from)
            })
            .collect()
    }

    async fn delete_container(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM containers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_node(&self, node: &Node) -> Result<(), StoreError> {
        let data = serde_json::to_string(node)?;
        sqlx::query(
            r#"
            INSERT INTO nodes (id, data) VALUES (?, ?)
            ON CONFLICT(id) DO UPDATE SET data = excluded.data
            "#,
        )
        .bind(&node.id)
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_node(&self, id: &str) -> Result<Node, StoreError> {
        let row = sqlx::query("SELECT data FROM nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;

        let data: String = row.get("data");
        Ok(serde_json::from_str(&data)?)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        let rows = sqlx::query("SELECT data FROM nodes ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let data: String = row.get("data");
                serde_json::from_str(&data).map_err(StoreError::from)
            })
            .collect()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
