use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::{
    domain::{ContentRef, IdRef},
    error::{CoreError, CoreResult},
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use tracing::debug;

use crate::{ObjectStore, StoredObject};

/// Object store persisted in a SQLite database.
#[derive(Clone)]
pub struct SqliteObjectStore {
    pool: Pool<Sqlite>,
}

impl SqliteObjectStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Each connection to an in-memory database is a separate database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open object store at '{database_url}'"))?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS objects (
                hash       TEXT PRIMARY KEY,
                type_name  TEXT NOT NULL,
                identity   TEXT,
                body       TEXT NOT NULL,
                stored_at  TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure objects table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS identities (
                id_hash      TEXT PRIMARY KEY,
                latest_hash  TEXT NOT NULL,
                updated_at   TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure identities table exists")?;

        Ok(())
    }
}

fn io_error(err: sqlx::Error) -> CoreError {
    CoreError::transient(format!("sqlite: {err}"))
}

fn object_from_row(row: &SqliteRow) -> CoreResult<StoredObject> {
    let body: String = row.try_get("body").map_err(io_error)?;
    Ok(StoredObject {
        type_name: row.try_get("type_name").map_err(io_error)?,
        identity: row.try_get("identity").map_err(io_error)?,
        body: serde_json::from_str(&body)?,
    })
}

#[async_trait]
impl ObjectStore for SqliteObjectStore {
    async fn put(&self, object: StoredObject) -> CoreResult<ContentRef> {
        let reference = object.content_ref();
        let mut tx = self.pool.begin().await.map_err(io_error)?;

        sqlx::query(
            "INSERT INTO objects (hash, type_name, identity, body) VALUES (?, ?, ?, ?)
             ON CONFLICT(hash) DO NOTHING",
        )
        .bind(reference.as_str())
        .bind(object.type_name.as_str())
        .bind(object.identity.as_deref())
        .bind(object.body.to_string())
        .execute(&mut *tx)
        .await
        .map_err(io_error)?;

        if let Some(id_ref) = object.id_ref() {
            sqlx::query(
                "INSERT INTO identities (id_hash, latest_hash) VALUES (?, ?)
                 ON CONFLICT(id_hash) DO UPDATE SET latest_hash=excluded.latest_hash, updated_at=CURRENT_TIMESTAMP",
            )
            .bind(id_ref.as_str())
            .bind(reference.as_str())
            .execute(&mut *tx)
            .await
            .map_err(io_error)?;
        }

        tx.commit().await.map_err(io_error)?;
        debug!(type_name = %object.type_name, reference = %reference, "store: object written");
        Ok(reference)
    }

    async fn put_if_latest(
        &self,
        object: StoredObject,
        expected: Option<&ContentRef>,
    ) -> CoreResult<Option<ContentRef>> {
        let reference = object.content_ref();
        let id_ref = object.id_ref().ok_or_else(|| {
            CoreError::invalid_state(format!("conditional put of {} without identity", object.type_name))
        })?;
        let mut tx = self.pool.begin().await.map_err(io_error)?;

        // Writes first so the transaction takes the write lock up front.
        let moved = match expected {
            None => sqlx::query(
                "INSERT INTO identities (id_hash, latest_hash) VALUES (?, ?)
                 ON CONFLICT(id_hash) DO NOTHING",
            )
            .bind(id_ref.as_str())
            .bind(reference.as_str())
            .execute(&mut *tx)
            .await
            .map_err(io_error)?,
            Some(expected) => sqlx::query(
                "UPDATE identities SET latest_hash = ?, updated_at = CURRENT_TIMESTAMP
                 WHERE id_hash = ? AND latest_hash = ?",
            )
            .bind(reference.as_str())
            .bind(id_ref.as_str())
            .bind(expected.as_str())
            .execute(&mut *tx)
            .await
            .map_err(io_error)?,
        };
        if moved.rows_affected() != 1 {
            tx.rollback().await.map_err(io_error)?;
            debug!(type_name = %object.type_name, "store: conditional write lost");
            return Ok(None);
        }

        sqlx::query(
            "INSERT INTO objects (hash, type_name, identity, body) VALUES (?, ?, ?, ?)
             ON CONFLICT(hash) DO NOTHING",
        )
        .bind(reference.as_str())
        .bind(object.type_name.as_str())
        .bind(object.identity.as_deref())
        .bind(object.body.to_string())
        .execute(&mut *tx)
        .await
        .map_err(io_error)?;

        tx.commit().await.map_err(io_error)?;
        debug!(type_name = %object.type_name, reference = %reference, "store: object written");
        Ok(Some(reference))
    }

    async fn get(&self, reference: &ContentRef) -> CoreResult<StoredObject> {
        let row = sqlx::query("SELECT type_name, identity, body FROM objects WHERE hash = ?")
            .bind(reference.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(io_error)?
            .ok_or_else(|| CoreError::not_found(format!("object {reference}")))?;
        object_from_row(&row)
    }

    async fn get_by_identity(&self, id: &IdRef) -> CoreResult<(StoredObject, ContentRef)> {
        let row = sqlx::query(
            "SELECT o.hash, o.type_name, o.identity, o.body
             FROM identities i
             INNER JOIN objects o ON o.hash = i.latest_hash
             WHERE i.id_hash = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(io_error)?
        .ok_or_else(|| CoreError::not_found(format!("identity {id}")))?;
        let hash: String = row.try_get("hash").map_err(io_error)?;
        Ok((object_from_row(&row)?, ContentRef(hash)))
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.contains(":memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/sqlite_tests.rs"]
mod tests;
