//! src/services/disk_store.rs
//!
//! DiskStore: durable object store backed by SQLite for metadata and local
//! disk for payloads. Payloads are content-addressed and sharded beneath
//! `base_path/{bucket}/{shard}/{shard}/{md5}`; a blob is never modified once
//! renamed into place, so swapping the metadata row is the only step that
//! makes a new version visible.

use crate::models::object::{Object, ObjectMeta, VersionMarker, etag_of};
use crate::services::object_store::{ObjectStore, StoreError, StoreResult, validate_key};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::{
    FromRow, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, info, instrument};
use uuid::Uuid;

const MIGRATION: &str = include_str!("../../migrations/0001_init.sql");
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;

#[derive(FromRow)]
struct ObjectRow {
    key: String,
    content_version: String,
    source_marker: String,
    etag: String,
    size_bytes: i64,
    content_type: Option<String>,
    last_modified: DateTime<Utc>,
}

impl From<ObjectRow> for ObjectMeta {
    fn from(row: ObjectRow) -> Self {
        ObjectMeta {
            key: row.key,
            content_version: VersionMarker::new(row.content_version),
            source_marker: VersionMarker::new(row.source_marker),
            etag: row.etag,
            size_bytes: row.size_bytes,
            content_type: row.content_type,
            last_modified: row.last_modified,
        }
    }
}

#[derive(Clone)]
pub struct DiskStore {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where payloads are stored.
    pub base_path: PathBuf,

    bucket: String,
}

impl DiskStore {
    /// Open (creating if needed) the metadata database and bucket directory,
    /// then apply the schema.
    pub async fn open(
        database_url: &str,
        base_path: impl Into<PathBuf>,
        bucket: &str,
    ) -> StoreResult<Self> {
        validate_bucket_name(bucket)?;
        let base_path = base_path.into();
        fs::create_dir_all(base_path.join(bucket))
            .await
            .map_err(io_err)?;

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(db_err)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(io_err)?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await
            .map_err(db_err)?;

        let store = Self {
            db: Arc::new(pool),
            base_path,
            bucket: bucket.to_string(),
        };
        store.migrate().await?;
        store.ensure_bucket().await?;
        info!(bucket, base_path = %store.base_path.display(), "disk store ready");
        Ok(store)
    }

    /// Apply the embedded schema. Every statement is idempotent.
    pub async fn migrate(&self) -> StoreResult<()> {
        let statements = MIGRATION
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        debug!("running {} migration statements", statements.len());
        for stmt in statements {
            sqlx::query(stmt)
                .execute(&*self.db)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    async fn ensure_bucket(&self) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO buckets (name, created_at) VALUES (?, ?)
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(&self.bucket)
        .bind(Utc::now())
        .execute(&*self.db)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Content-addressed payload path: base_path/bucket/{aa}/{bb}/{md5}.
    fn blob_path(&self, etag: &str) -> PathBuf {
        let mut path = self.base_path.join(&self.bucket);
        path.push(&etag[0..2]);
        path.push(&etag[2..4]);
        path.push(etag);
        path
    }

    /// Write a payload blob unless identical content is already present.
    ///
    /// Bytes go to a temporary file which is fsynced and then renamed into
    /// place; the temp file is removed on any error.
    async fn write_blob(&self, etag: &str, bytes: &[u8]) -> StoreResult<()> {
        let path = self.blob_path(etag);
        if fs::try_exists(&path).await.map_err(io_err)? {
            debug!("blob {} already present", path.display());
            return Ok(());
        }
        let parent = path.parent().map(Path::to_path_buf).ok_or_else(|| {
            io_err(io::Error::new(
                ErrorKind::Other,
                "blob path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await.map_err(io_err)?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let written = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, &path).await
        }
        .await;

        match written {
            Ok(()) => Ok(()),
            // Another writer renamed the same content into place first.
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&tmp_path).await;
                Ok(())
            }
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                Err(io_err(err))
            }
        }
    }

    async fn fetch_row(&self, key: &str) -> StoreResult<ObjectRow> {
        sqlx::query_as::<_, ObjectRow>(
            "SELECT key, content_version, source_marker, etag, size_bytes, content_type, last_modified
             FROM objects WHERE bucket = ? AND key = ?",
        )
        .bind(&self.bucket)
        .bind(key)
        .fetch_optional(&*self.db)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }
}

#[async_trait]
impl ObjectStore for DiskStore {
    #[instrument(skip(self, bytes, source_marker), fields(bucket = %self.bucket))]
    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        source_marker: VersionMarker,
    ) -> StoreResult<ObjectMeta> {
        validate_key(key)?;
        let object = Object::new(key, bytes, source_marker);
        self.write_blob(&object.meta.etag, &object.bytes).await?;

        let meta = &object.meta;
        let row = sqlx::query_as::<_, ObjectRow>(
            r#"
            INSERT INTO objects (
                bucket, key, content_version, source_marker, etag, size_bytes, content_type,
                last_modified
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(bucket, key) DO UPDATE SET
                content_version = excluded.content_version,
                source_marker = excluded.source_marker,
                etag = excluded.etag,
                size_bytes = excluded.size_bytes,
                content_type = excluded.content_type,
                last_modified = excluded.last_modified
            RETURNING key, content_version, source_marker, etag, size_bytes, content_type,
                last_modified
            "#,
        )
        .bind(&self.bucket)
        .bind(key)
        .bind(meta.content_version.as_str())
        .bind(meta.source_marker.as_str())
        .bind(&meta.etag)
        .bind(meta.size_bytes)
        .bind(meta.content_type.as_deref())
        .bind(meta.last_modified)
        .fetch_one(&*self.db)
        .await
        .map_err(db_err)?;

        debug!(marker = %row.source_marker, size = row.size_bytes, "stored object");
        Ok(row.into())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn get(&self, key: &str) -> StoreResult<Object> {
        validate_key(key)?;
        let meta: ObjectMeta = self.fetch_row(key).await?.into();
        let path = self.blob_path(&meta.etag);
        let payload = fs::read(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::Corrupt {
                    key: key.to_string(),
                    reason: format!("payload {} missing", path.display()),
                }
            } else {
                io_err(err)
            }
        })?;

        let digest = etag_of(&payload);
        if digest != meta.etag {
            return Err(StoreError::Corrupt {
                key: key.to_string(),
                reason: format!("etag mismatch: expected {}, found {}", meta.etag, digest),
            });
        }
        Ok(Object {
            meta,
            bytes: Bytes::from(payload),
        })
    }

    async fn stat(&self, key: &str) -> StoreResult<ObjectMeta> {
        validate_key(key)?;
        Ok(self.fetch_row(key).await?.into())
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        // substr comparison instead of LIKE: LIKE is case-insensitive in SQLite.
        sqlx::query_scalar::<_, String>(
            "SELECT key FROM objects
             WHERE bucket = ? AND substr(key, 1, length(?)) = ?
             ORDER BY key ASC",
        )
        .bind(&self.bucket)
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&*self.db)
        .await
        .map_err(db_err)
    }

    /// Drops the metadata row. The blob stays: other keys may reference the
    /// same content.
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn delete(&self, key: &str) -> StoreResult<bool> {
        validate_key(key)?;
        let result = sqlx::query("DELETE FROM objects WHERE bucket = ? AND key = ?")
            .bind(&self.bucket)
            .bind(key)
            .execute(&*self.db)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }
}

/// Map SQLx errors onto the store taxonomy. Pool exhaustion, I/O failures and
/// lock contention are transient; everything else is not.
fn db_err(err: sqlx::Error) -> StoreError {
    let transient = match &err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db_err) => {
            let msg = db_err.message().to_ascii_lowercase();
            msg.contains("database is locked") || msg.contains("busy")
        }
        _ => false,
    };
    if transient {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Backend(err.to_string())
    }
}

fn io_err(err: io::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

/// Validate bucket name format.
///
/// Enforces S3-like naming rules:
/// - 3–63 characters
/// - lowercase letters, digits, dots, hyphens only
/// - cannot start/end with dot or hyphen
/// - cannot contain consecutive dots or dot-hyphen patterns
/// - cannot look like an IPv4 address
pub fn validate_bucket_name(name: &str) -> StoreResult<()> {
    let invalid = |reason: &str| StoreError::InvalidBucketName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let len = name.len();
    if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
        return Err(invalid("must be between 3 and 63 characters"));
    }
    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
    {
        return Err(invalid(
            "allowed characters are lowercase letters, digits, dots, and hyphens",
        ));
    }
    if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
        return Err(invalid("must start and end with a lowercase letter or digit"));
    }
    if name.contains("..") || name.contains("-.") || name.contains(".-") {
        return Err(invalid(
            "cannot contain consecutive dots or dot-hyphen combinations",
        ));
    }
    if is_ipv4_like(name) {
        return Err(invalid("must not be formatted like an IP address"));
    }
    Ok(())
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}
