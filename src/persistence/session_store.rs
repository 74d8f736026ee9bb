//! 分片上传会话存储

use super::Database;
use crate::error::{GatewayError, Result};
use crate::uploader::hash::HashInfo;
use crate::uploader::session::{SessionKey, SessionStatus, SliceBitmap, UploadSession};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::path::PathBuf;
use tracing::debug;

/// 会话持久化接口
///
/// 持久化存储是会话状态的唯一可信来源，内存缓存只在首次访问时从这里加载
pub trait SessionStore: Send + Sync {
    /// 按唯一键查找
    fn find_by_key(&self, key: &SessionKey) -> Result<Option<UploadSession>>;

    fn get(&self, id: i64) -> Result<Option<UploadSession>>;

    /// 插入新会话
    ///
    /// # 返回
    /// (入库后的会话, 是否为本次新建)。唯一键冲突时返回已存在的会话
    fn insert(&self, session: &UploadSession) -> Result<(UploadSession, bool)>;

    fn update(&self, session: &UploadSession) -> Result<()>;

    fn delete(&self, id: i64) -> Result<bool>;
}

/// 基于 SQLite 的会话存储
#[derive(Clone)]
pub struct SqliteSessionStore {
    db: Database,
}

const SELECT_COLUMNS: &str = "id, storage_id, dst_path, dst_id, name, size, hash_md5, hash_md5_256kb, hash_sha1, \
     overwrite, preup_id, server, slice_size, slice_count, slice_bitmap, slice_hash, temp_file, \
     status, message, created_at, updated_at, task_id";

/// 数据库行（先原样读出，再转换为会话）
struct SessionRow {
    id: i64,
    storage_id: String,
    dst_path: String,
    dst_id: String,
    name: String,
    size: i64,
    hash_md5: String,
    hash_md5_256kb: String,
    hash_sha1: String,
    overwrite: bool,
    preup_id: String,
    server: Option<String>,
    slice_size: i64,
    slice_count: i64,
    slice_bitmap: Vec<u8>,
    slice_hash: String,
    temp_file: Option<String>,
    status: String,
    message: String,
    created_at: i64,
    updated_at: i64,
    task_id: Option<String>,
}

impl SessionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            storage_id: row.get(1)?,
            dst_path: row.get(2)?,
            dst_id: row.get(3)?,
            name: row.get(4)?,
            size: row.get(5)?,
            hash_md5: row.get(6)?,
            hash_md5_256kb: row.get(7)?,
            hash_sha1: row.get(8)?,
            overwrite: row.get(9)?,
            preup_id: row.get(10)?,
            server: row.get(11)?,
            slice_size: row.get(12)?,
            slice_count: row.get(13)?,
            slice_bitmap: row.get(14)?,
            slice_hash: row.get(15)?,
            temp_file: row.get(16)?,
            status: row.get(17)?,
            message: row.get(18)?,
            created_at: row.get(19)?,
            updated_at: row.get(20)?,
            task_id: row.get(21)?,
        })
    }

    fn into_session(self) -> Result<UploadSession> {
        let slice_count = self.slice_count as usize;
        let bitmap = SliceBitmap::from_bytes(&self.slice_bitmap, slice_count).map_err(|e| {
            GatewayError::Other(anyhow::anyhow!("会话 {} 位图损坏: {}", self.id, e))
        })?;
        let status = SessionStatus::parse(&self.status).ok_or_else(|| {
            GatewayError::Other(anyhow::anyhow!("会话 {} 状态未知: {}", self.id, self.status))
        })?;

        Ok(UploadSession {
            id: self.id,
            storage_id: self.storage_id,
            dst_path: self.dst_path,
            dst_id: self.dst_id,
            name: self.name,
            size: self.size as u64,
            hash: HashInfo {
                md5: non_empty(self.hash_md5),
                md5_256kb: non_empty(self.hash_md5_256kb),
                sha1: non_empty(self.hash_sha1),
            },
            overwrite: self.overwrite,
            preup_id: self.preup_id,
            server: self.server,
            slice_size: self.slice_size as u64,
            slice_count,
            bitmap,
            slice_hashes: crate::uploader::hash::parse_manifest(&self.slice_hash),
            temp_file: self.temp_file.map(PathBuf::from),
            task_id: self.task_id,
            status,
            message: self.message,
            created_at: from_timestamp(self.created_at),
            updated_at: from_timestamp(self.updated_at),
        })
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn from_timestamp(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
}

impl SqliteSessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn query_one(&self, sql: &str, params: impl rusqlite::Params) -> Result<Option<UploadSession>> {
        let conn = self.db.conn()?;
        let row = conn
            .query_row(sql, params, SessionRow::from_row)
            .optional()?;
        row.map(SessionRow::into_session).transpose()
    }
}

impl SessionStore for SqliteSessionStore {
    fn find_by_key(&self, key: &SessionKey) -> Result<Option<UploadSession>> {
        let sql = format!(
            "SELECT {} FROM slice_uploads WHERE storage_id = ?1 AND dst_path = ?2 AND name = ?3 \
             AND size = ?4 AND hash_md5 = ?5 AND hash_md5_256kb = ?6",
            SELECT_COLUMNS
        );
        self.query_one(
            &sql,
            params![
                key.storage_id,
                key.dst_path,
                key.name,
                key.size as i64,
                key.hash_md5,
                key.hash_md5_256kb
            ],
        )
    }

    fn get(&self, id: i64) -> Result<Option<UploadSession>> {
        let sql = format!("SELECT {} FROM slice_uploads WHERE id = ?1", SELECT_COLUMNS);
        self.query_one(&sql, params![id])
    }

    fn insert(&self, session: &UploadSession) -> Result<(UploadSession, bool)> {
        let inserted = {
            let conn = self.db.conn()?;
            let changed = conn.execute(
                r#"
                INSERT INTO slice_uploads (
                    storage_id, dst_path, dst_id, name, size, hash_md5, hash_md5_256kb, hash_sha1,
                    overwrite, preup_id, server, slice_size, slice_count, slice_bitmap, slice_hash,
                    temp_file, status, message, created_at, updated_at, task_id
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)
                ON CONFLICT DO NOTHING
                "#,
                params![
                    session.storage_id,
                    session.dst_path,
                    session.dst_id,
                    session.name,
                    session.size as i64,
                    session.hash.md5.as_deref().unwrap_or_default(),
                    session.hash.md5_256kb.as_deref().unwrap_or_default(),
                    session.hash.sha1.as_deref().unwrap_or_default(),
                    session.overwrite,
                    session.preup_id,
                    session.server,
                    session.slice_size as i64,
                    session.slice_count as i64,
                    session.bitmap.to_bytes(),
                    session.slice_hashes.join(","),
                    session.temp_file.as_ref().map(|p| p.to_string_lossy().into_owned()),
                    session.status.as_str(),
                    session.message,
                    session.created_at.timestamp(),
                    session.updated_at.timestamp(),
                    session.task_id,
                ],
            )?;
            (changed == 1).then(|| conn.last_insert_rowid())
        };

        match inserted {
            Some(id) => {
                debug!("新建上传会话: id={}, name={}", id, session.name);
                let mut stored = session.clone();
                stored.id = id;
                Ok((stored, true))
            }
            None => {
                // 并发 Preup 竞争，以先入库者为准
                let existing = self
                    .find_by_key(&session.key())?
                    .ok_or_else(|| GatewayError::Other(anyhow::anyhow!("会话插入冲突后未找到已有记录")))?;
                debug!("上传会话已存在: id={}, name={}", existing.id, existing.name);
                Ok((existing, false))
            }
        }
    }

    fn update(&self, session: &UploadSession) -> Result<()> {
        let conn = self.db.conn()?;
        let changed = conn.execute(
            r#"
            UPDATE slice_uploads SET
                dst_id = ?2, preup_id = ?3, server = ?4, slice_bitmap = ?5, slice_hash = ?6,
                temp_file = ?7, status = ?8, message = ?9, updated_at = ?10, task_id = ?11
            WHERE id = ?1
            "#,
            params![
                session.id,
                session.dst_id,
                session.preup_id,
                session.server,
                session.bitmap.to_bytes(),
                session.slice_hashes.join(","),
                session.temp_file.as_ref().map(|p| p.to_string_lossy().into_owned()),
                session.status.as_str(),
                session.message,
                session.updated_at.timestamp(),
                session.task_id,
            ],
        )?;
        if changed == 0 {
            return Err(GatewayError::NoSuchSession(session.id));
        }
        Ok(())
    }

    fn delete(&self, id: i64) -> Result<bool> {
        let conn = self.db.conn()?;
        let changed = conn.execute("DELETE FROM slice_uploads WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(name: &str) -> UploadSession {
        UploadSession {
            id: 0,
            storage_id: "pan".into(),
            dst_path: "/a".into(),
            dst_id: "100".into(),
            name: name.into(),
            size: 10_000_000,
            hash: HashInfo::with_md5("deadbeef"),
            overwrite: false,
            preup_id: "pre-1".into(),
            server: Some("http://upload.example".into()),
            slice_size: 4_194_304,
            slice_count: 3,
            bitmap: SliceBitmap::new(3),
            slice_hashes: Vec::new(),
            temp_file: None,
            task_id: None,
            status: SessionStatus::Created,
            message: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn store() -> (TempDir, SqliteSessionStore) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("test.db")).unwrap();
        (dir, SqliteSessionStore::new(db))
    }

    #[test]
    fn test_insert_and_reload() {
        let (_dir, store) = store();
        let (mut session, created) = store.insert(&sample("f.bin")).unwrap();
        assert!(created);
        assert!(session.id > 0);

        session.bitmap.set(0);
        session.bitmap.set(2);
        session.slice_hashes = vec!["aa".into(), "bb".into(), "cc".into()];
        session.temp_file = Some(PathBuf::from("/tmp/x"));
        session.task_id = Some("task-1".into());
        session.status = SessionStatus::Uploading;
        store.update(&session).unwrap();

        let loaded = store.get(session.id).unwrap().unwrap();
        assert!(loaded.bitmap.is_set(0));
        assert!(!loaded.bitmap.is_set(1));
        assert!(loaded.bitmap.is_set(2));
        assert_eq!(loaded.slice_hashes, session.slice_hashes);
        assert_eq!(loaded.temp_file, session.temp_file);
        assert_eq!(loaded.task_id.as_deref(), Some("task-1"));
        assert_eq!(loaded.status, SessionStatus::Uploading);
        assert_eq!(loaded.hash.md5.as_deref(), Some("deadbeef"));
        assert_eq!(loaded.hash.sha1, None);
        assert_eq!(loaded.server.as_deref(), Some("http://upload.example"));
    }

    #[test]
    fn test_duplicate_key_returns_existing() {
        let (_dir, store) = store();
        let (first, _) = store.insert(&sample("f.bin")).unwrap();

        let mut again = sample("f.bin");
        again.preup_id = "pre-2".into();
        let (second, created) = store.insert(&again).unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);
        assert_eq!(second.preup_id, "pre-1");

        let found = store.find_by_key(&again.key()).unwrap().unwrap();
        assert_eq!(found.id, first.id);

        // 哈希不同视为不同会话
        let mut other = sample("f.bin");
        other.hash = HashInfo::with_md5("cafebabe");
        let (third, created) = store.insert(&other).unwrap();
        assert!(created);
        assert_ne!(third.id, first.id);
    }

    #[test]
    fn test_update_and_delete_missing() {
        let (_dir, store) = store();
        let mut session = sample("gone.bin");
        session.id = 42;
        assert!(matches!(
            store.update(&session),
            Err(GatewayError::NoSuchSession(42))
        ));
        assert!(!store.delete(42).unwrap());

        let (stored, _) = store.insert(&sample("f.bin")).unwrap();
        assert!(store.delete(stored.id).unwrap());
        assert!(store.get(stored.id).unwrap().is_none());
    }
}
