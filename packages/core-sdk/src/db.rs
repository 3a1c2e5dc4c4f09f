use anyhow::{Context, Result};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, ErrorCode};
use std::{collections::HashMap, path::Path, thread, time::Duration};

use crate::models::{Message, Role, Session, SessionPatch};

impl ToSql for Role {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Role {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        Role::parse(text).ok_or_else(|| FromSqlError::Other(format!("unknown role {}", text).into()))
    }
}

/**
 * \brief 打开指定路径的数据库文件，并设置锁等待时间。
 */
pub fn open_db(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create database directory {}", parent.display()))?;
        }
    }
    let conn = Connection::open(path)
        .with_context(|| format!("open database {}", path.display()))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建会话与消息表；可重复调用。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        PRAGMA foreign_keys=ON;
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            model TEXT NOT NULL,
            api_provider TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            timestamp TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_session_id ON messages (session_id);
        "#,
        )
    })?;

    ensure_messages_attachments_column(conn)?;
    Ok(())
}

fn ensure_messages_attachments_column(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare("PRAGMA table_info(messages)")?;
    let mut rows = stmt.query([])?;
    let mut has = false;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == "attachments" {
            has = true;
            break;
        }
    }
    if !has {
        retry_on_locked(|| {
            conn.execute(
                "ALTER TABLE messages ADD COLUMN attachments TEXT NOT NULL DEFAULT '[]'",
                [],
            )
        })?;
    }
    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
        params![table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/**
 * \brief 读取全部会话及其消息（按插入顺序）；尚未建表时返回空集合。
 */
pub fn load_all(conn: &Connection) -> Result<HashMap<String, Session>> {
    if !table_exists(conn, "sessions")? || !table_exists(conn, "messages")? {
        return Ok(HashMap::new());
    }

    let mut stmt = conn.prepare(
        "SELECT id, title, created_at, updated_at, model, api_provider FROM sessions ORDER BY created_at ASC, id ASC",
    )?;
    let sessions = stmt
        .query_map([], |row| {
            Ok(Session {
                id: row.get(0)?,
                title: row.get(1)?,
                messages: Vec::new(),
                created_at: row.get(2)?,
                updated_at: row.get(3)?,
                model: row.get(4)?,
                api_provider: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut out = HashMap::with_capacity(sessions.len());
    for mut session in sessions {
        session.messages = load_messages(conn, &session.id)?;
        out.insert(session.id.clone(), session);
    }
    Ok(out)
}

/**
 * \brief 读取指定会话的全部消息。
 */
pub fn load_messages(conn: &Connection, session_id: &str) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(
        "SELECT role, content, timestamp, attachments FROM messages WHERE session_id=?1 ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map(params![session_id], |row| {
            Ok((
                row.get::<_, Role>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(role, content, timestamp, attachments)| {
            let attachments: Vec<String> = serde_json::from_str(&attachments)
                .with_context(|| format!("decode attachments of session {}", session_id))?;
            Ok(Message {
                role,
                content,
                timestamp,
                attachments,
            })
        })
        .collect()
}

/**
 * \brief 写入会话元数据，并以内存中的消息列表整体替换已存储的消息。
 */
pub fn upsert_session(conn: &mut Connection, session: &Session) -> Result<()> {
    let tx = conn.transaction()?;
    retry_on_locked(|| {
        tx.execute(
            "INSERT INTO sessions (id, title, created_at, updated_at, model, api_provider)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
            title=excluded.title,
            created_at=excluded.created_at,
            updated_at=excluded.updated_at,
            model=excluded.model,
            api_provider=excluded.api_provider",
            params![
                session.id,
                session.title,
                session.created_at,
                session.updated_at,
                session.model,
                session.api_provider
            ],
        )
    })?;
    retry_on_locked(|| {
        tx.execute(
            "DELETE FROM messages WHERE session_id=?1",
            params![session.id],
        )
    })?;
    for message in &session.messages {
        insert_message(&tx, &session.id, message)?;
    }
    tx.commit()?;
    Ok(())
}

/**
 * \brief 删除会话及其全部消息，返回会话行是否存在。
 */
pub fn delete_session(conn: &mut Connection, session_id: &str) -> Result<bool> {
    let tx = conn.transaction()?;
    retry_on_locked(|| {
        tx.execute(
            "DELETE FROM messages WHERE session_id=?1",
            params![session_id],
        )
    })?;
    let rows = retry_on_locked(|| tx.execute("DELETE FROM sessions WHERE id=?1", params![session_id]))?;
    tx.commit()?;
    Ok(rows > 0)
}

/**
 * \brief 追加单条消息并刷新会话的 updated_at。
 */
pub fn append_message(
    conn: &Connection,
    session_id: &str,
    message: &Message,
    updated_at: &str,
) -> Result<i64> {
    let id = insert_message(conn, session_id, message)?;
    touch_session(conn, session_id, updated_at)?;
    Ok(id)
}

/**
 * \brief 清空会话消息并刷新 updated_at。
 */
pub fn clear_messages(conn: &Connection, session_id: &str, updated_at: &str) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "DELETE FROM messages WHERE session_id=?1",
            params![session_id],
        )
    })?;
    touch_session(conn, session_id, updated_at)?;
    Ok(())
}

/**
 * \brief 部分更新会话元数据；只写入提供的字段，updated_at 总是更新。
 */
pub fn update_metadata(
    conn: &Connection,
    session_id: &str,
    patch: &SessionPatch,
    updated_at: &str,
) -> Result<()> {
    let mut assignments = Vec::new();
    let mut values: Vec<&dyn ToSql> = Vec::new();
    if let Some(title) = &patch.title {
        assignments.push("title=?");
        values.push(title);
    }
    if let Some(model) = &patch.model {
        assignments.push("model=?");
        values.push(model);
    }
    if let Some(api_provider) = &patch.api_provider {
        assignments.push("api_provider=?");
        values.push(api_provider);
    }
    assignments.push("updated_at=?");
    values.push(&updated_at);
    values.push(&session_id);

    let sql = format!("UPDATE sessions SET {} WHERE id=?", assignments.join(", "));
    retry_on_locked(|| conn.execute(&sql, values.as_slice()))?;
    Ok(())
}

fn insert_message(conn: &Connection, session_id: &str, message: &Message) -> Result<i64> {
    let attachments = serde_json::to_string(&message.attachments)?;
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO messages (session_id, role, content, timestamp, attachments) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session_id,
                message.role,
                message.content,
                message.timestamp,
                attachments
            ],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

fn touch_session(conn: &Connection, session_id: &str, updated_at: &str) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "UPDATE sessions SET updated_at=?1 WHERE id=?2",
            params![updated_at, session_id],
        )
    })?;
    Ok(())
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并进行线性退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                attempt += 1;
                tracing::warn!(attempt, "sqlite busy, retrying");
                thread::sleep(Duration::from_millis(200 * attempt as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        migrate(&conn).expect("migrate");
        conn
    }

    fn sample_session(id: &str) -> Session {
        let mut session = Session::new(id, "chat", "gpt-4o", "openai");
        session.messages.push(Message::user("hello"));
        session.messages.push(
            Message::assistant("hi").with_attachments(vec!["/uploads/a.png".to_string()]),
        );
        session
    }

    fn message_rows(conn: &Connection, session_id: &str) -> i64 {
        conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE session_id=?1",
            params![session_id],
            |row| row.get(0),
        )
        .expect("count messages")
    }

    fn sqlite_failure(code: std::os::raw::c_int) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
    }

    #[test]
    fn test_retry_on_locked_retries_busy_errors() {
        let mut calls = 0;
        let value = retry_on_locked(|| {
            calls += 1;
            match calls {
                1 => Err(sqlite_failure(rusqlite::ffi::SQLITE_BUSY)),
                2 => Err(sqlite_failure(rusqlite::ffi::SQLITE_LOCKED)),
                _ => Ok(42),
            }
        })
        .expect("succeeds after retries");
        assert_eq!(value, 42);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_on_locked_does_not_retry_other_errors() {
        let mut calls = 0;
        let result: Result<()> = retry_on_locked(|| {
            calls += 1;
            Err(sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = mem_conn();
        migrate(&conn).expect("migrate twice");
        assert!(load_all(&conn).expect("load").is_empty());
    }

    #[test]
    fn test_load_all_without_schema_is_empty() {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        let sessions = load_all(&conn).expect("load without schema");
        assert!(sessions.is_empty());
    }

    #[test]
    fn test_upsert_then_load_round_trips() {
        let mut conn = mem_conn();
        let session = sample_session("s1");
        upsert_session(&mut conn, &session).expect("upsert");

        let loaded = load_all(&conn).expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["s1"], session);
    }

    #[test]
    fn test_upsert_replaces_message_set() {
        let mut conn = mem_conn();
        let mut session = sample_session("s1");
        upsert_session(&mut conn, &session).expect("upsert");

        session.messages.remove(0);
        session.title = "renamed".into();
        upsert_session(&mut conn, &session).expect("upsert again");

        let loaded = load_all(&conn).expect("load");
        assert_eq!(loaded["s1"].messages.len(), 1);
        assert_eq!(loaded["s1"].messages[0].content, "hi");
        assert_eq!(loaded["s1"].title, "renamed");
    }

    #[test]
    fn test_delete_session_removes_messages() {
        let mut conn = mem_conn();
        upsert_session(&mut conn, &sample_session("s1")).expect("upsert");
        upsert_session(&mut conn, &sample_session("s2")).expect("upsert");

        assert!(delete_session(&mut conn, "s1").expect("delete"));
        assert_eq!(message_rows(&conn, "s1"), 0);
        assert_eq!(message_rows(&conn, "s2"), 2);
        assert!(!delete_session(&mut conn, "s1").expect("delete again"));

        let loaded = load_all(&conn).expect("load");
        assert!(!loaded.contains_key("s1"));
        assert!(loaded.contains_key("s2"));
    }

    #[test]
    fn test_append_message_touches_session() {
        let mut conn = mem_conn();
        let session = Session::new("s1", "chat", "gpt-4o", "openai");
        upsert_session(&mut conn, &session).expect("upsert");

        append_message(&conn, "s1", &Message::user("first"), "2999-01-01T00:00:00.000000Z")
            .expect("append 1");
        append_message(&conn, "s1", &Message::assistant("second"), "2999-01-02T00:00:00.000000Z")
            .expect("append 2");

        let loaded = load_all(&conn).expect("load");
        let s1 = &loaded["s1"];
        assert_eq!(s1.updated_at, "2999-01-02T00:00:00.000000Z");
        assert_eq!(s1.messages.len(), 2);
        assert_eq!(s1.messages[0].content, "first");
        assert_eq!(s1.messages[1].role, Role::Assistant);
    }

    #[test]
    fn test_clear_messages_keeps_session() {
        let mut conn = mem_conn();
        upsert_session(&mut conn, &sample_session("s1")).expect("upsert");
        clear_messages(&conn, "s1", "2999-01-01T00:00:00.000000Z").expect("clear");

        let loaded = load_all(&conn).expect("load");
        assert!(loaded["s1"].messages.is_empty());
        assert_eq!(loaded["s1"].updated_at, "2999-01-01T00:00:00.000000Z");
    }

    #[test]
    fn test_update_metadata_only_touches_supplied_fields() {
        let mut conn = mem_conn();
        upsert_session(&mut conn, &sample_session("s1")).expect("upsert");

        let patch = SessionPatch {
            model: Some("claude-3-5-sonnet".into()),
            ..SessionPatch::default()
        };
        update_metadata(&conn, "s1", &patch, "2999-01-01T00:00:00.000000Z").expect("update");

        let loaded = load_all(&conn).expect("load");
        let s1 = &loaded["s1"];
        assert_eq!(s1.title, "chat");
        assert_eq!(s1.model, "claude-3-5-sonnet");
        assert_eq!(s1.api_provider, "openai");
        assert_eq!(s1.updated_at, "2999-01-01T00:00:00.000000Z");
    }

    #[test]
    fn test_legacy_messages_table_gains_attachments_column() {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            r#"
            CREATE TABLE sessions (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                model TEXT DEFAULT 'gpt-4o',
                api_provider TEXT DEFAULT 'OpenAI'
            );
            CREATE TABLE messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );
            INSERT INTO sessions VALUES ('old', 'legacy', 't0', 't1', 'gpt-4o', 'OpenAI');
            INSERT INTO messages (session_id, role, content, timestamp) VALUES ('old', 'user', 'hey', 't0');
            "#,
        )
        .expect("legacy schema");

        migrate(&conn).expect("migrate legacy");
        let loaded = load_all(&conn).expect("load legacy");
        assert_eq!(loaded["old"].messages.len(), 1);
        assert!(loaded["old"].messages[0].attachments.is_empty());
    }
}
