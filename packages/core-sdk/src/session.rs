use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use rusqlite::Connection;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db;
use crate::error::{ChatError, Result};
use crate::models::{
    derive_title, Message, Session, SessionPatch, DEFAULT_SESSION_ID, DEFAULT_SESSION_TITLE,
};

/**
 * \brief 新会话使用的默认模型与模型服务。
 */
#[derive(Debug, Clone)]
pub struct SessionDefaults {
    pub model: String,
    pub api_provider: String,
}

struct RegistryState {
    conn: Connection,
    sessions: HashMap<String, Session>,
}

/**
 * \brief 会话注册表：进程内的权威会话视图，所有写操作同步落盘。
 * \details 每次修改先作用于副本，持久化成功后才提交到内存，存储失败不会留下半更新状态。
 */
pub struct SessionRegistry {
    state: Mutex<RegistryState>,
    defaults: SessionDefaults,
}

impl SessionRegistry {
    /**
     * \brief 以数据库连接初始化注册表：迁移、加载全部会话，必要时创建默认会话。
     */
    pub fn open(mut conn: Connection, defaults: SessionDefaults) -> Result<Self> {
        db::migrate(&conn).map_err(ChatError::persistence)?;
        let mut sessions = db::load_all(&conn).map_err(ChatError::persistence)?;
        if sessions.is_empty() {
            let session = Session::new(
                DEFAULT_SESSION_ID,
                DEFAULT_SESSION_TITLE,
                defaults.model.clone(),
                defaults.api_provider.clone(),
            );
            db::upsert_session(&mut conn, &session).map_err(ChatError::persistence)?;
            info!("created default session");
            sessions.insert(session.id.clone(), session);
        } else {
            info!(count = sessions.len(), "loaded sessions from store");
        }
        Ok(Self {
            state: Mutex::new(RegistryState { conn, sessions }),
            defaults,
        })
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /**
     * \brief 列出全部会话，按创建时间排序。
     */
    pub fn list(&self) -> Vec<Session> {
        let state = self.state();
        let mut sessions: Vec<Session> = state.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        sessions
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.state().sessions.get(id).cloned()
    }

    /**
     * \brief 创建新会话并立即持久化。
     */
    pub fn create(&self, title: &str) -> Result<Session> {
        let mut state = self.state();
        let mut id = Uuid::new_v4().simple().to_string();
        while state.sessions.contains_key(&id) {
            id = Uuid::new_v4().simple().to_string();
        }
        let session = Session::new(
            id,
            title,
            self.defaults.model.clone(),
            self.defaults.api_provider.clone(),
        );
        db::upsert_session(&mut state.conn, &session).map_err(ChatError::persistence)?;
        debug!(session_id = %session.id, "session created");
        state.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    /**
     * \brief 部分更新会话元数据。
     */
    pub fn update(&self, id: &str, patch: &SessionPatch) -> Result<Session> {
        let mut state = self.state();
        let mut session = current(&state, id)?;
        session.apply(patch);
        session.touch();
        db::update_metadata(&state.conn, id, patch, &session.updated_at)
            .map_err(ChatError::persistence)?;
        debug!(session_id = %id, "session updated");
        Ok(commit(&mut state, session))
    }

    /**
     * \brief 删除会话及其消息，返回会话是否存在。
     */
    pub fn delete(&self, id: &str) -> Result<bool> {
        let mut state = self.state();
        let stored = db::delete_session(&mut state.conn, id).map_err(ChatError::persistence)?;
        let cached = state.sessions.remove(id).is_some();
        debug!(session_id = %id, existed = stored || cached, "session deleted");
        Ok(stored || cached)
    }

    /**
     * \brief 追加消息；若为首条消息，则以其内容生成会话标题。
     */
    pub fn append_message(&self, id: &str, message: Message) -> Result<Session> {
        let mut state = self.state();
        let mut session = current(&state, id)?;
        session.messages.push(message);
        let retitled = session.messages.len() == 1;
        if retitled {
            session.title = derive_title(&session.messages[0].content);
        }
        session.touch();

        let tx = state.conn.transaction().map_err(|e| ChatError::persistence(e.into()))?;
        let last = &session.messages[session.messages.len() - 1];
        db::append_message(&tx, id, last, &session.updated_at).map_err(ChatError::persistence)?;
        if retitled {
            db::update_metadata(
                &tx,
                id,
                &SessionPatch::title(session.title.clone()),
                &session.updated_at,
            )
            .map_err(ChatError::persistence)?;
        }
        tx.commit()
            .context("commit appended message")
            .map_err(ChatError::persistence)?;

        debug!(session_id = %id, role = %last.role, count = session.messages.len(), "message appended");
        Ok(commit(&mut state, session))
    }

    /**
     * \brief 替换指定下标的消息。
     */
    pub fn edit_message(&self, id: &str, index: usize, message: Message) -> Result<Session> {
        let mut state = self.state();
        let mut session = current(&state, id)?;
        let slot = session
            .messages
            .get_mut(index)
            .ok_or_else(|| ChatError::message_not_found(id, index))?;
        *slot = message;
        session.touch();
        db::upsert_session(&mut state.conn, &session).map_err(ChatError::persistence)?;
        debug!(session_id = %id, index, "message edited");
        Ok(commit(&mut state, session))
    }

    /**
     * \brief 删除指定下标的消息。
     */
    pub fn delete_message(&self, id: &str, index: usize) -> Result<Session> {
        let mut state = self.state();
        let mut session = current(&state, id)?;
        if index >= session.messages.len() {
            return Err(ChatError::message_not_found(id, index));
        }
        session.messages.remove(index);
        session.touch();
        db::upsert_session(&mut state.conn, &session).map_err(ChatError::persistence)?;
        debug!(session_id = %id, index, "message deleted");
        Ok(commit(&mut state, session))
    }

    pub fn clear_messages(&self, id: &str) -> Result<Session> {
        let mut state = self.state();
        let mut session = current(&state, id)?;
        session.messages.clear();
        session.touch();
        db::clear_messages(&state.conn, id, &session.updated_at).map_err(ChatError::persistence)?;
        debug!(session_id = %id, "messages cleared");
        Ok(commit(&mut state, session))
    }
}

fn current(state: &RegistryState, id: &str) -> Result<Session> {
    state
        .sessions
        .get(id)
        .cloned()
        .ok_or_else(|| ChatError::session_not_found(id))
}

fn commit(state: &mut RegistryState, session: Session) -> Session {
    state.sessions.insert(session.id.clone(), session.clone());
    session
}
