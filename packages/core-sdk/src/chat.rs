use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::db;
use crate::error::{ChatError, Result};
use crate::models::{Message, Session, SessionPatch};
use crate::payload::{build_payload, AttachmentResolver};
use crate::providers::{ProviderCatalog, ProviderRegistry};
use crate::session::{SessionDefaults, SessionRegistry};

/** \brief 模型服务调用失败时写入会话的助手消息前缀。 */
pub const FAILURE_NOTE_PREFIX: &str = "API调用失败: ";

/**
 * \brief 一轮对话的结果：更新后的会话与助手回复。
 */
#[derive(Debug, Clone, Serialize)]
pub struct ChatTurn {
    pub session: Session,
    pub response: Message,
}

/**
 * \brief 核心服务门面：会话操作、对话编排与模型发现。
 */
pub struct ChatService {
    sessions: SessionRegistry,
    providers: ProviderRegistry,
    attachments: AttachmentResolver,
    turn_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChatService {
    pub fn new(
        sessions: SessionRegistry,
        providers: ProviderRegistry,
        attachments: AttachmentResolver,
    ) -> Self {
        Self {
            sessions,
            providers,
            attachments,
            turn_locks: Mutex::new(HashMap::new()),
        }
    }

    /**
     * \brief 按配置打开数据库、构建模型服务注册表并组装服务。
     */
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let conn = db::open_db(&config.database_path)?;
        let sessions = SessionRegistry::open(
            conn,
            SessionDefaults {
                model: config.default_model.clone(),
                api_provider: config.default_provider.clone(),
            },
        )?;
        let providers = ProviderRegistry::from_config(config)?;
        Ok(Self::new(
            sessions,
            providers,
            AttachmentResolver::new(&config.upload_dir).with_local_paths(config.local_attachments),
        ))
    }

    pub fn list_sessions(&self) -> Vec<Session> {
        self.sessions.list()
    }

    pub fn create_session(&self, title: &str) -> Result<Session> {
        self.sessions.create(title)
    }

    pub fn get_session(&self, id: &str) -> Option<Session> {
        self.sessions.get(id)
    }

    pub fn update_session(&self, id: &str, patch: &SessionPatch) -> Result<Session> {
        self.sessions.update(id, patch)
    }

    pub fn delete_session(&self, id: &str) -> Result<bool> {
        let existed = self.sessions.delete(id)?;
        self.locks().remove(id);
        Ok(existed)
    }

    pub fn append_message(&self, id: &str, message: Message) -> Result<Session> {
        self.sessions.append_message(id, message)
    }

    pub fn edit_message(&self, id: &str, index: usize, message: Message) -> Result<Session> {
        self.sessions.edit_message(id, index, message)
    }

    pub fn delete_message(&self, id: &str, index: usize) -> Result<Session> {
        self.sessions.delete_message(id, index)
    }

    pub fn clear_messages(&self, id: &str) -> Result<Session> {
        self.sessions.clear_messages(id)
    }

    pub fn list_providers_and_models(&self) -> ProviderCatalog {
        self.providers.list_available()
    }

    fn locks(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.turn_locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn turn_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks()
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /**
     * \brief 执行一轮对话。
     * \details 用户消息先落盘；模型服务不可用时直接返回 Unconfigured（用户消息保留）；
     * 调用失败时把错误说明记为助手消息后再返回 ProviderCallFailed。同一会话的对话轮次串行执行。
     */
    pub async fn chat(
        &self,
        session_id: &str,
        text: &str,
        attachments: Vec<String>,
    ) -> Result<ChatTurn> {
        if self.sessions.get(session_id).is_none() {
            return Err(ChatError::session_not_found(session_id));
        }
        let lock = self.turn_lock(session_id);
        let _guard = lock.lock().await;
        if self.sessions.get(session_id).is_none() {
            self.locks().remove(session_id);
            return Err(ChatError::session_not_found(session_id));
        }

        let user_message = Message::user(text).with_attachments(attachments);
        let session = self.sessions.append_message(session_id, user_message)?;

        let payload = build_payload(&session.messages, &self.attachments).await;

        let provider = match self.providers.resolve(Some(&session.api_provider)) {
            Ok(provider) => provider,
            Err(err) => {
                warn!(session_id, provider = %session.api_provider, error = %err, "chat turn has no provider");
                return Err(err);
            }
        };

        info!(
            session_id,
            provider = %provider.name,
            model = %session.model,
            messages = payload.len(),
            "chat request"
        );

        match provider
            .client
            .complete(&session.model, &payload, &provider.params)
            .await
        {
            Ok(reply) => {
                let response = Message::assistant(reply);
                let session = self.sessions.append_message(session_id, response.clone())?;
                info!(session_id, reply_len = response.content.len(), "chat reply recorded");
                Ok(ChatTurn { session, response })
            }
            Err(err) => {
                let detail = format!("{:#}", err);
                warn!(session_id, provider = %provider.name, error = %detail, "provider call failed");
                let note = Message::assistant(format!("{}{}", FAILURE_NOTE_PREFIX, detail));
                if let Err(persist_err) = self.sessions.append_message(session_id, note) {
                    error!(session_id, error = %persist_err, "failed to record provider failure note");
                }
                Err(ChatError::ProviderCallFailed(detail))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatClient;
    use crate::models::{Role, DEFAULT_SESSION_ID};
    use crate::payload::{PayloadContent, PayloadMessage};
    use crate::providers::{CallParameters, ProviderEntry};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use rusqlite::Connection;
    use std::time::Duration;

    struct StubClient {
        reply: std::result::Result<&'static str, &'static str>,
        seen: Mutex<Vec<Vec<PayloadMessage>>>,
    }

    impl StubClient {
        fn replying(reply: &'static str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(reply),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn failing(detail: &'static str) -> Arc<Self> {
            Arc::new(Self {
                reply: Err(detail),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatClient for StubClient {
        async fn complete(
            &self,
            _model: &str,
            messages: &[PayloadMessage],
            _params: &CallParameters,
        ) -> anyhow::Result<String> {
            self.seen.lock().expect("lock").push(messages.to_vec());
            self.reply.map(str::to_string).map_err(|e| anyhow!(e))
        }
    }

    fn service(providers: ProviderRegistry) -> ChatService {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        let sessions = SessionRegistry::open(
            conn,
            SessionDefaults {
                model: "gpt-4o".into(),
                api_provider: "openai".into(),
            },
        )
        .expect("open registry");
        ChatService::new(sessions, providers, AttachmentResolver::new("uploads"))
    }

    fn with_client(client: Arc<StubClient>) -> ChatService {
        service(
            ProviderRegistry::new("openai", "gpt-4o").with_provider(
                ProviderEntry::new("openai", vec!["gpt-4o".into()]).with_client(client),
            ),
        )
    }

    #[tokio::test]
    async fn test_scenario_title_then_chat() {
        let client = StubClient::replying("Hi there");
        let service = with_client(client.clone());

        let session = service.create_session("新对话").expect("create");
        let session = service
            .append_message(&session.id, Message::user("Hello world, testing"))
            .expect("append");
        assert_eq!(session.title, "Hello worl...");
        service.clear_messages(&session.id).expect("clear");

        let turn = service
            .chat(&session.id, "Hello world, testing", Vec::new())
            .await
            .expect("chat");
        assert_eq!(turn.session.messages.len(), 2);
        assert_eq!(turn.session.messages[1].role, Role::Assistant);
        assert_eq!(turn.session.messages[1].content, "Hi there");
        assert_eq!(turn.response.content, "Hi there");

        let seen = client.seen.lock().expect("lock");
        assert_eq!(seen.len(), 1);
        assert_eq!(
            seen[0][0].content,
            PayloadContent::Text("Hello world, testing".into())
        );
    }

    #[tokio::test]
    async fn test_chat_without_provider_keeps_user_message() {
        let service = service(ProviderRegistry::new("openai", "gpt-4o"));
        let err = service
            .chat(DEFAULT_SESSION_ID, "anyone there?", Vec::new())
            .await
            .expect_err("unconfigured");
        assert!(matches!(err, ChatError::Unconfigured(_)));

        let session = service.get_session(DEFAULT_SESSION_ID).expect("session");
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].role, Role::User);
        assert_eq!(session.messages[0].content, "anyone there?");
    }

    #[tokio::test]
    async fn test_chat_failure_is_recorded_and_surfaced() {
        let service = with_client(StubClient::failing("429 rate limited"));
        let err = service
            .chat(DEFAULT_SESSION_ID, "hello", Vec::new())
            .await
            .expect_err("provider failure");
        match err {
            ChatError::ProviderCallFailed(detail) => assert!(detail.contains("429")),
            other => panic!("unexpected error {other:?}"),
        }

        let session = service.get_session(DEFAULT_SESSION_ID).expect("session");
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[1].role, Role::Assistant);
        assert!(session.messages[1].content.starts_with(FAILURE_NOTE_PREFIX));
        assert!(session.messages[1].content.contains("429 rate limited"));
    }

    #[tokio::test]
    async fn test_failure_note_persist_error_keeps_provider_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("chat.db");
        let sessions = SessionRegistry::open(
            db::open_db(&path).expect("open db"),
            SessionDefaults {
                model: "gpt-4o".into(),
                api_provider: "openai".into(),
            },
        )
        .expect("open registry");
        let service = ChatService::new(
            sessions,
            ProviderRegistry::new("openai", "gpt-4o").with_provider(
                ProviderEntry::new("openai", vec!["gpt-4o".into()])
                    .with_client(StubClient::failing("503 upstream")),
            ),
            AttachmentResolver::new("uploads"),
        );
        Connection::open(&path)
            .expect("second connection")
            .execute_batch(
                "CREATE TRIGGER reject_assistant BEFORE INSERT ON messages
                 WHEN NEW.role = 'assistant'
                 BEGIN SELECT RAISE(ABORT, 'read-only'); END;",
            )
            .expect("install trigger");

        let err = service
            .chat(DEFAULT_SESSION_ID, "hello", Vec::new())
            .await
            .expect_err("provider failure");
        match err {
            ChatError::ProviderCallFailed(detail) => assert!(detail.contains("503 upstream")),
            other => panic!("unexpected error {other:?}"),
        }
        let session = service.get_session(DEFAULT_SESSION_ID).expect("session");
        assert_eq!(session.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_sessions_leave_no_turn_locks() {
        let service = with_client(StubClient::replying("x"));
        for i in 0..100 {
            let err = service
                .chat(&format!("missing-{}", i), "hello", Vec::new())
                .await
                .expect_err("not found");
            assert!(matches!(err, ChatError::NotFound(_)));
        }
        assert!(service.locks().is_empty());
    }

    struct SlowClient {
        delay: Duration,
    }

    #[async_trait]
    impl ChatClient for SlowClient {
        async fn complete(
            &self,
            _model: &str,
            messages: &[PayloadMessage],
            _params: &CallParameters,
        ) -> anyhow::Result<String> {
            tokio::time::sleep(self.delay).await;
            match &messages[messages.len() - 1].content {
                PayloadContent::Text(text) => Ok(format!("re: {}", text)),
                PayloadContent::Parts(_) => Ok("re: parts".to_string()),
            }
        }
    }

    #[tokio::test]
    async fn test_turns_on_same_session_are_serialised() {
        let service = service(ProviderRegistry::new("openai", "gpt-4o").with_provider(
            ProviderEntry::new("openai", vec!["gpt-4o".into()]).with_client(Arc::new(SlowClient {
                delay: Duration::from_millis(50),
            })),
        ));

        let (first, second) = tokio::join!(
            service.chat(DEFAULT_SESSION_ID, "first", Vec::new()),
            service.chat(DEFAULT_SESSION_ID, "second", Vec::new()),
        );
        first.expect("first turn");
        second.expect("second turn");

        let session = service.get_session(DEFAULT_SESSION_ID).expect("session");
        let history: Vec<(Role, &str)> = session
            .messages
            .iter()
            .map(|m| (m.role, m.content.as_str()))
            .collect();
        assert_eq!(
            history,
            vec![
                (Role::User, "first"),
                (Role::Assistant, "re: first"),
                (Role::User, "second"),
                (Role::Assistant, "re: second"),
            ]
        );
    }

    #[tokio::test]
    async fn test_chat_unknown_session() {
        let service = with_client(StubClient::replying("x"));
        let err = service
            .chat("missing", "hello", Vec::new())
            .await
            .expect_err("not found");
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_chat_uses_session_provider() {
        let default_client = StubClient::replying("from openai");
        let claude_client = StubClient::replying("from claude");
        let service = service(
            ProviderRegistry::new("openai", "gpt-4o")
                .with_provider(
                    ProviderEntry::new("openai", vec!["gpt-4o".into()])
                        .with_client(default_client.clone()),
                )
                .with_provider(
                    ProviderEntry::new("claude", vec!["claude-3-haiku".into()])
                        .with_client(claude_client.clone()),
                ),
        );
        service
            .update_session(
                DEFAULT_SESSION_ID,
                &SessionPatch {
                    api_provider: Some("claude".into()),
                    model: Some("claude-3-haiku".into()),
                    ..SessionPatch::default()
                },
            )
            .expect("update");

        let turn = service
            .chat(DEFAULT_SESSION_ID, "hi", Vec::new())
            .await
            .expect("chat");
        assert_eq!(turn.response.content, "from claude");
        assert!(default_client.seen.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn test_history_is_sent_in_order() {
        let client = StubClient::replying("ok");
        let service = with_client(client.clone());
        service
            .chat(DEFAULT_SESSION_ID, "one", Vec::new())
            .await
            .expect("turn 1");
        service
            .chat(DEFAULT_SESSION_ID, "two", Vec::new())
            .await
            .expect("turn 2");

        let seen = client.seen.lock().expect("lock");
        let roles: Vec<Role> = seen[1].iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User]);
        assert_eq!(seen[1][2].content, PayloadContent::Text("two".into()));
    }

    #[test]
    fn test_discovery_passthrough() {
        let service = service(ProviderRegistry::new("openai", "gpt-3.5-turbo"));
        let catalog = service.list_providers_and_models();
        assert_eq!(catalog.default_model, "gpt-3.5-turbo");
    }
}
