use std::fmt;

use serde::{Deserialize, Serialize};
use time::{macros::format_description, OffsetDateTime};
use tracing::warn;

/** \brief 默认会话的固定 ID。 */
pub const DEFAULT_SESSION_ID: &str = "default";
/** \brief 默认会话标题。 */
pub const DEFAULT_SESSION_TITLE: &str = "默认对话";
/** \brief 新建会话未指定标题时使用的标题。 */
pub const NEW_SESSION_TITLE: &str = "新对话";

const AUTO_TITLE_CHARS: usize = 10;

/**
 * \brief 消息角色。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/**
 * \brief 会话中的一条消息，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /** \brief 角色：user/assistant */
    pub role: Role,
    /** \brief 内容 */
    pub content: String,
    /** \brief 创建时间（ISO-8601） */
    pub timestamp: String,
    /** \brief 附件引用（上传后的 URL 或本地路径），保持原始顺序。 */
    #[serde(default, alias = "file_urls", deserialize_with = "nullable_list")]
    pub attachments: Vec<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: now_timestamp(),
            attachments: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_attachments(mut self, attachments: Vec<String>) -> Self {
        self.attachments = attachments;
        self
    }
}

/**
 * \brief 聊天会话：有序消息列表加上模型服务选择。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    pub created_at: String,
    pub updated_at: String,
    pub model: String,
    pub api_provider: String,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        model: impl Into<String>,
        api_provider: impl Into<String>,
    ) -> Self {
        let now = now_timestamp();
        Self {
            id: id.into(),
            title: title.into(),
            messages: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
            model: model.into(),
            api_provider: api_provider.into(),
        }
    }

    /**
     * \brief 刷新 updated_at，保证不会倒退。
     */
    pub fn touch(&mut self) {
        let now = now_timestamp();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    /**
     * \brief 按补丁更新元数据，未提供的字段保持不变。
     */
    pub fn apply(&mut self, patch: &SessionPatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(model) = &patch.model {
            self.model = model.clone();
        }
        if let Some(api_provider) = &patch.api_provider {
            self.api_provider = api_provider.clone();
        }
    }
}

/**
 * \brief 会话元数据的部分更新。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_provider: Option<String>,
}

impl SessionPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }
}

/**
 * \brief 由首条消息推导会话标题：前 10 个字符，超出部分以 "..." 表示。
 */
pub fn derive_title(content: &str) -> String {
    if content.chars().count() > AUTO_TITLE_CHARS {
        let head: String = content.chars().take(AUTO_TITLE_CHARS).collect();
        format!("{}...", head)
    } else {
        content.to_string()
    }
}

/**
 * \brief 当前 UTC 时间，定宽微秒精度，字典序即时间序。
 */
pub fn now_timestamp() -> String {
    let now = OffsetDateTime::now_utc();
    let format = format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
    );
    now.format(format).unwrap_or_else(|err| {
        warn!(error = %err, "timestamp formatting failed");
        now.unix_timestamp().to_string()
    })
}

fn nullable_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}
