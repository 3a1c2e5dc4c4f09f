use thiserror::Error;

/**
 * \brief 核心层错误分类。
 */
#[derive(Debug, Error)]
pub enum ChatError {
    /** \brief 会话不存在或消息下标越界。 */
    #[error("not found: {0}")]
    NotFound(String),

    /** \brief 没有可用的模型服务凭据。 */
    #[error("no usable provider configured: {0}")]
    Unconfigured(String),

    /** \brief 模型服务调用失败（网络、鉴权、限流、响应格式等）。 */
    #[error("provider call failed: {0}")]
    ProviderCallFailed(String),

    /** \brief 存储读写失败。 */
    #[error("persistence failed: {0}")]
    PersistenceFailed(String),
}

impl ChatError {
    pub fn session_not_found(id: &str) -> Self {
        ChatError::NotFound(format!("session {}", id))
    }

    pub fn message_not_found(id: &str, index: usize) -> Self {
        ChatError::NotFound(format!("message #{} in session {}", index, id))
    }

    pub fn persistence(err: anyhow::Error) -> Self {
        ChatError::PersistenceFailed(format!("{:#}", err))
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
