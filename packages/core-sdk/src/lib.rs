pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod models;
pub mod payload;
pub mod providers;
pub mod server;
pub mod session;
pub mod telemetry;

pub use chat::{ChatService, ChatTurn};
pub use config::AppConfig;
pub use error::ChatError;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::chat::{ChatService, ChatTurn};
    pub use crate::config::AppConfig;
    pub use crate::error::ChatError;
    pub use crate::models::{Message, Role, Session, SessionPatch};
    pub use crate::{config, server, telemetry};
}
