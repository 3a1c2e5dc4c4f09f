use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use easychat_core_sdk::models::NEW_SESSION_TITLE;
use easychat_core_sdk::{server, telemetry, AppConfig, ChatService};

/**
 * \brief CLI 程序入口：启动服务，或在终端里直接管理会话与对话。
 */
#[derive(Parser, Debug)]
#[command(name = "easychat", version, about = "EasyChat multi-provider chat backend")]
struct Cli {
    /// 配置文件路径，缺省读取当前目录下的 easychat.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 提高日志级别：-v 为 debug，-vv 为 trace
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 启动 HTTP 服务。
     */
    Serve {
        #[arg(long)]
        addr: Option<String>,
    },

    /// 列出全部会话
    Sessions,

    NewSession {
        #[arg(long)]
        title: Option<String>,
    },

    /**
     * \brief 发送一条用户消息并打印模型回复。
     * \param attach 附件路径或 /uploads/ 引用，可重复
     */
    Chat {
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value = "default")]
        session_id: String,
        #[arg(long = "attach")]
        attachments: Vec<String>,
    },

    /// 列出已配置的模型服务与模型
    Models,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).context("load configuration failed")?;
    match cli.verbose {
        0 => {}
        1 => config.logging.level = "debug".to_string(),
        _ => config.logging.level = "trace".to_string(),
    }
    let _log_guard = telemetry::init(&config.logging).context("init logging failed")?;

    match cli.command {
        Commands::Serve { addr } => {
            if let Some(addr) = addr {
                config.bind_addr = addr;
            }
            server::run(config).await?;
        }
        Commands::Sessions => {
            let service = open_service(&config)?;
            for session in service.list_sessions() {
                println!(
                    "{}\t{}\t{}/{}\t{} messages\t{}",
                    session.id,
                    session.title,
                    session.api_provider,
                    session.model,
                    session.messages.len(),
                    session.updated_at
                );
            }
        }
        Commands::NewSession { title } => {
            let service = open_service(&config)?;
            let title = title.unwrap_or_else(|| NEW_SESSION_TITLE.to_string());
            let session = service
                .create_session(&title)
                .context("create session failed")?;
            println!("Created session id={} (title={})", session.id, session.title);
        }
        Commands::Chat {
            prompt,
            session_id,
            attachments,
        } => {
            config.local_attachments = true;
            let service = open_service(&config)?;
            info!(session_id = %session_id, prompt_len = prompt.len(), "cli chat");
            let turn = service
                .chat(&session_id, &prompt, attachments)
                .await
                .context("chat failed")?;
            println!("{}", turn.response.content);
        }
        Commands::Models => {
            let service = open_service(&config)?;
            let catalog = service.list_providers_and_models();
            println!("{}", serde_json::to_string_pretty(&catalog)?);
        }
    }

    Ok(())
}

fn open_service(config: &AppConfig) -> Result<ChatService> {
    ChatService::from_config(config).context("open chat service failed")
}
