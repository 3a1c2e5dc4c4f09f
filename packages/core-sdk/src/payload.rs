use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::Engine;
use serde::Serialize;
use tracing::warn;
use url::Url;

use crate::models::{Message, Role};

/** \brief 上传文件对外暴露的 URL 前缀。 */
pub const UPLOADS_PREFIX: &str = "/uploads/";

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "gif", "webp"];

/**
 * \brief 发送给模型服务的一条消息。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayloadMessage {
    pub role: Role,
    pub content: PayloadContent,
}

/**
 * \brief 纯文本，或文本加图片的多段内容。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PayloadContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

/**
 * \brief 把附件引用解析为本地文件路径。
 * \details `/uploads/<name>` 与 `http(s)://host/uploads/<name>` 映射到上传目录（只取文件名部分）。
 * 本地路径与 `file://` 引用仅在 with_local_paths(true) 时解析，否则视为无法解析。
 */
#[derive(Debug, Clone)]
pub struct AttachmentResolver {
    upload_dir: PathBuf,
    allow_local_paths: bool,
}

impl AttachmentResolver {
    pub fn new(upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            allow_local_paths: false,
        }
    }

    pub fn with_local_paths(mut self, allow: bool) -> Self {
        self.allow_local_paths = allow;
        self
    }

    pub fn resolve(&self, reference: &str) -> Option<PathBuf> {
        let reference = reference.trim();
        if reference.is_empty() {
            return None;
        }
        if let Ok(url) = Url::parse(reference) {
            return match url.scheme() {
                "http" | "https" => self.uploaded_file(url.path()),
                "file" if self.allow_local_paths => url.to_file_path().ok(),
                _ => None,
            };
        }
        self.uploaded_file(reference).or_else(|| {
            self.allow_local_paths
                .then(|| PathBuf::from(reference))
        })
    }

    fn uploaded_file(&self, path: &str) -> Option<PathBuf> {
        let name = path.strip_prefix(UPLOADS_PREFIX)?;
        let file_name = Path::new(name).file_name()?;
        Some(self.upload_dir.join(file_name))
    }
}

fn image_mime(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if !IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        return None;
    }
    Some(match ext.as_str() {
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "image/jpeg",
    })
}

async fn encode_image(path: &Path, mime: &str) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("read {}", path.display()))?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
    Ok(format!("data:{};base64,{}", mime, encoded))
}

/**
 * \brief 将会话历史转换为模型服务的消息数组。
 * \details 附件处理尽力而为：图片内联为 base64 data URI，失败或非图片附件以方括号注记追加到文本段，不会中断整条消息。
 */
pub async fn build_payload(
    messages: &[Message],
    resolver: &AttachmentResolver,
) -> Vec<PayloadMessage> {
    let mut payload = Vec::with_capacity(messages.len());
    for message in messages {
        payload.push(build_message(message, resolver).await);
    }
    payload
}

async fn build_message(message: &Message, resolver: &AttachmentResolver) -> PayloadMessage {
    if message.attachments.is_empty() {
        return PayloadMessage {
            role: message.role,
            content: PayloadContent::Text(message.content.clone()),
        };
    }

    let mut text = message.content.clone();
    let mut images = Vec::new();
    for reference in &message.attachments {
        let target = resolver
            .resolve(reference)
            .and_then(|path| image_mime(&path).map(|mime| (path, mime)));
        match target {
            Some((path, mime)) => match encode_image(&path, mime).await {
                Ok(url) => images.push(ContentPart::ImageUrl {
                    image_url: ImageUrl { url },
                }),
                Err(err) => {
                    warn!(attachment = %reference, error = %err, "attachment could not be inlined");
                    text.push_str(&format!("\n[failed to process file {}: {:#}]", reference, err));
                }
            },
            None => text.push_str(&format!("\n[uploaded file: {}]", reference)),
        }
    }

    let mut parts = Vec::with_capacity(images.len() + 1);
    parts.push(ContentPart::Text { text });
    parts.extend(images);
    PayloadMessage {
        role: message.role,
        content: PayloadContent::Parts(parts),
    }
}
