//! REST 客户端模块 - 会话列表与历史消息
//!
//! 实时通道只负责增量事件；会话目录、分页历史、发送兜底和用户资料
//! 都走这里的 REST 接口，使用 reqwest 作为底层 HTTP 客户端。
//! 视图模型通过 `ChatApi` trait 消费，测试注入假实现。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RentChatSDKError, Result};
use crate::session::SessionStore;

/// HTTP 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// 连接超时时间（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 请求超时时间（秒）
    pub request_timeout_secs: Option<u64>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: Some(10),
            request_timeout_secs: Some(30),
        }
    }
}

/// 已读回执记录（按 reader 去重）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadReceiptRecord {
    pub reader_id: String,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
}

/// 历史消息记录（服务端按新→旧返回）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub sender_id: String,
    #[serde(default)]
    pub recipient_ids: Vec<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read_receipts: Vec<ReadReceiptRecord>,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

/// 会话目录条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub participant_ids: Vec<String>,
    /// 群聊名称；私聊为空，由调用方按对端用户解析
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
}

/// 用户资料（私聊显示名解析用）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// REST 发送消息请求（通道不可用时的兜底路径）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMessageRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub recipient_ids: Vec<String>,
    pub is_group: bool,
    pub content: String,
}

/// 聊天 REST 接口契约
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// 分页拉取会话目录
    async fn conversations(&self, skip: u32, limit: u32) -> Result<Vec<ConversationSummary>>;

    /// 分页拉取某会话的历史消息，新→旧
    async fn message_history(
        &self,
        conversation_id: &str,
        is_group: bool,
        skip: u32,
        limit: u32,
    ) -> Result<Vec<MessageRecord>>;

    /// 通过 REST 创建消息（发送兜底）
    async fn create_message(&self, request: &CreateMessageRequest) -> Result<MessageRecord>;

    /// 按 ID 查用户
    async fn user(&self, user_id: &str) -> Result<UserProfile>;
}

/// reqwest 实现
pub struct HttpChatApi {
    client: Client,
    base_url: String,
    session: Arc<dyn SessionStore>,
}

impl HttpChatApi {
    pub fn new(
        config: &HttpClientConfig,
        base_url: impl Into<String>,
        session: Arc<dyn SessionStore>,
    ) -> Result<Self> {
        let mut builder = Client::builder();

        if let Some(timeout) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }
        if let Some(timeout) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }

        let client = builder
            .build()
            .map_err(|e| RentChatSDKError::Other(format!("创建 HTTP 客户端失败: {}", e)))?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        info!("✅ 聊天 REST 客户端已创建 (base_url: {})", base_url);

        Ok(Self {
            client,
            base_url,
            session,
        })
    }

    fn token(&self) -> Result<String> {
        self.session.token().ok_or(RentChatSDKError::AuthMissing)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn conversations(&self, skip: u32, limit: u32) -> Result<Vec<ConversationSummary>> {
        let token = self.token()?;
        let response = self
            .client
            .get(self.url("/api/v1/messages/conversations"))
            .bearer_auth(token)
            .query(&[("skip", skip), ("limit", limit)])
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn message_history(
        &self,
        conversation_id: &str,
        is_group: bool,
        skip: u32,
        limit: u32,
    ) -> Result<Vec<MessageRecord>> {
        let token = self.token()?;
        let response = self
            .client
            .get(self.url(&format!("/api/v1/messages/history/{}", conversation_id)))
            .bearer_auth(token)
            .query(&[
                ("is_group", is_group.to_string()),
                ("skip", skip.to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn create_message(&self, request: &CreateMessageRequest) -> Result<MessageRecord> {
        let token = self.token()?;
        let response = self
            .client
            .post(self.url("/api/v1/messages"))
            .bearer_auth(token)
            .json(request)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn user(&self, user_id: &str) -> Result<UserProfile> {
        let token = self.token()?;
        let response = self
            .client
            .get(self.url(&format!("/api/v1/users/{}", user_id)))
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}
