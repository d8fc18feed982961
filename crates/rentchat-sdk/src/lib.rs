//! RentChat SDK - 租房平台的实时消息客户端
//!
//! 本 SDK 提供租房应用内聊天所需的完整客户端能力，包括：
//! - 🔗 单例消息通道：URL 令牌认证、连接超时、指数退避自动重连
//! - 📡 事件路由：按类型订阅入站事件，支持 `"all"` 通配与退订安全
//! - 💬 会话视图模型：分页历史、乐观发送与临时 ID 对账、REST 兜底
//! - ✅ 已读回执按 reader 去重，输入状态指示 3 秒自动过期
//! - 🗂 会话目录：未读数、最后消息预览、私聊显示名解析
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rentchat_sdk::{ConversationTarget, MemorySession, RentChatConfig, RentChatSDK};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 登录态由宿主应用写入
//!     let session = Arc::new(MemorySession::new());
//!     session.sign_in("user-1", "bearer-token");
//!
//!     let config = RentChatConfig {
//!         api_base_url: "https://housing.example.com".to_string(),
//!         ..Default::default()
//!     };
//!     let sdk = RentChatSDK::initialize(config, session)?;
//!
//!     // 打开消息通道（断线自动重连）
//!     sdk.connect();
//!
//!     // 打开和房东的会话
//!     let conversation = sdk.open_conversation(ConversationTarget::direct("landlord-42"));
//!     conversation.load_page(true).await?;
//!     conversation.send_message("你好，房子还在出租吗？").await?;
//!
//!     conversation.close();
//!     sdk.disconnect();
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod commands;
pub mod connection;
pub mod conversation;
pub mod conversation_list;
pub mod error;
pub mod events;
pub mod rest;
pub mod sdk;
pub mod session;
pub mod timer;
pub mod transport;
pub mod version;

// 重新导出核心类型，方便使用
pub use commands::{temp_message_id, ClientCommand, MessageTarget};
pub use connection::{ChannelState, ConnectionConfig, ConnectionManager, ReconnectConfig};
pub use conversation::{
    ConversationTarget, ConversationViewModel, DeliveryStatus, DisplayMessage,
};
pub use conversation_list::ConversationListViewModel;
pub use error::{RentChatSDKError, Result};
pub use events::{EventRouter, ServerEvent, Subscription, WILDCARD};
pub use rest::{
    ChatApi, ConversationSummary, CreateMessageRequest, HttpChatApi, HttpClientConfig,
    MessageRecord, ReadReceiptRecord, UserProfile,
};
pub use sdk::{RentChatConfig, RentChatSDK, TypingConfig};
pub use session::{MemorySession, SessionStore};
pub use timer::ResettableTimer;
pub use transport::{
    websocket_endpoint, Connector, Frame, FrameSink, FrameStream, WsConnector, CLOSE_ABNORMAL,
    CLOSE_NORMAL, CLOSE_POLICY_VIOLATION,
};
pub use version::SDK_VERSION;
