//! RentChat SDK 主入口
//!
//! 负责装配各组件：事件路由器、连接管理器、REST 客户端，并暴露
//! 打开会话 / 会话目录 / 各类出站指令的门面方法。宿主应用通常只
//! 与本模块和两个视图模型打交道。

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::commands::{temp_message_id, ClientCommand};
use crate::connection::{ChannelState, ConnectionConfig, ConnectionManager, ReconnectConfig};
use crate::conversation::{ConversationTarget, ConversationViewModel};
use crate::conversation_list::ConversationListViewModel;
use crate::error::{RentChatSDKError, Result};
use crate::events::EventRouter;
use crate::rest::{ChatApi, HttpChatApi, HttpClientConfig};
use crate::session::SessionStore;
use crate::transport::{Connector, WsConnector};
use crate::version::SDK_VERSION;

/// 输入状态配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingConfig {
    /// 指示自动消失时间（秒）- 超过多久没有新事件就认为停止输入
    pub expiry_secs: u64,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self { expiry_secs: 3 }
    }
}

/// RentChat SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RentChatConfig {
    /// REST base URL；消息通道地址由它推导
    pub api_base_url: String,
    /// 建连超时时间（秒）
    pub connect_timeout_secs: u64,
    /// 重连退避配置
    pub reconnect: ReconnectConfig,
    /// 输入状态配置
    pub typing: TypingConfig,
    /// 历史消息 / 会话目录的分页大小
    pub page_size: u32,
    /// HTTP 客户端配置
    pub http: HttpClientConfig,
    /// 调试模式（初始化日志输出）
    pub debug_mode: bool,
}

impl Default for RentChatConfig {
    fn default() -> Self {
        Self {
            api_base_url: String::new(),
            connect_timeout_secs: 10,
            reconnect: ReconnectConfig::default(),
            typing: TypingConfig::default(),
            page_size: 20,
            http: HttpClientConfig::default(),
            debug_mode: false,
        }
    }
}

/// RentChat SDK - 租房平台的实时消息客户端
pub struct RentChatSDK {
    config: RentChatConfig,
    session: Arc<dyn SessionStore>,
    router: Arc<EventRouter>,
    connection: ConnectionManager,
    api: Arc<dyn ChatApi>,
}

impl RentChatSDK {
    /// 初始化 SDK
    pub fn initialize(config: RentChatConfig, session: Arc<dyn SessionStore>) -> Result<Self> {
        if config.debug_mode {
            let _ = tracing_subscriber::fmt()
                .with_max_level(tracing::Level::DEBUG)
                .try_init();
        }
        if config.api_base_url.is_empty() {
            return Err(RentChatSDKError::Config(
                "api_base_url 不能为空".to_string(),
            ));
        }

        let api: Arc<dyn ChatApi> = Arc::new(HttpChatApi::new(
            &config.http,
            config.api_base_url.clone(),
            session.clone(),
        )?);
        let sdk = Self::assemble(config, session, Arc::new(WsConnector), api);
        info!("✅ RentChat SDK v{} 已初始化", SDK_VERSION);
        Ok(sdk)
    }

    /// 用注入的传输与 REST 实现装配（测试用）
    pub(crate) fn assemble(
        config: RentChatConfig,
        session: Arc<dyn SessionStore>,
        connector: Arc<dyn Connector>,
        api: Arc<dyn ChatApi>,
    ) -> Self {
        let router = Arc::new(EventRouter::new());
        let connection = ConnectionManager::new(
            ConnectionConfig {
                base_url: config.api_base_url.clone(),
                connect_timeout_secs: config.connect_timeout_secs,
                reconnect: config.reconnect.clone(),
            },
            session.clone(),
            router.clone(),
            connector,
        );
        Self {
            config,
            session,
            router,
            connection,
            api,
        }
    }

    /// 打开消息通道（幂等）
    pub fn connect(&self) -> bool {
        self.connection.open()
    }

    /// 关闭消息通道并取消所有重连排程
    pub fn disconnect(&self) {
        self.connection.close();
    }

    pub fn connection_state(&self) -> ChannelState {
        self.connection.state()
    }

    /// 事件路由器（UI 层订阅连接状态横幅等）
    pub fn events(&self) -> Arc<EventRouter> {
        self.router.clone()
    }

    /// 打开一个会话
    pub fn open_conversation(&self, target: ConversationTarget) -> ConversationViewModel {
        let viewer_id = self.session.user_id().unwrap_or_default();
        ConversationViewModel::open(
            target,
            viewer_id,
            self.api.clone(),
            self.connection.clone(),
            &self.router,
            self.config.page_size,
            Duration::from_secs(self.config.typing.expiry_secs),
        )
    }

    /// 打开会话目录
    pub fn conversation_list(&self) -> ConversationListViewModel {
        let viewer_id = self.session.user_id().unwrap_or_default();
        ConversationListViewModel::open(
            viewer_id,
            self.api.clone(),
            &self.router,
            self.config.page_size,
        )
    }

    /// 给尚无会话的对象发首条消息（服务端隐式建会话）
    pub fn send_first_message(
        &self,
        participant_ids: Vec<String>,
        is_group: bool,
        content: impl Into<String>,
    ) -> bool {
        let command = ClientCommand::message_new_conversation(
            participant_ids,
            is_group,
            content,
            temp_message_id(),
        );
        self.connection.send(&command)
    }

    /// 编辑消息（尽力而为）
    pub fn edit_message(&self, message_id: impl Into<String>, content: impl Into<String>) -> bool {
        self.connection.send(&ClientCommand::EditMessage {
            message_id: message_id.into(),
            content: content.into(),
        })
    }

    /// 删除消息（尽力而为）
    pub fn delete_message(
        &self,
        conversation_id: impl Into<String>,
        message_id: impl Into<String>,
    ) -> bool {
        self.connection.send(&ClientCommand::DeleteMessage {
            conversation_id: conversation_id.into(),
            message_id: message_id.into(),
        })
    }

    /// 拉黑用户
    pub fn block_user(&self, user_id: impl Into<String>) -> bool {
        self.connection.send(&ClientCommand::BlockUser {
            user_id: user_id.into(),
        })
    }

    /// 解除拉黑
    pub fn unblock_user(&self, user_id: impl Into<String>) -> bool {
        self.connection.send(&ClientCommand::UnblockUser {
            user_id: user_id.into(),
        })
    }

    /// SDK 版本号
    pub fn version(&self) -> &'static str {
        SDK_VERSION
    }
}
