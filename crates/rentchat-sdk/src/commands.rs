//! 出站指令编码
//!
//! 通道上双向传输的都是带 `type` 判别字段的 JSON 对象。本模块把类型化的
//! 客户端指令映射为待发送的信封，不做任何网络或状态副作用；真正的发送
//! 由 `ConnectionManager::send` 负责。
//!
//! 聊天消息有两种形态：会话已存在时带 `conversation_id`；首次私聊/建群时
//! 带 `new_conversation: true` + 参与者列表 + 群聊标记，由服务端隐式建会话。
//! 调用方根据是否已知会话 ID 选择形态。

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use serde::Serialize;

use crate::error::Result;

/// 消息指令的目标形态
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MessageTarget {
    /// 已有会话
    Existing { conversation_id: String },
    /// 请求服务端隐式创建会话
    New {
        new_conversation: bool,
        participant_ids: Vec<String>,
        is_group: bool,
    },
}

/// 客户端出站指令
///
/// 序列化后即为线上信封，`type` 字段取变体的 snake_case 名。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    Message {
        #[serde(flatten)]
        target: MessageTarget,
        content: String,
        /// 乐观消息的临时 ID，服务端会在 message_sent 里原样回传
        temp_id: String,
    },
    ReadReceipt {
        conversation_id: String,
        message_id: String,
    },
    Typing {
        recipient_ids: Vec<String>,
        is_group: bool,
    },
    OpenConversation {
        conversation_id: String,
        is_group: bool,
    },
    CloseConversation {
        conversation_id: String,
    },
    EditMessage {
        message_id: String,
        content: String,
    },
    DeleteMessage {
        conversation_id: String,
        message_id: String,
    },
    BlockUser {
        user_id: String,
    },
    UnblockUser {
        user_id: String,
    },
}

impl ClientCommand {
    /// 向已有会话发消息
    pub fn message(conversation_id: impl Into<String>, content: impl Into<String>, temp_id: impl Into<String>) -> Self {
        ClientCommand::Message {
            target: MessageTarget::Existing {
                conversation_id: conversation_id.into(),
            },
            content: content.into(),
            temp_id: temp_id.into(),
        }
    }

    /// 发消息并请求隐式创建会话
    pub fn message_new_conversation(
        participant_ids: Vec<String>,
        is_group: bool,
        content: impl Into<String>,
        temp_id: impl Into<String>,
    ) -> Self {
        ClientCommand::Message {
            target: MessageTarget::New {
                new_conversation: true,
                participant_ids,
                is_group,
            },
            content: content.into(),
            temp_id: temp_id.into(),
        }
    }

    /// 编码为线上 JSON 信封
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

static LAST_TEMP_MS: AtomicI64 = AtomicI64::new(0);

/// 生成乐观消息的临时 ID（`temp-<毫秒时间戳>`）
///
/// 同一进程内保证严格递增，同一毫秒内连发也不会撞号。
pub fn temp_message_id() -> String {
    let now = Utc::now().timestamp_millis();
    let mut candidate = now;
    loop {
        let prev = LAST_TEMP_MS.load(Ordering::SeqCst);
        if candidate <= prev {
            candidate = prev + 1;
        }
        if LAST_TEMP_MS
            .compare_exchange(prev, candidate, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return format!("temp-{}", candidate);
        }
    }
}
