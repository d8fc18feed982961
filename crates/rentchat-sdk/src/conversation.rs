//! 打开中会话的视图模型
//!
//! 功能包括：
//! - 分页加载历史消息（REST 返回新→旧，这里倒序成时间线）
//! - 乐观发送与 message_sent 确认的临时 ID 对账
//! - 已读回执按 reader 去重、输入状态 3 秒过期
//! - 把实时事件按会话范围过滤后合并进本地消息序列
//!
//! REST 响应和实时事件的到达顺序没有任何保证，这里的对账规则
//! （临时 ID 匹配、回执去重、按 ID 幂等追加）保证任意交错下合并结果一致。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::commands::{temp_message_id, ClientCommand};
use crate::connection::ConnectionManager;
use crate::error::{RentChatSDKError, Result};
use crate::events::{EventRouter, ServerEvent, Subscription};
use crate::rest::{ChatApi, CreateMessageRequest, MessageRecord, ReadReceiptRecord};

/// 消息的投递状态（从查看者视角）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    /// 通道和 REST 兜底都失败的终态，不再自动重试
    Failed,
}

/// 展示用消息
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayMessage {
    /// 服务端 ID；确认前是 `temp-` 前缀的临时 ID
    pub id: String,
    pub sender_id: String,
    pub recipient_ids: Vec<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    /// 按 reader 去重的回执集合
    pub read_receipts: Vec<ReadReceiptRecord>,
    pub is_from_me: bool,
}

/// 会话标识
///
/// 私聊的 conversation_id 就是对端用户 ID，群聊是群 ID。
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationTarget {
    pub conversation_id: String,
    pub is_group: bool,
}

impl ConversationTarget {
    pub fn direct(counterpart_id: impl Into<String>) -> Self {
        Self {
            conversation_id: counterpart_id.into(),
            is_group: false,
        }
    }

    pub fn group(group_id: impl Into<String>) -> Self {
        Self {
            conversation_id: group_id.into(),
            is_group: true,
        }
    }
}

struct VmState {
    messages: Vec<DisplayMessage>,
    offset: u32,
    has_more: bool,
    /// 正在输入的用户 → 过期定时器（重新收到事件时重置窗口）
    typing: HashMap<String, Arc<crate::timer::ResettableTimer>>,
    /// 刷新/关闭时递增；迟到的历史响应按代次丢弃
    generation: u64,
    closed: bool,
}

struct VmInner {
    target: ConversationTarget,
    viewer_id: String,
    api: Arc<dyn ChatApi>,
    connection: ConnectionManager,
    page_size: u32,
    typing_expiry: Duration,
    state: Mutex<VmState>,
    subscriptions: Mutex<Vec<Subscription>>,
}

/// 会话视图模型
///
/// 同一时刻只负责一个打开的会话；挂载时订阅事件路由器并发
/// `open_conversation`，卸载（`close`）时全部退订并清空本地状态。
#[derive(Clone)]
pub struct ConversationViewModel {
    inner: Arc<VmInner>,
}

impl ConversationViewModel {
    pub fn open(
        target: ConversationTarget,
        viewer_id: impl Into<String>,
        api: Arc<dyn ChatApi>,
        connection: ConnectionManager,
        router: &Arc<EventRouter>,
        page_size: u32,
        typing_expiry: Duration,
    ) -> Self {
        let inner = Arc::new(VmInner {
            target,
            viewer_id: viewer_id.into(),
            api,
            connection,
            page_size,
            typing_expiry,
            state: Mutex::new(VmState {
                messages: Vec::new(),
                offset: 0,
                has_more: false,
                typing: HashMap::new(),
                generation: 0,
                closed: false,
            }),
            subscriptions: Mutex::new(Vec::new()),
        });

        Self::register(&inner, router);

        // 尽力而为：通道没开也不算错
        let _ = inner.connection.send(&ClientCommand::OpenConversation {
            conversation_id: inner.target.conversation_id.clone(),
            is_group: inner.target.is_group,
        });

        Self { inner }
    }

    fn register(inner: &Arc<VmInner>, router: &Arc<EventRouter>) {
        let mut subscriptions = inner.subscriptions.lock();

        let weak = Arc::downgrade(inner);
        subscriptions.push(router.subscribe("new_message", move |event| {
            let Some(inner) = weak.upgrade() else { return };
            if let ServerEvent::NewMessage {
                message_id,
                sender_id,
                recipient_ids,
                content,
                is_group,
                created_at,
            } = event
            {
                inner.apply_new_message(
                    message_id,
                    sender_id,
                    recipient_ids,
                    content,
                    *is_group,
                    *created_at,
                );
            }
        }));

        let weak = Arc::downgrade(inner);
        subscriptions.push(router.subscribe("message_sent", move |event| {
            let Some(inner) = weak.upgrade() else { return };
            if let ServerEvent::MessageSent {
                message_id,
                temp_id,
                status,
            } = event
            {
                inner.apply_message_sent(message_id, temp_id.as_deref(), *status);
            }
        }));

        let weak = Arc::downgrade(inner);
        subscriptions.push(router.subscribe("read_receipt", move |event| {
            let Some(inner) = weak.upgrade() else { return };
            if let ServerEvent::ReadReceipt {
                message_id,
                reader_id,
                read_at,
                ..
            } = event
            {
                inner.apply_read_receipt(message_id, reader_id, *read_at);
            }
        }));

        let weak = Arc::downgrade(inner);
        subscriptions.push(router.subscribe("typing", move |event| {
            let Some(inner) = weak.upgrade() else { return };
            if let ServerEvent::Typing {
                sender_id,
                recipient_ids,
                is_group,
            } = event
            {
                inner.apply_typing(sender_id, recipient_ids, *is_group);
            }
        }));
    }

    /// 加载一页历史
    ///
    /// `refresh` 时重置偏移并整体替换；分页时把更旧的一页倒序后
    /// 拼到列表头部。每条非本人发出的消息都会补发一条已读回执。
    pub async fn load_page(&self, refresh: bool) -> Result<()> {
        let inner = &self.inner;
        let (skip, generation) = {
            let mut state = inner.state.lock();
            if state.closed {
                return Ok(());
            }
            if refresh {
                state.offset = 0;
                state.generation += 1;
            }
            (state.offset, state.generation)
        };

        let page = inner
            .api
            .message_history(
                &inner.target.conversation_id,
                inner.target.is_group,
                skip,
                inner.page_size,
            )
            .await?;

        let mut acks = Vec::new();
        {
            let mut state = inner.state.lock();
            if state.closed || state.generation != generation {
                debug!("会话已关闭或已刷新，丢弃过期的历史页");
                return Ok(());
            }
            for record in &page {
                if record.sender_id != inner.viewer_id {
                    acks.push(record.id.clone());
                }
            }
            let fetched = page.len() as u32;
            // 服务端新→旧，倒序成时间线
            let display: Vec<DisplayMessage> = page
                .into_iter()
                .rev()
                .map(|record| inner.display_from_record(record))
                .collect();
            if refresh {
                state.messages = display;
            } else {
                let mut merged = display;
                merged.append(&mut state.messages);
                state.messages = merged;
            }
            state.offset += fetched;
            state.has_more = fetched == inner.page_size;
        }

        for message_id in acks {
            let _ = inner.connection.send(&ClientCommand::ReadReceipt {
                conversation_id: inner.target.conversation_id.clone(),
                message_id,
            });
        }
        Ok(())
    }

    /// 发送一条消息
    ///
    /// 先落一条 `sending` 状态的乐观消息；通道可用时等 `message_sent`
    /// 确认升级状态，不可用时走一次 REST 兜底并刷新历史。兜底也失败
    /// 则把乐观条目置为 `failed` 终态，此后不再自动重试。
    pub async fn send_message(&self, content: impl Into<String>) -> Result<()> {
        let content = content.into();
        let inner = &self.inner;
        let temp_id = temp_message_id();
        {
            let mut state = inner.state.lock();
            if state.closed {
                return Err(RentChatSDKError::InvalidArgument(
                    "conversation is closed".to_string(),
                ));
            }
            state.messages.push(DisplayMessage {
                id: temp_id.clone(),
                sender_id: inner.viewer_id.clone(),
                recipient_ids: vec![inner.target.conversation_id.clone()],
                content: content.clone(),
                created_at: Utc::now(),
                status: DeliveryStatus::Sending,
                read_receipts: Vec::new(),
                is_from_me: true,
            });
        }

        let command = ClientCommand::message(
            inner.target.conversation_id.as_str(),
            content.as_str(),
            temp_id.as_str(),
        );
        if inner.connection.send(&command) {
            return Ok(());
        }

        debug!("通道不可用，消息回退到 REST 发送");
        let request = CreateMessageRequest {
            conversation_id: Some(inner.target.conversation_id.clone()),
            recipient_ids: vec![inner.target.conversation_id.clone()],
            is_group: inner.target.is_group,
            content,
        };
        match inner.api.create_message(&request).await {
            Ok(_) => {
                // REST 已落库，刷新让服务端副本取代乐观条目
                self.load_page(true).await
            }
            Err(e) => {
                warn!("REST 兜底发送失败: {}", e);
                let mut state = inner.state.lock();
                if let Some(message) = state.messages.iter_mut().find(|m| m.id == temp_id) {
                    message.status = DeliveryStatus::Failed;
                }
                Err(e)
            }
        }
    }

    /// 通知对端"正在输入"（尽力而为）
    pub fn notify_typing(&self) -> bool {
        self.inner.connection.send(&ClientCommand::Typing {
            recipient_ids: vec![self.inner.target.conversation_id.clone()],
            is_group: self.inner.target.is_group,
        })
    }

    /// 卸载：退订全部事件、清空本地消息与输入状态、发 close_conversation
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.generation += 1;
            state.messages.clear();
            state.has_more = false;
            for (_, timer) in state.typing.drain() {
                timer.cancel();
            }
        }
        for subscription in self.inner.subscriptions.lock().drain(..) {
            subscription.unsubscribe();
        }
        let _ = self.inner.connection.send(&ClientCommand::CloseConversation {
            conversation_id: self.inner.target.conversation_id.clone(),
        });
    }

    /// 当前消息序列（时间线顺序）
    pub fn messages(&self) -> Vec<DisplayMessage> {
        self.inner.state.lock().messages.clone()
    }

    /// 正在输入的用户
    pub fn typing_users(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        let mut users: Vec<String> = state.typing.keys().cloned().collect();
        users.sort();
        users
    }

    pub fn has_more(&self) -> bool {
        self.inner.state.lock().has_more
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

impl VmInner {
    /// 事件是否属于当前会话
    ///
    /// 私聊：发送方是对端，或本人发给对端（多端同步）；
    /// 群聊：带群标记且接收集合包含会话 ID。
    fn event_in_scope(&self, sender_id: &str, recipient_ids: &[String], is_group: bool) -> bool {
        if self.target.is_group {
            is_group
                && recipient_ids
                    .iter()
                    .any(|r| r == &self.target.conversation_id)
        } else {
            !is_group
                && (sender_id == self.target.conversation_id
                    || (sender_id == self.viewer_id
                        && recipient_ids
                            .iter()
                            .any(|r| r == &self.target.conversation_id)))
        }
    }

    fn display_from_record(&self, record: MessageRecord) -> DisplayMessage {
        let is_from_me = record.sender_id == self.viewer_id;
        // 别人的消息对查看者而言一律已读；自己的看是否有回执
        let status = if !is_from_me || !record.read_receipts.is_empty() {
            DeliveryStatus::Read
        } else {
            DeliveryStatus::Delivered
        };
        DisplayMessage {
            id: record.id,
            sender_id: record.sender_id,
            recipient_ids: record.recipient_ids,
            content: record.content,
            created_at: record.created_at,
            status,
            read_receipts: record.read_receipts,
            is_from_me,
        }
    }

    fn apply_new_message(
        self: &Arc<Self>,
        message_id: &str,
        sender_id: &str,
        recipient_ids: &[String],
        content: &str,
        is_group: bool,
        created_at: Option<DateTime<Utc>>,
    ) {
        if !self.event_in_scope(sender_id, recipient_ids, is_group) {
            return;
        }
        let is_from_me = sender_id == self.viewer_id;
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            if state.messages.iter().any(|m| m.id == message_id) {
                return;
            }
            state.messages.push(DisplayMessage {
                id: message_id.to_string(),
                sender_id: sender_id.to_string(),
                recipient_ids: recipient_ids.to_vec(),
                content: content.to_string(),
                created_at: created_at.unwrap_or_else(Utc::now),
                status: DeliveryStatus::Delivered,
                read_receipts: Vec::new(),
                is_from_me,
            });
        }
        // 查看者正盯着会话，立即回执
        if !is_from_me {
            let _ = self.connection.send(&ClientCommand::ReadReceipt {
                conversation_id: self.target.conversation_id.clone(),
                message_id: message_id.to_string(),
            });
        }
    }

    fn apply_message_sent(
        &self,
        message_id: &str,
        temp_id: Option<&str>,
        status: Option<DeliveryStatus>,
    ) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        let index = temp_id
            .and_then(|t| state.messages.iter().position(|m| m.id == t))
            .or_else(|| state.messages.iter().position(|m| m.id == message_id));
        match index {
            Some(index) => {
                let message = &mut state.messages[index];
                message.id = message_id.to_string();
                message.status = status.unwrap_or(DeliveryStatus::Sent);
            }
            None => {
                // 多半是其他端发的消息确认，历史刷新会覆盖
                debug!("message_sent 未匹配到本地消息: {}", message_id);
            }
        }
    }

    fn apply_read_receipt(
        &self,
        message_id: &str,
        reader_id: &str,
        read_at: Option<DateTime<Utc>>,
    ) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        let Some(message) = state.messages.iter_mut().find(|m| m.id == message_id) else {
            return;
        };
        if message
            .read_receipts
            .iter()
            .any(|r| r.reader_id == reader_id)
        {
            return;
        }
        message.read_receipts.push(ReadReceiptRecord {
            reader_id: reader_id.to_string(),
            read_at,
        });
        message.status = DeliveryStatus::Read;
    }

    fn apply_typing(self: &Arc<Self>, sender_id: &str, recipient_ids: &[String], is_group: bool) {
        if sender_id == self.viewer_id {
            return;
        }
        if !self.event_in_scope(sender_id, recipient_ids, is_group) {
            return;
        }
        let timer = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state
                .typing
                .entry(sender_id.to_string())
                .or_insert_with(|| Arc::new(crate::timer::ResettableTimer::new()))
                .clone()
        };
        // 重复事件重置 3 秒窗口：旧排程被取代，不会提前清掉刷新后的指示
        let weak = Arc::downgrade(self);
        let sender = sender_id.to_string();
        timer.arm(self.typing_expiry, move || {
            if let Some(inner) = weak.upgrade() {
                inner.state.lock().typing.remove(&sender);
            }
        });
    }
}
