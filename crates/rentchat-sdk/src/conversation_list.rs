//! 会话目录视图模型
//!
//! 分页拉取会话列表（未读数、最后一条消息预览、参与者），并把
//! `new_message` / `conversation_updated` 实时事件合并进目录：
//! 未读数自增、预览更新、活跃会话置顶。私聊显示名按需查用户资料。

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::events::{EventRouter, ServerEvent, Subscription};
use crate::rest::{ChatApi, ConversationSummary};

struct ListState {
    conversations: Vec<ConversationSummary>,
    offset: u32,
    has_more: bool,
    generation: u64,
    closed: bool,
}

struct ListInner {
    viewer_id: String,
    api: Arc<dyn ChatApi>,
    page_size: u32,
    state: Mutex<ListState>,
    subscriptions: Mutex<Vec<Subscription>>,
}

/// 会话目录
#[derive(Clone)]
pub struct ConversationListViewModel {
    inner: Arc<ListInner>,
}

impl ConversationListViewModel {
    pub fn open(
        viewer_id: impl Into<String>,
        api: Arc<dyn ChatApi>,
        router: &Arc<EventRouter>,
        page_size: u32,
    ) -> Self {
        let inner = Arc::new(ListInner {
            viewer_id: viewer_id.into(),
            api,
            page_size,
            state: Mutex::new(ListState {
                conversations: Vec::new(),
                offset: 0,
                has_more: false,
                generation: 0,
                closed: false,
            }),
            subscriptions: Mutex::new(Vec::new()),
        });

        let mut subscriptions = inner.subscriptions.lock();

        let weak = Arc::downgrade(&inner);
        subscriptions.push(router.subscribe("new_message", move |event| {
            let Some(inner) = weak.upgrade() else { return };
            if let ServerEvent::NewMessage {
                sender_id,
                recipient_ids,
                content,
                is_group,
                ..
            } = event
            {
                inner.apply_new_message(sender_id, recipient_ids, content, *is_group);
            }
        }));

        let weak = Arc::downgrade(&inner);
        subscriptions.push(router.subscribe("conversation_updated", move |event| {
            let Some(inner) = weak.upgrade() else { return };
            if let ServerEvent::ConversationUpdated {
                conversation_id,
                last_message,
                last_message_at,
                unread_count,
            } = event
            {
                inner.apply_conversation_updated(
                    conversation_id,
                    last_message.clone(),
                    *last_message_at,
                    *unread_count,
                );
            }
        }));

        drop(subscriptions);
        Self { inner }
    }

    /// 加载一页会话目录
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

        let page = inner.api.conversations(skip, inner.page_size).await?;

        let mut state = inner.state.lock();
        if state.closed || state.generation != generation {
            debug!("目录已关闭或已刷新，丢弃过期的会话页");
            return Ok(());
        }
        let fetched = page.len() as u32;
        if refresh {
            state.conversations = page;
        } else {
            state.conversations.extend(page);
        }
        state.offset += fetched;
        state.has_more = fetched == inner.page_size;
        Ok(())
    }

    /// 解析某个会话的显示名
    ///
    /// 群聊用自身名称；私聊查对端用户资料，查不到时退回用户 ID。
    pub async fn resolve_display_name(&self, conversation_id: &str) -> Result<String> {
        let (is_group, display_name, counterpart) = {
            let state = self.inner.state.lock();
            let Some(summary) = state
                .conversations
                .iter()
                .find(|c| c.conversation_id == conversation_id)
            else {
                return Ok(conversation_id.to_string());
            };
            let counterpart = summary
                .participant_ids
                .iter()
                .find(|p| *p != &self.inner.viewer_id)
                .cloned()
                .unwrap_or_else(|| summary.conversation_id.clone());
            (summary.is_group, summary.display_name.clone(), counterpart)
        };

        if is_group {
            return Ok(display_name.unwrap_or_else(|| conversation_id.to_string()));
        }
        if let Some(name) = display_name {
            return Ok(name);
        }
        let profile = self.inner.api.user(&counterpart).await?;
        Ok(profile.display_name.unwrap_or(profile.id))
    }

    pub fn conversations(&self) -> Vec<ConversationSummary> {
        self.inner.state.lock().conversations.clone()
    }

    pub fn has_more(&self) -> bool {
        self.inner.state.lock().has_more
    }

    /// 卸载：退订并清空
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.generation += 1;
            state.conversations.clear();
            state.has_more = false;
        }
        for subscription in self.inner.subscriptions.lock().drain(..) {
            subscription.unsubscribe();
        }
    }
}

impl ListInner {
    /// 新消息落到哪个会话条目
    fn conversation_key(
        &self,
        sender_id: &str,
        recipient_ids: &[String],
        is_group: bool,
    ) -> Option<String> {
        if is_group {
            recipient_ids.first().cloned()
        } else if sender_id == self.viewer_id {
            recipient_ids.first().cloned()
        } else {
            Some(sender_id.to_string())
        }
    }

    fn apply_new_message(
        &self,
        sender_id: &str,
        recipient_ids: &[String],
        content: &str,
        is_group: bool,
    ) {
        let Some(key) = self.conversation_key(sender_id, recipient_ids, is_group) else {
            return;
        };
        let from_me = sender_id == self.viewer_id;

        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        let index = state
            .conversations
            .iter()
            .position(|c| c.conversation_id == key);
        match index {
            Some(index) => {
                let mut summary = state.conversations.remove(index);
                if !from_me {
                    summary.unread_count += 1;
                }
                summary.last_message = Some(content.to_string());
                summary.last_message_at = Some(Utc::now());
                // 活跃会话置顶
                state.conversations.insert(0, summary);
            }
            None => {
                state.conversations.insert(
                    0,
                    ConversationSummary {
                        conversation_id: key,
                        is_group,
                        participant_ids: vec![sender_id.to_string()],
                        display_name: None,
                        unread_count: if from_me { 0 } else { 1 },
                        last_message: Some(content.to_string()),
                        last_message_at: Some(Utc::now()),
                    },
                );
            }
        }
    }

    fn apply_conversation_updated(
        &self,
        conversation_id: &str,
        last_message: Option<String>,
        last_message_at: Option<chrono::DateTime<Utc>>,
        unread_count: Option<u32>,
    ) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        if let Some(summary) = state
            .conversations
            .iter_mut()
            .find(|c| c.conversation_id == conversation_id)
        {
            if let Some(unread) = unread_count {
                summary.unread_count = unread;
            }
            if last_message.is_some() {
                summary.last_message = last_message;
            }
            if last_message_at.is_some() {
                summary.last_message_at = last_message_at;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::test_support::FakeChatApi;
    use crate::rest::UserProfile;

    fn summary(id: &str, is_group: bool, participants: Vec<&str>) -> ConversationSummary {
        ConversationSummary {
            conversation_id: id.to_string(),
            is_group,
            participant_ids: participants.into_iter().map(String::from).collect(),
            display_name: None,
            unread_count: 0,
            last_message: None,
            last_message_at: None,
        }
    }

    fn new_message(sender: &str, recipients: Vec<&str>, content: &str, is_group: bool) -> ServerEvent {
        ServerEvent::NewMessage {
            message_id: "m".to_string(),
            sender_id: sender.to_string(),
            recipient_ids: recipients.into_iter().map(String::from).collect(),
            content: content.to_string(),
            is_group,
            created_at: None,
        }
    }

    #[tokio::test]
    async fn test_load_page_pagination() {
        let api = FakeChatApi::new();
        let router = Arc::new(EventRouter::new());
        let list = ConversationListViewModel::open("user-1", api.clone(), &router, 2);

        api.push_conversation_page(vec![
            summary("user-2", false, vec!["user-1", "user-2"]),
            summary("group-7", true, vec!["user-1", "user-3", "user-4"]),
        ]);
        api.push_conversation_page(vec![summary("user-5", false, vec!["user-1", "user-5"])]);

        list.load_page(true).await.unwrap();
        assert!(list.has_more());
        list.load_page(false).await.unwrap();
        assert!(!list.has_more());

        let conversations = list.conversations();
        assert_eq!(
            conversations
                .iter()
                .map(|c| c.conversation_id.as_str())
                .collect::<Vec<_>>(),
            vec!["user-2", "group-7", "user-5"]
        );
    }

    #[tokio::test]
    async fn test_new_message_bumps_unread_and_moves_to_front() {
        let api = FakeChatApi::new();
        let router = Arc::new(EventRouter::new());
        let list = ConversationListViewModel::open("user-1", api.clone(), &router, 20);

        api.push_conversation_page(vec![
            summary("user-2", false, vec!["user-1", "user-2"]),
            summary("user-5", false, vec!["user-1", "user-5"]),
        ]);
        list.load_page(true).await.unwrap();

        router.dispatch(&new_message("user-5", vec!["user-1"], "你好", false));

        let conversations = list.conversations();
        assert_eq!(conversations[0].conversation_id, "user-5");
        assert_eq!(conversations[0].unread_count, 1);
        assert_eq!(conversations[0].last_message.as_deref(), Some("你好"));

        // 自己发的消息不加未读
        router.dispatch(&new_message("user-1", vec!["user-5"], "回复", false));
        let conversations = list.conversations();
        assert_eq!(conversations[0].unread_count, 1);
        assert_eq!(conversations[0].last_message.as_deref(), Some("回复"));
    }

    #[tokio::test]
    async fn test_new_message_for_unknown_conversation_inserts_entry() {
        let api = FakeChatApi::new();
        let router = Arc::new(EventRouter::new());
        let list = ConversationListViewModel::open("user-1", api.clone(), &router, 20);

        router.dispatch(&new_message("user-9", vec!["user-1"], "初次联系", false));

        let conversations = list.conversations();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].conversation_id, "user-9");
        assert_eq!(conversations[0].unread_count, 1);
    }

    #[tokio::test]
    async fn test_conversation_updated_overwrites_unread() {
        let api = FakeChatApi::new();
        let router = Arc::new(EventRouter::new());
        let list = ConversationListViewModel::open("user-1", api.clone(), &router, 20);

        api.push_conversation_page(vec![summary("user-2", false, vec!["user-1", "user-2"])]);
        list.load_page(true).await.unwrap();

        router.dispatch(&ServerEvent::ConversationUpdated {
            conversation_id: "user-2".to_string(),
            last_message: Some("已读完".to_string()),
            last_message_at: None,
            unread_count: Some(0),
        });

        let conversations = list.conversations();
        assert_eq!(conversations[0].unread_count, 0);
        assert_eq!(conversations[0].last_message.as_deref(), Some("已读完"));
    }

    #[tokio::test]
    async fn test_resolve_display_name_for_direct_conversation() {
        let api = FakeChatApi::new();
        api.users.lock().push(UserProfile {
            id: "user-2".to_string(),
            display_name: Some("李雷".to_string()),
            email: None,
        });
        let router = Arc::new(EventRouter::new());
        let list = ConversationListViewModel::open("user-1", api.clone(), &router, 20);

        api.push_conversation_page(vec![summary("user-2", false, vec!["user-1", "user-2"])]);
        list.load_page(true).await.unwrap();

        let name = list.resolve_display_name("user-2").await.unwrap();
        assert_eq!(name, "李雷");
    }

    #[tokio::test]
    async fn test_close_unsubscribes_and_clears() {
        let api = FakeChatApi::new();
        let router = Arc::new(EventRouter::new());
        let list = ConversationListViewModel::open("user-1", api.clone(), &router, 20);

        router.dispatch(&new_message("user-9", vec!["user-1"], "hi", false));
        assert_eq!(list.conversations().len(), 1);

        list.close();
        assert!(list.conversations().is_empty());
        assert_eq!(router.listener_count(), 0);

        router.dispatch(&new_message("user-9", vec!["user-1"], "late", false));
        assert!(list.conversations().is_empty());
    }
}
