//! 事件系统模块 - 入站事件类型与订阅分发
//!
//! 功能包括：
//! - 通道入站帧的封闭 tagged union（未知类型单独兜底，永不致命）
//! - 按事件类型注册回调的路由器，支持 `"all"` 通配订阅
//! - 分发过程中退订安全、单个回调 panic 隔离
//!
//! 连接层自身的 `connection_open` / `connection_close` / `connection_error`
//! 伪事件也走同一条分发路径，UI 层据此渲染在线状态横幅。

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::conversation::DeliveryStatus;
use crate::error::{RentChatSDKError, Result};

/// 入站事件
///
/// 每个变体对应一个线上 `type` 判别值；服务端新增的类型落入 `Unknown`，
/// 只会被通配订阅者看到。
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// 通道建立（本地伪事件，载荷为空）
    ConnectionOpen {},
    /// 通道关闭（本地伪事件）
    ConnectionClose {
        code: u16,
        #[serde(default)]
        reason: String,
    },
    /// 传输层错误（本地伪事件）
    ConnectionError {
        #[serde(default)]
        message: String,
    },
    NewMessage {
        message_id: String,
        sender_id: String,
        #[serde(default)]
        recipient_ids: Vec<String>,
        content: String,
        #[serde(default)]
        is_group: bool,
        #[serde(default)]
        created_at: Option<DateTime<Utc>>,
    },
    ReadReceipt {
        message_id: String,
        reader_id: String,
        #[serde(default)]
        conversation_id: Option<String>,
        #[serde(default)]
        read_at: Option<DateTime<Utc>>,
    },
    Typing {
        sender_id: String,
        #[serde(default)]
        recipient_ids: Vec<String>,
        #[serde(default)]
        is_group: bool,
    },
    /// 发送确认：按 temp_id 或 message_id 与乐观消息对账
    MessageSent {
        message_id: String,
        #[serde(default)]
        temp_id: Option<String>,
        #[serde(default)]
        status: Option<DeliveryStatus>,
    },
    ConversationUpdated {
        conversation_id: String,
        #[serde(default)]
        last_message: Option<String>,
        #[serde(default)]
        last_message_at: Option<DateTime<Utc>>,
        #[serde(default)]
        unread_count: Option<u32>,
    },
    UserBlocked {
        user_id: String,
    },
    UserUnblocked {
        user_id: String,
    },
    /// 服务端心跳，订阅方可忽略
    Ping {},
    /// 未识别的事件类型，只分发给 `"all"` 订阅者
    #[serde(skip)]
    Unknown { event_type: String, payload: Value },
}

/// 已识别的 `type` 判别值，必须与上面变体的 snake_case 名一致
const KNOWN_TYPES: &[&str] = &[
    "connection_open",
    "connection_close",
    "connection_error",
    "new_message",
    "read_receipt",
    "typing",
    "message_sent",
    "conversation_updated",
    "user_blocked",
    "user_unblocked",
    "ping",
];

impl ServerEvent {
    /// 解析一帧入站 JSON
    ///
    /// 缺少 `type` 字段或已识别类型的字段不合法都算坏帧（调用方丢弃并记日志，
    /// 通道保持打开）；未识别的 `type` 不是错误，返回 `Unknown`。
    pub fn parse(text: &str) -> Result<ServerEvent> {
        let value: Value = serde_json::from_str(text)?;
        let event_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| RentChatSDKError::JsonError("frame missing `type` field".to_string()))?;

        if KNOWN_TYPES.contains(&event_type) {
            Ok(serde_json::from_value(value)?)
        } else {
            Ok(ServerEvent::Unknown {
                event_type: event_type.to_string(),
                payload: value,
            })
        }
    }

    /// 事件类型字符串（路由键）
    pub fn event_type(&self) -> &str {
        match self {
            ServerEvent::ConnectionOpen {} => "connection_open",
            ServerEvent::ConnectionClose { .. } => "connection_close",
            ServerEvent::ConnectionError { .. } => "connection_error",
            ServerEvent::NewMessage { .. } => "new_message",
            ServerEvent::ReadReceipt { .. } => "read_receipt",
            ServerEvent::Typing { .. } => "typing",
            ServerEvent::MessageSent { .. } => "message_sent",
            ServerEvent::ConversationUpdated { .. } => "conversation_updated",
            ServerEvent::UserBlocked { .. } => "user_blocked",
            ServerEvent::UserUnblocked { .. } => "user_unblocked",
            ServerEvent::Ping {} => "ping",
            ServerEvent::Unknown { event_type, .. } => event_type,
        }
    }
}

/// 事件回调类型
pub type EventCallback = Box<dyn Fn(&ServerEvent) + Send + Sync>;

struct ListenerEntry {
    id: u64,
    active: AtomicBool,
    callback: EventCallback,
}

/// 事件路由器
///
/// 按类型维护注册序的回调列表；`"all"` 是保留键，任何事件在类型订阅者
/// 之后都会再分发给它。同一线程内分发，注册表用锁只为拿快照，回调执行
/// 不持锁，因此回调内退订/再订阅都是安全的。
pub struct EventRouter {
    listeners: Mutex<HashMap<String, Vec<Arc<ListenerEntry>>>>,
    next_id: AtomicU64,
}

/// 通配订阅键：收到每一个事件
pub const WILDCARD: &str = "all";

impl EventRouter {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// 订阅某个事件类型，返回退订句柄
    ///
    /// 同一类型的多个订阅者按注册顺序被调用。
    pub fn subscribe<F>(self: &Arc<Self>, event_type: &str, callback: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let entry = Arc::new(ListenerEntry {
            id,
            active: AtomicBool::new(true),
            callback: Box::new(callback),
        });

        let mut listeners = self.listeners.lock();
        listeners
            .entry(event_type.to_string())
            .or_default()
            .push(entry.clone());
        debug!("已订阅事件类型: {} (id={})", event_type, id);

        Subscription {
            router: Arc::downgrade(self),
            event_type: event_type.to_string(),
            entry,
        }
    }

    /// 分发一个事件：先调该类型的订阅者，再调 `"all"` 订阅者
    ///
    /// 回调 panic 被逐个隔离，不影响兄弟回调。
    pub fn dispatch(&self, event: &ServerEvent) {
        let snapshot: Vec<Arc<ListenerEntry>> = {
            let listeners = self.listeners.lock();
            let mut entries = listeners
                .get(event.event_type())
                .cloned()
                .unwrap_or_default();
            if event.event_type() != WILDCARD {
                if let Some(wildcard) = listeners.get(WILDCARD) {
                    entries.extend(wildcard.iter().cloned());
                }
            }
            entries
        };

        for entry in snapshot {
            // 分发过程中被退订的回调不再调用
            if !entry.active.load(Ordering::SeqCst) {
                continue;
            }
            let result = catch_unwind(AssertUnwindSafe(|| (entry.callback)(event)));
            if result.is_err() {
                warn!(
                    "事件回调 panic（已隔离）: type={} listener_id={}",
                    event.event_type(),
                    entry.id
                );
            }
        }
    }

    /// 当前注册的回调总数
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().values().map(Vec::len).sum()
    }

    fn remove(&self, event_type: &str, id: u64) {
        let mut listeners = self.listeners.lock();
        if let Some(entries) = listeners.get_mut(event_type) {
            entries.retain(|e| e.id != id);
            if entries.is_empty() {
                listeners.remove(event_type);
            }
        }
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// 订阅句柄
///
/// `unsubscribe` 幂等，可在回调内部调用；drop 不会自动退订，
/// 退订时机由持有方（视图模型）显式控制。
pub struct Subscription {
    router: Weak<EventRouter>,
    event_type: String,
    entry: Arc<ListenerEntry>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        // 先打标记：正在进行中的分发立即停止调用该回调
        self.entry.active.store(false, Ordering::SeqCst);
        if let Some(router) = self.router.upgrade() {
            router.remove(&self.event_type, self.entry.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    fn ping() -> ServerEvent {
        ServerEvent::Ping {}
    }

    #[test]
    fn test_parse_known_event() {
        let ev = ServerEvent::parse(
            r#"{"type":"new_message","message_id":"m1","sender_id":"u2","recipient_ids":["u1"],"content":"hi"}"#,
        )
        .unwrap();
        match ev {
            ServerEvent::NewMessage {
                message_id,
                sender_id,
                is_group,
                ..
            } => {
                assert_eq!(message_id, "m1");
                assert_eq!(sender_id, "u2");
                assert!(!is_group);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_parse_unknown_type_is_not_fatal() {
        let ev = ServerEvent::parse(r#"{"type":"promo_banner","text":"hello"}"#).unwrap();
        match &ev {
            ServerEvent::Unknown { event_type, payload } => {
                assert_eq!(event_type, "promo_banner");
                assert_eq!(payload["text"], "hello");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(ev.event_type(), "promo_banner");
    }

    #[test]
    fn test_parse_malformed_frames() {
        assert!(ServerEvent::parse("not json").is_err());
        assert!(ServerEvent::parse(r#"{"no_type":1}"#).is_err());
        // 已识别类型但字段缺失也是坏帧
        assert!(ServerEvent::parse(r#"{"type":"new_message"}"#).is_err());
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let router = Arc::new(EventRouter::new());
        let order = Arc::new(PlMutex::new(Vec::new()));

        let o = order.clone();
        let _sub1 = router.subscribe("ping", move |_| o.lock().push(1));
        let o = order.clone();
        let _sub2 = router.subscribe("ping", move |_| o.lock().push(2));

        router.dispatch(&ping());
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[test]
    fn test_wildcard_receives_everything_after_typed() {
        let router = Arc::new(EventRouter::new());
        let order = Arc::new(PlMutex::new(Vec::new()));

        let o = order.clone();
        let _all = router.subscribe(WILDCARD, move |ev| o.lock().push(format!("all:{}", ev.event_type())));
        let o = order.clone();
        let _typed = router.subscribe("ping", move |_| o.lock().push("typed".to_string()));

        router.dispatch(&ping());
        router.dispatch(&ServerEvent::Unknown {
            event_type: "promo_banner".to_string(),
            payload: Value::Null,
        });

        assert_eq!(
            *order.lock(),
            vec![
                "typed".to_string(),
                "all:ping".to_string(),
                "all:promo_banner".to_string()
            ]
        );
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let router = Arc::new(EventRouter::new());
        let count = Arc::new(PlMutex::new(0u32));

        let c = count.clone();
        let sub = router.subscribe("ping", move |_| *c.lock() += 1);
        assert_eq!(router.listener_count(), 1);

        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(router.listener_count(), 0);

        router.dispatch(&ping());
        assert_eq!(*count.lock(), 0);
    }

    #[test]
    fn test_unsubscribe_mid_dispatch_skips_pending_callback() {
        let router = Arc::new(EventRouter::new());
        let order = Arc::new(PlMutex::new(Vec::new()));

        // sub2 在 sub1 的回调里被退订：本轮不得再被调用
        let slot: Arc<PlMutex<Option<Subscription>>> = Arc::new(PlMutex::new(None));

        let o = order.clone();
        let s = slot.clone();
        let _sub1 = router.subscribe("ping", move |_| {
            o.lock().push("first");
            if let Some(sub2) = s.lock().take() {
                sub2.unsubscribe();
            }
        });
        let o = order.clone();
        let sub2 = router.subscribe("ping", move |_| o.lock().push("second"));
        *slot.lock() = Some(sub2);

        router.dispatch(&ping());
        assert_eq!(*order.lock(), vec!["first"]);

        // 后续分发同样不再触达
        router.dispatch(&ping());
        assert_eq!(*order.lock(), vec!["first", "first"]);
    }

    #[test]
    fn test_callback_panic_is_isolated() {
        let router = Arc::new(EventRouter::new());
        let order = Arc::new(PlMutex::new(Vec::new()));

        let _bad = router.subscribe("ping", |_| panic!("boom"));
        let o = order.clone();
        let _good = router.subscribe("ping", move |_| o.lock().push("ran"));

        router.dispatch(&ping());
        assert_eq!(*order.lock(), vec!["ran"]);
    }
}
