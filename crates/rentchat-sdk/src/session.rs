//! 登录会话存取
//!
//! 消息通道握手和 REST 调用都依赖持久化的登录令牌。这里只定义读取接口，
//! 令牌的颁发与刷新由上层身份系统负责，SDK 不参与。

use parking_lot::RwLock;

/// 登录会话读取接口
///
/// 实现方保证读取是同步、无阻塞的（例如内存缓存或本地 KV）。
/// 没有令牌是建立消息通道的硬性前置失败，见 `ConnectionManager::open`。
pub trait SessionStore: Send + Sync {
    /// 当前 bearer 令牌，未登录返回 None
    fn token(&self) -> Option<String>;

    /// 当前登录用户 ID，未登录返回 None
    fn user_id(&self) -> Option<String>;
}

#[derive(Debug, Clone, Default)]
struct SessionData {
    user_id: Option<String>,
    token: Option<String>,
}

/// 内存会话实现
///
/// 宿主应用在登录成功后写入，登出时清空。
#[derive(Default)]
pub struct MemorySession {
    data: RwLock<SessionData>,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入登录态
    pub fn sign_in(&self, user_id: impl Into<String>, token: impl Into<String>) {
        let mut data = self.data.write();
        data.user_id = Some(user_id.into());
        data.token = Some(token.into());
    }

    /// 清空登录态
    pub fn sign_out(&self) {
        let mut data = self.data.write();
        data.user_id = None;
        data.token = None;
    }
}

impl SessionStore for MemorySession {
    fn token(&self) -> Option<String> {
        self.data.read().token.clone()
    }

    fn user_id(&self) -> Option<String> {
        self.data.read().user_id.clone()
    }
}
