use harbor_core::User;
use tokio::sync::broadcast;

/// 进程内会话事件
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// 用户记录被更新（凭证或服务器分配变化）
    UserUsageUpdated(User),
    /// 消费方报告当前个人凭证已失效，触发静默重分配
    PersonalTokenFailed,
    /// 活跃会话中更换了服务器，需要整页重载
    ReloadRequired,
}

/// 进程内发布/订阅通道
/// 由编排器持有，登出时随编排器一起销毁
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(32);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// 没有订阅者时静默丢弃
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
