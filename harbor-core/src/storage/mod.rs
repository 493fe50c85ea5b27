pub mod memory;
pub mod session;

pub use memory::MemoryStorage;
pub use session::{LocalCache, Preferences, SessionCache};

/// 键值存储接口
///
/// 会话级和持久级的本地状态都通过这个接口访问，
/// 不使用环境全局量，测试中可以直接替换实现
pub trait KeyValueStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}
