pub mod http;
pub mod types;

pub use http::HttpPoolStore;
pub use types::{LeaseOutcome, PoolEntry, StoreError};

use crate::auth::{ServerId, User};
use async_trait::async_trait;
use std::collections::HashMap;

/// 池存储接口
///
/// 外部键值/关系存储的客户端契约：共享凭证池、主凭证、
/// 每用户的租借状态和服务器占用统计都通过它访问。
/// 定义为trait以便注入测试替身
#[async_trait]
pub trait PoolStore: Send + Sync {
    /// 读取共享主凭证
    async fn get_master_credential(&self) -> Result<Option<String>, StoreError>;

    /// 读取共享凭证池，按创建时间排序
    async fn get_credential_pool(&self) -> Result<Vec<PoolEntry>, StoreError>;

    /// 尝试把一条池凭证租借给指定用户
    async fn lease_credential(&self, user_id: &str, token: &str) -> LeaseOutcome;

    /// 清除用户当前的个人凭证（重新分配前的必要步骤）
    async fn clear_credential(&self, user_id: &str) -> Result<User, StoreError>;

    /// 持久化用户的服务器分配
    async fn set_server_assignment(
        &self,
        user_id: &str,
        server: Option<&ServerId>,
    ) -> Result<(), StoreError>;

    /// 每个服务器当前绑定的用户数（咨询性质，最终一致）
    async fn get_server_usage_counts(&self) -> Result<HashMap<ServerId, u64>, StoreError>;

    /// 用户可用的服务器候选列表，按分组过滤
    async fn get_available_servers(&self, user: &User) -> Result<Vec<ServerId>, StoreError>;

    /// 更新用户的最后活跃时间（心跳）
    async fn touch_last_seen(&self, user_id: &str) -> Result<(), StoreError>;
}
