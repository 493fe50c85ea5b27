pub mod types;

pub use types::*;

use anyhow::Result;
use async_trait::async_trait;

/// 外部认证/会话提供方的接口
///
/// 实际登录流程和强制登出推送通道由外部实现；
/// 本库只依赖登出能力，推送更新通过调用编排器的处理方法送入
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// 结束当前会话
    async fn sign_out(&self) -> Result<()>;
}
