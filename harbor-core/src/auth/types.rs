use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 服务器标识，指向固定配置的一组后端代理之一
pub type ServerId = String;

/// 用户角色
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    /// 运营账号，只能使用保留服务器
    Admin,
    Member,
}

impl Default for UserRole {
    fn default() -> Self {
        Self::Member
    }
}

/// 用户分组，决定可用的后端服务器池
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Cohort {
    Batch01,
    Batch02,
}

impl Default for Cohort {
    fn default() -> Self {
        Self::Batch01
    }
}

impl Cohort {
    pub fn as_str(&self) -> &str {
        match self {
            Cohort::Batch01 => "batch_01",
            Cohort::Batch02 => "batch_02",
        }
    }
}

/// 会话中的用户状态
/// 由外部认证提供方创建，凭证和服务器分配由本库维护
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct User {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub role: UserRole,
    #[serde(default)]
    pub cohort: Cohort,
    /// 从共享池租借到的个人凭证
    #[serde(default)]
    pub personal_token: Option<String>,
    #[serde(default)]
    pub assigned_server: Option<ServerId>,
    /// 服务端下发的强制登出时间戳
    #[serde(default)]
    pub force_logout_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: UserRole::Member,
            cohort: Cohort::Batch01,
            personal_token: None,
            assigned_server: None,
            force_logout_at: None,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }

    pub fn has_personal_token(&self) -> bool {
        self.personal_token.is_some()
    }
}
