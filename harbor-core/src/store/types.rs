use crate::auth::User;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 共享凭证池中的一条记录
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PoolEntry {
    pub token: String,
    pub created_at: DateTime<Utc>,
}

/// 租借一条池凭证的结果
///
/// 租借是尽力而为的：存储端不保证比较交换语义，
/// 极少数的双重租借是已接受的一致性取舍（见 DESIGN.md）
#[derive(Debug)]
pub enum LeaseOutcome {
    /// 租借成功，返回更新后的用户记录
    Leased(User),
    /// 凭证在探测和租借之间被其他用户占用
    AlreadyClaimed,
    /// 存储端失败，可能是瞬时错误也可能是结构漂移
    Failed(StoreError),
}

/// 池存储错误类型
#[derive(Error, Debug)]
pub enum StoreError {
    /// 存储结构缺少预期字段（结构漂移），需要运营侧修复
    #[error("store schema is missing expected column: {0}")]
    MissingColumn(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("HTTP请求失败: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("JSON解析失败: {0}")]
    JsonParseError(#[from] serde_json::Error),
    #[error("store returned error: 状态码 {status}")]
    UpstreamError { status: u16, body: String },
}

impl StoreError {
    /// 结构漂移是终态错误，不应该换一个候选重试
    pub fn is_schema_drift(&self) -> bool {
        matches!(self, StoreError::MissingColumn(_))
    }
}
