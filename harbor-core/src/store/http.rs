use super::types::{LeaseOutcome, PoolEntry, StoreError};
use super::PoolStore;
use crate::auth::{ServerId, User};
use crate::config::StoreSettings;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// 基于 PostgREST 风格 REST 接口的池存储客户端
///
/// 租借是两步写入（先占池记录，再写用户记录），中间没有事务，
/// 属于文档化的尽力而为语义
#[derive(Clone)]
pub struct HttpPoolStore {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpPoolStore {
    pub fn new(settings: &StoreSettings) -> Self {
        Self::with_timeout(settings, Duration::from_secs(settings.timeout_seconds))
    }

    pub fn with_timeout(settings: &StoreSettings, timeout: Duration) -> Self {
        let client = match Client::builder().timeout(timeout).build() {
            Ok(client) => client,
            Err(e) => {
                warn!(
                    "Failed to build store HTTP client, falling back to default without the {:?} timeout: {}",
                    timeout, e
                );
                Client::new()
            }
        };

        Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
        }
    }

    fn url(&self, path_and_query: &str) -> String {
        format!("{}/{}", self.base_url, path_and_query.trim_start_matches('/'))
    }

    async fn get_rows(&self, path_and_query: &str) -> Result<Vec<Value>, StoreError> {
        let response = self
            .client
            .get(self.url(path_and_query))
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;

        if !(200..300).contains(&status) {
            return Err(classify_error_body(status, &body));
        }

        let rows: Vec<Value> = serde_json::from_str(&body)?;
        Ok(rows)
    }

    /// PATCH 并要求返回受影响的行；空结果表示过滤条件没有命中
    async fn patch_rows(&self, path_and_query: &str, body: &Value) -> Result<Vec<Value>, StoreError> {
        let response = self
            .client
            .patch(self.url(path_and_query))
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Prefer", "return=representation")
            .json(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let text = response.text().await?;

        if !(200..300).contains(&status) {
            return Err(classify_error_body(status, &text));
        }

        let rows: Vec<Value> = serde_json::from_str(&text)?;
        Ok(rows)
    }

    async fn patch_user_row(&self, user_id: &str, body: &Value) -> Result<User, StoreError> {
        let rows = self
            .patch_rows(&format!("profiles?id=eq.{user_id}"), body)
            .await?;

        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(user_id.to_string()))?;
        let user: User = serde_json::from_value(row)?;
        Ok(user)
    }
}

/// 归还租借第一步占住的池记录
/// claimed_by 条件限定只回滚本用户刚写入的占用，不碰别人的
fn release_claim_query(user_id: &str, token: &str) -> String {
    format!("token_pool?token=eq.{token}&claimed_by=eq.{user_id}")
}

/// 从存储端错误响应中区分结构漂移和其他失败
///
/// PostgREST 对未定义列返回 42703；这是需要运营介入的终态错误，
/// 不能当作瞬时失败继续扫描
fn classify_error_body(status: u16, body: &str) -> StoreError {
    if body.contains("42703") || body.contains("does not exist") {
        let column = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
            .unwrap_or_else(|| "unknown column".to_string());
        return StoreError::MissingColumn(column);
    }

    StoreError::UpstreamError {
        status,
        body: body.to_string(),
    }
}

#[async_trait]
impl PoolStore for HttpPoolStore {
    async fn get_master_credential(&self) -> Result<Option<String>, StoreError> {
        let rows = self
            .get_rows("shared_credentials?select=token&is_master=eq.true&limit=1")
            .await?;

        Ok(rows
            .first()
            .and_then(|row| row.get("token"))
            .and_then(|token| token.as_str())
            .map(String::from))
    }

    async fn get_credential_pool(&self) -> Result<Vec<PoolEntry>, StoreError> {
        let rows = self
            .get_rows("token_pool?select=token,created_at&order=created_at.asc")
            .await?;

        let mut pool = Vec::with_capacity(rows.len());
        for row in rows {
            pool.push(serde_json::from_value(row)?);
        }

        debug!("Fetched credential pool with {} entries", pool.len());
        Ok(pool)
    }

    async fn lease_credential(&self, user_id: &str, token: &str) -> LeaseOutcome {
        // 第一步：占住池记录；claimed_by 过滤在已被占用时不命中任何行
        let claim = self
            .patch_rows(
                &format!("token_pool?token=eq.{token}&claimed_by=is.null"),
                &json!({ "claimed_by": user_id, "claimed_at": Utc::now() }),
            )
            .await;

        match claim {
            Ok(rows) if rows.is_empty() => {
                debug!("Pool credential already claimed by another user");
                return LeaseOutcome::AlreadyClaimed;
            }
            Ok(_) => {}
            Err(e) => return LeaseOutcome::Failed(e),
        }

        // 第二步：写入用户记录
        match self
            .patch_user_row(user_id, &json!({ "personal_token": token }))
            .await
        {
            Ok(user) => LeaseOutcome::Leased(user),
            Err(e) => {
                warn!("Claimed pool credential but failed to write user record: {}", e);
                // 尽力归还第一步占住的池记录，否则这条凭证会永久滞留在池外
                if let Err(release_err) = self
                    .patch_rows(
                        &release_claim_query(user_id, token),
                        &json!({ "claimed_by": Value::Null, "claimed_at": Value::Null }),
                    )
                    .await
                {
                    warn!(
                        "Failed to release claimed pool credential after lease failure: {}",
                        release_err
                    );
                }
                LeaseOutcome::Failed(e)
            }
        }
    }

    async fn clear_credential(&self, user_id: &str) -> Result<User, StoreError> {
        self.patch_user_row(user_id, &json!({ "personal_token": Value::Null }))
            .await
    }

    async fn set_server_assignment(
        &self,
        user_id: &str,
        server: Option<&ServerId>,
    ) -> Result<(), StoreError> {
        self.patch_user_row(user_id, &json!({ "assigned_server": server }))
            .await?;
        Ok(())
    }

    async fn get_server_usage_counts(&self) -> Result<HashMap<ServerId, u64>, StoreError> {
        let rows = self
            .get_rows("server_usage?select=server_id,active_users")
            .await?;

        let mut counts = HashMap::with_capacity(rows.len());
        for row in rows {
            let server = row
                .get("server_id")
                .and_then(|v| v.as_str())
                .map(String::from);
            let count = row.get("active_users").and_then(|v| v.as_u64());

            if let (Some(server), Some(count)) = (server, count) {
                counts.insert(server, count);
            }
        }

        Ok(counts)
    }

    async fn get_available_servers(&self, user: &User) -> Result<Vec<ServerId>, StoreError> {
        let rows = self
            .get_rows(&format!(
                "servers?select=server_id&cohort=eq.{}&order=position.asc",
                user.cohort.as_str()
            ))
            .await?;

        Ok(rows
            .iter()
            .filter_map(|row| row.get("server_id").and_then(|v| v.as_str()))
            .map(String::from)
            .collect())
    }

    async fn touch_last_seen(&self, user_id: &str) -> Result<(), StoreError> {
        self.patch_user_row(user_id, &json!({ "last_seen_at": Utc::now() }))
            .await?;
        Ok(())
    }
}
