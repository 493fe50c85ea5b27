use super::KeyValueStorage;
use crate::auth::{ServerId, User};
use crate::store::PoolEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

const KEY_SELECTED_SERVER: &str = "selected_server";
const KEY_SESSION_STARTED_AT: &str = "session_started_at";
const KEY_CREDENTIAL_POOL: &str = "credential_pool";
const KEY_MASTER_CREDENTIAL: &str = "master_credential";

const KEY_CACHED_USER: &str = "cached_user";
const KEY_PREFERENCES: &str = "preferences";

/// 会话级缓存
/// 保存选中的服务器、会话开始时间、凭证池快照和共享主凭证；
/// 登录时创建，登出或关闭页面时销毁
#[derive(Clone)]
pub struct SessionCache {
    storage: Arc<dyn KeyValueStorage>,
}

impl SessionCache {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self { storage }
    }

    pub fn selected_server(&self) -> Option<ServerId> {
        self.storage.get(KEY_SELECTED_SERVER)
    }

    pub fn set_selected_server(&self, server: &str) {
        self.storage.set(KEY_SELECTED_SERVER, server);
    }

    pub fn session_started_at(&self) -> Option<DateTime<Utc>> {
        self.get_json(KEY_SESSION_STARTED_AT)
    }

    pub fn set_session_started_at(&self, started_at: DateTime<Utc>) {
        self.set_json(KEY_SESSION_STARTED_AT, &started_at);
    }

    /// 凭证池快照，避免重新探测时再次拉取
    pub fn credential_pool(&self) -> Option<Vec<PoolEntry>> {
        self.get_json(KEY_CREDENTIAL_POOL)
    }

    pub fn set_credential_pool(&self, pool: &[PoolEntry]) {
        self.set_json(KEY_CREDENTIAL_POOL, &pool);
    }

    pub fn master_credential(&self) -> Option<String> {
        self.storage.get(KEY_MASTER_CREDENTIAL)
    }

    pub fn set_master_credential(&self, credential: &str) {
        self.storage.set(KEY_MASTER_CREDENTIAL, credential);
    }

    /// 清空全部会话状态
    pub fn clear(&self) {
        self.storage.remove(KEY_SELECTED_SERVER);
        self.storage.remove(KEY_SESSION_STARTED_AT);
        self.storage.remove(KEY_CREDENTIAL_POOL);
        self.storage.remove(KEY_MASTER_CREDENTIAL);
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.storage.get(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Discarding unreadable session cache entry '{}': {}", key, e);
                self.storage.remove(key);
                None
            }
        }
    }

    fn set_json<T: Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_string(value) {
            Ok(raw) => self.storage.set(key, &raw),
            Err(e) => warn!("Failed to serialize session cache entry '{}': {}", key, e),
        }
    }
}

/// 少量持久化设置
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Preferences {
    #[serde(default = "default_theme")]
    pub theme: String,
    #[serde(default = "default_language")]
    pub language: String,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            theme: default_theme(),
            language: default_language(),
        }
    }
}

fn default_theme() -> String {
    "light".to_string()
}

fn default_language() -> String {
    "en".to_string()
}

/// 持久级缓存
/// 保存用户偏好和当前用户的副本，页面重载时快速恢复
#[derive(Clone)]
pub struct LocalCache {
    storage: Arc<dyn KeyValueStorage>,
}

impl LocalCache {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self { storage }
    }

    pub fn cached_user(&self) -> Option<User> {
        let raw = self.storage.get(KEY_CACHED_USER)?;
        match serde_json::from_str(&raw) {
            Ok(user) => Some(user),
            Err(e) => {
                warn!("Discarding unreadable cached user: {}", e);
                self.storage.remove(KEY_CACHED_USER);
                None
            }
        }
    }

    pub fn set_cached_user(&self, user: &User) {
        match serde_json::to_string(user) {
            Ok(raw) => self.storage.set(KEY_CACHED_USER, &raw),
            Err(e) => warn!("Failed to serialize cached user: {}", e),
        }
    }

    pub fn clear_cached_user(&self) {
        self.storage.remove(KEY_CACHED_USER);
    }

    pub fn preferences(&self) -> Preferences {
        self.storage
            .get(KEY_PREFERENCES)
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub fn set_preferences(&self, preferences: &Preferences) {
        match serde_json::to_string(preferences) {
            Ok(raw) => self.storage.set(KEY_PREFERENCES, &raw),
            Err(e) => warn!("Failed to serialize preferences: {}", e),
        }
    }
}
