use super::events::{EventBus, SessionEvent};
use harbor_core::store::{PoolStore, StoreError};
use harbor_core::{Cohort, ServerId, SessionCache, User};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 兜底服务器清单，按分组硬编码
/// 仅在候选列表或占用统计拉取失败时使用，独立于外部账本
const BATCH_01_FALLBACK: &[&str] = &["proxy-b1-01", "proxy-b1-02", "proxy-b1-03"];
const BATCH_02_FALLBACK: &[&str] = &["proxy-b2-01", "proxy-b2-02", "proxy-b2-03"];

/// 一次服务器选择的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionOutcome {
    pub server: ServerId,
    /// 活跃会话中更换服务器时为真，调用方应整页重载
    pub reload_required: bool,
    /// 本次选择走了随机兜底路径
    pub fallback_used: bool,
}

/// 服务器选择器
///
/// 负载感知的最少占用选择，外部数据不可用时退化为随机兜底；
/// 选中结果先写会话缓存再异步持久化到用户记录
pub struct ServerSelector {
    store: Arc<dyn PoolStore>,
    cache: SessionCache,
    bus: EventBus,
    reserved: ServerId,
    rng: Mutex<StdRng>,
}

impl ServerSelector {
    pub fn new(
        store: Arc<dyn PoolStore>,
        cache: SessionCache,
        bus: EventBus,
        reserved: ServerId,
    ) -> Self {
        Self::with_rng(store, cache, bus, reserved, StdRng::from_os_rng())
    }

    /// 注入确定性随机源，测试用
    pub fn with_rng_seed(
        store: Arc<dyn PoolStore>,
        cache: SessionCache,
        bus: EventBus,
        reserved: ServerId,
        seed: u64,
    ) -> Self {
        Self::with_rng(store, cache, bus, reserved, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        store: Arc<dyn PoolStore>,
        cache: SessionCache,
        bus: EventBus,
        reserved: ServerId,
        rng: StdRng,
    ) -> Self {
        Self {
            store,
            cache,
            bus,
            reserved,
            rng: Mutex::new(rng),
        }
    }

    /// 用户可见的服务器候选列表
    /// 运营账号只会得到保留服务器，普通用户得到其分组的池
    pub async fn list_candidates(&self, user: &User) -> Result<Vec<ServerId>, StoreError> {
        if user.is_admin() {
            return Ok(vec![self.reserved.clone()]);
        }

        self.store.get_available_servers(user).await
    }

    /// 稳定的最少占用选择：线性扫描，占用数缺省为0，
    /// 平局时保留输入顺序中先出现的候选
    pub fn pick_least_loaded(
        candidates: &[ServerId],
        usage: &HashMap<ServerId, u64>,
    ) -> Option<ServerId> {
        candidates
            .iter()
            .reduce(|best, candidate| {
                let best_count = usage.get(best).copied().unwrap_or(0);
                let count = usage.get(candidate).copied().unwrap_or(0);
                if count < best_count {
                    candidate
                } else {
                    best
                }
            })
            .cloned()
    }

    /// 从硬编码清单里均匀抽取一个兜底服务器
    pub fn pick_random_fallback_with(cohort: Cohort, rng: &mut impl Rng) -> ServerId {
        let pool = match cohort {
            Cohort::Batch01 => BATCH_01_FALLBACK,
            Cohort::Batch02 => BATCH_02_FALLBACK,
        };
        pool[rng.random_range(0..pool.len())].to_string()
    }

    pub fn pick_random_fallback(&self, cohort: Cohort) -> ServerId {
        Self::pick_random_fallback_with(cohort, &mut *self.rng.lock())
    }

    /// 计算当前的最少占用建议，不持久化
    /// 交互界面用它来预置"自动选择"入口
    pub async fn suggest(&self, user: &User) -> Option<ServerId> {
        let candidates = self.list_candidates(user).await.ok()?;
        let usage = self.store.get_server_usage_counts().await.ok()?;
        Self::pick_least_loaded(&candidates, &usage)
    }

    /// 自动选择：最少占用优先，账本不可用时随机兜底
    /// 账本失败不会作为错误上报给用户
    pub async fn select_auto(&self, user: &User) -> SelectionOutcome {
        let picked = match self.list_candidates(user).await {
            Ok(candidates) => match self.store.get_server_usage_counts().await {
                Ok(usage) => Self::pick_least_loaded(&candidates, &usage),
                Err(e) => {
                    warn!("Usage ledger fetch failed, falling back to random pick: {}", e);
                    None
                }
            },
            Err(e) => {
                warn!("Candidate list fetch failed, falling back to random pick: {}", e);
                None
            }
        };

        match picked {
            Some(server) => {
                debug!("Least-loaded selection picked server '{}'", server);
                self.commit(user, server, false).await
            }
            None => {
                let server = self.pick_random_fallback(user.cohort);
                info!(
                    "Selected fallback server '{}' from cohort '{}'",
                    server,
                    user.cohort.as_str()
                );
                self.commit(user, server, true).await
            }
        }
    }

    /// 用户显式指定服务器，跳过负载计算
    pub async fn select_manual(&self, user: &User, server: ServerId) -> SelectionOutcome {
        self.commit(user, server, false).await
    }

    /// 先写会话缓存（页面中途重载不会重新触发选择），
    /// 再持久化到用户记录；活跃会话换服务器时广播重载信号
    async fn commit(&self, user: &User, server: ServerId, fallback_used: bool) -> SelectionOutcome {
        let previous = self.cache.selected_server();
        self.cache.set_selected_server(&server);

        if let Err(e) = self
            .store
            .set_server_assignment(&user.id, Some(&server))
            .await
        {
            // 会话缓存已经写入，持久化失败只记日志
            warn!("Failed to persist server assignment for '{}': {}", user.id, e);
        }

        let reload_required = matches!(&previous, Some(p) if *p != server);
        if reload_required {
            info!(
                "Server changed from '{}' to '{}' mid-session, requesting reload",
                previous.unwrap_or_default(),
                server
            );
            self.bus.publish(SessionEvent::ReloadRequired);
        }

        SelectionOutcome {
            server,
            reload_required,
            fallback_used,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use harbor_core::store::LeaseOutcome;
    use harbor_core::{MemoryStorage, PoolEntry, UserRole};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ids(names: &[&str]) -> Vec<ServerId> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn usage(pairs: &[(&str, u64)]) -> HashMap<ServerId, u64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_pick_least_loaded_first_minimum_wins() {
        let candidates = ids(&["A", "B", "C"]);
        let counts = usage(&[("A", 5), ("B", 2), ("C", 2)]);

        // B和C平局，输入顺序在前的B胜出
        assert_eq!(
            ServerSelector::pick_least_loaded(&candidates, &counts).as_deref(),
            Some("B")
        );
    }

    #[test]
    fn test_pick_least_loaded_empty_usage_returns_first() {
        let candidates = ids(&["A", "B", "C"]);
        let counts = HashMap::new();

        assert_eq!(
            ServerSelector::pick_least_loaded(&candidates, &counts).as_deref(),
            Some("A")
        );
    }

    #[test]
    fn test_pick_least_loaded_missing_candidate_defaults_to_zero() {
        let candidates = ids(&["A", "B"]);
        let counts = usage(&[("A", 1)]);

        assert_eq!(
            ServerSelector::pick_least_loaded(&candidates, &counts).as_deref(),
            Some("B")
        );
    }

    #[test]
    fn test_pick_least_loaded_empty_candidates() {
        let counts = HashMap::new();
        assert!(ServerSelector::pick_least_loaded(&[], &counts).is_none());
    }

    #[test]
    fn test_random_fallback_stays_in_cohort_pool() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..50 {
            let picked = ServerSelector::pick_random_fallback_with(Cohort::Batch01, &mut rng);
            assert!(BATCH_01_FALLBACK.contains(&picked.as_str()));

            let picked = ServerSelector::pick_random_fallback_with(Cohort::Batch02, &mut rng);
            assert!(BATCH_02_FALLBACK.contains(&picked.as_str()));
        }
    }

    /// 存储替身：可配置候选列表和占用统计，并可强制账本失败
    #[derive(Default)]
    struct MockStore {
        servers: Vec<ServerId>,
        counts: HashMap<ServerId, u64>,
        fail_usage: bool,
        fail_servers: bool,
        assignments: AtomicUsize,
    }

    #[async_trait]
    impl PoolStore for MockStore {
        async fn get_master_credential(&self) -> Result<Option<String>, StoreError> {
            Ok(None)
        }

        async fn get_credential_pool(&self) -> Result<Vec<PoolEntry>, StoreError> {
            Ok(Vec::new())
        }

        async fn lease_credential(&self, _user_id: &str, _token: &str) -> LeaseOutcome {
            LeaseOutcome::AlreadyClaimed
        }

        async fn clear_credential(&self, user_id: &str) -> Result<User, StoreError> {
            Ok(User::new(user_id, "Mock User"))
        }

        async fn set_server_assignment(
            &self,
            _user_id: &str,
            _server: Option<&ServerId>,
        ) -> Result<(), StoreError> {
            self.assignments.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn get_server_usage_counts(&self) -> Result<HashMap<ServerId, u64>, StoreError> {
            if self.fail_usage {
                return Err(StoreError::UpstreamError {
                    status: 500,
                    body: "ledger down".to_string(),
                });
            }
            Ok(self.counts.clone())
        }

        async fn get_available_servers(&self, _user: &User) -> Result<Vec<ServerId>, StoreError> {
            if self.fail_servers {
                return Err(StoreError::UpstreamError {
                    status: 500,
                    body: "list down".to_string(),
                });
            }
            Ok(self.servers.clone())
        }

        async fn touch_last_seen(&self, _user_id: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn selector_with(store: MockStore) -> (ServerSelector, SessionCache, EventBus) {
        let cache = SessionCache::new(Arc::new(MemoryStorage::new()));
        let bus = EventBus::new();
        let selector = ServerSelector::with_rng_seed(
            Arc::new(store),
            cache.clone(),
            bus.clone(),
            "ops-proxy-01".to_string(),
            9,
        );
        (selector, cache, bus)
    }

    #[tokio::test]
    async fn test_admin_candidates_are_reserved_only() {
        let (selector, _, _) = selector_with(MockStore {
            servers: ids(&["proxy-b1-01", "proxy-b1-02"]),
            counts: usage(&[("proxy-b1-01", 0)]),
            ..Default::default()
        });

        let mut admin = User::new("op1", "Operator");
        admin.role = UserRole::Admin;

        // 无论占用统计和分组如何，运营账号只能看到保留服务器
        let candidates = selector.list_candidates(&admin).await.unwrap();
        assert_eq!(candidates, ids(&["ops-proxy-01"]));
    }

    #[tokio::test]
    async fn test_select_auto_prefers_least_loaded() {
        let (selector, cache, _) = selector_with(MockStore {
            servers: ids(&["proxy-b1-01", "proxy-b1-02", "proxy-b1-03"]),
            counts: usage(&[("proxy-b1-01", 4), ("proxy-b1-02", 1), ("proxy-b1-03", 6)]),
            ..Default::default()
        });

        let user = User::new("u1", "Test User");
        let outcome = selector.select_auto(&user).await;

        assert_eq!(outcome.server, "proxy-b1-02");
        assert!(!outcome.fallback_used);
        assert!(!outcome.reload_required);
        // 选择结果立即进入会话缓存
        assert_eq!(cache.selected_server().as_deref(), Some("proxy-b1-02"));
    }

    #[tokio::test]
    async fn test_select_auto_falls_back_when_ledger_fails() {
        let (selector, _, _) = selector_with(MockStore {
            servers: ids(&["proxy-b1-01"]),
            fail_usage: true,
            ..Default::default()
        });

        let user = User::new("u1", "Test User");
        let outcome = selector.select_auto(&user).await;

        assert!(outcome.fallback_used);
        assert!(BATCH_01_FALLBACK.contains(&outcome.server.as_str()));
    }

    #[tokio::test]
    async fn test_select_auto_falls_back_when_candidate_list_fails() {
        let (selector, _, _) = selector_with(MockStore {
            fail_servers: true,
            ..Default::default()
        });

        let mut user = User::new("u1", "Test User");
        user.cohort = Cohort::Batch02;
        let outcome = selector.select_auto(&user).await;

        assert!(outcome.fallback_used);
        assert!(BATCH_02_FALLBACK.contains(&outcome.server.as_str()));
    }

    #[tokio::test]
    async fn test_server_change_publishes_reload() {
        let (selector, cache, bus) = selector_with(MockStore::default());
        let mut rx = bus.subscribe();
        cache.set_selected_server("proxy-b1-01");

        let user = User::new("u1", "Test User");
        let outcome = selector
            .select_manual(&user, "proxy-b1-02".to_string())
            .await;

        assert!(outcome.reload_required);
        match rx.try_recv() {
            Ok(SessionEvent::ReloadRequired) => {}
            other => panic!("expected reload event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_same_server_does_not_reload() {
        let (selector, cache, bus) = selector_with(MockStore::default());
        let mut rx = bus.subscribe();
        cache.set_selected_server("proxy-b1-01");

        let user = User::new("u1", "Test User");
        let outcome = selector
            .select_manual(&user, "proxy-b1-01".to_string())
            .await;

        assert!(!outcome.reload_required);
        assert!(rx.try_recv().is_err());
    }
}
