use super::engine::{AssignError, AssignmentEngine};
use super::events::{EventBus, SessionEvent};
use super::prober::CredentialProber;
use super::selector::ServerSelector;
use anyhow::Result;
use chrono::{DateTime, Utc};
use harbor_core::store::PoolStore;
use harbor_core::{
    AuthProvider, Config, KeyValueStorage, LocalCache, ServerId, SessionCache, User,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 会话生命周期阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    CheckingSession,
    LoggedOut,
    WelcomeAnimation,
    ServerSelection,
    AwaitingTokenAssignment,
    Ready,
}

/// 会话编排器
///
/// 把服务器选择、凭证分配、强制登出和心跳串成一个状态机。
/// 事件总线归编排器所有，登出时后台任务一并终止
pub struct SessionOrchestrator {
    config: Config,
    store: Arc<dyn PoolStore>,
    auth: Arc<dyn AuthProvider>,
    engine: Arc<AssignmentEngine>,
    selector: Arc<ServerSelector>,
    cache: SessionCache,
    local: LocalCache,
    bus: EventBus,
    phase_tx: watch::Sender<SessionPhase>,
    user: RwLock<Option<User>>,
    /// 静默重分配的单槽位守卫
    silent_in_flight: AtomicBool,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl SessionOrchestrator {
    pub fn new(
        config: Config,
        store: Arc<dyn PoolStore>,
        prober: Arc<dyn CredentialProber>,
        auth: Arc<dyn AuthProvider>,
        session_storage: Arc<dyn KeyValueStorage>,
        local_storage: Arc<dyn KeyValueStorage>,
    ) -> Arc<Self> {
        let cache = SessionCache::new(session_storage);
        let local = LocalCache::new(local_storage);
        let bus = EventBus::new();

        let engine = Arc::new(AssignmentEngine::new(
            store.clone(),
            prober,
            cache.clone(),
        ));
        let selector = Arc::new(ServerSelector::new(
            store.clone(),
            cache.clone(),
            bus.clone(),
            config.servers.reserved.clone(),
        ));

        let (phase_tx, _) = watch::channel(SessionPhase::CheckingSession);

        Arc::new(Self {
            config,
            store,
            auth,
            engine,
            selector,
            cache,
            local,
            bus,
            phase_tx,
            user: RwLock::new(None),
            silent_in_flight: AtomicBool::new(false),
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase_tx.subscribe()
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase_tx.borrow()
    }

    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    pub fn engine(&self) -> Arc<AssignmentEngine> {
        self.engine.clone()
    }

    pub fn selector(&self) -> Arc<ServerSelector> {
        self.selector.clone()
    }

    pub async fn current_user(&self) -> Option<User> {
        self.user.read().await.clone()
    }

    fn set_phase(&self, phase: SessionPhase) {
        debug!("Session phase -> {:?}", phase);
        // send_replace存值不依赖订阅者存在，phase()随时可读到当前状态
        self.phase_tx.send_replace(phase);
    }

    /// 启动时恢复会话：有缓存用户按登录处理，否则进入登出态
    pub async fn bootstrap(self: &Arc<Self>) -> SessionPhase {
        self.set_phase(SessionPhase::CheckingSession);

        match self.local.cached_user() {
            Some(user) => {
                info!("Restored cached user '{}' from local storage", user.id);
                if let Err(e) = self.complete_login(user).await {
                    warn!("Failed to restore session: {}", e);
                    self.set_phase(SessionPhase::LoggedOut);
                }
            }
            None => {
                debug!("No cached user found, session is logged out");
                self.set_phase(SessionPhase::LoggedOut);
            }
        }

        self.phase()
    }

    /// 登录完成后的入口
    ///
    /// 运营账号直接路由到保留服务器，本地开发环境跳过选择提示，
    /// 其余用户进入服务器选择阶段
    pub async fn complete_login(self: &Arc<Self>, user: User) -> Result<()> {
        if self.cache.session_started_at().is_none() {
            self.cache.set_session_started_at(Utc::now());
        }
        self.local.set_cached_user(&user);
        *self.user.write().await = Some(user.clone());

        self.cache_master_credential().await;
        self.spawn_background_tasks();

        if user.is_admin() {
            info!("Operator account, auto-routing to reserved server");
            self.selector
                .select_manual(&user, self.config.servers.reserved.clone())
                .await;
            self.branch_on_credential().await;
            return Ok(());
        }

        if self.config.settings.local_dev {
            debug!("Local development context, skipping server selection");
            self.branch_on_credential().await;
            return Ok(());
        }

        self.set_phase(SessionPhase::ServerSelection);
        Ok(())
    }

    /// 服务器选择阶段的确认：None 表示走自动选择
    pub async fn confirm_server(self: &Arc<Self>, choice: Option<ServerId>) -> Result<()> {
        let user = self
            .current_user()
            .await
            .ok_or_else(|| anyhow::anyhow!("No active user to confirm server for"))?;

        match choice {
            Some(server) => {
                self.selector.select_manual(&user, server).await;
            }
            None => {
                self.selector.select_auto(&user).await;
            }
        }

        self.branch_on_credential().await;
        Ok(())
    }

    /// 凭证分配失败后的手动重试入口
    pub async fn retry_assignment(self: &Arc<Self>) {
        self.branch_on_credential().await;
    }

    /// 欢迎动画结束
    pub async fn finish_welcome(&self) {
        if self.phase() == SessionPhase::WelcomeAnimation {
            self.set_phase(SessionPhase::Ready);
        }
    }

    /// 处理服务端推送的强制登出时间戳
    /// 只有晚于会话开始时间的信号才是权威的
    pub async fn handle_force_logout(&self, force_logout_at: DateTime<Utc>) -> bool {
        let started_at = self.cache.session_started_at();

        let newer = match started_at {
            Some(started) => force_logout_at > started,
            // 没有会话开始时间说明会话状态已失效，信号按权威处理
            None => true,
        };

        if !newer {
            debug!(
                "Ignoring stale force-logout signal at {} (session started {:?})",
                force_logout_at, started_at
            );
            return false;
        }

        info!("Force-logout signal at {} is newer than session start, ending session", force_logout_at);
        self.logout().await;
        true
    }

    /// 结束会话：终止后台任务，清空本地状态
    pub async fn logout(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        if let Err(e) = self.auth.sign_out().await {
            warn!("Auth provider sign-out failed: {}", e);
        }

        self.cache.clear();
        self.local.clear_cached_user();
        *self.user.write().await = None;
        self.set_phase(SessionPhase::LoggedOut);
    }

    /// 有个人凭证直接进欢迎界面，否则运行分配引擎
    async fn branch_on_credential(self: &Arc<Self>) {
        let Some(user) = self.current_user().await else {
            return;
        };

        if user.has_personal_token() {
            self.set_phase(SessionPhase::WelcomeAnimation);
            return;
        }

        self.set_phase(SessionPhase::AwaitingTokenAssignment);

        let mut working = user;
        match self.engine.assign(&mut working).await {
            Ok(()) => {
                self.store_updated_user(working).await;
                // 固定的短暂展示延迟后再切换界面
                tokio::time::sleep(self.config.welcome_delay()).await;
                self.set_phase(SessionPhase::WelcomeAnimation);
            }
            Err(AssignError::AlreadyRunning) => {
                debug!("Assignment already in flight, leaving phase untouched");
            }
            Err(e) => {
                // 停留在分配阶段，错误细节由引擎快照承载，用户可手动重试
                error!("Token assignment failed: {}", e);
            }
        }
    }

    async fn store_updated_user(&self, user: User) {
        self.local.set_cached_user(&user);
        *self.user.write().await = Some(user.clone());
        self.bus.publish(SessionEvent::UserUsageUpdated(user));
    }

    async fn cache_master_credential(&self) {
        if self.cache.master_credential().is_some() {
            return;
        }

        match self.store.get_master_credential().await {
            Ok(Some(credential)) => self.cache.set_master_credential(&credential),
            Ok(None) => debug!("No master credential present in store"),
            Err(e) => warn!("Failed to fetch master credential: {}", e),
        }
    }

    fn spawn_background_tasks(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        // 心跳：固定间隔更新最后活跃时间，失败只记日志
        let heartbeat = {
            let this = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(this.config.heartbeat_interval());
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let Some(user) = this.current_user().await else {
                        continue;
                    };
                    if let Err(e) = this.store.touch_last_seen(&user.id).await {
                        warn!("Heartbeat failed for user '{}': {}", user.id, e);
                    }
                }
            })
        };
        tasks.push(heartbeat);

        // 事件循环：消费进程内事件，驱动静默重分配
        let events = {
            let this = self.clone();
            let mut rx = self.bus.subscribe();
            tokio::spawn(async move {
                while let Ok(event) = rx.recv().await {
                    match event {
                        SessionEvent::PersonalTokenFailed => {
                            let this = this.clone();
                            tokio::spawn(async move {
                                this.silent_reassign().await;
                            });
                        }
                        SessionEvent::UserUsageUpdated(_) | SessionEvent::ReloadRequired => {}
                    }
                }
            })
        };
        tasks.push(events);
    }

    /// 静默重分配：清掉失效凭证后重新运行引擎，不阻塞界面也不改变可见状态
    ///
    /// 有界重试：最多 silent_retry_limit 次，间隔固定退避；
    /// 全部失败后放弃，等待下一次失效信号或手动重试（见 DESIGN.md）
    pub async fn silent_reassign(self: &Arc<Self>) {
        if self
            .silent_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Silent reassignment already in flight, skipping");
            return;
        }

        let limit = self.config.settings.silent_retry_limit.max(1);
        for attempt in 1..=limit {
            match self.silent_reassign_once().await {
                Ok(()) => {
                    info!("Silent reassignment succeeded on attempt {}", attempt);
                    self.silent_in_flight.store(false, Ordering::SeqCst);
                    return;
                }
                Err(e) => {
                    warn!(
                        "Silent reassignment attempt {}/{} failed: {}",
                        attempt, limit, e
                    );
                    if attempt < limit {
                        tokio::time::sleep(self.config.silent_retry_backoff()).await;
                    }
                }
            }
        }

        warn!("Giving up silent reassignment after {} attempts", limit);
        self.silent_in_flight.store(false, Ordering::SeqCst);
    }

    async fn silent_reassign_once(self: &Arc<Self>) -> Result<()> {
        let Some(user) = self.current_user().await else {
            anyhow::bail!("No active user for silent reassignment");
        };

        // 失效凭证必须先清除，再开始新的分配尝试
        let mut working = if user.has_personal_token() {
            let cleared = self.store.clear_credential(&user.id).await?;
            self.local.set_cached_user(&cleared);
            *self.user.write().await = Some(cleared.clone());
            cleared
        } else {
            user
        };

        self.engine.assign(&mut working).await?;
        self.store_updated_user(working).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::prober::{CredentialProber, ProbeReport, ServiceVerdict};
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use harbor_core::store::{LeaseOutcome, StoreError};
    use harbor_core::{
        GlobalSettings, MemoryStorage, PoolEntry, ProbeService, ProbeSettings, ServerSettings,
        StoreSettings, UserRole,
    };
    use std::collections::HashMap;

    fn create_test_config(local_dev: bool) -> Config {
        Config {
            store: StoreSettings {
                base_url: "https://store.test.com".to_string(),
                api_key: "test-store-key-123456".to_string(),
                timeout_seconds: 5,
            },
            probe: ProbeSettings {
                timeout_seconds: 5,
                services: vec![
                    ProbeService {
                        name: "chat".to_string(),
                        url: "https://api.test.com/v1/chat".to_string(),
                    },
                    ProbeService {
                        name: "image".to_string(),
                        url: "https://api.test.com/v1/image".to_string(),
                    },
                ],
            },
            servers: ServerSettings {
                reserved: "ops-proxy-01".to_string(),
            },
            settings: GlobalSettings {
                welcome_delay_ms: 1,
                silent_retry_backoff_seconds: 1,
                local_dev,
                ..GlobalSettings::default()
            },
        }
    }

    struct MockStore {
        pool: Vec<PoolEntry>,
        servers: Vec<ServerId>,
    }

    impl Default for MockStore {
        fn default() -> Self {
            Self {
                pool: vec![PoolEntry {
                    token: "sk-pool".to_string(),
                    created_at: Utc::now(),
                }],
                servers: vec!["proxy-b1-01".to_string(), "proxy-b1-02".to_string()],
            }
        }
    }

    #[async_trait]
    impl PoolStore for MockStore {
        async fn get_master_credential(&self) -> Result<Option<String>, StoreError> {
            Ok(Some("sk-master".to_string()))
        }

        async fn get_credential_pool(&self) -> Result<Vec<PoolEntry>, StoreError> {
            Ok(self.pool.clone())
        }

        async fn lease_credential(&self, user_id: &str, token: &str) -> LeaseOutcome {
            let mut user = User::new(user_id, "Mock User");
            user.personal_token = Some(token.to_string());
            LeaseOutcome::Leased(user)
        }

        async fn clear_credential(&self, user_id: &str) -> Result<User, StoreError> {
            Ok(User::new(user_id, "Mock User"))
        }

        async fn set_server_assignment(
            &self,
            _user_id: &str,
            _server: Option<&ServerId>,
        ) -> Result<(), StoreError> {
            Ok(())
        }

        async fn get_server_usage_counts(&self) -> Result<HashMap<ServerId, u64>, StoreError> {
            Ok(HashMap::new())
        }

        async fn get_available_servers(&self, _user: &User) -> Result<Vec<ServerId>, StoreError> {
            Ok(self.servers.clone())
        }

        async fn touch_last_seen(&self, _user_id: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    struct AlwaysHealthyProber;

    #[async_trait]
    impl CredentialProber for AlwaysHealthyProber {
        async fn probe(&self, _credential: &str) -> ProbeReport {
            ProbeReport {
                services: vec![ServiceVerdict {
                    name: "chat".to_string(),
                    success: true,
                }],
            }
        }
    }

    struct NoopAuth;

    #[async_trait]
    impl AuthProvider for NoopAuth {
        async fn sign_out(&self) -> Result<()> {
            Ok(())
        }
    }

    fn create_orchestrator(local_dev: bool) -> Arc<SessionOrchestrator> {
        SessionOrchestrator::new(
            create_test_config(local_dev),
            Arc::new(MockStore::default()),
            Arc::new(AlwaysHealthyProber),
            Arc::new(NoopAuth),
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryStorage::new()),
        )
    }

    #[tokio::test]
    async fn test_bootstrap_without_cached_user_logs_out() {
        let orchestrator = create_orchestrator(false);
        let phase = orchestrator.bootstrap().await;
        assert_eq!(phase, SessionPhase::LoggedOut);
    }

    #[tokio::test]
    async fn test_login_enters_server_selection() {
        let orchestrator = create_orchestrator(false);
        let user = User::new("u1", "Test User");

        orchestrator.complete_login(user).await.unwrap();
        assert_eq!(orchestrator.phase(), SessionPhase::ServerSelection);
    }

    #[tokio::test]
    async fn test_operator_skips_selection_and_uses_reserved_server() {
        let orchestrator = create_orchestrator(false);
        let mut user = User::new("op1", "Operator");
        user.role = UserRole::Admin;
        user.personal_token = Some("sk-existing".to_string());

        orchestrator.complete_login(user).await.unwrap();

        // 运营账号不经过选择阶段，已有凭证时直接进入欢迎界面
        assert_eq!(orchestrator.phase(), SessionPhase::WelcomeAnimation);
        assert_eq!(
            orchestrator.cache.selected_server().as_deref(),
            Some("ops-proxy-01")
        );
    }

    #[tokio::test]
    async fn test_local_dev_skips_selection() {
        let orchestrator = create_orchestrator(true);
        let mut user = User::new("u1", "Test User");
        user.personal_token = Some("sk-existing".to_string());

        orchestrator.complete_login(user).await.unwrap();
        assert_eq!(orchestrator.phase(), SessionPhase::WelcomeAnimation);
    }

    #[tokio::test]
    async fn test_confirm_server_without_token_runs_assignment() {
        let orchestrator = create_orchestrator(false);
        let user = User::new("u1", "Test User");

        orchestrator.complete_login(user).await.unwrap();
        orchestrator.confirm_server(None).await.unwrap();

        // 引擎成功后经过展示延迟进入欢迎界面
        assert_eq!(orchestrator.phase(), SessionPhase::WelcomeAnimation);
        let user = orchestrator.current_user().await.unwrap();
        assert_eq!(user.personal_token.as_deref(), Some("sk-pool"));
    }

    #[tokio::test]
    async fn test_confirm_server_with_token_goes_to_welcome() {
        let orchestrator = create_orchestrator(false);
        let mut user = User::new("u1", "Test User");
        user.personal_token = Some("sk-existing".to_string());

        orchestrator.complete_login(user).await.unwrap();
        orchestrator
            .confirm_server(Some("proxy-b1-02".to_string()))
            .await
            .unwrap();

        assert_eq!(orchestrator.phase(), SessionPhase::WelcomeAnimation);
    }

    #[tokio::test]
    async fn test_phase_readable_without_subscribers() {
        let orchestrator = create_orchestrator(true);
        let mut user = User::new("u1", "Test User");
        user.personal_token = Some("sk-existing".to_string());

        // 全程没有phase订阅者，phase()仍要反映每次状态推进
        orchestrator.complete_login(user).await.unwrap();
        assert_eq!(orchestrator.phase(), SessionPhase::WelcomeAnimation);

        orchestrator.finish_welcome().await;
        assert_eq!(orchestrator.phase(), SessionPhase::Ready);

        // 之后才订阅的接收端看到的也是当前状态
        let rx = orchestrator.subscribe_phase();
        assert_eq!(*rx.borrow(), SessionPhase::Ready);
    }

    #[tokio::test]
    async fn test_finish_welcome_reaches_ready() {
        let orchestrator = create_orchestrator(true);
        let mut user = User::new("u1", "Test User");
        user.personal_token = Some("sk-existing".to_string());

        orchestrator.complete_login(user).await.unwrap();
        orchestrator.finish_welcome().await;
        assert_eq!(orchestrator.phase(), SessionPhase::Ready);
    }

    #[tokio::test]
    async fn test_stale_force_logout_is_ignored() {
        let orchestrator = create_orchestrator(true);
        let mut user = User::new("u1", "Test User");
        user.personal_token = Some("sk-existing".to_string());
        orchestrator.complete_login(user).await.unwrap();

        let stale = Utc::now() - ChronoDuration::hours(1);
        assert!(!orchestrator.handle_force_logout(stale).await);
        assert_ne!(orchestrator.phase(), SessionPhase::LoggedOut);
    }

    #[tokio::test]
    async fn test_newer_force_logout_ends_session() {
        let orchestrator = create_orchestrator(true);
        let mut user = User::new("u1", "Test User");
        user.personal_token = Some("sk-existing".to_string());
        orchestrator.complete_login(user).await.unwrap();

        let newer = Utc::now() + ChronoDuration::seconds(5);
        assert!(orchestrator.handle_force_logout(newer).await);
        assert_eq!(orchestrator.phase(), SessionPhase::LoggedOut);
        assert!(orchestrator.current_user().await.is_none());
        assert!(orchestrator.cache.session_started_at().is_none());
    }

    #[tokio::test]
    async fn test_silent_reassign_replaces_failed_token() {
        let orchestrator = create_orchestrator(true);
        let mut user = User::new("u1", "Test User");
        user.personal_token = Some("sk-dead".to_string());
        orchestrator.complete_login(user).await.unwrap();

        orchestrator.silent_reassign().await;

        let user = orchestrator.current_user().await.unwrap();
        assert_eq!(user.personal_token.as_deref(), Some("sk-pool"));
    }

    #[tokio::test]
    async fn test_bootstrap_restores_cached_user() {
        let local_storage = Arc::new(MemoryStorage::new());
        let mut cached = User::new("u1", "Test User");
        cached.personal_token = Some("sk-existing".to_string());
        LocalCache::new(local_storage.clone()).set_cached_user(&cached);

        let orchestrator = SessionOrchestrator::new(
            create_test_config(true),
            Arc::new(MockStore::default()),
            Arc::new(AlwaysHealthyProber),
            Arc::new(NoopAuth),
            Arc::new(MemoryStorage::new()),
            local_storage,
        );

        let phase = orchestrator.bootstrap().await;
        assert_eq!(phase, SessionPhase::WelcomeAnimation);
        assert!(orchestrator.current_user().await.is_some());
    }
}
