use super::prober::CredentialProber;
use harbor_core::store::{LeaseOutcome, PoolStore};
use harbor_core::{SessionCache, User};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// 分配流程的粗粒度阶段，供UI消费
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Idle,
    Scanning,
    Assigning,
    Success,
    Error,
}

/// 引擎进度快照
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub phase: EnginePhase,
    /// 当前扫描到第几个候选（从1开始）
    pub current: usize,
    pub total: usize,
    pub message: Option<String>,
}

impl EngineSnapshot {
    fn idle() -> Self {
        Self {
            phase: EnginePhase::Idle,
            current: 0,
            total: 0,
            message: None,
        }
    }
}

/// 分配失败类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssignError {
    /// 同一进程内已有一次分配在进行中，本次调用不产生任何副作用
    #[error("assignment already running")]
    AlreadyRunning,
    /// 共享池为空或不可达
    #[error("no tokens available in the shared pool")]
    PoolEmpty,
    /// 所有候选都不健康或被占用
    #[error("pool exhausted: all {probed} candidates unhealthy or claimed")]
    Exhausted { probed: usize },
    /// 存储结构漂移，终态错误，需要运营介入后手动重试
    #[error("store schema drift: {0}. Operator action is required before retrying")]
    SchemaDrift(String),
}

/// 令牌分配引擎
///
/// 拉取共享池 → 洗牌 → 逐个探测 → 对第一个健康候选尝试租借。
/// 探测失败和租借冲突都只记日志后跳到下一个候选；
/// 引擎内部没有自动重试，由调用方手动重新发起
pub struct AssignmentEngine {
    store: Arc<dyn PoolStore>,
    prober: Arc<dyn CredentialProber>,
    cache: SessionCache,
    /// 单槽位的进行中资源：占不到说明已有一次调用在飞行中
    in_flight: tokio::sync::Mutex<()>,
    rng: Mutex<StdRng>,
    snapshot_tx: watch::Sender<EngineSnapshot>,
}

impl AssignmentEngine {
    pub fn new(
        store: Arc<dyn PoolStore>,
        prober: Arc<dyn CredentialProber>,
        cache: SessionCache,
    ) -> Self {
        Self::with_rng(store, prober, cache, StdRng::from_os_rng())
    }

    /// 注入确定性随机源，测试用
    pub fn with_rng_seed(
        store: Arc<dyn PoolStore>,
        prober: Arc<dyn CredentialProber>,
        cache: SessionCache,
        seed: u64,
    ) -> Self {
        Self::with_rng(store, prober, cache, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        store: Arc<dyn PoolStore>,
        prober: Arc<dyn CredentialProber>,
        cache: SessionCache,
        rng: StdRng,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(EngineSnapshot::idle());
        Self {
            store,
            prober,
            cache,
            in_flight: tokio::sync::Mutex::new(()),
            rng: Mutex::new(rng),
            snapshot_tx,
        }
    }

    /// 订阅进度快照
    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshot_tx.subscribe()
    }

    fn publish(&self, phase: EnginePhase, current: usize, total: usize, message: Option<String>) {
        // send_replace存值不依赖订阅者存在，晚订阅也能读到最新快照
        self.snapshot_tx.send_replace(EngineSnapshot {
            phase,
            current,
            total,
            message,
        });
    }

    /// 为用户分配一条健康的池凭证
    ///
    /// 成功时恰好租借一条凭证并更新用户记录；
    /// 失败时不修改用户状态。并发调用立即返回 `AlreadyRunning`
    pub async fn assign(&self, user: &mut User) -> Result<(), AssignError> {
        let _guard = match self.in_flight.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Assignment already in flight for this session, rejecting call");
                return Err(AssignError::AlreadyRunning);
            }
        };

        self.publish(EnginePhase::Scanning, 0, 0, None);

        let mut pool = match self.load_pool().await {
            Ok(pool) => pool,
            Err(e) => {
                self.publish(EnginePhase::Error, 0, 0, Some(e.to_string()));
                return Err(e);
            }
        };

        // 均匀随机置换，避免并发用户按同一顺序探测导致的租借碰撞
        pool.shuffle(&mut *self.rng.lock());

        let total = pool.len();
        info!("Starting assignment scan over {} pool candidates", total);

        for (index, entry) in pool.iter().enumerate() {
            let current = index + 1;
            self.publish(EnginePhase::Scanning, current, total, None);

            let report = self.prober.probe(&entry.token).await;
            if !report.healthy() {
                // 单条凭证不健康属于局部事件，跳过即可，不上报给用户
                debug!("Candidate {}/{} failed health probe, skipping", current, total);
                continue;
            }

            self.publish(EnginePhase::Assigning, current, total, None);

            match self.store.lease_credential(&user.id, &entry.token).await {
                LeaseOutcome::Leased(updated) => {
                    info!(
                        "Leased pool credential to user '{}' after probing {}/{} candidates",
                        user.id, current, total
                    );
                    *user = updated;
                    self.publish(EnginePhase::Success, current, total, None);
                    return Ok(());
                }
                LeaseOutcome::AlreadyClaimed => {
                    debug!(
                        "Candidate {}/{} was claimed by another user between probe and lease",
                        current, total
                    );
                    continue;
                }
                LeaseOutcome::Failed(e) if e.is_schema_drift() && user.is_admin() => {
                    // 结构漂移对运营账号是可行动的终态错误，立即中止扫描
                    error!("Schema drift detected during lease, aborting scan: {}", e);
                    let err = AssignError::SchemaDrift(e.to_string());
                    self.publish(EnginePhase::Error, current, total, Some(err.to_string()));
                    return Err(err);
                }
                LeaseOutcome::Failed(e) => {
                    warn!(
                        "Lease attempt for candidate {}/{} failed, continuing: {}",
                        current, total, e
                    );
                    continue;
                }
            }
        }

        let err = AssignError::Exhausted { probed: total };
        warn!("Assignment scan exhausted the pool: {}", err);
        self.publish(EnginePhase::Error, total, total, Some(err.to_string()));
        Err(err)
    }

    /// 取会话内缓存的池快照，没有时从存储拉取并回填缓存
    async fn load_pool(&self) -> Result<Vec<harbor_core::PoolEntry>, AssignError> {
        if let Some(cached) = self.cache.credential_pool() {
            if !cached.is_empty() {
                debug!("Using cached credential pool snapshot ({} entries)", cached.len());
                return Ok(cached);
            }
        }

        let fetched = match self.store.get_credential_pool().await {
            Ok(pool) => pool,
            Err(e) => {
                warn!("Failed to fetch credential pool: {}", e);
                return Err(AssignError::PoolEmpty);
            }
        };

        if fetched.is_empty() {
            return Err(AssignError::PoolEmpty);
        }

        self.cache.set_credential_pool(&fetched);
        Ok(fetched)
    }
}
