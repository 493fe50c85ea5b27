use async_trait::async_trait;
use harbor_core::config::ProbeSettings;
use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// 单个能力检查的结论
#[derive(Debug, Clone)]
pub struct ServiceVerdict {
    pub name: String,
    pub success: bool,
}

/// 一条候选凭证的探测报告
#[derive(Debug, Clone, Default)]
pub struct ProbeReport {
    pub services: Vec<ServiceVerdict>,
}

impl ProbeReport {
    /// 全部检查通过才算健康，任何一项失败都判定整条凭证不可用
    pub fn healthy(&self) -> bool {
        !self.services.is_empty() && self.services.iter().all(|v| v.success)
    }
}

/// 凭证探测器接口
///
/// 探测只做网络调用，没有其他副作用；
/// 网络错误和超时一律计为失败结论，不向调用方抛错
#[async_trait]
pub trait CredentialProber: Send + Sync {
    async fn probe(&self, credential: &str) -> ProbeReport;
}

/// 基于HTTP的探测器
/// 依次访问配置中的每个服务，用候选凭证做认证
pub struct HttpCredentialProber {
    client: Client,
    settings: ProbeSettings,
}

impl HttpCredentialProber {
    pub fn new(settings: ProbeSettings) -> Self {
        let timeout = Duration::from_secs(settings.timeout_seconds);
        let client = match Client::builder().timeout(timeout).build() {
            Ok(client) => client,
            Err(e) => {
                warn!(
                    "Failed to build probe HTTP client, falling back to default without the {}s timeout: {}",
                    settings.timeout_seconds, e
                );
                Client::new()
            }
        };

        Self { client, settings }
    }

    async fn check_service(&self, name: &str, url: &str, credential: &str) -> bool {
        let start_time = Instant::now();

        let result = self
            .client
            .get(url)
            .header("Authorization", format!("Bearer {credential}"))
            .send()
            .await;

        match result {
            Ok(response) => {
                let success = response.status().is_success();
                debug!(
                    "Probe service '{}' responded with status {} in {}ms",
                    name,
                    response.status(),
                    start_time.elapsed().as_millis()
                );
                success
            }
            Err(e) => {
                // 网络失败等同于负面结论，交给引擎继续扫描
                warn!("Probe service '{}' failed: {}", name, e);
                false
            }
        }
    }
}

#[async_trait]
impl CredentialProber for HttpCredentialProber {
    async fn probe(&self, credential: &str) -> ProbeReport {
        let mut services = Vec::with_capacity(self.settings.services.len());

        for service in &self.settings.services {
            let success = self
                .check_service(&service.name, &service.url, credential)
                .await;
            services.push(ServiceVerdict {
                name: service.name.clone(),
                success,
            });
        }

        ProbeReport { services }
    }
}
