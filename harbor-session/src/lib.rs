//! Harbor Session Library
//!
//! This library provides the session-side logic for the Harbor client shell including:
//! - Credential health probing
//! - Token assignment engine (scan, probe, lease)
//! - Least-loaded server selection with randomized fallback
//! - Session lifecycle orchestration and in-process events

pub mod session;

use tracing_subscriber::EnvFilter;

/// 初始化日志 - 完全依赖RUST_LOG环境变量
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_file(true)
        .with_line_number(true)
        .init();
}

// Re-export commonly used types
pub use session::{
    AssignError, AssignmentEngine, CredentialProber, EnginePhase, EngineSnapshot, EventBus,
    HttpCredentialProber, ProbeReport, SelectionOutcome, ServerSelector, ServiceVerdict,
    SessionEvent, SessionOrchestrator, SessionPhase,
};
