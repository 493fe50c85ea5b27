pub mod engine;
pub mod events;
pub mod orchestrator;
pub mod prober;
pub mod selector;

pub use engine::{AssignError, AssignmentEngine, EnginePhase, EngineSnapshot};
pub use events::{EventBus, SessionEvent};
pub use orchestrator::{SessionOrchestrator, SessionPhase};
pub use prober::{CredentialProber, HttpCredentialProber, ProbeReport, ServiceVerdict};
pub use selector::{SelectionOutcome, ServerSelector};
