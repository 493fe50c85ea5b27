//! Harbor Core Library
//!
//! This library provides core functionality for the Harbor client shell including:
//! - Configuration management
//! - User and session types
//! - Storage-service abstraction (session/local key-value state)
//! - Pool store collaborator contract and its HTTP implementation

pub mod auth;
pub mod config;
pub mod storage;
pub mod store;

// Re-export commonly used types
pub use auth::{AuthProvider, Cohort, ServerId, User, UserRole};
pub use config::{
    Config, GlobalSettings, ProbeService, ProbeSettings, ServerSettings, StoreSettings,
};
pub use storage::{KeyValueStorage, LocalCache, MemoryStorage, Preferences, SessionCache};
pub use store::{HttpPoolStore, LeaseOutcome, PoolEntry, PoolStore, StoreError};
