//! Scheduled purchase engine.
//!
//! Layering, bottom-up:
//!   types, messages, stats   shared data, event bus, counters
//!   traits                   Storefront and ResponseClassifier seams
//!   session                  single-flight login, TTL refresh
//!   registry                 per-attempt state machine, batch status
//!   scheduler                hold until fire time, release atomically
//!   executor                 admission-controlled purchase calls, retries
//!   engine                   submit / status / cancel facade

pub mod engine;
pub mod executor;
pub mod messages;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod stats;
pub mod traits;
pub mod types;

pub use engine::{parse_fire_time, EngineConfig, PurchaseEngine};
pub use messages::{EventBus, Outcome, PurchaseEvent};
pub use traits::{CookieJar, Credentials, LoginTimings, RemoteResponse, ResponseClassifier, Storefront};
pub use types::{AttemptId, AttemptState, BatchId, BatchState, BatchStatus, ItemRef, StatusRecord};
