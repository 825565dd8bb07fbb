// ABOUTME: Stateful orchestration core: dialogue pool, classification, task routing and topic tracking.
// ABOUTME: Transport and persistence are traits so the binary and tests can plug in their own.

pub mod analysis;
pub mod config;
pub mod dialogue;
pub mod dispatcher;
pub mod manager;
pub mod memory;
pub mod metrics;
pub mod mime;
pub mod paths;
pub mod pool;
pub mod registry;
pub mod resource;
pub mod retry;
pub mod router;
pub mod tags;
pub mod task;
pub mod topic;
pub mod traits;

pub use config::Config;
pub use dialogue::{DialogueRecord, DialogueType, InboundEvent, Priority};
pub use manager::{IngestReport, Manager};
pub use pool::DialoguePool;
pub use retry::StatusError;
pub use task::{Task, TaskQueue, TaskStatus, TaskType};
pub use topic::TopicTracker;
pub use traits::{Directory, OutboundMessage, Transport};
