// ABOUTME: Pluggable classifier abstraction for opera.
// ABOUTME: Trait-based backends, a factory registry, typed responses and defensive JSON repair.

pub mod backends;
pub mod config;
pub mod registry;
pub mod repair;
pub mod request;
pub mod response;
pub mod traits;

pub use config::ClassifierConfig;
pub use registry::{ClassifierFactory, ClassifierRegistry};
pub use request::{ClassifierMode, ClassifierRequest, ContextEntry, ResourceRef};
pub use response::{CodeDetails, ContextResponse, IntentResponse, ResourceSpec};
pub use traits::Classifier;
