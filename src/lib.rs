// ABOUTME: Library side of the opera binary: concrete classifier, transport and directory backends.
// ABOUTME: The orchestration logic itself lives in opera-core; this crate plugs it into the outside world.

pub mod http_classifier;
pub mod logging;
pub mod sqlite_directory;
pub mod stdio_transport;

pub use http_classifier::{classifier_registry, HttpClassifier};
pub use sqlite_directory::SqliteDirectory;
pub use stdio_transport::JsonLineTransport;
