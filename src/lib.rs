// OSI Layer modules
pub mod application; // Request builder and diagnostic client seam
pub mod data_link; // Acceptance filter table
pub mod physical; // CAN link and controller adapter
pub mod transport; // ISO-TP and TP2.0 sessions

// Re-exports for convenience
pub use application::{DiagnosticClient, DiagnosticResponse, RequestBuilder};
pub use data_link::{FilterTable, SessionFilter};
pub use physical::{can, CanLink};
pub use transport::{isotp, tp20, DiagnosticTransport};

// Common types and traits
pub mod config;
pub mod error;
pub mod timer;
pub mod types;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
