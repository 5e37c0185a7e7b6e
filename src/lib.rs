// Source and flow configuration
pub mod config;

// Encrypted secret storage
pub mod secrets;

// Run state, interactions and suspension snapshots
pub mod state;

// Payload extraction strategies
pub mod parser;

// OAuth and PKCE credential acquisition
pub mod auth;

// The flow state machine
pub mod executor;

// Per-source collection loops
pub mod scheduler;

// Engine facade
pub mod engine;

// Browser-assisted scrape seam
pub mod webview;

// Run-level error taxonomy
pub mod error;
