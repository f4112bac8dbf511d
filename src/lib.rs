//! Core of the `finrag` financial assistant: a persistent vector index over a
//! finance Q&A corpus, a sandboxed calculator, and a tool-calling chat loop
//! that ties them together.

// Declare all library modules to make them accessible.
pub mod agent;
pub mod client;
pub mod config;
pub mod datam;
pub mod embed;
pub mod error;
pub mod ingest;
pub mod orchestra;
pub mod providers;
pub mod retrieval;
pub mod sandbox;
pub mod tools;
pub mod vector;

pub use agent::{AgentSettings, FinancialAgent};
pub use config::AppConfig;
pub use error::{FinRagError, Result};
pub use retrieval::{RetrievalEngine, TopicFilter, TopicSource};
