//! `conduit-core` — shared configuration, error taxonomy, collaborator
//! contracts, wire envelope shape and audit redaction for the chat
//! streaming substrate.

pub mod collab;
pub mod config;
pub mod envelope;
pub mod error;
pub mod redact;

pub use collab::{AgentEvent, AgentRunner, SandboxService};
pub use config::Config;
pub use envelope::Envelope;
pub use error::{CoreError, Result};
