//! pbx-core - call-control core of a small PBX
//!
//! SIP signalling, RTP relaying, DTMF detection and dialplan routing,
//! organised the Domain-Driven Design way: `domain` holds the rules,
//! `infrastructure` the protocols and media, `context` wires them.

pub mod config;
pub mod context;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use config::Config;
pub use context::{ContextError, CoreContext};
pub use domain::shared::error::DomainError;
pub use domain::shared::result::Result;
pub use infrastructure::protocols::sip::SipServer;
