//! Domain layer - call-control rules independent of wire formats
//!
//! - `call`: the call aggregate and its transition table
//! - `dialplan`: ordered routing rules
//! - `extension`: the extension registry port
//! - `ip_blacklist`: abuse counters and temporary bans
//! - `cdr`: the call lifecycle sink port

pub mod audio;
pub mod call;
pub mod cdr;
pub mod dialplan;
pub mod extension;
pub mod ip_blacklist;
pub mod shared;
pub mod sip_trunk;

// Re-export commonly used types
pub use shared::{DomainError, Result};
