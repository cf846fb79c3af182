//! SIP protocol implementation (RFC 3261)
//!
//! Architecture:
//! ```text
//! ┌─────────────────────────┐
//! │  Call workers           │  call_handler, call_router
//! └───────────┬─────────────┘
//! ┌───────────▼─────────────┐
//! │  Dialogs / registrar    │  dialog, registrar, auth
//! └───────────┬─────────────┘
//! ┌───────────▼─────────────┐
//! │  Transactions           │  transaction, server
//! └───────────┬─────────────┘
//! ┌───────────▼─────────────┐
//! │  Transport (UDP, TCP)   │  transport, message, builder
//! └─────────────────────────┘
//! ```

pub mod auth;
pub mod builder;
pub mod call_handler;
pub mod call_router;
pub mod dialog;
pub mod message;
pub mod registrar;
pub mod sdp;
pub mod server;
pub mod transaction;
pub mod transport;

pub use auth::{AuthChallenge, ChallengeKind, DigestAuth};
pub use builder::{RequestBuilder, ResponseBuilder};
pub use call_handler::{CallServices, CallSettings, CallSetupError, CallWorker};
pub use call_router::{CallInput, CallManager, TransferError};
pub use dialog::{Dialog, DialogId, DialogState};
pub use message::{SipError, SipHeaders, SipMessage, SipMethod, SipRequest, SipResponse};
pub use registrar::{Registrar, RegistrarConfig};
pub use sdp::{MediaDirection, SdpCodec, SdpError, SdpSession};
pub use server::SipServer;
pub use transaction::{Outbound, ServerTransactions, SipTimers};
pub use transport::{
    ChannelSender, IncomingMessage, OutgoingMessage, SipSender, TransportProtocol,
};
