//! DTMF detection and the feature attach point
//!
//! - `dtmf`: digits, sources and SIP INFO bodies
//! - `goertzel`: in-band tone detection
//! - `rfc2833`: telephone-event payloads
//! - `queue`: per-call arbitration between the three sources
//! - `feature`: handler table and session handed to IVR features

pub mod dtmf;
pub mod feature;
pub mod goertzel;
pub mod queue;
pub mod rfc2833;

pub use dtmf::{DtmfDigit, DtmfEvent, DtmfParseError, DtmfParser, DtmfSource};
pub use feature::{FeatureError, FeatureHandler, FeatureSession, FeatureTable};
pub use goertzel::{GoertzelConfig, GoertzelDetector};
pub use queue::{DtmfQueue, DtmfQueueConfig, PushOutcome};
pub use rfc2833::{Rfc2833Receiver, Rfc2833Sender, TelephoneEvent};
