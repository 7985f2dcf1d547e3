//! # courier-shared
//!
//! Domain and wire types shared by the Courier store and server crates:
//! identities, location scopes, message envelopes, push intents and the
//! frames exchanged over live connections and the cross-process relay.

pub mod constants;
pub mod envelope;
pub mod error;
pub mod protocol;
pub mod types;

pub use envelope::{MessageEnvelope, PushEvent};
pub use error::CourierError;
pub use protocol::{ClientFrame, RelayFrame};
pub use types::{Identity, IdentityKind, LocationId};
