//! Wire protocol for the group-messaging server
//!
//! JSON text frames carrying an [`Envelope`] whose `type` is one of
//! [`MessageType`]. The coordinator treats `data` as opaque apart from the
//! handful of fields described by the payload structs.

mod envelope;
mod types;

pub use envelope::*;
pub use types::*;
