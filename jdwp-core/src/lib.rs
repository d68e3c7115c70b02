// JDWP client engine
//
// Attaches to a Java VM over the Java Debug Wire Protocol:
// - Session transport with concurrent command/reply correlation
// - Id-size aware value codec
// - Event subscriptions with per-request delivery loops
// - Lazily resolved event objects

pub mod codec;
pub mod commands;
pub mod config;
mod delivery;
mod eventloop;
pub mod eventrequest;
pub mod events;
pub mod method;
pub mod object;
pub mod protocol;
pub mod reftype;
pub mod session;
pub mod thread;
pub mod translator;
pub mod types;
pub mod vm;

#[cfg(test)]
mod testing;

pub use codec::{JdwpDecode, JdwpEncode, JdwpReader, JdwpWriter};
pub use config::SessionConfig;
pub use eventrequest::{
    ClassPattern, EventRequest, EventRequestManager, StepDepth, StepSize, SuspendPolicy,
};
pub use events::{EventKind, EventModifier, EventResponse, EventSet};
pub use protocol::{JdwpError, JdwpResult};
pub use session::{FreezeGuard, Session, WeakSession};
pub use translator::{EventObject, ObjectRef, ResolvedLocation, ThreadRef, TypeRef};
pub use types::{IdSizes, Location, Value};
