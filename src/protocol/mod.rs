//! Protocol detection module
//!
//! Pure classifiers over the first bytes of a connection, the buffer those
//! bytes accumulate in, and the table of protocols they are matched against.

mod buffer;
mod detector;
mod pattern;
mod signature;
mod table;
pub mod tls;

pub use buffer::ConnectionBuffer;
pub use detector::{Probe, ProbeResult};
pub use pattern::{MatchMode, PatternError, PatternProbe};
pub use signature::Signature;
pub use table::{Backend, EntryFlags, ProtocolEntry, ProtocolTable};
pub use tls::{ClientHello, TlsProbe};
