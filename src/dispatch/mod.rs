//! Packet dispatch: handler registration, per-version tables and the
//! session-state gate.

mod catalog;
mod handler;
mod preprocess;
mod table;

pub use catalog::{HandlerCatalog, HandlerEntry, HandlerProvider, VersionSpec};
pub use handler::{handler_fn, HandlerResult, PacketHandler};
pub use preprocess::{Preprocessor, Requirement};
pub use table::{DispatchOutcome, DispatchRegistry, DispatchSettings, DispatchTable};
