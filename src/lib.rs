//! Hierarchical statechart runtime: JSON documents, parallel regions,
//! event-driven transitions, and a frame/pump-driven cooperative event
//! loop.
//!
//! A [`Document`] is the immutable, validated shape of one statechart. A
//! [`Machine`] is a running instance of a document: an active
//! configuration, an event queue, and the entry/exit/action slots bound to
//! it. The [`MachineRegistry`] holds installed documents and hands out
//! named machines on demand.
//!
//! ```no_run
//! use statechart::{HandlerSet, MachineRegistry};
//!
//! # fn main() -> Result<(), statechart::EngineError> {
//! let registry = MachineRegistry::new();
//! registry.install_document(
//!     "door",
//!     r#"{"states": [
//!         {"id": "closed", "transitions": [{"event": "push", "target": "open"}]},
//!         {"id": "open"}
//!     ]}"#,
//! )?;
//!
//! let door = registry.get_machine("door")?;
//! let mut door = door.lock();
//! door.register_handler(HandlerSet::new().on("onentry_open", |_| println!("creak")));
//! door.start_engine()?;
//! door.enqueue_event("push");
//! door.pump_events()?;
//! assert!(door.in_state("open")?);
//! # Ok(())
//! # }
//! ```

pub mod configuration;
pub mod document;
pub mod error;
pub mod machine;
pub mod pool;
pub mod registry;
pub mod slots;

pub use configuration::{Activation, Configuration};
pub use document::{Document, NodeId, NodeKind, StateNode, Transition};
pub use error::EngineError;
pub use machine::{Lifecycle, Machine};
pub use pool::{PoolScope, ScopedPool};
pub use registry::{MachineHandle, MachineRegistry};
pub use slots::{ActionFn, HandlerSet, SlotContext};
