//! Pipeline event bus and terminal log rendering

pub mod bus;
pub mod logger;

pub use bus::{Emitter, Event, LogStream, StepSummary};
pub use logger::TerminalLogger;
