//! Application Services
//!
//! Services that run the engine and coordinate it with the upstream ports.
//!
//! - `EventSink` / `run_event_pump`: hand-off between producers and the engine
//! - `PollingFallback`: per-instrument minute bar pull loops
//! - `LivenessGuard`: resubscribe, heartbeat and stale-session loops
//! - `StreamRuntime`: wiring and lifecycle of all of the above

mod guard;
mod handoff;
mod polling;
mod runtime;

pub use guard::{GuardConfig, LivenessGuard};
pub use handoff::{EventSink, run_event_pump};
pub use polling::{PollingConfig, PollingFallback};
pub use runtime::StreamRuntime;
