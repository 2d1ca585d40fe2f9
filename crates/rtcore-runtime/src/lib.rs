#![doc = "Periodic real-time execution engine for rtcore."]

pub mod channel;
pub mod orchestrator;
pub mod realtime;
pub mod scheduler;
pub mod watchdog;
pub mod worker;

pub use channel::*;
pub use orchestrator::*;
pub use realtime::*;
pub use scheduler::*;
pub use watchdog::*;
pub use worker::*;
