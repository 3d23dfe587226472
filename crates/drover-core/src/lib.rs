//! The drover broker core: router transport, session registry, task state
//! machine, the single-threaded dispatch loop, and the monitoring API.

pub mod api;
pub mod broker;
pub mod registry;
pub mod router;
pub mod state;
