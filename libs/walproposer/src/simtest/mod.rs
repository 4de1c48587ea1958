//! In-memory capability implementation for deterministic tests, in the
//! spirit of `walproposer::simtest`'s simulated safekeeper -- but scoped to
//! exercising the core algorithms (election, recovery, streaming) directly
//! rather than simulating a full network.

pub mod api;

pub use api::SimulatedApi;
