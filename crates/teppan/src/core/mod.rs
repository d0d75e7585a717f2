//! # Core Scheduling
//!
//! The machinery behind [`GenerationHost`](crate::GenerationHost).
//!
//! ## Module Structure
//!
//! * [`assembler`] - Picks each tick's batch: keeps in-flight requests,
//!   fills free slots from the waiting list under an admission policy.
//!
//! * [`queue`] - The submission queue shared between callers and the tick
//!   loop.
//!
//! * [`scheduler`] - The tick loop itself: assemble, evaluate once, apply
//!   each member's result, retire finished requests, and the shutdown
//!   sequence.
//!
//! * [`worker`] - Owns the background task the tick loop runs on, with
//!   notification and stop/join support.
//!
pub mod assembler;
pub mod queue;
pub mod scheduler;
pub mod worker;
