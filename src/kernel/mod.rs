//! Kernel — core infrastructure with dependency injection.
//!
//! IMPORTANT: kernel is for INFRASTRUCTURE only; HTTP handling lives in
//! `server`.

pub mod clock;
pub mod deps;
pub mod jobs;

pub use clock::{Clock, Random, SystemClock, SystemRandom};
pub use deps::AppDeps;
