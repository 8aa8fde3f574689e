pub mod health;
pub mod jobs;
pub mod sse;

pub use health::health_handler;
