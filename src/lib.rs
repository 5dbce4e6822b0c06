pub mod config;
pub mod control;
pub mod errors;
pub mod phase;
pub mod pipeline;
pub mod scheduler;
pub mod session;

pub use control::PipelineService;
pub use scheduler::{Ack, RunRequest};
