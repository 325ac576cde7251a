pub mod config;
pub mod config_validator;
pub mod discord;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod health;
pub mod idempotency;
pub mod job;
pub mod key_generator;
pub mod metrics;
pub mod middleware;
pub mod monitor;
pub mod mutation;
pub mod payload;
pub mod queue;
pub mod rate_limiter;
pub mod redis;
pub mod response;
pub mod server;
pub mod store;
pub mod token_bucket;
pub mod validation;
pub mod worker;

pub use config::Config;
pub use engine::{Backends, EngineSettings, JobSubmission, SynthesisEngine};
pub use error::{Result, SynthesisError};
pub use job::{JobId, JobSnapshot, JobState, JobType};
pub use server::create_app;
