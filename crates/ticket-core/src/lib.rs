pub mod audit;
pub mod config;
pub mod guardrails;
pub mod prompt;
pub mod review_output;
pub mod types;

pub use config::{Config, ProjectRegistry};
pub use review_output::{ParsedReview, ReviewSource};
pub use types::*;
