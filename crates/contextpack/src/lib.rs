//! Assembles the per-turn context pack injected ahead of the user's
//! message: workspace files, skills index, and user-fact digests, each
//! truncated to its configured budget and reported back for observability.

pub mod builder;
pub mod injection;
pub mod report;
pub mod truncation;
