pub mod core;
pub mod jobs;
pub mod reports;
pub mod results;
pub mod scales;
pub mod setup;
pub mod sources;
