pub mod agent;
pub mod clock;
pub mod collector;
pub mod config;
pub mod export;
pub mod pipeline;
pub mod queue;
pub mod sink;
