pub mod config;
pub mod exec;
pub mod job;
pub mod lifecycle;
pub mod schedule;
pub mod terminal;
