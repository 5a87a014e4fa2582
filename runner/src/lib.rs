pub mod cli;
pub mod config;
pub mod database;
pub mod executors;
pub mod partition;
pub mod processor;
pub mod report;
pub mod reset;
pub mod sync;
pub mod worker;
