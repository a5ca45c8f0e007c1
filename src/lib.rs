pub mod agent;
pub mod approvals;
pub mod config;
pub mod db;
pub mod errors;
pub mod git;
pub mod github;
pub mod llm;
pub mod memory;
pub mod models;
pub mod pipeline;
pub mod poller;
pub mod queue;
pub mod recovery;
pub mod server;
pub mod worker;

#[cfg(test)]
pub mod testkit;
