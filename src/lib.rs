//! Coverage-improvement service: clone a repository, read its coverage from
//! SonarQube, generate tests for poorly covered files with an LLM and open a
//! pull request with them.

pub mod agent;
pub mod analysis;
pub mod config;
pub mod error;
pub mod llm;
pub mod platform;
pub mod quality;
pub mod queue;
pub mod server;
pub mod shutdown;
pub mod workflow;
pub mod workspace;
