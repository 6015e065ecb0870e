pub mod orchestrator;
pub mod policy;
pub mod registry;
pub mod retry;
pub mod state;
pub mod store;
