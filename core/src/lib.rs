pub mod db;
pub mod endpoint;
pub mod growth;
pub mod models;
pub mod orchestrator;
pub mod queue;
pub mod rate_limit;
pub mod sync_state;
pub mod units;
