pub mod activity_log;
pub mod discovery_result;
pub mod discovery_task;
pub mod node;
