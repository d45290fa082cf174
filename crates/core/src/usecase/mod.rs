pub mod context;
pub mod job_monitor;
pub mod poller;
pub mod recovery;
pub mod watch_registry;
