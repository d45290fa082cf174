pub mod error;
pub mod job;
pub mod settings;
pub mod severity;
pub mod status_view;
pub mod watch;
