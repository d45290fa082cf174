pub mod clock;
pub mod events;
pub mod metrics;
pub mod store;
