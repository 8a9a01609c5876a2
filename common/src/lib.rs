pub mod api;
pub mod cloud_init;
pub mod identity;
pub mod telemetry;
