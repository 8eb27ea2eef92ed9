//! HTTP handlers.

pub mod schedules;
pub mod status;
pub mod webhook;

pub use schedules::{
    change_schedule_status, get_property, get_schedule, ChangeStatusHandler, ChangeStatusRequest,
    ReadResourceHandler,
};
pub use status::{health_handler, readiness_handler, status_handler};
pub use webhook::ingest_webhook;
