pub mod health;
pub mod readiness;
pub mod uploads;
