// Background jobs

pub mod points_expiration;

pub use points_expiration::{expire_due_points, start_scheduler, ExpirationStats};
