// Services module - Business logic

pub mod balance;
pub mod locks;
pub mod loyalty;
pub mod notifier;
pub mod verification;

pub use loyalty::{LoyaltyService, LoyaltySettings};
