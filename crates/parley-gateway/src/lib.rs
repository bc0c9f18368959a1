pub mod bus;
pub mod connection;
pub mod filter;

pub use bus::{EventBus, Subscription};
