pub mod error;
pub mod events;

pub use error::StoreError;
pub use events::{EventEntry, EventLog, Subscription};
