mod adapter;

pub use adapter::{SlackAdapter, SlackConfig};
