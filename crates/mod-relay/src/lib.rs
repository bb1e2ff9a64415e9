pub mod backoff;
pub mod delivery;
pub mod filter;
pub mod pipeline;
pub mod session;

pub use backoff::{ConnectionState, ReconnectPolicy, RetryPolicy};
pub use delivery::DeliveryClient;
pub use filter::{evaluate, Condition, FilterRule, RewriteSpec, RuleSet, RuleSpec};
pub use pipeline::{Outcome, Pipeline, PipelineOptions};
pub use session::{SessionController, SessionEvent, SessionOptions, SessionState};
