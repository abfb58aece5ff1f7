//! In-process event publishing for pipeline progress and job lifecycle.
//!
//! Consumers (a UI, a log sink) subscribe to the [`bus::EventBus`]; emitters
//! never know who is listening. Delivery is fire-and-forget, at most once
//! per subscriber.

pub mod bus;

pub use bus::{EventBus, PipelineEvent, ProgressUpdate, StageStatus};
