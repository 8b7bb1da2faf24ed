//! Background delivery: the handler pipeline and the threads that drive it.

pub mod delivery;
pub mod projection_worker;

pub use delivery::{DegradedStream, DeliveryPipeline, PipelineHealth, RetryPolicy};
pub use projection_worker::{ProjectionWorker, TickWorker, WorkerHandle};
