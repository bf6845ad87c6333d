//! Capture → encode → mux → transmit coordination
//!
//! The producer thread talks to `PipelineCoordinator`; a dedicated worker
//! thread owns the GPU context, the encoders and the muxer and processes a
//! FIFO of tasks. Only two guarded flags (worker running, worker ready) and
//! the task queue cross between the threads.

mod coordinator;
pub mod queue;
pub mod state;
mod worker;

pub use coordinator::PipelineCoordinator;
pub use queue::TaskQueue;
pub use state::{PipelineEvent, SessionState, SessionStats};
