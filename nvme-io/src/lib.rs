//! Polled asynchronous block I/O over NVMe-style controllers.
//!
//! This crate discovers controllers on a [`Transport`](nvme::Transport),
//! attaches to their first active namespace, and drives write/read-back
//! cycles through queue pairs that only make progress when polled. There is
//! no interrupt path and no background thread: completion callbacks run from
//! [`NvmeQpair::process_completions`](nvme::NvmeQpair::process_completions)
//! on the caller's thread.
//!
//! # Quick Start
//!
//! ```
//! use std::rc::Rc;
//! use nvme_io::nvme::{
//!     ControllerConfig, EmulatedTransport, NamespaceConfig, Transport, discover_all, teardown,
//! };
//! use nvme_io::{IoTask, PollLimit, Result, run_all};
//!
//! fn main() -> Result<()> {
//!     let transport: Rc<dyn Transport> = Rc::new(
//!         EmulatedTransport::builder()
//!             .controller(
//!                 ControllerConfig::new("0000:00:04.0")
//!                     .cmb_size(8192)
//!                     .namespace(NamespaceConfig::new(1, 1024)),
//!             )
//!             .build()?,
//!     );
//!
//!     let entries = discover_all(&transport)?;
//!     let tasks = [IoTask::message(0, "Hello World!")];
//!     for outcome in run_all(&entries, &tasks, &PollLimit::unbounded()) {
//!         for report in outcome? {
//!             println!("{}", report?.message());
//!         }
//!     }
//!     assert!(teardown(entries).is_clean());
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`nvme`] - Controllers, namespaces, queue pairs, discovery and the
//!   emulated transport
//! - [`dma`] - DMA-capable buffer allocation across memory tiers
//! - [`complete`] - Completion callbacks and callback-to-future utilities
//! - [`poller`] - Bounded busy-poll loops
//! - [`pipeline`] - Write-then-read-back orchestration
//! - [`error`] - Error types

pub mod complete;
pub mod dma;
pub mod error;
pub mod nvme;
pub mod pipeline;
pub mod poller;

// Re-exports
pub use complete::{CompletionReceiver, CompletionSender, IoCompletion, block_on, completion};
pub use dma::{BufferTier, DmaBuf};
pub use error::{Error, Result, SubmitError};
pub use pipeline::{
    IoContext, IoTask, PendingIo, PipelineReport, Stage, run_all, run_namespace, run_pipeline,
};
pub use poller::{PollLimit, PollStats, poll_until};
