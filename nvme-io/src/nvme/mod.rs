//! NVMe driver API.
//!
//! Direct access to NVMe controllers and namespaces over a [`Transport`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  Transport       │  ← enumerate / attach, DMA memory, queues
//! └────────┬─────────┘
//!          │ discover()
//! ┌────────┴─────────┐
//! │  NvmeController  │
//! └────────┬─────────┘
//!     ┌────┴────┐
//!     ▼         ▼
//! ┌───────┐ ┌─────────┐
//! │  NS1  │ │NvmeQpair│  ← per-thread submission/completion
//! └───────┘ └─────────┘
//! ```
//!
//! Commands are submitted with a completion callback and complete only when
//! the queue pair is polled with [`NvmeQpair::process_completions`].

pub(crate) mod cmd;
pub(crate) mod controller;
mod emulated;
mod namespace;
mod opts;
mod probe;
mod qpair;
mod transport;

pub use cmd::{Completion, IoCommand, Opcode, Status};
pub use controller::NvmeController;
pub use emulated::{
    CompletionOrder, ControllerConfig, DEFAULT_IO_QUEUE_SIZE, EmulatedConfig, EmulatedTransport,
    EmulatedTransportBuilder, EmulatorStats, NamespaceConfig,
};
pub use namespace::NvmeNamespace;
pub use opts::NvmeQpairOpts;
pub use probe::{
    AcceptAll, AcceptPolicy, Discovered, FirstUsable, TeardownReport, discover, discover_all,
    discover_first, teardown,
};
pub use qpair::NvmeQpair;
pub use transport::{
    CommandId, ControllerData, ControllerId, NamespaceData, QpairId, Transport, TransportId,
    TransportType,
};
