//! Write-then-read-back pipeline over a namespace.
//!
//! Each [`IoTask`] becomes an [`IoContext`] that walks through
//!
//! ```text
//! AllocatingWriteBuf -> WriteSubmitted -> (write completes)
//!   -> AllocatingReadBuf -> ReadSubmitted -> (read completes) -> Done
//! ```
//!
//! The first stage runs on the caller's stack, every later stage runs inside
//! the completion callback of the previous command. Several contexts can share
//! one queue pair; [`run_pipeline`] starts them all and then polls until each
//! has reported an outcome.
//!
//! # Example
//!
//! ```
//! use std::rc::Rc;
//! use nvme_io::nvme::{
//!     ControllerConfig, EmulatedTransport, NamespaceConfig, Transport, discover_first,
//! };
//! use nvme_io::{IoTask, PollLimit, run_namespace};
//!
//! let transport: Rc<dyn Transport> = Rc::new(
//!     EmulatedTransport::builder()
//!         .controller(
//!             ControllerConfig::new("0000:00:04.0").namespace(NamespaceConfig::new(1, 1024)),
//!         )
//!         .build()?,
//! );
//! let entry = discover_first(&transport)?.expect("no controller");
//!
//! let tasks = [IoTask::message(0, "Hello World!")];
//! let reports = run_namespace(&entry, &tasks, &PollLimit::iterations(1000))?;
//! assert_eq!(reports[0].as_ref().unwrap().message(), "Hello World!");
//! # Ok::<(), nvme_io::Error>(())
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use crate::complete::IoCompletion;
use crate::dma::{BufferTier, DmaBuf};
use crate::error::{Error, Result};
use crate::nvme::{Completion, Discovered, NvmeNamespace, NvmeQpair};
use crate::poller::{PollLimit, poll_until};

/// Payload to write at a block address and read back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoTask {
    /// Starting block address
    pub lba: u64,
    /// Bytes to write
    pub payload: Vec<u8>,
}

impl IoTask {
    /// Write `payload` at `lba`.
    pub fn new(lba: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            lba,
            payload: payload.into(),
        }
    }

    /// Write `msg` as a NUL-terminated string at `lba`.
    pub fn message(lba: u64, msg: &str) -> Self {
        let mut payload = Vec::with_capacity(msg.len() + 1);
        payload.extend_from_slice(msg.as_bytes());
        payload.push(0);
        Self { lba, payload }
    }
}

/// Where an [`IoContext`] is in its write/read cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Getting a buffer for the payload
    AllocatingWriteBuf,
    /// Write in flight
    WriteSubmitted,
    /// Write done, getting a buffer to read into
    AllocatingReadBuf,
    /// Read in flight
    ReadSubmitted,
    /// Outcome recorded
    Done,
}

/// Result of one completed write/read cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    /// Block address written and read
    pub lba: u64,
    /// Bytes read back, as long as the payload
    pub data: Vec<u8>,
    /// Tier the write buffer came from
    pub write_tier: BufferTier,
    /// Tier the read buffer came from
    pub read_tier: BufferTier,
}

impl PipelineReport {
    /// The data read back as text, up to the first NUL.
    pub fn message(&self) -> String {
        let end = self
            .data
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.data.len());
        String::from_utf8_lossy(&self.data[..end]).into_owned()
    }
}

type OutcomeSlot = Rc<RefCell<Option<Result<PipelineReport>>>>;

/// State of one in-flight write/read cycle.
///
/// The context is the completion callback of whichever command it has in
/// flight, so it travels with the command and comes back on completion. The
/// outcome lands in a slot shared with the [`PendingIo`] returned by
/// [`start`](Self::start). A context dropped before it is done, for example
/// because its queue pair went away, records [`Error::Cancelled`].
pub struct IoContext {
    ns: NvmeNamespace,
    lba: u64,
    len: usize,
    num_blocks: u32,
    stage: Stage,
    tier: BufferTier,
    write_tier: BufferTier,
    outcome: OutcomeSlot,
}

impl IoContext {
    /// Allocate a write buffer, fill it with `task`'s payload and submit the
    /// write on `qpair`.
    ///
    /// # Errors
    ///
    /// Allocation and submission failures. The write buffer is released
    /// before returning.
    pub fn start(ns: &NvmeNamespace, qpair: &NvmeQpair, task: &IoTask) -> Result<PendingIo> {
        let len = task.payload.len();
        let num_blocks = ns.blocks_for(len)?;

        let mut buf = ns.alloc_io_buffer(len)?;
        buf.as_mut_slice().copy_from_slice(&task.payload);
        let tier = buf.tier();
        tracing::debug!(lba = task.lba, len, %tier, "write buffer allocated");

        let outcome: OutcomeSlot = Rc::new(RefCell::new(None));
        let ctx = IoContext {
            ns: ns.clone(),
            lba: task.lba,
            len,
            num_blocks,
            stage: Stage::WriteSubmitted,
            tier,
            write_tier: tier,
            outcome: outcome.clone(),
        };

        if let Err(err) = ns.submit_write(qpair, buf, task.lba, num_blocks, ctx) {
            tracing::error!(lba = task.lba, error = %err.error, "write submission failed");
            return Err(err.into());
        }
        tracing::info!(lba = task.lba, "Submitted write command to sector {}", task.lba);

        Ok(PendingIo {
            lba: task.lba,
            outcome,
        })
    }

    fn finish(mut self: Box<Self>, result: Result<PipelineReport>) {
        if let Err(err) = &result {
            tracing::error!(lba = self.lba, stage = ?self.stage, %err, "I/O failed");
        }
        self.stage = Stage::Done;
        *self.outcome.borrow_mut() = Some(result);
    }

    fn release(&self, buf: DmaBuf, what: &str) {
        tracing::debug!(lba = self.lba, tier = %buf.tier(), "freeing {} buffer", what);
        drop(buf);
    }

    fn on_write_complete(mut self: Box<Self>, qpair: &NvmeQpair, cpl: Completion) {
        let buf = match cpl.into_result() {
            Ok(buf) => buf,
            Err(err) => return self.finish(Err(err)),
        };
        self.release(buf, "write");

        self.stage = Stage::AllocatingReadBuf;
        let buf = match self.ns.alloc_io_buffer(self.len) {
            Ok(buf) => buf,
            Err(err) => return self.finish(Err(err)),
        };
        self.tier = buf.tier();
        tracing::debug!(lba = self.lba, tier = %self.tier, "read buffer allocated");

        self.stage = Stage::ReadSubmitted;
        let ns = self.ns.clone();
        let (lba, num_blocks) = (self.lba, self.num_blocks);
        let outcome = self.outcome.clone();
        if let Err(err) = ns.submit_read(qpair, buf, lba, num_blocks, *self) {
            tracing::error!(lba, error = %err.error, "read submission failed");
            *outcome.borrow_mut() = Some(Err(err.into()));
        }
    }

    fn on_read_complete(self: Box<Self>, cpl: Completion) {
        let buf = match cpl.into_result() {
            Ok(buf) => buf,
            Err(err) => return self.finish(Err(err)),
        };

        let end = self.len.min(buf.len());
        let report = PipelineReport {
            lba: self.lba,
            data: buf.as_slice()[..end].to_vec(),
            write_tier: self.write_tier,
            read_tier: buf.tier(),
        };
        tracing::info!(lba = self.lba, "{} is read from sector {}", report.message(), self.lba);
        self.release(buf, "read");
        self.finish(Ok(report));
    }
}

impl IoCompletion for IoContext {
    fn complete(self: Box<Self>, qpair: &NvmeQpair, cpl: Completion) {
        match self.stage {
            Stage::WriteSubmitted => self.on_write_complete(qpair, cpl),
            Stage::ReadSubmitted => self.on_read_complete(cpl),
            stage => {
                let err = Error::InvalidArgument(format!("completion in stage {:?}", stage));
                self.finish(Err(err));
            }
        }
    }
}

impl Drop for IoContext {
    fn drop(&mut self) {
        if self.stage == Stage::Done {
            return;
        }
        let mut slot = self.outcome.borrow_mut();
        if slot.is_none() {
            *slot = Some(Err(Error::Cancelled));
        }
    }
}

impl std::fmt::Debug for IoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoContext")
            .field("nsid", &self.ns.id())
            .field("lba", &self.lba)
            .field("len", &self.len)
            .field("stage", &self.stage)
            .field("tier", &self.tier)
            .finish()
    }
}

/// Caller-side handle on a started [`IoContext`].
#[derive(Debug)]
pub struct PendingIo {
    lba: u64,
    outcome: OutcomeSlot,
}

impl PendingIo {
    /// Block address of the task.
    pub fn lba(&self) -> u64 {
        self.lba
    }

    /// Whether the context has recorded its outcome.
    pub fn is_complete(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Take the outcome, `None` while the context is still running.
    pub fn take(&self) -> Option<Result<PipelineReport>> {
        self.outcome.borrow_mut().take()
    }
}

/// Run every task on `ns` through `qpair` and wait for all of them.
///
/// All contexts are started first, then `qpair` is polled until each one is
/// done. The returned vector holds one outcome per task, in task order; a
/// task that could not be started carries its start error.
///
/// # Errors
///
/// [`Error::PollTimeout`] when `limit` runs out. Contexts still in flight
/// are cancelled once the queue pair is dropped.
pub fn run_pipeline(
    ns: &NvmeNamespace,
    qpair: &NvmeQpair,
    tasks: &[IoTask],
    limit: &PollLimit,
) -> Result<Vec<Result<PipelineReport>>> {
    let started: Vec<Result<PendingIo>> = tasks
        .iter()
        .map(|task| IoContext::start(ns, qpair, task))
        .collect();

    let stats = poll_until(qpair, limit, || {
        started
            .iter()
            .all(|pending| pending.as_ref().map_or(true, PendingIo::is_complete))
    })?;
    tracing::debug!(
        iterations = stats.iterations,
        completions = stats.completions,
        errors = stats.errors,
        "pipeline drained"
    );

    Ok(started
        .into_iter()
        .map(|pending| {
            let pending = pending?;
            pending.take().unwrap_or(Err(Error::Cancelled))
        })
        .collect())
}

/// Run `tasks` against a discovered namespace on a queue pair of its own.
///
/// The queue pair is released before returning.
pub fn run_namespace(
    entry: &Discovered,
    tasks: &[IoTask],
    limit: &PollLimit,
) -> Result<Vec<Result<PipelineReport>>> {
    let ctrlr = entry.controller();
    let ns = entry.namespace();
    let traddr = ctrlr.transport_id().address();

    tracing::info!(
        traddr,
        nsid = ns.id(),
        nsze = ns.num_sectors(),
        ncap = ns.capacity(),
        sector_size = ns.sector_size(),
        "Namespace ID: {} size: {} bytes",
        ns.id(),
        ns.size()
    );

    let qpair = ctrlr.alloc_io_qpair(None)?;
    run_pipeline(ns, &qpair, tasks, limit)
}

/// [`run_namespace`] over every entry, one after the other, in order.
pub fn run_all(
    entries: &[Discovered],
    tasks: &[IoTask],
    limit: &PollLimit,
) -> Vec<Result<Vec<Result<PipelineReport>>>> {
    entries
        .iter()
        .map(|entry| run_namespace(entry, tasks, limit))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvme::{
        ControllerConfig, EmulatedTransport, NamespaceConfig, Transport, discover_first,
    };

    fn setup(cmb_size: usize) -> (Rc<EmulatedTransport>, Discovered) {
        let emu = Rc::new(
            EmulatedTransport::builder()
                .controller(
                    ControllerConfig::new("0000:00:04.0")
                        .cmb_size(cmb_size)
                        .namespace(NamespaceConfig::new(1, 256)),
                )
                .build()
                .unwrap(),
        );
        let transport: Rc<dyn Transport> = emu.clone();
        let entry = discover_first(&transport).unwrap().unwrap();
        (emu, entry)
    }

    #[test]
    fn test_message_task() {
        let task = IoTask::message(3, "abc");
        assert_eq!(task.lba, 3);
        assert_eq!(task.payload, b"abc\0");
    }

    #[test]
    fn test_report_message_stops_at_nul() {
        let report = PipelineReport {
            lba: 0,
            data: b"Hello\0junk".to_vec(),
            write_tier: BufferTier::HostPinned,
            read_tier: BufferTier::HostPinned,
        };
        assert_eq!(report.message(), "Hello");
    }

    #[test]
    fn test_context_walks_stages() {
        let (emu, entry) = setup(4096);
        let qpair = entry.controller().alloc_io_qpair(None).unwrap();

        let pending =
            IoContext::start(entry.namespace(), &qpair, &IoTask::message(0, "stage")).unwrap();
        assert!(!pending.is_complete());
        assert_eq!(qpair.outstanding(), 1);

        // Write completes and the read is submitted from the callback.
        assert_eq!(qpair.process_completions(0).unwrap(), 1);
        assert!(!pending.is_complete());
        assert_eq!(qpair.outstanding(), 1);

        assert_eq!(qpair.process_completions(0).unwrap(), 1);
        let report = pending.take().unwrap().unwrap();
        assert_eq!(report.message(), "stage");
        assert_eq!(report.write_tier, BufferTier::FastRegion);
        assert_eq!(report.read_tier, BufferTier::FastRegion);
        assert_eq!(emu.fast_bytes_in_use(), 0);
    }

    #[test]
    fn test_error_status_ends_context() {
        let (emu, entry) = setup(0);
        emu.fail_lba(7);
        let qpair = entry.controller().alloc_io_qpair(None).unwrap();

        let reports = run_pipeline(
            entry.namespace(),
            &qpair,
            &[IoTask::message(7, "bad"), IoTask::message(8, "good")],
            &PollLimit::iterations(100),
        )
        .unwrap();

        assert!(matches!(reports[0], Err(Error::NvmeError { .. })));
        assert_eq!(reports[1].as_ref().unwrap().message(), "good");
        assert_eq!(emu.host_bytes_in_use(), 0);
    }

    #[test]
    fn test_dropped_qpair_cancels_context() {
        let (emu, entry) = setup(0);
        let qpair = entry.controller().alloc_io_qpair(None).unwrap();

        let pending =
            IoContext::start(entry.namespace(), &qpair, &IoTask::message(0, "lost")).unwrap();
        drop(qpair);

        assert!(matches!(pending.take(), Some(Err(Error::Cancelled))));
        assert_eq!(emu.host_bytes_in_use(), 0);
    }
}
