//! NVMe I/O queue pair.
//!
//! Queue pairs are used to submit I/O commands to namespaces and are the
//! only place where completion callbacks run.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::complete::IoCompletion;
use crate::error::{Result, SubmitError};

use super::cmd::IoCommand;
use super::controller::ControllerInner;
use super::transport::{CommandId, QpairId};

/// NVMe I/O queue pair.
///
/// Used to submit I/O commands to a namespace. Each thread should
/// have its own qpair; submission and polling happen on the same thread.
///
/// # Thread Safety
///
/// `!Send + !Sync` - qpair must stay on the allocating thread.
///
/// # Draining
///
/// A qpair should be polled until [`outstanding()`](Self::outstanding) is
/// zero before it is dropped. Commands still in flight at drop time never
/// complete: their callbacks are discarded and their buffers released.
pub struct NvmeQpair {
    pub(crate) ctrlr: Rc<ControllerInner>,
    pub(crate) id: QpairId,
    pub(crate) pending: RefCell<HashMap<CommandId, Box<dyn IoCompletion>>>,
}

impl NvmeQpair {
    /// Hand a command to the transport and remember its callback.
    pub(crate) fn submit(
        &self,
        cmd: IoCommand,
        cb: Box<dyn IoCompletion>,
    ) -> std::result::Result<CommandId, SubmitError> {
        let cid = self.ctrlr.transport.submit(self.id, cmd)?;
        self.pending.borrow_mut().insert(cid, cb);
        Ok(cid)
    }

    /// Process I/O completions.
    ///
    /// Reaps finished commands and runs each one's callback synchronously,
    /// in the order the transport reports them. Callbacks may submit new
    /// commands on this qpair; those are picked up by a later call.
    ///
    /// # Arguments
    ///
    /// * `max_completions` - Max completions to process (0 = unlimited)
    ///
    /// # Returns
    ///
    /// Number of completions processed. A transport error does not mean any
    /// particular command failed; callers report it and keep polling.
    pub fn process_completions(&self, max_completions: u32) -> Result<usize> {
        let completions = self
            .ctrlr
            .transport
            .process_completions(self.id, max_completions)?;

        let count = completions.len();
        for (cid, cpl) in completions {
            // Release the borrow before running the callback: it may submit.
            let cb = self.pending.borrow_mut().remove(&cid);
            match cb {
                Some(cb) => cb.complete(self, cpl),
                None => tracing::warn!(?cid, "completion for unknown command"),
            }
        }

        Ok(count)
    }

    /// Number of submitted commands whose callbacks have not run yet.
    pub fn outstanding(&self) -> usize {
        self.pending.borrow().len()
    }
}

impl Drop for NvmeQpair {
    fn drop(&mut self) {
        let outstanding = self.pending.get_mut().len();
        if outstanding > 0 {
            tracing::warn!(
                traddr = self.ctrlr.trid.address(),
                outstanding,
                "qpair dropped with commands in flight"
            );
        }

        let in_flight = self.ctrlr.transport.free_qpair(self.id);
        // Buffers go back through their own tier once the transport is done.
        drop(in_flight);
        self.pending.get_mut().clear();
    }
}

impl std::fmt::Debug for NvmeQpair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvmeQpair")
            .field("traddr", &self.ctrlr.trid.address())
            .field("id", &self.id)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}
