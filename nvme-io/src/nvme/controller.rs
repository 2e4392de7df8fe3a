//! NVMe controller.
//!
//! Controller attachment, namespace lookup and queue pair allocation.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::dma::DmaBuf;
use crate::error::{Error, Result};

use super::namespace::NvmeNamespace;
use super::opts::NvmeQpairOpts;
use super::qpair::NvmeQpair;
use super::transport::{ControllerData, ControllerId, Transport, TransportId};

/// State shared by a controller handle and everything allocated against it.
///
/// Namespaces, queue pairs and fast-tier buffers each hold a reference, so
/// the transport-level detach only happens once all of them are gone.
pub(crate) struct ControllerInner {
    pub(crate) transport: Rc<dyn Transport>,
    pub(crate) id: ControllerId,
    pub(crate) trid: TransportId,
    pub(crate) data: ControllerData,
    detached: Cell<bool>,
}

impl ControllerInner {
    fn detach(&self) -> Result<()> {
        if self.detached.replace(true) {
            return Ok(());
        }
        self.transport.detach(self.id)
    }
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        if self.detached.get() {
            return;
        }
        match self.detach() {
            Ok(()) => tracing::info!(
                traddr = self.trid.address(),
                "The device with transport address {} has been detached",
                self.trid.address()
            ),
            Err(err) => tracing::error!(
                traddr = self.trid.address(),
                %err,
                "Failed to detach controller"
            ),
        }
    }
}

/// NVMe controller handle.
///
/// Represents an attached NVMe controller. Obtained via
/// [`attach()`](Self::attach) or from discovery.
///
/// # Thread Safety
///
/// `!Send + !Sync` - controller operations must remain on the thread that
/// attached it.
///
/// # Lifetime
///
/// [`detach()`](Self::detach) releases the controller explicitly. Dropping
/// the handle detaches as well once no namespace, queue pair or fast-tier
/// buffer references the controller anymore.
pub struct NvmeController {
    inner: Rc<ControllerInner>,
}

impl NvmeController {
    /// Attach to the controller at `trid`.
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot attach the controller or cannot
    /// identify it. A controller attached but not identified is detached
    /// again before returning.
    pub fn attach(transport: Rc<dyn Transport>, trid: &TransportId) -> Result<Self> {
        let id = transport.attach(trid)?;

        let data = match transport.controller_data(id) {
            Ok(data) => data,
            Err(err) => {
                if let Err(detach_err) = transport.detach(id) {
                    tracing::error!(
                        traddr = trid.address(),
                        %detach_err,
                        "Failed to detach controller"
                    );
                }
                return Err(err);
            }
        };

        Ok(Self {
            inner: Rc::new(ControllerInner {
                transport,
                id,
                trid: trid.clone(),
                data,
                detached: Cell::new(false),
            }),
        })
    }

    /// Transport identifier this controller was attached through.
    pub fn transport_id(&self) -> &TransportId {
        &self.inner.trid
    }

    /// The transport this controller lives on.
    pub fn transport(&self) -> &Rc<dyn Transport> {
        &self.inner.transport
    }

    /// Get the number of namespaces.
    ///
    /// Note: Some namespace IDs may be inactive.
    pub fn num_namespaces(&self) -> u32 {
        self.inner.data.num_namespaces
    }

    /// Size of the controller memory buffer in bytes, 0 if there is none.
    pub fn cmb_size(&self) -> usize {
        self.inner.data.cmb_size
    }

    /// Ids of all active namespaces, ascending.
    pub fn active_namespaces(&self) -> Vec<u32> {
        self.inner.transport.active_namespaces(self.inner.id)
    }

    /// Lowest active namespace id, `None` if the controller has none.
    pub fn first_active_ns(&self) -> Option<u32> {
        self.active_namespaces()
            .into_iter()
            .filter(|&id| id != 0)
            .min()
    }

    /// Get a namespace by ID (1-indexed).
    ///
    /// Returns `None` if the namespace ID is invalid or inactive.
    pub fn namespace(&self, ns_id: u32) -> Option<NvmeNamespace> {
        if ns_id == 0 || ns_id > self.num_namespaces() {
            return None;
        }

        let data = self.inner.transport.namespace_data(self.inner.id, ns_id)?;
        if data.active {
            Some(NvmeNamespace::new(self.inner.clone(), ns_id, data))
        } else {
            None
        }
    }

    /// Allocate an I/O queue pair for submitting commands.
    ///
    /// Each thread should have its own qpair.
    pub fn alloc_io_qpair(&self, opts: Option<&NvmeQpairOpts>) -> Result<NvmeQpair> {
        let queue_size = opts.and_then(|opts| opts.io_queue_size);
        let id = self
            .inner
            .transport
            .alloc_qpair(self.inner.id, queue_size)
            .map_err(|err| {
                tracing::error!(
                    traddr = self.inner.trid.address(),
                    %err,
                    "qpair allocation failed"
                );
                Error::QpairAlloc
            })?;

        Ok(NvmeQpair {
            ctrlr: self.inner.clone(),
            id,
            pending: RefCell::new(HashMap::new()),
        })
    }

    /// Allocate an I/O buffer, CMB first then host memory.
    ///
    /// Shorthand for [`DmaBuf::alloc_io_buffer`].
    pub fn alloc_io_buffer(&self, len: usize) -> Result<DmaBuf> {
        DmaBuf::alloc_io_buffer(self, len)
    }

    /// Detach from the controller.
    ///
    /// # Errors
    ///
    /// [`Error::ControllerBusy`] if namespaces, queue pairs or buffers still
    /// reference the controller; it is detached when the last of them is
    /// dropped. Otherwise any error reported by the transport.
    pub fn detach(self) -> Result<()> {
        let traddr = self.inner.trid.address().to_string();
        let inner = Rc::try_unwrap(self.inner).map_err(|_| Error::ControllerBusy(traddr.clone()))?;
        let result = inner.detach();
        if result.is_ok() {
            tracing::info!(
                traddr = traddr.as_str(),
                "The device with transport address {} has been detached",
                traddr
            );
        }
        result
    }

    pub(crate) fn inner(&self) -> &Rc<ControllerInner> {
        &self.inner
    }
}

impl std::fmt::Debug for NvmeController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvmeController")
            .field("trid", &self.inner.trid)
            .field("id", &self.inner.id)
            .field("num_namespaces", &self.inner.data.num_namespaces)
            .field("cmb_size", &self.inner.data.cmb_size)
            .finish()
    }
}
