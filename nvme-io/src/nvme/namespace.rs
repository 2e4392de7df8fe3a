//! NVMe namespace.
//!
//! Represents a namespace on an NVMe controller.

use std::rc::Rc;

use crate::complete::{IoCompletion, completion};
use crate::dma::DmaBuf;
use crate::error::{Error, Result, SubmitError};

use super::cmd::{Completion, IoCommand, Opcode};
use super::controller::ControllerInner;
use super::qpair::NvmeQpair;
use super::transport::NamespaceData;

/// NVMe namespace handle.
///
/// Obtained via [`NvmeController::namespace()`](super::NvmeController::namespace).
/// Cloning is cheap; every clone keeps the controller attached.
///
/// # Example
///
/// ```
/// use std::rc::Rc;
/// use nvme_io::nvme::{
///     ControllerConfig, EmulatedTransport, NamespaceConfig, NvmeController, Transport,
///     TransportId,
/// };
/// use nvme_io::{PollLimit, complete::block_on};
///
/// let transport: Rc<dyn Transport> = Rc::new(
///     EmulatedTransport::builder()
///         .controller(
///             ControllerConfig::new("0000:00:04.0").namespace(NamespaceConfig::new(1, 1024)),
///         )
///         .build()?,
/// );
/// let ctrlr = NvmeController::attach(transport, &TransportId::pcie("0000:00:04.0")?)?;
///
/// let ns = ctrlr.namespace(1).expect("Namespace 1 not found");
/// assert_eq!(ns.sector_size(), 512);
/// assert_eq!(ns.num_sectors(), 1024);
///
/// let qpair = ctrlr.alloc_io_qpair(None)?;
/// let mut buf = ns.alloc_io_buffer(512)?;
/// buf.as_mut_slice().fill(0xAB);
///
/// let buf = block_on(&qpair, &PollLimit::iterations(100), ns.write(&qpair, buf, 0, 1))??;
/// let buf = block_on(&qpair, &PollLimit::iterations(100), ns.read(&qpair, buf, 0, 1))??;
/// assert!(buf.as_slice().iter().all(|&b| b == 0xAB));
/// # Ok::<(), nvme_io::Error>(())
/// ```
#[derive(Clone)]
pub struct NvmeNamespace {
    ctrlr: Rc<ControllerInner>,
    id: u32,
    data: NamespaceData,
}

impl NvmeNamespace {
    pub(crate) fn new(ctrlr: Rc<ControllerInner>, id: u32, data: NamespaceData) -> Self {
        Self { ctrlr, id, data }
    }

    /// Get namespace ID.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Get sector size in bytes.
    pub fn sector_size(&self) -> u32 {
        self.data.sector_size
    }

    /// Get total number of sectors.
    pub fn num_sectors(&self) -> u64 {
        self.data.size
    }

    /// Get the namespace capacity in sectors.
    pub fn capacity(&self) -> u64 {
        self.data.capacity
    }

    /// Get total size in bytes.
    ///
    /// Saturates at `u64::MAX` for namespaces whose byte size does not fit.
    pub fn size(&self) -> u64 {
        self.num_sectors().saturating_mul(u64::from(self.sector_size()))
    }

    /// Number of blocks needed to hold `len` bytes (at least one).
    pub fn blocks_for(&self, len: usize) -> Result<u32> {
        let sector_size = self.sector_size() as usize;
        if sector_size == 0 {
            return Err(Error::InvalidArgument(format!(
                "namespace {} reports a zero sector size",
                self.id
            )));
        }
        let blocks = len.div_ceil(sector_size).max(1);
        u32::try_from(blocks)
            .map_err(|_| Error::InvalidArgument(format!("{} bytes exceed one command", len)))
    }

    /// Allocate an I/O buffer on the owning controller, CMB first then host
    /// memory.
    pub fn alloc_io_buffer(&self, len: usize) -> Result<DmaBuf> {
        DmaBuf::alloc_for(&self.ctrlr, len)
    }

    /// Submit a write command without waiting for it.
    ///
    /// `cb` runs from a later [`NvmeQpair::process_completions`] call with the
    /// completion status and the buffer.
    ///
    /// # Errors
    ///
    /// If the controller does not accept the command, `cb` is dropped without
    /// running and the buffer is handed back inside the [`SubmitError`].
    pub fn submit_write(
        &self,
        qpair: &NvmeQpair,
        buf: DmaBuf,
        lba: u64,
        num_blocks: u32,
        cb: impl IoCompletion + 'static,
    ) -> std::result::Result<(), SubmitError> {
        self.submit(qpair, Opcode::Write, buf, lba, num_blocks, Box::new(cb))
    }

    /// Submit a read command without waiting for it.
    ///
    /// See [`submit_write`](Self::submit_write) for the callback contract.
    pub fn submit_read(
        &self,
        qpair: &NvmeQpair,
        buf: DmaBuf,
        lba: u64,
        num_blocks: u32,
        cb: impl IoCompletion + 'static,
    ) -> std::result::Result<(), SubmitError> {
        self.submit(qpair, Opcode::Read, buf, lba, num_blocks, Box::new(cb))
    }

    fn submit(
        &self,
        qpair: &NvmeQpair,
        opcode: Opcode,
        buf: DmaBuf,
        lba: u64,
        num_blocks: u32,
        cb: Box<dyn IoCompletion>,
    ) -> std::result::Result<(), SubmitError> {
        if !Rc::ptr_eq(&self.ctrlr, &qpair.ctrlr) {
            return Err(SubmitError {
                error: Error::InvalidArgument(format!(
                    "qpair does not belong to controller {}",
                    self.ctrlr.trid.address()
                )),
                buf,
            });
        }

        let cmd = IoCommand {
            opcode,
            nsid: self.id,
            lba,
            num_blocks,
            buf,
        };
        qpair.submit(cmd, cb).map(|_| ())
    }

    /// Write `num_blocks` blocks at `lba` and resolve once the write has
    /// completed, handing the buffer back.
    ///
    /// The future only makes progress while the queue pair is polled, e.g.
    /// through [`block_on`](crate::complete::block_on).
    pub async fn write(
        &self,
        qpair: &NvmeQpair,
        buf: DmaBuf,
        lba: u64,
        num_blocks: u32,
    ) -> Result<DmaBuf> {
        let (tx, rx) = completion();
        self.submit_write(qpair, buf, lba, num_blocks, move |_: &NvmeQpair, cpl: Completion| {
            tx.complete(cpl.into_result())
        })?;
        rx.await
    }

    /// Read `num_blocks` blocks at `lba` into `buf` and resolve with the
    /// filled buffer.
    pub async fn read(
        &self,
        qpair: &NvmeQpair,
        buf: DmaBuf,
        lba: u64,
        num_blocks: u32,
    ) -> Result<DmaBuf> {
        let (tx, rx) = completion();
        self.submit_read(qpair, buf, lba, num_blocks, move |_: &NvmeQpair, cpl: Completion| {
            tx.complete(cpl.into_result())
        })?;
        rx.await
    }
}

impl std::fmt::Debug for NvmeNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvmeNamespace")
            .field("traddr", &self.ctrlr.trid.address())
            .field("id", &self.id)
            .field("data", &self.data)
            .finish()
    }
}
