//! NVMe transport identifier and the transport collaborator.
//!
//! [`TransportId`] identifies how to reach an NVMe controller by its PCIe
//! address. [`Transport`] is the driver below the queue-pair abstraction: it
//! enumerates and attaches controllers, hands out DMA memory, and moves
//! commands and completions. The command and completion wire encoding is the
//! transport's business; this crate only sees [`IoCommand`] and
//! [`Completion`].

use std::fmt;

use crate::error::{Error, Result, SubmitError};

use super::cmd::{Completion, IoCommand};

/// Kind of bus or fabric a controller is reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum TransportType {
    /// Local PCIe function
    Pcie,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportType::Pcie => f.write_str("PCIe"),
        }
    }
}

/// NVMe transport identifier.
///
/// Identifies a controller by transport type and address.
///
/// # Example
///
/// ```
/// use nvme_io::nvme::{TransportId, TransportType};
///
/// let trid = TransportId::pcie("0000:00:04.0")?;
/// assert_eq!(trid.address(), "0000:00:04.0");
/// assert_eq!(trid.transport_type(), TransportType::Pcie);
/// assert_eq!(trid.to_string(), "trtype:PCIe traddr:0000:00:04.0");
/// # Ok::<(), nvme_io::Error>(())
/// ```
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TransportId {
    trtype: TransportType,
    traddr: String,
}

/// Longest address the transport accepts (matches the fixed-size field
/// drivers use for `traddr`).
const MAX_TRADDR_LEN: usize = 256;

impl TransportId {
    /// Create a PCIe transport ID from a BDF address.
    ///
    /// # Arguments
    ///
    /// * `addr` - PCI address in BDF format (e.g., "0000:00:04.0")
    pub fn pcie(addr: &str) -> Result<Self> {
        if addr.is_empty() || addr.len() >= MAX_TRADDR_LEN {
            return Err(Error::InvalidArgument(format!(
                "address length {} out of range (1..{})",
                addr.len(),
                MAX_TRADDR_LEN
            )));
        }
        if addr.contains(char::is_whitespace) {
            return Err(Error::InvalidArgument(format!(
                "address contains whitespace: {:?}",
                addr
            )));
        }
        Ok(Self {
            trtype: TransportType::Pcie,
            traddr: addr.to_string(),
        })
    }

    /// Get the transport type.
    pub fn transport_type(&self) -> TransportType {
        self.trtype
    }

    /// Get the address.
    pub fn address(&self) -> &str {
        &self.traddr
    }
}

impl fmt::Debug for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportId")
            .field("trtype", &self.trtype)
            .field("traddr", &self.traddr)
            .finish()
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trtype:{} traddr:{}", self.trtype, self.traddr)
    }
}

/// Transport-assigned handle of an attached controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ControllerId(pub u32);

/// Transport-assigned handle of an I/O queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QpairId(pub u32);

/// Identifier of one submitted command, unique per transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandId(pub u64);

/// Identify-controller data the engine cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerData {
    /// Number of namespace slots (`nn`), active or not
    pub num_namespaces: u32,
    /// Size of the controller memory buffer in bytes (0 = none)
    pub cmb_size: usize,
}

/// Identify-namespace data the engine cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceData {
    /// Namespace size in sectors (`nsze`)
    pub size: u64,
    /// Namespace capacity in sectors (`ncap`)
    pub capacity: u64,
    /// Formatted sector size in bytes
    pub sector_size: u32,
    /// Whether the namespace is attached and usable
    pub active: bool,
}

/// The driver below the queue-pair abstraction.
///
/// All methods take `&self`; implementations keep their state behind
/// interior mutability because buffers call back into the transport when
/// they are dropped. Handles are single-threaded, so a transport is shared
/// through `Rc<dyn Transport>`.
///
/// Implementations must never drop a [`DmaBuf`](crate::DmaBuf) while holding
/// an internal borrow: buffers free themselves through the transport.
pub trait Transport {
    /// List the controllers that are visible and not yet attached, in
    /// discovery order.
    fn enumerate(&self) -> Result<Vec<TransportId>>;

    /// Attach a controller found by [`enumerate`](Self::enumerate).
    fn attach(&self, trid: &TransportId) -> Result<ControllerId>;

    /// Detach a controller. The caller guarantees nothing references it.
    fn detach(&self, ctrlr: ControllerId) -> Result<()>;

    /// Identify-controller data.
    fn controller_data(&self, ctrlr: ControllerId) -> Result<ControllerData>;

    /// Ids of the active namespaces, ascending.
    fn active_namespaces(&self, ctrlr: ControllerId) -> Vec<u32>;

    /// Identify-namespace data, `None` if the id does not exist.
    fn namespace_data(&self, ctrlr: ControllerId, nsid: u32) -> Option<NamespaceData>;

    /// Allocate from the controller memory buffer. `None` when exhausted or
    /// unsupported.
    fn alloc_fast(&self, ctrlr: ControllerId, len: usize) -> Option<Box<[u8]>>;

    /// Return memory obtained from [`alloc_fast`](Self::alloc_fast).
    fn free_fast(&self, ctrlr: ControllerId, mem: Box<[u8]>, len: usize);

    /// Allocate pinned host memory usable for DMA.
    fn alloc_host(&self, len: usize) -> Option<Box<[u8]>>;

    /// Return memory obtained from [`alloc_host`](Self::alloc_host).
    fn free_host(&self, mem: Box<[u8]>);

    /// Allocate an I/O queue pair. `queue_size` bounds the number of
    /// commands in flight; `None` uses the transport default.
    fn alloc_qpair(&self, ctrlr: ControllerId, queue_size: Option<u32>) -> Result<QpairId>;

    /// Release a queue pair, handing back commands that never completed.
    fn free_qpair(&self, qpair: QpairId) -> Vec<IoCommand>;

    /// Enqueue a command. On rejection the buffer comes back in the error.
    fn submit(
        &self,
        qpair: QpairId,
        cmd: IoCommand,
    ) -> std::result::Result<CommandId, SubmitError>;

    /// Reap up to `max_completions` finished commands (0 = all available).
    ///
    /// Only commands submitted before this call may be returned.
    fn process_completions(
        &self,
        qpair: QpairId,
        max_completions: u32,
    ) -> Result<Vec<(CommandId, Completion)>>;
}
