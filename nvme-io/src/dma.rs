//! DMA-capable buffer allocation.
//!
//! I/O buffers must live in memory the device can reach directly. Two tiers
//! exist:
//!
//! - [`BufferTier::FastRegion`]: the controller memory buffer (CMB), a small
//!   region exposed by the controller itself.
//! - [`BufferTier::HostPinned`]: pinned host memory, used when the controller
//!   has no CMB or it is exhausted.
//!
//! A [`DmaBuf`] remembers where it came from and frees itself through the
//! same path, with the length it was allocated with, when dropped.
//!
//! # Example
//!
//! ```
//! use std::rc::Rc;
//! use nvme_io::nvme::{
//!     ControllerConfig, EmulatedTransport, NamespaceConfig, NvmeController, Transport,
//!     TransportId,
//! };
//! use nvme_io::{BufferTier, DmaBuf};
//!
//! let emu = Rc::new(
//!     EmulatedTransport::builder()
//!         .controller(
//!             ControllerConfig::new("0000:00:04.0")
//!                 .cmb_size(4096)
//!                 .namespace(NamespaceConfig::new(1, 128)),
//!         )
//!         .build()?,
//! );
//! let transport: Rc<dyn Transport> = emu.clone();
//! let ctrlr = NvmeController::attach(transport, &TransportId::pcie("0000:00:04.0")?)?;
//!
//! let mut buf = DmaBuf::alloc_io_buffer(&ctrlr, 512)?;
//! assert_eq!(buf.tier(), BufferTier::FastRegion);
//! buf.as_mut_slice()[..5].copy_from_slice(b"hello");
//! # drop(buf);
//! # ctrlr.detach()?;
//! # Ok::<(), nvme_io::Error>(())
//! ```

use std::fmt;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::nvme::controller::ControllerInner;
use crate::nvme::{NvmeController, Transport};

/// Where a DMA buffer's memory comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferTier {
    /// Controller memory buffer
    FastRegion,
    /// Pinned host memory
    HostPinned,
}

impl fmt::Display for BufferTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferTier::FastRegion => f.write_str("cmb"),
            BufferTier::HostPinned => f.write_str("host memory"),
        }
    }
}

/// The allocator a buffer must be returned to.
enum Origin {
    FastRegion(Rc<ControllerInner>),
    HostPinned(Rc<dyn Transport>),
}

/// A DMA-capable memory buffer for NVMe I/O.
///
/// # Ownership
///
/// A buffer is owned by exactly one party at a time: the code that allocated
/// it, or a command in flight. A fast-tier buffer keeps its controller
/// referenced, so the controller cannot be detached while the buffer lives.
///
/// # Thread Safety
///
/// `!Send + !Sync`, like the queue pairs it is used with.
pub struct DmaBuf {
    mem: Option<Box<[u8]>>,
    len: usize,
    origin: Origin,
}

impl DmaBuf {
    /// Allocate an I/O buffer for `ctrlr`, preferring the controller memory
    /// buffer and falling back to pinned host memory.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for a zero length, [`Error::MemoryAlloc`]
    /// when neither tier can satisfy the request.
    pub fn alloc_io_buffer(ctrlr: &NvmeController, len: usize) -> Result<Self> {
        Self::alloc_for(ctrlr.inner(), len)
    }

    /// Same as [`alloc_io_buffer`](Self::alloc_io_buffer) but the memory is
    /// zeroed.
    pub fn alloc_io_buffer_zeroed(ctrlr: &NvmeController, len: usize) -> Result<Self> {
        let mut buf = Self::alloc_for(ctrlr.inner(), len)?;
        buf.as_mut_slice().fill(0);
        Ok(buf)
    }

    /// Allocate from the controller memory buffer only.
    ///
    /// Returns `None` when the controller has no CMB or it is exhausted.
    pub fn alloc_fast(ctrlr: &NvmeController, len: usize) -> Option<Self> {
        if len == 0 {
            return None;
        }
        Self::alloc_fast_for(ctrlr.inner(), len)
    }

    /// Allocate pinned host memory only.
    ///
    /// # Errors
    ///
    /// [`Error::MemoryAlloc`] when the transport has no memory left or hands
    /// back a region of the wrong length.
    pub fn alloc_host(transport: &Rc<dyn Transport>, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidArgument("size must be > 0".to_string()));
        }

        let mem = transport.alloc_host(len).ok_or(Error::MemoryAlloc(len))?;
        if mem.len() != len {
            tracing::warn!(len, got = mem.len(), "host allocation has the wrong length");
            transport.free_host(mem);
            return Err(Error::MemoryAlloc(len));
        }
        Ok(Self {
            mem: Some(mem),
            len,
            origin: Origin::HostPinned(transport.clone()),
        })
    }

    pub(crate) fn alloc_for(ctrlr: &Rc<ControllerInner>, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidArgument("size must be > 0".to_string()));
        }

        if let Some(buf) = Self::alloc_fast_for(ctrlr, len) {
            return Ok(buf);
        }

        tracing::trace!(
            traddr = ctrlr.trid.address(),
            len,
            "cmb allocation unavailable, falling back to host memory"
        );
        Self::alloc_host(&ctrlr.transport, len)
    }

    fn alloc_fast_for(ctrlr: &Rc<ControllerInner>, len: usize) -> Option<Self> {
        let mem = ctrlr.transport.alloc_fast(ctrlr.id, len)?;
        if mem.len() != len {
            tracing::warn!(
                traddr = ctrlr.trid.address(),
                len,
                got = mem.len(),
                "cmb allocation has the wrong length"
            );
            ctrlr.transport.free_fast(ctrlr.id, mem, len);
            return None;
        }
        Some(Self {
            mem: Some(mem),
            len,
            origin: Origin::FastRegion(ctrlr.clone()),
        })
    }

    /// The tier this buffer was allocated from.
    #[inline]
    pub fn tier(&self) -> BufferTier {
        match self.origin {
            Origin::FastRegion(_) => BufferTier::FastRegion,
            Origin::HostPinned(_) => BufferTier::HostPinned,
        }
    }

    /// Get the buffer length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the buffer is empty (zero length).
    ///
    /// Note: Zero-length buffers cannot be created.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get an immutable slice view of the buffer.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        self.mem.as_deref().unwrap_or_default()
    }

    /// Get a mutable slice view of the buffer.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.mem.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for DmaBuf {
    fn drop(&mut self) {
        let Some(mem) = self.mem.take() else {
            return;
        };
        match &self.origin {
            Origin::FastRegion(ctrlr) => ctrlr.transport.free_fast(ctrlr.id, mem, self.len),
            Origin::HostPinned(transport) => transport.free_host(mem),
        }
    }
}

impl fmt::Debug for DmaBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuf")
            .field("ptr", &self.as_slice().as_ptr())
            .field("len", &self.len)
            .field("tier", &self.tier())
            .finish()
    }
}

impl AsRef<[u8]> for DmaBuf {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for DmaBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}
