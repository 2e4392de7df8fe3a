//! NVMe queue pair options.

/// NVMe queue pair options.
///
/// Configure queue pair behavior when allocating.
#[derive(Debug, Default, Clone)]
pub struct NvmeQpairOpts {
    /// Queue depth. Submissions beyond it are rejected by the controller.
    pub io_queue_size: Option<u32>,
}
