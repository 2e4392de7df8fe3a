//! In-process emulated NVMe transport.
//!
//! [`EmulatedTransport`] models a set of controllers with namespaces backed
//! by memory, an optional controller memory buffer per controller, a pinned
//! host memory pool, and queue pairs that complete commands only when
//! polled. It also injects the failures the engine has to survive: enumeration
//! failure, rejected submissions, transport errors while polling, stalled
//! queues, failing LBAs and failing detaches.
//!
//! The topology comes from [`EmulatedConfig`], built in code or loaded from
//! JSON:
//!
//! ```json
//! {
//!   "controllers": [
//!     {
//!       "traddr": "0000:00:04.0",
//!       "cmb_size": 8192,
//!       "namespaces": [ { "id": 1, "num_blocks": 1024, "block_size": 512 } ]
//!     }
//!   ],
//!   "host_memory_limit": 1048576
//! }
//! ```

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, SubmitError};

use super::cmd::{Completion, IoCommand, Opcode, Status};
use super::transport::{
    CommandId, ControllerData, ControllerId, NamespaceData, QpairId, Transport, TransportId,
};

const DEFAULT_BLOCK_SIZE: u32 = 512;

/// Queue depth used when a qpair is allocated without options.
pub const DEFAULT_IO_QUEUE_SIZE: u32 = 256;

fn default_block_size() -> u32 {
    DEFAULT_BLOCK_SIZE
}

fn default_active() -> bool {
    true
}

/// Order in which a poll reports the commands it completed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionOrder {
    /// Oldest submission first
    #[default]
    Fifo,
    /// Newest submission first
    Lifo,
}

/// Topology of an emulated transport.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmulatedConfig {
    /// Controllers in discovery order
    #[serde(default)]
    pub controllers: Vec<ControllerConfig>,
    /// Bytes of pinned host memory available (unlimited if absent)
    #[serde(default)]
    pub host_memory_limit: Option<usize>,
    /// Completion reporting order
    #[serde(default)]
    pub completion_order: CompletionOrder,
}

/// One emulated controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    /// Transport address
    pub traddr: String,
    /// Controller memory buffer size in bytes (0 = no CMB)
    #[serde(default)]
    pub cmb_size: usize,
    /// Namespaces, active or not
    #[serde(default)]
    pub namespaces: Vec<NamespaceConfig>,
}

impl ControllerConfig {
    /// Controller at `traddr` without CMB or namespaces.
    pub fn new(traddr: &str) -> Self {
        Self {
            traddr: traddr.to_string(),
            cmb_size: 0,
            namespaces: Vec::new(),
        }
    }

    /// Set the controller memory buffer size.
    pub fn cmb_size(mut self, cmb_size: usize) -> Self {
        self.cmb_size = cmb_size;
        self
    }

    /// Add a namespace.
    pub fn namespace(mut self, ns: NamespaceConfig) -> Self {
        self.namespaces.push(ns);
        self
    }
}

/// One emulated namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NamespaceConfig {
    /// Namespace id (1-based)
    pub id: u32,
    /// Size in blocks
    pub num_blocks: u64,
    /// Block size in bytes
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    /// Capacity in blocks (defaults to the size)
    #[serde(default)]
    pub capacity: Option<u64>,
    /// Whether the namespace is active
    #[serde(default = "default_active")]
    pub active: bool,
}

impl NamespaceConfig {
    /// Active namespace of `num_blocks` 512-byte blocks.
    pub fn new(id: u32, num_blocks: u64) -> Self {
        Self {
            id,
            num_blocks,
            block_size: DEFAULT_BLOCK_SIZE,
            capacity: None,
            active: true,
        }
    }

    /// Set the block size.
    pub fn block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    /// Set the capacity in blocks.
    pub fn capacity(mut self, capacity: u64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Mark the namespace inactive.
    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

/// Counters kept by the emulator.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EmulatorStats {
    /// Successful controller attaches
    pub attaches: u64,
    /// Successful controller detaches
    pub detaches: u64,
    /// CMB allocations
    pub fast_allocs: u64,
    /// CMB frees
    pub fast_frees: u64,
    /// Host memory allocations
    pub host_allocs: u64,
    /// Host memory frees
    pub host_frees: u64,
    /// Frees through the wrong path or with the wrong length
    pub mismatched_frees: u64,
    /// Commands accepted
    pub submitted: u64,
    /// Commands rejected at submission
    pub rejected: u64,
    /// Commands completed
    pub completed: u64,
    /// Commands discarded with their qpair
    pub aborted: u64,
}

#[derive(Default)]
struct Faults {
    fail_probe: bool,
    reject_submissions: u32,
    fail_polls: u32,
    stalled: bool,
    error_lbas: HashSet<u64>,
    fail_detach: HashSet<String>,
    disable_fast: bool,
}

struct EmuNamespace {
    data: NamespaceData,
    blocks: HashMap<u64, Box<[u8]>>,
}

struct EmuController {
    traddr: String,
    cmb_size: usize,
    cmb_in_use: usize,
    cmb_live: HashSet<usize>,
    namespaces: BTreeMap<u32, EmuNamespace>,
    attached: bool,
}

struct EmuQpair {
    ctrlr: usize,
    depth: u32,
    sq: VecDeque<(CommandId, IoCommand)>,
}

struct State {
    controllers: Vec<EmuController>,
    qpairs: HashMap<QpairId, EmuQpair>,
    host_limit: Option<usize>,
    host_in_use: usize,
    host_live: HashSet<usize>,
    order: CompletionOrder,
    faults: Faults,
    stats: EmulatorStats,
    next_qpair: u32,
    next_cid: u64,
}

impl State {
    fn attached(&self, ctrlr: ControllerId) -> Option<&EmuController> {
        self.controllers
            .get(ctrlr.0 as usize)
            .filter(|ctrlr| ctrlr.attached)
    }

    fn attached_mut(&mut self, ctrlr: ControllerId) -> Option<&mut EmuController> {
        self.controllers
            .get_mut(ctrlr.0 as usize)
            .filter(|ctrlr| ctrlr.attached)
    }
}

/// Emulated transport built from an [`EmulatedConfig`].
///
/// Share it as `Rc<dyn Transport>`; keep an `Rc<EmulatedTransport>` clone to
/// inspect counters and inject faults.
pub struct EmulatedTransport {
    state: RefCell<State>,
}

/// Builder for [`EmulatedTransport`].
#[derive(Debug, Default)]
pub struct EmulatedTransportBuilder {
    config: EmulatedConfig,
}

impl EmulatedTransportBuilder {
    /// Add a controller; discovery order follows insertion order.
    pub fn controller(mut self, ctrlr: ControllerConfig) -> Self {
        self.config.controllers.push(ctrlr);
        self
    }

    /// Limit pinned host memory.
    pub fn host_memory_limit(mut self, bytes: usize) -> Self {
        self.config.host_memory_limit = Some(bytes);
        self
    }

    /// Set the completion reporting order.
    pub fn completion_order(mut self, order: CompletionOrder) -> Self {
        self.config.completion_order = order;
        self
    }

    /// Validate the topology and build the transport.
    pub fn build(self) -> Result<EmulatedTransport> {
        EmulatedTransport::new(self.config)
    }
}

impl EmulatedTransport {
    /// Create a new builder with an empty topology.
    pub fn builder() -> EmulatedTransportBuilder {
        EmulatedTransportBuilder::default()
    }

    /// Build from a topology.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for duplicate addresses, namespace id 0,
    /// duplicate namespace ids or a zero block size.
    pub fn new(config: EmulatedConfig) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut controllers = Vec::with_capacity(config.controllers.len());

        for ctrlr in config.controllers {
            TransportId::pcie(&ctrlr.traddr)?;
            if !seen.insert(ctrlr.traddr.clone()) {
                return Err(Error::InvalidArgument(format!(
                    "duplicate controller address {}",
                    ctrlr.traddr
                )));
            }

            let mut namespaces = BTreeMap::new();
            for ns in ctrlr.namespaces {
                if ns.id == 0 {
                    return Err(Error::InvalidArgument(format!(
                        "namespace id 0 on controller {}",
                        ctrlr.traddr
                    )));
                }
                if ns.block_size == 0 {
                    return Err(Error::InvalidArgument(format!(
                        "namespace {} on controller {} has a zero block size",
                        ns.id, ctrlr.traddr
                    )));
                }
                let data = NamespaceData {
                    size: ns.num_blocks,
                    capacity: ns.capacity.unwrap_or(ns.num_blocks),
                    sector_size: ns.block_size,
                    active: ns.active,
                };
                let emu_ns = EmuNamespace {
                    data,
                    blocks: HashMap::new(),
                };
                if namespaces.insert(ns.id, emu_ns).is_some() {
                    return Err(Error::InvalidArgument(format!(
                        "duplicate namespace {} on controller {}",
                        ns.id, ctrlr.traddr
                    )));
                }
            }

            controllers.push(EmuController {
                traddr: ctrlr.traddr,
                cmb_size: ctrlr.cmb_size,
                cmb_in_use: 0,
                cmb_live: HashSet::new(),
                namespaces,
                attached: false,
            });
        }

        Ok(Self {
            state: RefCell::new(State {
                controllers,
                qpairs: HashMap::new(),
                host_limit: config.host_memory_limit,
                host_in_use: 0,
                host_live: HashSet::new(),
                order: config.completion_order,
                faults: Faults::default(),
                stats: EmulatorStats::default(),
                next_qpair: 1,
                next_cid: 1,
            }),
        })
    }

    /// Build from a JSON topology.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: EmulatedConfig = serde_json::from_str(json)?;
        Self::new(config)
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> EmulatorStats {
        self.state.borrow().stats.clone()
    }

    /// CMB bytes currently allocated, across controllers.
    pub fn fast_bytes_in_use(&self) -> usize {
        self.state
            .borrow()
            .controllers
            .iter()
            .map(|ctrlr| ctrlr.cmb_in_use)
            .sum()
    }

    /// Host memory bytes currently allocated.
    pub fn host_bytes_in_use(&self) -> usize {
        self.state.borrow().host_in_use
    }

    /// Whether the controller at `traddr` is attached.
    pub fn is_attached(&self, traddr: &str) -> bool {
        self.state
            .borrow()
            .controllers
            .iter()
            .any(|ctrlr| ctrlr.traddr == traddr && ctrlr.attached)
    }

    /// Commands queued on all qpairs and not yet completed.
    pub fn queued(&self) -> usize {
        self.state
            .borrow()
            .qpairs
            .values()
            .map(|qpair| qpair.sq.len())
            .sum()
    }

    /// Raw contents of one block, `None` if it was never written.
    pub fn block(&self, traddr: &str, nsid: u32, lba: u64) -> Option<Vec<u8>> {
        let state = self.state.borrow();
        let ctrlr = state.controllers.iter().find(|c| c.traddr == traddr)?;
        let ns = ctrlr.namespaces.get(&nsid)?;
        ns.blocks.get(&lba).map(|block| block.to_vec())
    }

    /// Make the next [`Transport::enumerate`] calls fail.
    pub fn fail_probe(&self, fail: bool) {
        self.state.borrow_mut().faults.fail_probe = fail;
    }

    /// Reject the next `count` submissions.
    pub fn reject_submissions(&self, count: u32) {
        self.state.borrow_mut().faults.reject_submissions = count;
    }

    /// Fail the next `count` completion polls with a transport error.
    pub fn fail_polls(&self, count: u32) {
        self.state.borrow_mut().faults.fail_polls = count;
    }

    /// Stop (or resume) completing commands.
    pub fn stall(&self, stalled: bool) {
        self.state.borrow_mut().faults.stalled = stalled;
    }

    /// Complete every command touching `lba` with an internal error.
    pub fn fail_lba(&self, lba: u64) {
        self.state.borrow_mut().faults.error_lbas.insert(lba);
    }

    /// Make detaching the controller at `traddr` fail.
    pub fn fail_detach(&self, traddr: &str) {
        self.state
            .borrow_mut()
            .faults
            .fail_detach
            .insert(traddr.to_string());
    }

    /// Refuse every CMB allocation, as if no controller had one.
    pub fn disable_fast_region(&self, disable: bool) {
        self.state.borrow_mut().faults.disable_fast = disable;
    }
}

impl Transport for EmulatedTransport {
    fn enumerate(&self) -> Result<Vec<TransportId>> {
        let state = self.state.borrow();
        if state.faults.fail_probe {
            return Err(Error::ProbeFailed("emulated probe failure".to_string()));
        }

        state
            .controllers
            .iter()
            .filter(|ctrlr| !ctrlr.attached)
            .map(|ctrlr| TransportId::pcie(&ctrlr.traddr))
            .collect()
    }

    fn attach(&self, trid: &TransportId) -> Result<ControllerId> {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        let index = state
            .controllers
            .iter()
            .position(|ctrlr| ctrlr.traddr == trid.address())
            .ok_or_else(|| Error::ControllerNotFound(trid.address().to_string()))?;

        let ctrlr = &mut state.controllers[index];
        if ctrlr.attached {
            return Err(Error::InvalidArgument(format!(
                "controller {} is already attached",
                ctrlr.traddr
            )));
        }
        ctrlr.attached = true;
        state.stats.attaches += 1;

        Ok(ControllerId(index as u32))
    }

    fn detach(&self, ctrlr: ControllerId) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let traddr = state
            .attached(ctrlr)
            .map(|c| c.traddr.clone())
            .ok_or_else(|| Error::ControllerNotFound(format!("controller id {}", ctrlr.0)))?;

        if state.faults.fail_detach.contains(&traddr) {
            return Err(Error::DetachFailed(traddr));
        }

        let index = ctrlr.0 as usize;
        let orphaned: Vec<QpairId> = state
            .qpairs
            .iter()
            .filter(|(_, qpair)| qpair.ctrlr == index)
            .map(|(id, _)| *id)
            .collect();
        if !orphaned.is_empty() {
            tracing::warn!(
                traddr = traddr.as_str(),
                qpairs = orphaned.len(),
                "detaching controller with live qpairs"
            );
        }

        state.controllers[index].attached = false;
        state.stats.detaches += 1;
        Ok(())
    }

    fn controller_data(&self, ctrlr: ControllerId) -> Result<ControllerData> {
        let state = self.state.borrow();
        let ctrlr = state
            .attached(ctrlr)
            .ok_or_else(|| Error::ControllerNotFound(format!("controller id {}", ctrlr.0)))?;

        Ok(ControllerData {
            num_namespaces: ctrlr.namespaces.keys().next_back().copied().unwrap_or(0),
            cmb_size: ctrlr.cmb_size,
        })
    }

    fn active_namespaces(&self, ctrlr: ControllerId) -> Vec<u32> {
        let state = self.state.borrow();
        state
            .attached(ctrlr)
            .map(|ctrlr| {
                ctrlr
                    .namespaces
                    .iter()
                    .filter(|(_, ns)| ns.data.active)
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn namespace_data(&self, ctrlr: ControllerId, nsid: u32) -> Option<NamespaceData> {
        let state = self.state.borrow();
        state
            .attached(ctrlr)?
            .namespaces
            .get(&nsid)
            .map(|ns| ns.data)
    }

    fn alloc_fast(&self, ctrlr: ControllerId, len: usize) -> Option<Box<[u8]>> {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        if state.faults.disable_fast {
            return None;
        }

        let ctrlr = state.attached_mut(ctrlr)?;
        let cmb_size = ctrlr.cmb_size;
        if cmb_size == 0
            || ctrlr
                .cmb_in_use
                .checked_add(len)
                .is_none_or(|end| end > cmb_size)
        {
            return None;
        }

        let mem = zeroed(len)?;
        ctrlr.cmb_in_use += len;
        ctrlr.cmb_live.insert(mem.as_ptr() as usize);
        state.stats.fast_allocs += 1;
        Some(mem)
    }

    fn free_fast(&self, ctrlr: ControllerId, mem: Box<[u8]>, len: usize) {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        let addr = mem.as_ptr() as usize;

        let mut owned = false;
        if let Some(c) = state.controllers.get_mut(ctrlr.0 as usize) {
            if c.cmb_live.remove(&addr) {
                c.cmb_in_use -= mem.len();
                owned = true;
            }
        }

        if owned && len == mem.len() {
            state.stats.fast_frees += 1;
        } else {
            tracing::error!(ctrlr = ctrlr.0, len, actual = mem.len(), owned, "mismatched cmb free");
            state.stats.mismatched_frees += 1;
        }
    }

    fn alloc_host(&self, len: usize) -> Option<Box<[u8]>> {
        let mut state = self.state.borrow_mut();
        let end = state.host_in_use.checked_add(len)?;
        if state.host_limit.is_some_and(|limit| end > limit) {
            return None;
        }

        let mem = zeroed(len)?;
        state.host_in_use = end;
        state.host_live.insert(mem.as_ptr() as usize);
        state.stats.host_allocs += 1;
        Some(mem)
    }

    fn free_host(&self, mem: Box<[u8]>) {
        let mut state = self.state.borrow_mut();
        if state.host_live.remove(&(mem.as_ptr() as usize)) {
            state.host_in_use -= mem.len();
            state.stats.host_frees += 1;
        } else {
            tracing::error!(len = mem.len(), "mismatched host memory free");
            state.stats.mismatched_frees += 1;
        }
    }

    fn alloc_qpair(&self, ctrlr: ControllerId, queue_size: Option<u32>) -> Result<QpairId> {
        let mut state = self.state.borrow_mut();
        if state.attached(ctrlr).is_none() {
            return Err(Error::ControllerNotFound(format!("controller id {}", ctrlr.0)));
        }

        let depth = queue_size.unwrap_or(DEFAULT_IO_QUEUE_SIZE);
        if depth == 0 {
            return Err(Error::InvalidArgument("io_queue_size must be > 0".to_string()));
        }

        let id = QpairId(state.next_qpair);
        state.next_qpair += 1;
        state.qpairs.insert(
            id,
            EmuQpair {
                ctrlr: ctrlr.0 as usize,
                depth,
                sq: VecDeque::new(),
            },
        );
        Ok(id)
    }

    fn free_qpair(&self, qpair: QpairId) -> Vec<IoCommand> {
        let mut state = self.state.borrow_mut();
        let Some(qpair) = state.qpairs.remove(&qpair) else {
            return Vec::new();
        };
        state.stats.aborted += qpair.sq.len() as u64;
        qpair.sq.into_iter().map(|(_, cmd)| cmd).collect()
    }

    fn submit(
        &self,
        qpair: QpairId,
        cmd: IoCommand,
    ) -> std::result::Result<CommandId, SubmitError> {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;

        if state.faults.reject_submissions > 0 {
            state.faults.reject_submissions -= 1;
            state.stats.rejected += 1;
            return Err(SubmitError {
                error: Error::SubmitFailed("emulated submission failure".to_string()),
                buf: cmd.buf,
            });
        }

        let cid = CommandId(state.next_cid);
        let Some(queue) = state.qpairs.get_mut(&qpair) else {
            return Err(SubmitError {
                error: Error::InvalidArgument(format!("unknown qpair {}", qpair.0)),
                buf: cmd.buf,
            });
        };
        if queue.sq.len() >= queue.depth as usize {
            state.stats.rejected += 1;
            return Err(SubmitError {
                error: Error::SubmitFailed("submission queue full".to_string()),
                buf: cmd.buf,
            });
        }

        queue.sq.push_back((cid, cmd));
        state.next_cid += 1;
        state.stats.submitted += 1;
        Ok(cid)
    }

    fn process_completions(
        &self,
        qpair: QpairId,
        max_completions: u32,
    ) -> Result<Vec<(CommandId, Completion)>> {
        let mut state = self.state.borrow_mut();

        if state.faults.fail_polls > 0 {
            state.faults.fail_polls -= 1;
            return Err(Error::Transport("emulated completion queue error".to_string()));
        }
        if state.faults.stalled {
            return Ok(Vec::new());
        }

        let queue = state
            .qpairs
            .get_mut(&qpair)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown qpair {}", qpair.0)))?;
        let ctrlr = queue.ctrlr;
        let n = match max_completions as usize {
            0 => queue.sq.len(),
            max => max.min(queue.sq.len()),
        };
        let batch: Vec<(CommandId, IoCommand)> = queue.sq.drain(..n).collect();

        let State {
            controllers,
            faults,
            stats,
            order,
            ..
        } = &mut *state;

        let mut completions: Vec<(CommandId, Completion)> = batch
            .into_iter()
            .map(|(cid, mut cmd)| {
                let status = if faults.error_lbas.contains(&cmd.lba) {
                    Status::INTERNAL_ERROR
                } else {
                    let ns = controllers[ctrlr].namespaces.get_mut(&cmd.nsid);
                    execute(ns, &mut cmd)
                };
                (
                    cid,
                    Completion {
                        status,
                        buf: cmd.buf,
                    },
                )
            })
            .collect();

        if *order == CompletionOrder::Lifo {
            completions.reverse();
        }
        stats.completed += completions.len() as u64;

        Ok(completions)
    }
}

/// Zeroed memory, `None` if the allocator cannot provide `len` bytes.
fn zeroed(len: usize) -> Option<Box<[u8]>> {
    let mut mem = Vec::new();
    mem.try_reserve_exact(len).ok()?;
    mem.resize(len, 0u8);
    Some(mem.into_boxed_slice())
}

/// Run one command against namespace storage.
///
/// Transfers `min(buf.len(), num_blocks * block_size)` bytes. Written blocks
/// are zero-filled past the end of the buffer.
fn execute(ns: Option<&mut EmuNamespace>, cmd: &mut IoCommand) -> Status {
    let Some(ns) = ns.filter(|ns| ns.data.active) else {
        return Status::INVALID_NAMESPACE;
    };
    if cmd.num_blocks == 0 {
        return Status::INVALID_FIELD;
    }
    match cmd.lba.checked_add(cmd.num_blocks as u64) {
        Some(end) if end <= ns.data.size => {}
        _ => return Status::LBA_OUT_OF_RANGE,
    }

    let bs = ns.data.sector_size as usize;
    let data = cmd.buf.as_mut_slice();
    let span = data.len().min(cmd.num_blocks as usize * bs);

    for i in 0..cmd.num_blocks as usize {
        let lba = cmd.lba + i as u64;
        let start = (i * bs).min(span);
        let end = ((i + 1) * bs).min(span);

        match cmd.opcode {
            Opcode::Write => {
                let block = ns
                    .blocks
                    .entry(lba)
                    .or_insert_with(|| vec![0u8; bs].into_boxed_slice());
                let chunk = &data[start..end];
                block[..chunk.len()].copy_from_slice(chunk);
                block[chunk.len()..].fill(0);
            }
            Opcode::Read => {
                let dst = &mut data[start..end];
                match ns.blocks.get(&lba) {
                    Some(block) => dst.copy_from_slice(&block[..dst.len()]),
                    None => dst.fill(0),
                }
            }
        }
    }

    Status::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology() -> EmulatedTransport {
        EmulatedTransport::builder()
            .controller(
                ControllerConfig::new("0000:00:04.0")
                    .cmb_size(64)
                    .namespace(NamespaceConfig::new(2, 16))
                    .namespace(NamespaceConfig::new(1, 16).inactive()),
            )
            .controller(ControllerConfig::new("0000:00:05.0"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_enumerate_skips_attached() {
        let emu = topology();
        let all = emu.enumerate().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].address(), "0000:00:04.0");

        let id = emu.attach(&all[0]).unwrap();
        let rest = emu.enumerate().unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].address(), "0000:00:05.0");
        assert!(emu.attach(&all[0]).is_err());

        emu.detach(id).unwrap();
        assert_eq!(emu.enumerate().unwrap().len(), 2);
        assert!(emu.detach(id).is_err());
    }

    #[test]
    fn test_namespace_queries() {
        let emu = topology();
        let trid = TransportId::pcie("0000:00:04.0").unwrap();
        let id = emu.attach(&trid).unwrap();

        assert_eq!(emu.active_namespaces(id), vec![2]);
        assert_eq!(emu.controller_data(id).unwrap().num_namespaces, 2);
        assert!(!emu.namespace_data(id, 1).unwrap().active);
        assert_eq!(emu.namespace_data(id, 2).unwrap().sector_size, 512);
        assert!(emu.namespace_data(id, 3).is_none());
    }

    #[test]
    fn test_fast_region_accounting() {
        let emu = topology();
        let id = emu
            .attach(&TransportId::pcie("0000:00:04.0").unwrap())
            .unwrap();

        let a = emu.alloc_fast(id, 40).unwrap();
        assert!(emu.alloc_fast(id, 40).is_none());
        let b = emu.alloc_fast(id, 24).unwrap();
        assert_eq!(emu.fast_bytes_in_use(), 64);

        emu.free_fast(id, a, 40);
        emu.free_fast(id, b, 24);
        assert_eq!(emu.fast_bytes_in_use(), 0);
        assert_eq!(emu.stats().mismatched_frees, 0);

        // Host memory handed to the CMB path is caught.
        let host = emu.alloc_host(8).unwrap();
        emu.free_fast(id, host, 8);
        assert_eq!(emu.stats().mismatched_frees, 1);
    }

    #[test]
    fn test_host_limit() {
        let emu = EmulatedTransport::builder()
            .host_memory_limit(100)
            .build()
            .unwrap();
        let a = emu.alloc_host(60).unwrap();
        assert!(emu.alloc_host(60).is_none());
        emu.free_host(a);
        assert!(emu.alloc_host(60).is_some());
    }

    #[test]
    fn test_invalid_topologies() {
        let dup = EmulatedTransport::builder()
            .controller(ControllerConfig::new("a"))
            .controller(ControllerConfig::new("a"))
            .build();
        assert!(dup.is_err());

        let zero_id = EmulatedTransport::builder()
            .controller(ControllerConfig::new("a").namespace(NamespaceConfig::new(0, 8)))
            .build();
        assert!(zero_id.is_err());

        let zero_bs = EmulatedTransport::builder()
            .controller(
                ControllerConfig::new("a").namespace(NamespaceConfig::new(1, 8).block_size(0)),
            )
            .build();
        assert!(zero_bs.is_err());
    }

    #[test]
    fn test_from_json() {
        let emu = EmulatedTransport::from_json(
            r#"{
                "controllers": [{
                    "traddr": "0000:00:04.0",
                    "cmb_size": 4096,
                    "namespaces": [
                        { "id": 1, "num_blocks": 1024, "block_size": 4096, "capacity": 512 },
                        { "id": 2, "num_blocks": 8, "active": false }
                    ]
                }],
                "completion_order": "lifo"
            }"#,
        )
        .unwrap();

        let id = emu
            .attach(&TransportId::pcie("0000:00:04.0").unwrap())
            .unwrap();
        let ns = emu.namespace_data(id, 1).unwrap();
        assert_eq!(ns.sector_size, 4096);
        assert_eq!(ns.size, 1024);
        assert_eq!(ns.capacity, 512);
        assert_eq!(emu.active_namespaces(id), vec![1]);
        assert_eq!(emu.controller_data(id).unwrap().cmb_size, 4096);

        assert!(EmulatedTransport::from_json(r#"{ "controllers": 3 }"#).is_err());
        assert!(EmulatedTransport::from_json(r#"{ "bogus": true }"#).is_err());
    }
}
