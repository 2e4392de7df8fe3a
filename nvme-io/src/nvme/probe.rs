//! Controller discovery and teardown.
//!
//! [`discover`] walks the controllers visible on a transport, asks an
//! [`AcceptPolicy`] whether to attach each one, and keeps the first active
//! namespace of every accepted controller. A controller without an active
//! namespace is detached on the spot; it is a failure for that controller
//! only, not for the scan.
//!
//! Results come back in discovery order and are meant to be processed in that
//! order.

use std::rc::Rc;

use crate::error::{Error, Result};

use super::controller::NvmeController;
use super::namespace::NvmeNamespace;
use super::transport::{Transport, TransportId};

/// An accepted controller and the namespace selected on it.
#[derive(Debug)]
pub struct Discovered {
    ctrlr: NvmeController,
    ns: NvmeNamespace,
}

impl Discovered {
    /// The attached controller.
    pub fn controller(&self) -> &NvmeController {
        &self.ctrlr
    }

    /// The controller's first active namespace.
    pub fn namespace(&self) -> &NvmeNamespace {
        &self.ns
    }

    /// Split into controller and namespace.
    pub fn into_parts(self) -> (NvmeController, NvmeNamespace) {
        (self.ctrlr, self.ns)
    }
}

/// Decides, per candidate, whether discovery attaches it.
///
/// `attached` holds what discovery has accepted so far, in order.
pub trait AcceptPolicy {
    /// Return true to attach `candidate`.
    fn accept(&mut self, candidate: &TransportId, attached: &[Discovered]) -> bool;
}

impl<F> AcceptPolicy for F
where
    F: FnMut(&TransportId, &[Discovered]) -> bool,
{
    fn accept(&mut self, candidate: &TransportId, attached: &[Discovered]) -> bool {
        self(candidate, attached)
    }
}

/// Accept controllers until one with a usable namespace has been found,
/// reject everything after it.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstUsable;

impl AcceptPolicy for FirstUsable {
    fn accept(&mut self, _candidate: &TransportId, attached: &[Discovered]) -> bool {
        attached.is_empty()
    }
}

/// Accept every controller.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl AcceptPolicy for AcceptAll {
    fn accept(&mut self, _candidate: &TransportId, _attached: &[Discovered]) -> bool {
        true
    }
}

/// Enumerate controllers on `transport` and attach those `policy` accepts.
///
/// For each accepted controller the lowest active namespace id is selected.
/// Controllers without one are detached before this returns and do not
/// appear in the result. A controller that fails to attach is skipped.
///
/// # Errors
///
/// [`Error::ProbeFailed`] if the transport cannot enumerate controllers.
pub fn discover<P>(transport: &Rc<dyn Transport>, policy: &mut P) -> Result<Vec<Discovered>>
where
    P: AcceptPolicy + ?Sized,
{
    let candidates = transport.enumerate().map_err(|err| match err {
        Error::ProbeFailed(msg) => Error::ProbeFailed(msg),
        other => Error::ProbeFailed(other.to_string()),
    })?;

    let mut found = Vec::new();
    for trid in candidates {
        let traddr = trid.address();
        if !policy.accept(&trid, &found) {
            tracing::debug!(traddr, "controller rejected by probe policy");
            continue;
        }

        tracing::info!(traddr, "Attaching to {}", traddr);
        let ctrlr = match NvmeController::attach(transport.clone(), &trid) {
            Ok(ctrlr) => ctrlr,
            Err(err) => {
                tracing::warn!(traddr, %err, "failed to attach controller");
                continue;
            }
        };
        tracing::info!(
            traddr,
            num_namespaces = ctrlr.num_namespaces(),
            "The controller {} has been attached",
            traddr
        );

        let Some(ns) = ctrlr.first_active_ns().and_then(|id| ctrlr.namespace(id)) else {
            tracing::warn!(traddr, "There is no active namespace on controller {}", traddr);
            if let Err(err) = ctrlr.detach() {
                tracing::error!(traddr, %err, "Failed to detach controller");
            }
            continue;
        };

        tracing::info!(
            traddr,
            nsid = ns.id(),
            "Namespace {} of controller {} is used",
            ns.id(),
            traddr
        );
        found.push(Discovered { ctrlr, ns });
    }

    Ok(found)
}

/// Singleton discovery: the first controller with a usable namespace.
///
/// Controllers probed after it are never attached.
pub fn discover_first(transport: &Rc<dyn Transport>) -> Result<Option<Discovered>> {
    Ok(discover(transport, &mut FirstUsable)?.into_iter().next())
}

/// Multi-controller discovery: the first active namespace of every
/// controller, in discovery order.
pub fn discover_all(transport: &Rc<dyn Transport>) -> Result<Vec<Discovered>> {
    discover(transport, &mut AcceptAll)
}

/// Outcome of [`teardown`].
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Addresses of controllers detached cleanly
    pub detached: Vec<String>,
    /// Addresses and errors of controllers that failed to detach
    pub failed: Vec<(String, Error)>,
}

impl TeardownReport {
    /// Whether every controller detached.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Detach every discovered controller.
///
/// Best effort: a failing detach is logged and recorded, and the remaining
/// controllers are still detached. Each entry is released once its
/// controller has been handled.
pub fn teardown(entries: Vec<Discovered>) -> TeardownReport {
    let mut report = TeardownReport::default();

    for entry in entries {
        let (ctrlr, ns) = entry.into_parts();
        let traddr = ctrlr.transport_id().address().to_string();
        // The namespace handle is metadata; it must not keep the controller busy.
        drop(ns);

        match ctrlr.detach() {
            Ok(()) => report.detached.push(traddr),
            Err(err) => {
                tracing::error!(
                    traddr = traddr.as_str(),
                    %err,
                    "Failed to detach controller {}",
                    traddr
                );
                report.failed.push((traddr, err));
            }
        }
    }

    report
}
