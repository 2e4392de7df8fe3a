//! Integration tests for controller discovery and teardown.
//!
//! Everything runs against the emulated transport, no hardware needed.

use std::rc::Rc;

use nvme_io::nvme::{
    AcceptAll, ControllerConfig, EmulatedTransport, NamespaceConfig, NvmeController, Transport,
    TransportId, discover, discover_all, discover_first, teardown,
};
use nvme_io::{Error, Result};

fn emulator(
    controllers: Vec<ControllerConfig>,
) -> Result<(Rc<EmulatedTransport>, Rc<dyn Transport>)> {
    let mut builder = EmulatedTransport::builder();
    for ctrlr in controllers {
        builder = builder.controller(ctrlr);
    }
    let emu = Rc::new(builder.build()?);
    let transport: Rc<dyn Transport> = emu.clone();
    Ok((emu, transport))
}

fn with_ns(traddr: &str) -> ControllerConfig {
    ControllerConfig::new(traddr).namespace(NamespaceConfig::new(1, 1024))
}

// ============================================================================
// Discovery
// ============================================================================

#[test]
fn test_singleton_rejects_later_controllers() -> Result<()> {
    let (emu, transport) = emulator(vec![with_ns("0000:00:04.0"), with_ns("0000:00:05.0")])?;

    let entry = discover_first(&transport)?.expect("no controller discovered");
    assert_eq!(entry.controller().transport_id().address(), "0000:00:04.0");
    assert_eq!(entry.namespace().id(), 1);

    // The second controller was never attached, not attached-then-detached.
    assert!(!emu.is_attached("0000:00:05.0"));
    assert_eq!(emu.stats().attaches, 1);
    assert_eq!(emu.stats().detaches, 0);

    let report = teardown(vec![entry]);
    assert!(report.is_clean());
    assert_eq!(report.detached, vec!["0000:00:04.0".to_string()]);
    assert!(!emu.is_attached("0000:00:04.0"));
    Ok(())
}

#[test]
fn test_singleton_skips_namespace_less_controller() -> Result<()> {
    let (emu, transport) = emulator(vec![
        ControllerConfig::new("0000:00:04.0").namespace(NamespaceConfig::new(1, 64).inactive()),
        with_ns("0000:00:05.0"),
        with_ns("0000:00:06.0"),
    ])?;

    let entry = discover_first(&transport)?.expect("no controller discovered");
    assert_eq!(entry.controller().transport_id().address(), "0000:00:05.0");

    assert!(!emu.is_attached("0000:00:04.0"));
    assert!(!emu.is_attached("0000:00:06.0"));
    let stats = emu.stats();
    assert_eq!(stats.attaches, 2);
    assert_eq!(stats.detaches, 1);

    assert!(teardown(vec![entry]).is_clean());
    Ok(())
}

#[test]
fn test_discover_all_keeps_order() -> Result<()> {
    let (_emu, transport) = emulator(vec![
        with_ns("0000:00:06.0"),
        with_ns("0000:00:04.0"),
        with_ns("0000:00:05.0"),
    ])?;

    let entries = discover_all(&transport)?;
    let addrs: Vec<&str> = entries
        .iter()
        .map(|entry| entry.controller().transport_id().address())
        .collect();
    assert_eq!(addrs, ["0000:00:06.0", "0000:00:04.0", "0000:00:05.0"]);

    let report = teardown(entries);
    assert_eq!(report.detached, ["0000:00:06.0", "0000:00:04.0", "0000:00:05.0"]);
    Ok(())
}

#[test]
fn test_lowest_active_namespace_chosen() -> Result<()> {
    let (_emu, transport) = emulator(vec![
        ControllerConfig::new("0000:00:04.0")
            .namespace(NamespaceConfig::new(1, 64).inactive())
            .namespace(NamespaceConfig::new(4, 64))
            .namespace(NamespaceConfig::new(2, 128).block_size(4096)),
    ])?;

    let entries = discover_all(&transport)?;
    assert_eq!(entries.len(), 1);

    let ctrlr = entries[0].controller();
    assert_eq!(ctrlr.num_namespaces(), 4);
    assert_eq!(ctrlr.active_namespaces(), vec![2, 4]);
    assert!(ctrlr.namespace(1).is_none());
    assert!(ctrlr.namespace(3).is_none());

    let ns = entries[0].namespace();
    assert_eq!(ns.id(), 2);
    assert_eq!(ns.sector_size(), 4096);
    assert_eq!(ns.size(), 128 * 4096);

    assert!(teardown(entries).is_clean());
    Ok(())
}

#[test]
fn test_huge_namespace_size_saturates() -> Result<()> {
    let (_emu, transport) = emulator(vec![
        ControllerConfig::new("0000:00:04.0")
            .namespace(NamespaceConfig::new(1, u64::MAX).block_size(4096)),
    ])?;

    let entry = discover_first(&transport)?.expect("no controller discovered");
    assert_eq!(entry.namespace().num_sectors(), u64::MAX);
    assert_eq!(entry.namespace().size(), u64::MAX);
    assert!(teardown(vec![entry]).is_clean());
    Ok(())
}

#[test]
fn test_namespace_less_controllers_excluded() -> Result<()> {
    let (emu, transport) = emulator(vec![
        ControllerConfig::new("0000:00:04.0"),
        with_ns("0000:00:05.0"),
    ])?;

    let entries = discover_all(&transport)?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].controller().transport_id().address(), "0000:00:05.0");
    assert!(!emu.is_attached("0000:00:04.0"));

    assert!(teardown(entries).is_clean());
    Ok(())
}

#[test]
fn test_custom_policy() -> Result<()> {
    let (emu, transport) = emulator(vec![
        with_ns("0000:00:04.0"),
        with_ns("0000:00:05.0"),
        with_ns("0000:00:06.0"),
    ])?;

    let mut skip_middle = |trid: &TransportId, _: &[nvme_io::nvme::Discovered]| {
        trid.address() != "0000:00:05.0"
    };
    let entries = discover(&transport, &mut skip_middle)?;
    assert_eq!(entries.len(), 2);
    assert!(!emu.is_attached("0000:00:05.0"));

    assert!(teardown(entries).is_clean());

    // Everything is free again, so a second scan sees all three.
    let entries = discover(&transport, &mut AcceptAll)?;
    assert_eq!(entries.len(), 3);
    assert!(teardown(entries).is_clean());
    Ok(())
}

#[test]
fn test_enumeration_failure_is_fatal() -> Result<()> {
    let (emu, transport) = emulator(vec![with_ns("0000:00:04.0")])?;
    emu.fail_probe(true);

    match discover_all(&transport) {
        Err(Error::ProbeFailed(msg)) => eprintln!("enumeration failed as expected: {}", msg),
        other => panic!("expected ProbeFailed, got {:?}", other),
    }
    assert_eq!(emu.stats().attaches, 0);
    Ok(())
}

#[test]
fn test_no_controllers() -> Result<()> {
    let (_emu, transport) = emulator(Vec::new())?;
    assert!(discover_first(&transport)?.is_none());
    assert!(discover_all(&transport)?.is_empty());
    Ok(())
}

// ============================================================================
// Teardown and controller lifetime
// ============================================================================

#[test]
fn test_detach_failure_does_not_stop_teardown() -> Result<()> {
    let (emu, transport) = emulator(vec![
        with_ns("0000:00:04.0"),
        with_ns("0000:00:05.0"),
        with_ns("0000:00:06.0"),
    ])?;
    emu.fail_detach("0000:00:05.0");

    let entries = discover_all(&transport)?;
    let report = teardown(entries);

    assert!(!report.is_clean());
    assert_eq!(report.detached, ["0000:00:04.0", "0000:00:06.0"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "0000:00:05.0");
    assert!(matches!(report.failed[0].1, Error::DetachFailed(_)));

    assert!(!emu.is_attached("0000:00:04.0"));
    assert!(!emu.is_attached("0000:00:06.0"));
    Ok(())
}

#[test]
fn test_detach_busy_controller() -> Result<()> {
    let (emu, transport) = emulator(vec![with_ns("0000:00:04.0")])?;

    let ctrlr = NvmeController::attach(transport, &TransportId::pcie("0000:00:04.0")?)?;
    let qpair = ctrlr.alloc_io_qpair(None)?;

    assert!(matches!(ctrlr.detach(), Err(Error::ControllerBusy(_))));
    assert!(emu.is_attached("0000:00:04.0"));

    // The queue pair held the last reference.
    drop(qpair);
    assert!(!emu.is_attached("0000:00:04.0"));
    Ok(())
}

#[test]
fn test_attach_unknown_controller() -> Result<()> {
    let (_emu, transport) = emulator(vec![with_ns("0000:00:04.0")])?;
    let result = NvmeController::attach(transport, &TransportId::pcie("0000:00:09.0")?);
    assert!(matches!(result, Err(Error::ControllerNotFound(_))));
    Ok(())
}

#[test]
fn test_topology_from_json() -> Result<()> {
    let emu = EmulatedTransport::from_json(
        r#"{
            "controllers": [
                { "traddr": "0000:00:04.0", "cmb_size": 4096,
                  "namespaces": [ { "id": 1, "num_blocks": 2048, "capacity": 1024 } ] }
            ],
            "completion_order": "lifo"
        }"#,
    )?;
    let transport: Rc<dyn Transport> = Rc::new(emu);

    let entry = discover_first(&transport)?.expect("no controller discovered");
    assert_eq!(entry.controller().cmb_size(), 4096);
    assert_eq!(entry.namespace().num_sectors(), 2048);
    assert_eq!(entry.namespace().capacity(), 1024);
    assert_eq!(entry.namespace().sector_size(), 512);
    assert!(teardown(vec![entry]).is_clean());

    let bad = EmulatedTransport::from_json(r#"{ "controllers": [], "bogus": 1 }"#);
    assert!(matches!(bad, Err(Error::Config(_))));
    Ok(())
}
