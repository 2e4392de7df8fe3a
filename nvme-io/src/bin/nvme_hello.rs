//! Hello-world over the emulated NVMe transport.
//!
//! Runs two passes against the same topology:
//!
//! 1. Singleton: attach the first controller with an active namespace and
//!    write two messages at blocks 0 and 1 through one queue pair.
//! 2. Multi: attach every controller and write "Hello World!" at block 0 of
//!    each one's first active namespace.
//!
//! The topology is read from the JSON file named by `NVME_HELLO_CONFIG`, or a
//! built-in default is used. Logging follows `RUST_LOG` (default `info`).
//!
//! ```json
//! {
//!   "topology": {
//!     "controllers": [
//!       { "traddr": "0000:00:04.0", "namespaces": [ { "id": 1, "num_blocks": 1024 } ] }
//!     ]
//!   },
//!   "poll": { "timeout_ms": 5000 }
//! }
//! ```

use std::process::ExitCode;
use std::rc::Rc;
use std::time::Duration;

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use nvme_io::nvme::{
    ControllerConfig, EmulatedConfig, EmulatedTransport, NamespaceConfig, Transport,
    discover_all, discover_first, teardown,
};
use nvme_io::{IoTask, PipelineReport, PollLimit, Result, run_all, run_namespace};

const CONFIG_ENV: &str = "NVME_HELLO_CONFIG";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HelloConfig {
    #[serde(default = "default_topology")]
    topology: EmulatedConfig,
    #[serde(default = "default_poll")]
    poll: PollLimit,
}

impl Default for HelloConfig {
    fn default() -> Self {
        Self {
            topology: default_topology(),
            poll: default_poll(),
        }
    }
}

fn default_topology() -> EmulatedConfig {
    EmulatedConfig {
        controllers: vec![
            ControllerConfig::new("0000:00:04.0")
                .cmb_size(8192)
                .namespace(NamespaceConfig::new(1, 1 << 20)),
            ControllerConfig::new("0000:00:05.0")
                .namespace(NamespaceConfig::new(1, 1 << 16).block_size(4096)),
        ],
        ..EmulatedConfig::default()
    }
}

fn default_poll() -> PollLimit {
    PollLimit::timeout(Duration::from_secs(10))
}

fn load_config() -> Result<HelloConfig> {
    let Ok(path) = std::env::var(CONFIG_ENV) else {
        tracing::debug!("{} not set, using the built-in topology", CONFIG_ENV);
        return Ok(HelloConfig::default());
    };

    tracing::info!(path = path.as_str(), "loading configuration");
    let json = std::fs::read_to_string(&path).map_err(|err| {
        nvme_io::Error::InvalidArgument(format!("cannot read {}: {}", path, err))
    })?;
    Ok(serde_json::from_str(&json)?)
}

fn report(outcome: Result<PipelineReport>) -> bool {
    match outcome {
        Ok(report) => {
            println!("{}", report.message());
            true
        }
        Err(err) => {
            tracing::error!(%err, "I/O did not complete");
            false
        }
    }
}

fn run_singleton(config: &HelloConfig) -> Result<bool> {
    let transport: Rc<dyn Transport> = Rc::new(EmulatedTransport::new(config.topology.clone())?);

    let Some(entry) = discover_first(&transport)? else {
        tracing::error!("no controller with an active namespace found");
        return Ok(false);
    };

    let tasks = [
        IoTask::message(0, "Event framework does the I/O One!"),
        IoTask::message(1, "Event framework does the I/O Two!"),
    ];
    let mut ok = true;
    for outcome in run_namespace(&entry, &tasks, &config.poll)? {
        ok &= report(outcome);
    }

    ok &= teardown(vec![entry]).is_clean();
    Ok(ok)
}

fn run_multi(config: &HelloConfig) -> Result<bool> {
    let transport: Rc<dyn Transport> = Rc::new(EmulatedTransport::new(config.topology.clone())?);

    let entries = discover_all(&transport)?;
    if entries.is_empty() {
        tracing::error!("no controller with an active namespace found");
        return Ok(false);
    }
    tracing::info!("Initialization complete.");

    let tasks = [IoTask::message(0, "Hello World!")];
    let mut ok = true;
    for (entry, outcome) in entries.iter().zip(run_all(&entries, &tasks, &config.poll)) {
        match outcome {
            Ok(outcomes) => {
                for outcome in outcomes {
                    ok &= report(outcome);
                }
            }
            Err(err) => {
                tracing::error!(
                    traddr = entry.controller().transport_id().address(),
                    %err,
                    "namespace run failed"
                );
                ok = false;
            }
        }
    }

    ok &= teardown(entries).is_clean();
    Ok(ok)
}

fn run() -> Result<bool> {
    let config = load_config()?;
    let singleton = run_singleton(&config)?;
    let multi = run_multi(&config)?;
    Ok(singleton && multi)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            tracing::error!(%err, "nvme_hello failed");
            ExitCode::FAILURE
        }
    }
}
