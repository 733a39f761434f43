//! netbill-runner: headless host for the subscription core.
//!
//! Usage:
//!   netbill-runner --db billing.db --config portal.json
//!   netbill-runner --db billing.db --sweep-once
//!
//! Without `--sweep-once` the runner starts the renewal scheduler on its own
//! thread and reads line-delimited JSON requests from stdin, answering each
//! with one JSON line on stdout. The NAS is an in-memory dry run and
//! notifications go to the log.

use anyhow::Result;
use crossbeam_channel::bounded;
use netbill_core::{
    clock::{Clock, SystemClock},
    command::AdminCommand,
    config::PortalConfig,
    engine::BillingEngine,
    network::{InMemoryNas, NetworkAccess},
    notify::{LogNotifier, Notifier},
    outbound::{EffectRunner, OutboundQueue},
    store::{LedgerStore, NewClient},
    types::Gateway,
};
use std::env;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IpcRequest {
    Callback {
        tenant_id: String,
        gateway: Gateway,
        payload: serde_json::Value,
    },
    Register {
        client: NewClient,
    },
    GetClient {
        client_id: String,
    },
    Admin {
        command: AdminCommand,
    },
    Sweep,
    Audit,
    Quit,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let db = DbLocation::resolve(flag_value(&args, "--db"));
    let sweep_once = args.iter().any(|a| a == "--sweep-once");
    let config = match flag_value(&args, "--config") {
        Some(path) => PortalConfig::load(path)?,
        None => PortalConfig::default(),
    };

    if db.scratch {
        log::warn!("netbill-runner: no --db given, using scratch file {}", db.path);
    }
    let store = LedgerStore::open(&db.path)?;
    store.migrate()?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let nas: Arc<dyn NetworkAccess> = Arc::new(InMemoryNas::new());
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);

    let queue = Arc::new(OutboundQueue::start(config.outbound.workers, || {
        Ok(EffectRunner::new(
            &config,
            store.reopen()?,
            Arc::clone(&nas),
            Arc::clone(&notifier),
            Arc::clone(&clock),
        ))
    })?);
    let engine = BillingEngine::new(store, config, clock, queue);
    log::info!("netbill-runner: db={} nas={}", db.path, nas.name());

    if sweep_once {
        let report = engine.sweep();
        println!("{}", serde_json::to_string_pretty(&report)?);
        drop(engine);
        db.cleanup();
        return Ok(());
    }

    let (stop_tx, stop_rx) = bounded::<()>(1);
    let scheduler_engine = engine.fork()?;
    let scheduler = std::thread::Builder::new()
        .name("scheduler".into())
        .spawn(move || scheduler_engine.run_scheduler(stop_rx))?;

    let result = run_ipc_loop(&engine);

    // Dropping the sender also wakes the scheduler's select.
    drop(stop_tx);
    if scheduler.join().is_err() {
        log::error!("netbill-runner: scheduler thread panicked");
    }
    drop(engine);
    db.cleanup();
    result
}

/// Where the ledger lives. Every connection (engine, scheduler, outbound
/// workers) needs the same file: a shared-cache memory database answers
/// concurrent writers with SQLITE_LOCKED, which the busy timeout does not
/// wait out.
#[derive(Debug, Clone, PartialEq)]
struct DbLocation {
    path: String,
    /// Created for this run and removed on exit.
    scratch: bool,
}

impl DbLocation {
    fn resolve(flag: Option<&str>) -> Self {
        match flag {
            Some(path) if path != ":memory:" && !path.trim().is_empty() => Self {
                path: path.to_string(),
                scratch: false,
            },
            _ => {
                let name = format!(
                    "netbill-{}-{}.db",
                    std::process::id(),
                    chrono::Utc::now().timestamp_millis()
                );
                Self {
                    path: env::temp_dir().join(name).to_string_lossy().into_owned(),
                    scratch: true,
                }
            }
        }
    }

    fn cleanup(&self) {
        if !self.scratch {
            return;
        }
        for suffix in ["", "-wal", "-shm"] {
            let file = format!("{}{suffix}", self.path);
            if let Err(e) = std::fs::remove_file(&file) {
                if e.kind() != io::ErrorKind::NotFound {
                    log::warn!("netbill-runner: could not remove {file}: {e}");
                }
            }
        }
    }
}

fn run_ipc_loop(engine: &BillingEngine) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut handle = stdin.lock();
    let mut buffer = String::new();

    loop {
        buffer.clear();
        if handle.read_line(&mut buffer)? == 0 {
            break; // EOF
        }
        if buffer.trim().is_empty() {
            continue;
        }

        let request: IpcRequest = match serde_json::from_str(&buffer) {
            Ok(r) => r,
            Err(e) => {
                writeln!(stdout, "{}", serde_json::json!({ "error": e.to_string() }))?;
                stdout.flush()?;
                continue;
            }
        };
        if matches!(request, IpcRequest::Quit) {
            break;
        }

        let reply = handle_request(engine, request)
            .unwrap_or_else(|e| serde_json::json!({ "error": e.to_string() }));
        writeln!(stdout, "{reply}")?;
        stdout.flush()?;
    }
    Ok(())
}

fn handle_request(engine: &BillingEngine, request: IpcRequest) -> Result<serde_json::Value> {
    let reply = match request {
        IpcRequest::Callback {
            tenant_id,
            gateway,
            payload,
        } => serde_json::to_value(engine.callbacks().handle_json(&tenant_id, gateway, payload))?,
        IpcRequest::Register { client } => serde_json::to_value(engine.register_client(client)?)?,
        IpcRequest::GetClient { client_id } => serde_json::to_value(engine.statement(&client_id)?)?,
        IpcRequest::Admin { command } => serde_json::to_value(engine.apply_command(&command)?)?,
        IpcRequest::Sweep => serde_json::to_value(engine.sweep())?,
        IpcRequest::Audit => serde_json::to_value(engine.audit()?)?,
        IpcRequest::Quit => serde_json::Value::Null,
    };
    Ok(reply)
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
}
