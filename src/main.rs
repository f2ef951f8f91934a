use std::collections::HashMap;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use plc_gateway::api::rest::{create_api_routes, SharedAppState};
use plc_gateway::config::settings::Settings;
use plc_gateway::drivers::compactlogix::CompactLogixDriver;
use plc_gateway::drivers::mock::{MockControl, MockDriver};
use plc_gateway::drivers::slc500::Slc500Driver;
use plc_gateway::drivers::traits::PlcDriver;
use plc_gateway::health::HealthRegistry;
use plc_gateway::metrics::{self, MetricsRegistry};
use plc_gateway::poll::observer::PollObserver;
use plc_gateway::poll::poller::{Poller, PollerConfig, WriteHandle};
use plc_gateway::tags::structures::PlcName;
use plc_gateway::TagStore;

// Exit codes: 0 normal stop, 1 invalid configuration, 2 port bind failure.
const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 1;
const EXIT_BIND: i32 = 2;

#[tokio::main]
async fn main() {
    plc_gateway::logging::init_logging();

    let settings = match Settings::load() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("FATAL: failed to load configuration from environment: {e}");
            std::process::exit(EXIT_CONFIG);
        }
    };
    if let Err(e) = settings.validate() {
        eprintln!("FATAL: invalid configuration: {e}");
        std::process::exit(EXIT_CONFIG);
    }

    let code = run(settings).await;
    std::process::exit(code);
}

async fn run(settings: Settings) -> i32 {
    info!("PLC gateway starting");

    let store = TagStore::new();
    let health = Arc::new(HealthRegistry::new(
        settings.ready_file.clone().map(PathBuf::from),
    ));
    let metrics_registry = Arc::new(MetricsRegistry::new());
    let shutdown = CancellationToken::new();

    // --- Drivers ---
    let mock_control = MockControl::new(settings.mock_fail_reconnect());
    let mut drivers: Vec<Box<dyn PlcDriver>> = Vec::new();
    if settings.mock_plc() {
        info!("mock PLC mode enabled");
        drivers.push(Box::new(MockDriver::new(
            PlcName::Compactlogix,
            store.clone(),
            mock_control.clone(),
        )));
        drivers.push(Box::new(MockDriver::new(
            PlcName::Slc500,
            store.clone(),
            MockControl::default(),
        )));
    } else {
        if let Some(ip) = &settings.compactlogix_ip {
            drivers.push(Box::new(CompactLogixDriver::new(
                ip.clone(),
                settings.socket_timeout(),
            )));
        }
        if let Some(ip) = &settings.slc500_ip {
            drivers.push(Box::new(Slc500Driver::new(
                ip.clone(),
                settings.socket_timeout(),
            )));
        }
    }

    // --- Pollers ---
    let observers: Vec<Arc<dyn PollObserver>> =
        vec![health.clone() as _, metrics_registry.clone() as _];
    let mut writers: HashMap<PlcName, WriteHandle> = HashMap::new();
    let mut poller_tasks = Vec::new();
    for driver in drivers {
        let plc = driver.plc();
        health.register(plc, driver.ip());
        metrics_registry.register(plc, driver.ip());
        let (poller, handle) = Poller::new(
            PollerConfig {
                plc,
                poll_period: settings.poll_period(),
                reconnect_base: settings.reconnect_base,
                reconnect_max: settings.reconnect_max,
            },
            driver,
            store.clone(),
            observers.clone(),
        );
        writers.insert(plc, handle);
        poller_tasks.push(tokio::spawn(poller.run(shutdown.clone())));
    }
    info!("{} poller(s) started", poller_tasks.len());
    if poller_tasks.is_empty() {
        // Nothing to wait for; the REST surface alone is the service.
        health.set_ready();
    }

    // --- Metrics exporter (optional) ---
    if let Some(port) = settings.metrics_port() {
        tokio::spawn(metrics::exporter::serve(
            metrics_registry.clone(),
            port,
            shutdown.clone(),
        ));
    }

    let writers = Arc::new(writers);

    // --- OPC UA server (optional capability) ---
    #[cfg(feature = "opcua-support")]
    {
        if let Err(e) = plc_gateway::opcua::OpcUaAdapter::spawn(
            store.clone(),
            writers.clone(),
            settings.opcua_port,
        ) {
            warn!("OPC UA server unavailable, continuing without it: {e}");
        }
    }
    #[cfg(not(feature = "opcua-support"))]
    warn!("built without opcua-support; tags are served over REST only");

    // --- REST API ---
    let state = SharedAppState {
        store,
        health: health.clone(),
        writers,
        shutdown: shutdown.clone(),
    };
    let app = create_api_routes().with_state(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.http_port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("cannot bind REST listener on {addr}: {e}");
            return EXIT_BIND;
        }
    };
    info!("REST API listening on http://{addr}/api/v1");

    let drain_token = shutdown.clone();
    let mut serve = std::pin::pin!(axum::serve(listener, app)
        .with_graceful_shutdown(async move { drain_token.cancelled().await })
        .into_future());

    tokio::select! {
        res = &mut serve => {
            if let Err(e) = res {
                error!("REST server error: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            // Same drain discipline as POST /hmi/stop: cancel, then let the
            // server finish in-flight responses within the bounded deadline.
            info!("interrupt received, shutting down");
            health.set_stopping();
            shutdown.cancel();
            match tokio::time::timeout(settings.shutdown_timeout(), &mut serve).await {
                Ok(Err(e)) => error!("REST server error: {e}"),
                Ok(Ok(())) => {}
                Err(_) => warn!("REST server did not drain within the shutdown timeout"),
            }
        }
    }

    // Cancel pollers (drivers disconnect) and give them a bounded window.
    shutdown.cancel();
    let drain = async {
        for task in poller_tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(settings.shutdown_timeout(), drain)
        .await
        .is_err()
    {
        warn!("pollers did not stop within the shutdown timeout");
    }

    info!("gateway stopped");
    EXIT_OK
}
