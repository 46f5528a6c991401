//! Gadget Tracer Manager: the node agent that tracks the containers running
//! on a node and keeps the kernel tables of its tracers in sync with them.
//!
//! Containers are discovered by watching `runc` through fanotify, or by
//! polling the CRI runtimes. Every tracer owns a pinned mount namespace
//! filter that gadget BPF programs consult, and a shared `containers` map
//! resolves mount namespaces to container names.
use std::sync::Arc;

use tokio_stream::wrappers::UnixListenerStream;

pub mod api;
pub mod bpf;
pub mod cgroup;
pub mod collection;
pub mod config;
pub mod container;
pub mod containers_map;
pub mod error;
pub mod event;
pub mod fsutil;
pub mod gadget;
pub mod grpc;
pub mod host;
pub mod manager;
pub mod mountinfo;
pub mod proc;
pub mod pubsub;
pub mod runtime;
pub mod service;
pub mod tracer;
pub mod watcher;

pub mod gadgettracermanager {
    pub mod api {
        tonic::include_proto!("gadgettracermanager");
    }
}

pub mod cri {
    pub mod v1 {
        tonic::include_proto!("runtime.v1");
    }
}

#[cfg(feature = "bpf")]
fn map_provider(
    pin_path: &std::path::Path,
    _kind: watcher::WatcherKind,
) -> Result<Arc<dyn bpf::MapProvider>, bpf::Error> {
    let bpffs = pin_path.parent().unwrap_or(pin_path);
    bpf::ensure_bpffs(bpffs)?;
    bpf::raise_memlock_rlimit()?;
    Ok(Arc::new(bpf::PinnedMaps))
}

/// Tables in process memory only serve an agent that does not track
/// containers, e.g. one driven through `AddContainer` for testing.
#[cfg(not(feature = "bpf"))]
fn map_provider(
    _pin_path: &std::path::Path,
    kind: watcher::WatcherKind,
) -> Result<Arc<dyn bpf::MapProvider>, bpf::Error> {
    if kind != watcher::WatcherKind::None {
        return Err(bpf::Error::Unsupported);
    }
    log::warn!("Built without the `bpf` feature, kernel tables are kept in process memory");
    Ok(Arc::new(bpf::MemoryMaps::default()))
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(err) => {
            log::error!("failed to install SIGTERM handler: {err}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => log::info!("Received SIGINT"),
        _ = terminate.recv() => log::info!("Received SIGTERM"),
    }
}

/// Runs the agent until SIGINT or SIGTERM.
///
/// # Errors
///
/// Possible errors include:
/// - Invalid configuration in the environment.
/// - Running in a container without the host filesystem mounted.
/// - Failure to prepare the pin directory or the kernel tables.
/// - A watcher other than `none` in a build without the `bpf` feature.
/// - An explicitly requested watcher that is not supported on this node.
/// - Failure to bind the gRPC socket.
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = config::Config::from_env()?;
    log::debug!("Configuration: {config:?}");

    let host_root = config.resolve_host_root()?;
    log::info!("Host root: {}", host_root.display());

    let provider = map_provider(&config.pin_path, config.watcher)?;

    let mut builder = manager::TracerManager::builder();
    builder
        .set_host_root(&host_root)
        .set_pin_path(&config.pin_path)
        .set_map_provider(provider)
        .set_node_name(&config.node_name);
    match mountinfo::detect_cgroup_mounts(proc::ProcFs::under(&host_root).mountinfo_file(1)) {
        Ok(mounts) => {
            log::debug!("Cgroup mounts: {mounts:?}");
            builder.set_cgroup_mounts(mounts);
        }
        Err(err) => log::warn!("cgroup ids will not be resolved: {err}"),
    }
    for client in runtime::connect_all(&config.runtimes, &host_root) {
        builder.add_runtime_client(client);
    }
    let manager = builder.build()?;

    manager.start_watcher(config.watcher, config.poll_interval)?;
    manager.inject_initial_containers().await;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    if let Some(addr) = config.http_addr {
        let api = api::APIServer::new(Arc::clone(&manager));
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.changed().await;
            };
            if let Err(err) = api.listen(addr, shutdown).await {
                log::error!("Debug API failed: {err}");
            }
        });
    }

    let listener = grpc::bind_unix_listener(&config.socket)?;
    log::info!("Serving gRPC on {}", config.socket.display());
    let service = service::Service::new(Arc::clone(&manager));
    let served = tonic::transport::Server::builder()
        .add_service(service.into_server())
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown_signal())
        .await;

    let _ = shutdown_tx.send(true);
    drop(shutdown_rx);
    manager.close();
    if let Err(err) = std::fs::remove_file(&config.socket) {
        log::debug!("Failed to remove {}: {err}", config.socket.display());
    }
    served?;
    Ok(())
}
