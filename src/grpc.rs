//! gRPC plumbing over unix domain sockets.
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{pin, task};

use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tonic::transport::{Channel, Endpoint};

/// Connects every request of a channel to the same unix socket, ignoring the URI.
#[derive(Debug, Clone)]
struct UnixConnector {
    path: PathBuf,
}

impl tower::Service<hyper::Uri> for UnixConnector {
    type Response = TokioIo<tokio::net::UnixStream>;

    type Error = std::io::Error;

    type Future = pin::Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut task::Context<'_>) -> task::Poll<Result<(), Self::Error>> {
        task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: hyper::Uri) -> Self::Future {
        let path = self.path.clone();
        Box::pin(async move {
            let stream = tokio::net::UnixStream::connect(path).await?;
            Ok(TokioIo::new(stream))
        })
    }
}

/// Creates a lazily connecting channel to a gRPC server listening on `path`.
///
/// The channel connects on first use, so an absent runtime socket is reported
/// by the first request rather than here.
pub fn lazy_channel_for_unix_socket(path: impl AsRef<Path>, timeout: Duration) -> Channel {
    let path = path.as_ref();
    log::debug!("Creating channel for {}", path.display());
    let connector = UnixConnector {
        path: path.to_path_buf(),
    };
    Endpoint::from_static("http://[::]:50051")
        .connect_timeout(timeout)
        .timeout(timeout)
        .connect_with_connector_lazy(connector)
}

/// Binds a unix listener at `path`, replacing a stale socket left by a previous run.
pub fn bind_unix_listener(path: impl AsRef<Path>) -> std::io::Result<UnixListener> {
    let path = path.as_ref();
    match std::fs::remove_file(path) {
        Ok(()) => log::debug!("Removed stale socket {}", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    UnixListener::bind(path)
}
