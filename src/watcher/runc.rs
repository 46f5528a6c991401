//! Container detection by intercepting `runc create` with fanotify.
//!
//! The watcher marks the runc binaries for exec permission events. When runc
//! is executed with `create`, the directory of its `--pid-file` is marked for
//! access permission events: runc's parent reads the pid file once the
//! container process exists but before it is started, which is when `Add`
//! is emitted.
use std::io::Read;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::fanotify::{
    EventFFlags, Fanotify, FanotifyEvent, FanotifyResponse, InitFlags, MarkFlags, MaskFlags,
    Response,
};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;

use super::oci::Spec;
use super::termination::TerminationWatches;
use super::{CloseFlag, Error, Result, RuntimeEvent, RuntimeWatcher, Supported};
use crate::container::ContainerID;
use crate::error::ResultOkLogExt;
use crate::fsutil;
use crate::proc::ProcFs;

/// How long a pid file is watched before `runc create` is assumed to have
/// failed.
const PID_FILE_TIMEOUT: Duration = Duration::from_secs(120);

const RUNC_PATHS: [&str; 4] = [
    "/usr/bin/runc",
    "/usr/sbin/runc",
    "/usr/local/sbin/runc",
    "/run/torcx/unpack/docker/bin/runc",
];

#[derive(Debug)]
pub struct RuncWatcher {
    closed: CloseFlag,
    terminations: Arc<TerminationWatches>,
}

/// State shared by the runc loop and the pid file loops it spawns.
#[derive(Debug)]
struct Context {
    host_root: PathBuf,
    proc: ProcFs,
    self_pid: u32,
    tx: mpsc::Sender<RuntimeEvent>,
    terminations: Arc<TerminationWatches>,
    closed: CloseFlag,
    interval: Duration,
    pid_file_timeout: Duration,
}

struct FanotifyFd(Fanotify);

impl AsRawFd for FanotifyFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_fd().as_raw_fd()
    }
}

/// Allows the event when dropped, so the blocked process is released on
/// every return path.
struct Permission<'a> {
    fanotify: &'a Fanotify,
    event: &'a FanotifyEvent,
}

impl Drop for Permission<'_> {
    fn drop(&mut self) {
        let Some(fd) = self.event.fd() else {
            return;
        };
        let response = FanotifyResponse::new(fd, Response::FAN_ALLOW);
        if let Err(err) = self.fanotify.write_response(response) {
            log::error!(
                "failed to allow fanotify event of pid {}: {err}",
                self.event.pid()
            );
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct RuncCreate {
    bundle: PathBuf,
    pid_file: PathBuf,
}

/// Extracts bundle and pid file from a `runc ... create ...` command line.
fn parse_runc_create(args: &[String]) -> Option<RuncCreate> {
    let mut create = false;
    let mut bundle = None;
    let mut pid_file = None;
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "create" => create = true,
            "--bundle" | "-b" => bundle = it.next().map(PathBuf::from),
            "--pid-file" => pid_file = it.next().map(PathBuf::from),
            other => {
                if let Some(value) = other.strip_prefix("--bundle=") {
                    bundle = Some(PathBuf::from(value));
                } else if let Some(value) = other.strip_prefix("--pid-file=") {
                    pid_file = Some(PathBuf::from(value));
                }
            }
        }
    }
    if !create {
        return None;
    }
    Some(RuncCreate {
        bundle: bundle.filter(|b| !b.as_os_str().is_empty())?,
        pid_file: pid_file.filter(|p| !p.as_os_str().is_empty())?,
    })
}

fn parse_pid(content: &str) -> std::result::Result<u32, String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err("empty pid file".to_owned());
    }
    match trimmed.parse::<u32>() {
        Ok(0) => Err("pid 0".to_owned()),
        Ok(pid) => Ok(pid),
        Err(err) => Err(format!("`{trimmed}`: {err}")),
    }
}

/// The container id is the name of the bundle directory.
fn container_id_from_bundle(bundle: &Path) -> Result<ContainerID> {
    let name = bundle
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(ContainerID::new(name)?)
}

/// Existing runc binaries below any of the given roots, without duplicates.
fn find_runc_binaries(roots: &[&Path]) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = Vec::new();
    for root in roots {
        for path in RUNC_PATHS {
            let candidate = fsutil::join_under(root, path);
            if candidate.exists() && !found.contains(&candidate) {
                found.push(candidate);
            }
        }
    }
    found
}

fn runc_roots(host_root: &Path) -> [&Path; 3] {
    [Path::new("/"), Path::new("/host"), host_root]
}

fn init_fanotify() -> nix::Result<Fanotify> {
    Fanotify::init(
        InitFlags::FAN_CLOEXEC
            | InitFlags::FAN_CLASS_CONTENT
            | InitFlags::FAN_UNLIMITED_QUEUE
            | InitFlags::FAN_UNLIMITED_MARKS
            | InitFlags::FAN_NONBLOCK,
        EventFFlags::O_RDONLY | EventFFlags::O_LARGEFILE | EventFFlags::O_CLOEXEC,
    )
}

fn mark(fanotify: &Fanotify, flags: MarkFlags, mask: MaskFlags, path: &Path) -> Result<()> {
    fanotify
        .mark(flags, mask, None, Some(path))
        .map_err(|source| Error::FanotifyMark {
            path: path.to_path_buf(),
            source,
        })
}

impl RuncWatcher {
    /// Checks that a runc binary exists and fanotify permission events are
    /// available to this process.
    pub fn supported(host_root: &Path) -> Supported {
        if find_runc_binaries(&runc_roots(host_root)).is_empty() {
            return Supported::No("runc binary not found".to_owned());
        }
        match init_fanotify() {
            Ok(_) => Supported::Yes,
            Err(err) => Supported::No(format!("fanotify unavailable: {err}")),
        }
    }

    pub fn new(
        host_root: &Path,
        tx: mpsc::Sender<RuntimeEvent>,
        interval: Duration,
    ) -> Result<Self> {
        let fanotify = init_fanotify().map_err(Error::FanotifyInit)?;
        let binaries = find_runc_binaries(&runc_roots(host_root));
        if binaries.is_empty() {
            return Err(Error::NoRuncBinary);
        }
        for binary in &binaries {
            mark(
                &fanotify,
                MarkFlags::FAN_MARK_ADD,
                MaskFlags::FAN_OPEN_EXEC_PERM,
                binary,
            )?;
            log::info!("Watching runc binary {}", binary.display());
        }
        let fanotify = AsyncFd::with_interest(FanotifyFd(fanotify), Interest::READABLE)
            .map_err(Error::AsyncFd)?;

        let closed = CloseFlag::default();
        let terminations = Arc::new(TerminationWatches::new(tx.clone(), closed.clone(), interval));
        let ctx = Arc::new(Context {
            host_root: host_root.to_path_buf(),
            proc: ProcFs::default(),
            self_pid: std::process::id(),
            tx,
            terminations: Arc::clone(&terminations),
            closed: closed.clone(),
            interval,
            pid_file_timeout: PID_FILE_TIMEOUT,
        });
        tokio::spawn(watch_runc(fanotify, ctx));

        Ok(Self {
            closed,
            terminations,
        })
    }
}

impl RuntimeWatcher for RuncWatcher {
    fn name(&self) -> &'static str {
        "runc"
    }

    fn add_watch_container_termination(&self, id: &ContainerID, pid: u32) -> Result<bool> {
        self.terminations.watch(id.clone(), pid)
    }

    fn close(&self) {
        self.closed.close();
    }
}

/// Waits until the fanotify fd is readable and returns its pending events.
///
/// Returns `None` when the loop should stop.
async fn next_events(fanotify: &AsyncFd<FanotifyFd>, ctx: &Context) -> Option<Vec<FanotifyEvent>> {
    loop {
        if ctx.closed.is_closed() {
            return None;
        }
        let mut guard = match tokio::time::timeout(ctx.interval, fanotify.readable()).await {
            Err(_elapsed) => continue,
            Ok(Err(err)) => {
                log::error!("polling fanotify failed: {err}");
                return None;
            }
            Ok(Ok(guard)) => guard,
        };
        match guard.get_inner().0.read_events() {
            Ok(events) => return Some(events),
            Err(Errno::EAGAIN) => guard.clear_ready(),
            Err(err) => {
                log::error!("reading fanotify events failed: {err}");
                return None;
            }
        }
    }
}

async fn watch_runc(fanotify: AsyncFd<FanotifyFd>, ctx: Arc<Context>) {
    while let Some(events) = next_events(&fanotify, &ctx).await {
        for event in &events {
            let permission = Permission {
                fanotify: &fanotify.get_ref().0,
                event,
            };
            if !event.mask().contains(MaskFlags::FAN_OPEN_EXEC_PERM) {
                log::warn!("unexpected fanotify event on runc: mask={:?}", event.mask());
                continue;
            }
            let pid = u32::try_from(event.pid()).ok();
            answer_runc_exec(permission, pid, &ctx, |create| {
                monitor_runc_instance(&ctx, create).map(drop)
            });
        }
    }
    log::debug!("runc watcher stopped");
}

/// Answers an exec of runc. For a `create`, `permission` is only released
/// once `monitor` has marked the pid file directory.
fn answer_runc_exec<P>(
    permission: P,
    pid: Option<u32>,
    ctx: &Context,
    monitor: impl FnOnce(RuncCreate) -> Result<()>,
) {
    if let Some(create) = pid.and_then(|pid| runc_create_of(pid, ctx)) {
        if let Err(err) = monitor(create) {
            log::error!("failed to monitor runc instance: {err}");
        }
    }
    drop(permission);
}

fn runc_create_of(pid: u32, ctx: &Context) -> Option<RuncCreate> {
    if pid == ctx.self_pid {
        return None;
    }
    // runc re-executes itself: the first exec comes from the shim, the
    // second one from runc and carries the final command line.
    if ctx.proc.comm(pid).ok()? != "runc" {
        return None;
    }
    let args = ctx.proc.cmdline(pid).ok_log()?;
    parse_runc_create(&args)
}

#[derive(Debug)]
struct PidFileWatch {
    bundle: PathBuf,
    pid_file: PathBuf,
    pid_file_dir: PathBuf,
}

fn monitor_runc_instance(
    ctx: &Arc<Context>,
    create: RuncCreate,
) -> Result<tokio::task::JoinHandle<()>> {
    let pid_file = fsutil::join_under(&ctx.host_root, &create.pid_file);
    let watch = PidFileWatch {
        bundle: fsutil::join_under(&ctx.host_root, &create.bundle),
        pid_file_dir: pid_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/")),
        pid_file,
    };
    log::debug!(
        "runc create: bundle={} pid_file={}",
        watch.bundle.display(),
        watch.pid_file.display()
    );

    let fanotify = init_fanotify().map_err(Error::FanotifyInit)?;
    // The pid file does not exist yet, so its directory is watched.
    mark(
        &fanotify,
        MarkFlags::FAN_MARK_ADD,
        MaskFlags::FAN_ACCESS_PERM | MaskFlags::FAN_EVENT_ON_CHILD,
        &watch.pid_file_dir,
    )?;
    // Kernels before 5.9 ignore this mask; such events are filtered by path.
    let config_json = watch.bundle.join("config.json");
    if let Err(err) = mark(
        &fanotify,
        MarkFlags::FAN_MARK_ADD | MarkFlags::FAN_MARK_IGNORED_MASK,
        MaskFlags::FAN_ACCESS_PERM,
        &config_json,
    ) {
        log::debug!("{err}");
    }

    let fanotify = AsyncFd::with_interest(FanotifyFd(fanotify), Interest::READABLE)
        .map_err(Error::AsyncFd)?;
    Ok(tokio::spawn(watch_pid_file(fanotify, watch, Arc::clone(ctx))))
}

async fn watch_pid_file(fanotify: AsyncFd<FanotifyFd>, watch: PidFileWatch, ctx: Arc<Context>) {
    let detected = match tokio::time::timeout(
        ctx.pid_file_timeout,
        wait_for_pid_file(&fanotify, &watch, &ctx),
    )
    .await
    {
        Ok(detected) => detected,
        Err(_elapsed) => {
            log::warn!(
                "pid file {} was not read within {:?}, dropping its watch",
                watch.pid_file.display(),
                ctx.pid_file_timeout
            );
            None
        }
    };
    drop(fanotify);

    let Some((id, pid, config)) = detected else {
        return;
    };
    let add = RuntimeEvent::Add {
        id: id.clone(),
        pid,
        config,
    };
    if ctx.tx.send(add).await.is_err() {
        return;
    }
    if let Err(err) = ctx.terminations.watch(id.clone(), pid) {
        log::error!("container `{id}` with pid {pid} terminated before it could be watched: {err}");
        // Remove is not sent by a watch that never started.
        let _ = ctx.tx.send(RuntimeEvent::Remove { id, pid }).await;
    }
}

type Detected = (ContainerID, u32, Option<Box<Spec>>);

async fn wait_for_pid_file(
    fanotify: &AsyncFd<FanotifyFd>,
    watch: &PidFileWatch,
    ctx: &Context,
) -> Option<Detected> {
    loop {
        let events = next_events(fanotify, ctx).await?;
        let mut detected = None;
        for event in &events {
            match handle_pid_file_access(&fanotify.get_ref().0, event, watch, ctx) {
                Ok(Some(hit)) if detected.is_none() => detected = Some(hit),
                Ok(_) => {}
                Err(err) => log::error!("error watching pid file: {err}"),
            }
        }
        if detected.is_some() {
            return detected;
        }
    }
}

/// Answers an access below the pid file directory and returns the container
/// once the pid file itself was read.
fn handle_pid_file_access(
    fanotify: &Fanotify,
    event: &FanotifyEvent,
    watch: &PidFileWatch,
    ctx: &Context,
) -> Result<Option<Detected>> {
    let _permission = Permission { fanotify, event };
    if !event.mask().contains(MaskFlags::FAN_ACCESS_PERM) {
        log::warn!("unexpected fanotify event on pid file: mask={:?}", event.mask());
        return Ok(None);
    }
    if u32::try_from(event.pid()).is_ok_and(|pid| pid == ctx.self_pid) {
        return Ok(None);
    }
    let Some(fd) = event.fd() else {
        return Ok(None);
    };
    let path = fsutil::read_link(format!("/proc/self/fd/{}", fd.as_raw_fd()))?;
    let file = fd
        .try_clone_to_owned()
        .map(std::fs::File::from)
        .map_err(|err| Error::PidFile {
            path: watch.pid_file.clone(),
            reason: err.to_string(),
        })?;
    let Some((id, pid)) = read_pid_file(watch, Path::new(&path), file)? else {
        return Ok(None);
    };

    // Without the directory mark reading config.json cannot block on ourselves.
    let config = match fanotify.mark(
        MarkFlags::FAN_MARK_REMOVE,
        MaskFlags::FAN_ACCESS_PERM | MaskFlags::FAN_EVENT_ON_CHILD,
        None,
        Some(watch.pid_file_dir.as_path()),
    ) {
        Ok(()) => Spec::from_bundle(&watch.bundle).map(Box::new).ok_log(),
        Err(err) => {
            log::warn!(
                "failed to unmark {}, not reading the OCI config: {err}",
                watch.pid_file_dir.display()
            );
            None
        }
    };
    log::debug!("runc created container `{id}` with pid {pid}");
    Ok(Some((id, pid, config)))
}

/// Returns the container and its pid if `accessed` is the watched pid file.
/// Accesses to other files below its directory are ignored.
fn read_pid_file(
    watch: &PidFileWatch,
    accessed: &Path,
    mut file: std::fs::File,
) -> Result<Option<(ContainerID, u32)>> {
    if accessed != watch.pid_file {
        log::trace!("ignoring access to {}", accessed.display());
        return Ok(None);
    }
    let pid_file_error = |reason: String| Error::PidFile {
        path: watch.pid_file.clone(),
        reason,
    };
    let mut content = String::new();
    file.read_to_string(&mut content)
        .map_err(|err| pid_file_error(err.to_string()))?;
    let pid = parse_pid(&content).map_err(pid_file_error)?;
    let id = container_id_from_bundle(&watch.bundle)?;
    Ok(Some((id, pid)))
}
