//! # RPC command surface.
//!
//! The wire protocol is newline-delimited JSON over the UNIX socket: one
//! [`Request`] object per line in, one [`Response`] object per line out.
//! Requests carry a client-chosen `id` that is echoed back, a `cmd` tag,
//! and an optional `args` object.
//!
//! Every handler body runs under a panic trampoline: an unexpected panic
//! becomes a `"Server error: <msg>"` response and a critical log line, and
//! never takes the daemon down.
//!
//! ## Command set
//! `version`, `list`, `info`, `start`, `stop`, `wait`, `run`, `clean`,
//! `load-services`, `tail`, `exit`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::config::{load_service_file, ServiceConfig, Version};
use crate::error::ServerError;
use crate::events::Info;
use crate::server::Server;
use crate::service::{OutputLine, Service};

/// How long a follow-mode tail waits for output before returning empty.
const TAIL_FOLLOW_TIMEOUT: Duration = Duration::from_secs(10);

// ---- Wire types ----

/// One request line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: u64,
    #[serde(flatten)]
    pub call: Call,
}

/// The command tag and its arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "args", rename_all = "kebab-case")]
pub enum Call {
    Version,
    List(ListArgs),
    Info(NameArgs),
    Start(NameArgs),
    Stop(StopArgs),
    Wait(NameArgs),
    Run(RunArgs),
    Clean(CleanArgs),
    LoadServices(LoadServicesArgs),
    Tail(TailArgs),
    Exit,
}

impl Call {
    /// Human-readable method name, used in connection-loss messages.
    pub fn name(&self) -> &'static str {
        match self {
            Call::Version => "Version",
            Call::List(_) => "List",
            Call::Info(_) => "Info",
            Call::Start(_) => "Start",
            Call::Stop(_) => "Stop",
            Call::Wait(_) => "Wait",
            Call::Run(_) => "Run",
            Call::Clean(_) => "Clean",
            Call::LoadServices(_) => "LoadServices",
            Call::Tail(_) => "Tail",
            Call::Exit => "Exit",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListArgs {
    /// Only running services.
    #[serde(default)]
    pub running: bool,
    /// Only temporary services.
    #[serde(default)]
    pub temp: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameArgs {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopArgs {
    pub name: String,
    /// Wait between escalation signals; zero means the server default.
    #[serde(default, with = "crate::config::duration::serde_compact")]
    pub escalation: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunArgs {
    /// Service name; derived from the program's basename when omitted.
    #[serde(default)]
    pub name: Option<String>,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub dir: PathBuf,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, with = "crate::config::duration::serde_compact")]
    pub clean_after: Duration,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanArgs {
    /// Glob over service names; empty means every name.
    #[serde(default)]
    pub pattern: String,
    /// Only services exited at least this long ago; zero means any.
    #[serde(default, with = "crate::config::duration::serde_compact")]
    pub age: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadServicesArgs {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailArgs {
    pub name: String,
    /// Restrict output to one process; 0 means all.
    #[serde(default)]
    pub pid: u32,
    /// Max lines per response; 0 means unlimited.
    #[serde(default)]
    pub max_lines: usize,
    /// Start index; negative counts back from the end.
    #[serde(default)]
    pub index: i64,
    /// Wait a while for output instead of returning empty immediately.
    #[serde(default)]
    pub follow: bool,
}

/// One response line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    fn result(id: u64, data: Value) -> Response {
        Response {
            id,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn fail(id: u64, message: impl Into<String>) -> Response {
        Response {
            id,
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

// ---- Reply payloads ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionReply {
    pub version: Version,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListReply {
    #[serde(default)]
    pub services: Vec<Info>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoReply {
    pub info: Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanFailure {
    pub info: Info,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanReply {
    #[serde(default)]
    pub cleaned: Vec<Info>,
    #[serde(default)]
    pub failed: Vec<CleanFailure>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadServicesReply {
    #[serde(default)]
    pub new_services: Vec<Info>,
    #[serde(default)]
    pub updated_services: Vec<Info>,
    #[serde(default)]
    pub deprecated_services: Vec<Info>,
    #[serde(default)]
    pub removed_services: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailReply {
    #[serde(default)]
    pub lines: Vec<OutputLine>,
    /// True if the requested process has produced its last line.
    #[serde(default)]
    pub eof: bool,
    /// Resume point for a follow-up call.
    #[serde(default)]
    pub next_index: u64,
    #[serde(default)]
    pub next_pid: u32,
}

// ---- Session ----

/// Serves one client connection: a loop of request lines.
pub async fn session(server: Arc<Server>, stream: UnixStream) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }

        let response = handle_line(&server, &line).await;
        let mut payload = match serde_json::to_string(&response) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(error = %err, "failed to encode rpc response");
                break;
            }
        };
        payload.push('\n');
        if write_half.write_all(payload.as_bytes()).await.is_err() {
            break;
        }
    }
}

async fn handle_line(server: &Arc<Server>, line: &str) -> Response {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => return Response::fail(0, format!("bad request: {err}")),
    };

    let id = request.id;
    let method = request.call.name();

    // Panic trampoline: a handler bug must never take the daemon down.
    match std::panic::AssertUnwindSafe(dispatch(server, request.call))
        .catch_unwind()
        .await
    {
        Ok(Ok(data)) => Response::result(id, data),
        Ok(Err(err)) => {
            tracing::debug!(method, error = %err, label = err.as_label(), "rpc call failed");
            Response::fail(id, err.to_string())
        }
        Err(panic) => {
            let detail = panic_detail(panic);
            tracing::error!(method, panic = %detail, "rpc handler panicked");
            Response::fail(id, format!("Server error: {detail}"))
        }
    }
}

fn panic_detail(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn to_value<T: Serialize>(reply: T) -> Result<Value, ServerError> {
    serde_json::to_value(reply)
        .map_err(|err| ServerError::Panic {
            detail: format!("failed to encode reply: {err}"),
        })
}

async fn dispatch(server: &Arc<Server>, call: Call) -> Result<Value, ServerError> {
    match call {
        Call::Version => to_value(VersionReply {
            version: Version::current(),
        }),

        Call::List(args) => {
            let mut services = Vec::new();
            for service in server.list().await {
                let info = service.info().await;
                if args.running && !info.running {
                    continue;
                }
                if args.temp && !info.config.temp {
                    continue;
                }
                services.push(info);
            }
            to_value(ListReply { services })
        }

        Call::Info(args) => {
            let service = must_get(server, &args.name).await?;
            to_value(InfoReply {
                info: service.info().await,
            })
        }

        Call::Start(args) => {
            let service = server.start_registered(&args.name).await?;
            to_value(InfoReply {
                info: service.info().await,
            })
        }

        Call::Stop(args) => {
            let service = server.stop_registered(&args.name, args.escalation).await?;
            to_value(InfoReply {
                info: service.info().await,
            })
        }

        Call::Wait(args) => {
            let service = must_get(server, &args.name).await?;
            service.wait().await;
            to_value(InfoReply {
                info: service.info().await,
            })
        }

        Call::Run(args) => run(server, args).await,

        Call::Clean(args) => clean(server, args).await,

        Call::LoadServices(args) => {
            tracing::info!(file = %args.path.display(), "load services");
            let configs = load_service_file(
                &args.path,
                server.settings().clean_temp_services_after,
            )?;
            let reply = reconcile_services(server, configs).await?;
            to_value(reply)
        }

        Call::Tail(args) => tail(server, args).await,

        Call::Exit => {
            tracing::info!("exiting server");
            server.stop_token().cancel();
            to_value(Value::Null)
        }
    }
}

async fn must_get(server: &Arc<Server>, name: &str) -> Result<Arc<Service>, ServerError> {
    server.get(name).await.ok_or_else(|| ServerError::NotFound {
        name: name.to_string(),
    })
}

// ---- Run ----

async fn run(server: &Arc<Server>, args: RunArgs) -> Result<Value, ServerError> {
    let name = match args.name.filter(|n| !n.is_empty()) {
        Some(name) => name,
        None => derive_run_name(server, &args.program).await?,
    };

    let mut conf = ServiceConfig {
        name,
        program: args.program,
        args: args.args,
        dir: args.dir,
        env: args.env,
        auto_start: false,
        restart_on_exit: false,
        temp: true,
        clean_after: args.clean_after,
    };
    conf.sanitize(server.settings().clean_temp_services_after)?;

    let name = conf.name.clone();
    let service = Service::new(conf);
    server.add(Arc::clone(&service), false).await?;

    tracing::debug!(service = %name, "running service");
    service.start(server.bus()).await?;

    to_value(InfoReply {
        info: service.info().await,
    })
}

/// Names an anonymous run after its program, dodging collisions.
///
/// A collision with an exited temp service replaces it; otherwise a `-N`
/// suffix is probed.
async fn derive_run_name(server: &Arc<Server>, program: &str) -> Result<String, ServerError> {
    let base = Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string());

    match server.get(&base).await {
        None => return Ok(base),
        Some(existing) => {
            let conf = existing.config().await;
            if conf.temp && !existing.running() && server.remove(&base).await.is_ok() {
                return Ok(base);
            }
        }
    }

    for n in 1..=50 {
        let candidate = format!("{base}-{n}");
        if server.get(&candidate).await.is_none() {
            return Ok(candidate);
        }
    }

    Err(ServerError::Config("failed to name the service".to_string()))
}

// ---- Clean ----

async fn clean(server: &Arc<Server>, args: CleanArgs) -> Result<Value, ServerError> {
    let pattern = if args.pattern.is_empty() {
        "*".to_string()
    } else {
        args.pattern
    };
    let matcher = globset::Glob::new(&pattern)
        .map_err(|err| ServerError::InvalidPattern {
            pattern: pattern.clone(),
            reason: err.to_string(),
        })?
        .compile_matcher();

    tracing::info!(%pattern, age = ?args.age, "cleaning services");

    let now = SystemTime::now();
    let mut reply = CleanReply::default();
    for service in server.list().await {
        let info = service.info().await;
        if !info.config.temp || info.running || !matcher.is_match(info.name()) {
            continue;
        }

        let old_enough = args.age.is_zero()
            || info
                .end_time
                .map(|end| now.duration_since(end).unwrap_or_default() >= args.age)
                .unwrap_or(true);
        if !old_enough {
            continue;
        }

        match server.remove(info.name()).await {
            Ok(()) => reply.cleaned.push(info),
            Err(err) => {
                tracing::warn!(service = info.name(), error = %err, "failed to remove a service");
                reply.failed.push(CleanFailure {
                    info,
                    error: err.to_string(),
                });
            }
        }
    }

    to_value(reply)
}

// ---- LoadServices ----

/// Reconciles the registry against an authoritative list of configs.
///
/// Classification per entry: NEW (unknown name), unchanged, UPDATED
/// (replaced while stopped, or safe fields applied while running),
/// REMOVED (absent from the list and stopped), DEPRECATED (absent but
/// running; marked temp with zero grace so the reaper removes it on exit).
/// The first entry that can't be transformed aborts the call; earlier
/// entries are not rolled back.
pub async fn reconcile_services(
    server: &Arc<Server>,
    configs: Vec<ServiceConfig>,
) -> Result<LoadServicesReply, ServerError> {
    let mut reply = LoadServicesReply::default();
    let keep: std::collections::HashSet<String> =
        configs.iter().map(|c| c.name.clone()).collect();

    for conf in configs {
        let Some(existing) = server.get(&conf.name).await else {
            tracing::debug!(service = %conf.name, "adding a new service");
            let service = Service::new(conf);
            server.add(Arc::clone(&service), false).await?;
            reply.new_services.push(service.info().await);
            continue;
        };

        let current = existing.config().await;
        if current == conf {
            continue;
        }

        if !existing.running() {
            tracing::debug!(service = %conf.name, "replacing a changed service");
            let watch = conf.restart_on_exit;
            let name = conf.name.clone();
            let service = Service::new(conf);
            server.add(Arc::clone(&service), true).await?;
            server.sync_restart_watch(&name, &service, watch);
            reply.updated_services.push(service.info().await);
            continue;
        }

        if current.equal_ignoring_safe_fields(&conf) {
            tracing::debug!(service = %conf.name, "updating a running service with safe changes");

            // A service that had been deprecated out of the file and is now
            // listed again gets its permanence back.
            if current.temp && !conf.temp && !server.change_permanence(&conf.name, false, Duration::ZERO).await
            {
                return Err(ServerError::Config(format!(
                    "failed to remove temporary status of a now-permanent service ({})",
                    conf.name
                )));
            }

            existing.set_auto_start(conf.auto_start).await;

            if !current.restart_on_exit && conf.restart_on_exit {
                server.watch_for_restart(&conf.name, &existing);
                existing.set_restart_on_exit(true).await;
            } else if current.restart_on_exit && !conf.restart_on_exit {
                server.restarts().unregister(&conf.name);
                existing.set_restart_on_exit(false).await;
            }

            reply.updated_services.push(existing.info().await);
            continue;
        }

        return Err(ServerError::Config(format!(
            "cannot apply these changes to a running service ({})",
            conf.name
        )));
    }

    // Anything the file no longer lists gets removed, or deprecated if
    // it's still running.
    for service in server.list().await {
        let conf = service.config().await;
        if keep.contains(&conf.name) {
            continue;
        }

        if !service.running() {
            tracing::info!(service = %conf.name, "removing service that's no longer in conf");
            match server.remove(&conf.name).await {
                Ok(()) => reply.removed_services.push(conf.name),
                Err(err) => tracing::warn!(
                    service = %conf.name,
                    error = %err,
                    "failed to remove service absent from conf"
                ),
            }
        } else {
            tracing::info!(
                service = %conf.name,
                "service no longer in conf is running, marking temp for removal after exit"
            );
            if !server.change_permanence(&conf.name, true, Duration::ZERO).await {
                return Err(ServerError::Config(format!(
                    "failed to mark a removed but still running service ({}) for cleanup",
                    conf.name
                )));
            }
            reply.deprecated_services.push(service.info().await);
        }
    }

    Ok(reply)
}

// ---- Tail ----

async fn tail(server: &Arc<Server>, args: TailArgs) -> Result<Value, ServerError> {
    let service = must_get(server, &args.name).await?;
    let ring = Arc::clone(service.output());

    let mut chunk = ring.get(args.index, args.pid, args.max_lines).await;

    if args.follow && !chunk.eof && chunk.lines.is_empty() {
        let deadline = tokio::time::sleep(TAIL_FOLLOW_TIMEOUT);
        tokio::pin!(deadline);

        loop {
            // Register for the append signal before re-reading, so a line
            // landing in between can't be missed.
            let notified = ring.appended();
            tokio::pin!(notified);
            notified.as_mut().enable();

            chunk = ring
                .get(chunk.next_index as i64, chunk.next_pid, args.max_lines)
                .await;
            if chunk.eof || !chunk.lines.is_empty() {
                break;
            }

            tokio::select! {
                _ = &mut deadline => break,
                _ = &mut notified => {}
            }
        }
    }

    to_value(TailReply {
        lines: chunk.lines,
        eof: chunk.eof,
        next_index: chunk.next_index,
        next_pid: chunk.next_pid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_round_trip() {
        let request = Request {
            id: 7,
            call: Call::Tail(TailArgs {
                name: "web".to_string(),
                pid: 42,
                max_lines: 10,
                index: -10,
                follow: true,
            }),
        };
        let line = serde_json::to_string(&request).unwrap();
        assert!(line.contains("\"cmd\":\"tail\""));
        let parsed: Request = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.id, 7);
        match parsed.call {
            Call::Tail(args) => {
                assert_eq!(args.name, "web");
                assert_eq!(args.index, -10);
                assert!(args.follow);
            }
            other => panic!("wrong call: {other:?}"),
        }
    }

    #[test]
    fn unit_commands_have_no_args() {
        let line = serde_json::to_string(&Request {
            id: 1,
            call: Call::Version,
        })
        .unwrap();
        let parsed: Request = serde_json::from_str(&line).unwrap();
        assert!(matches!(parsed.call, Call::Version));

        let parsed: Request = serde_json::from_str("{\"id\":2,\"cmd\":\"exit\"}").unwrap();
        assert!(matches!(parsed.call, Call::Exit));
    }

    #[test]
    fn stop_escalation_defaults_to_zero() {
        let parsed: Request =
            serde_json::from_str("{\"id\":3,\"cmd\":\"stop\",\"args\":{\"name\":\"svc\"}}")
                .unwrap();
        match parsed.call {
            Call::Stop(args) => assert!(args.escalation.is_zero()),
            other => panic!("wrong call: {other:?}"),
        }
    }

    #[test]
    fn response_error_shape() {
        let rendered =
            serde_json::to_string(&Response::fail(9, "service 'x' not found")).unwrap();
        let parsed: Response = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed.id, 9);
        assert!(!parsed.ok);
        assert!(parsed.data.is_none());
        assert_eq!(parsed.error.as_deref(), Some("service 'x' not found"));
    }
}
