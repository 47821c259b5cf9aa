//! End-to-end scenarios: an in-process daemon serving the real socket
//! protocol, driven through the library client.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::task::JoinHandle;

use procvisor::client::Client;
use procvisor::config::Settings;
use procvisor::error::ServerError;
use procvisor::events::Info;
use procvisor::server::rpc::{
    Call, InfoReply, ListArgs, ListReply, LoadServicesArgs, LoadServicesReply, NameArgs,
    RunArgs, StopArgs, TailArgs, TailReply,
};
use procvisor::server::{endpoint, Server};

struct TestDaemon {
    _dir: TempDir,
    settings: Settings,
    _server: Arc<Server>,
    serve: JoinHandle<()>,
}

impl TestDaemon {
    async fn start() -> TestDaemon {
        let dir = TempDir::new().expect("tempdir");
        let settings = Settings {
            log_path: PathBuf::from("-"),
            log_level: "warn".to_string(),
            fifo_path: dir.path().join("test.fifo"),
            clean_temp_services_after: Duration::from_secs(3600),
            service_file: None,
        };

        let (server, mut updates) = Server::new(settings.clone());
        tokio::spawn(async move { while updates.recv().await.is_some() {} });

        let listener = endpoint::open(&settings.fifo_path).expect("open endpoint");
        let serve = tokio::spawn(endpoint::serve(Arc::clone(&server), listener));

        TestDaemon {
            _dir: dir,
            settings,
            _server: server,
            serve,
        }
    }

    async fn client(&self) -> Client {
        Client::connect(&self.settings, false)
            .await
            .expect("connect to test daemon")
    }

    fn service_file(&self, contents: &str) -> PathBuf {
        let path = self._dir.path().join("services.yml");
        std::fs::write(&path, contents).expect("write services.yml");
        path
    }
}

async fn info_of(client: &mut Client, name: &str) -> Info {
    let reply: InfoReply = client
        .call(Call::Info(NameArgs {
            name: name.to_string(),
        }))
        .await
        .expect("info call");
    reply.info
}

/// Polls a service's Info until the predicate holds or the deadline passes.
async fn wait_until_info<F>(client: &mut Client, name: &str, what: &str, deadline: Duration, check: F)
where
    F: Fn(&Info) -> bool,
{
    let end = Instant::now() + deadline;
    loop {
        let info = info_of(client, name).await;
        if check(&info) {
            return;
        }
        assert!(Instant::now() < end, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Polls the registry until `name` is gone.
async fn wait_until_absent(client: &mut Client, name: &str, deadline: Duration) {
    let end = Instant::now() + deadline;
    loop {
        let list: ListReply = client
            .call(Call::List(ListArgs::default()))
            .await
            .expect("list");
        if !list.services.iter().any(|i| i.name() == name) {
            return;
        }
        assert!(Instant::now() < end, "timed out waiting for {name} to be removed");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn run_args(name: &str, program: &str, args: &[&str], clean_after: Duration) -> RunArgs {
    RunArgs {
        name: Some(name.to_string()),
        program: program.to_string(),
        args: args.iter().map(|s| s.to_string()).collect(),
        dir: PathBuf::new(),
        env: Default::default(),
        clean_after,
    }
}

#[tokio::test]
async fn run_and_tail_round_trip() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.client().await;

    let reply: InfoReply = client
        .call(Call::Run(run_args(
            "echo",
            "sh",
            &["-c", "echo A; echo B; exit 0"],
            Duration::from_secs(3600),
        )))
        .await
        .expect("run");
    assert!(reply.info.pid > 0);
    let pid = reply.info.pid;

    wait_until_info(&mut client, "echo", "echo to exit", Duration::from_secs(2), |i| {
        !i.running
    })
    .await;

    let info = info_of(&mut client, "echo").await;
    assert!(info.succeeded);
    assert!(info.pid > 0);
    assert!(info.end_time.is_some());

    // Pid-constrained tail: both lines in order, and EOF since the process
    // is done.
    let tail: TailReply = client
        .call(Call::Tail(TailArgs {
            name: "echo".to_string(),
            pid,
            max_lines: 10,
            index: -10,
            follow: false,
        }))
        .await
        .expect("tail");
    let texts: Vec<&str> = tail.lines.iter().map(|l| l.text.as_str()).collect();
    assert_eq!(texts, vec!["A", "B"]);
    assert!(tail.eof);

    // Unconstrained tail sees the same lines without EOF.
    let tail: TailReply = client
        .call(Call::Tail(TailArgs {
            name: "echo".to_string(),
            pid: 0,
            max_lines: 10,
            index: -10,
            follow: false,
        }))
        .await
        .expect("tail");
    assert_eq!(tail.lines.len(), 2);
    assert!(!tail.eof);

    daemon.serve.abort();
}

#[tokio::test]
async fn stop_escalates_past_ignored_signals() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.client().await;

    client
        .call::<InfoReply>(Call::Run(run_args(
            "stubborn",
            "sh",
            &["-c", "trap '' INT TERM; while :; do sleep 1; done"],
            Duration::from_secs(3600),
        )))
        .await
        .expect("run");

    wait_until_info(
        &mut client,
        "stubborn",
        "stubborn to be running",
        Duration::from_secs(2),
        |i| i.running,
    )
    .await;

    let started = Instant::now();
    let reply: InfoReply = client
        .call(Call::Stop(StopArgs {
            name: "stubborn".to_string(),
            escalation: Duration::from_millis(200),
        }))
        .await
        .expect("stop should escalate to KILL and succeed");
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "escalation took {:?}",
        started.elapsed()
    );

    assert!(!reply.info.running);
    assert!(reply.info.succeeded, "user stop counts as success");
    assert!(reply.info.end_time.is_some());

    // Property: after a successful stop, wait returns immediately.
    let waited: InfoReply = tokio::time::timeout(
        Duration::from_secs(2),
        client.call(Call::Wait(NameArgs {
            name: "stubborn".to_string(),
        })),
    )
    .await
    .expect("wait must not block after stop")
    .expect("wait call");
    assert!(!waited.info.running);

    daemon.serve.abort();
}

#[tokio::test]
async fn exited_temp_service_is_garbage_collected() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.client().await;

    client
        .call::<InfoReply>(Call::Run(run_args(
            "ephemeral",
            "true",
            &[],
            Duration::from_secs(1),
        )))
        .await
        .expect("run");

    let list: ListReply = client
        .call(Call::List(ListArgs::default()))
        .await
        .expect("list");
    assert!(list.services.iter().any(|i| i.name() == "ephemeral"));

    wait_until_absent(&mut client, "ephemeral", Duration::from_secs(5)).await;

    daemon.serve.abort();
}

#[tokio::test]
async fn reload_reconciles_and_is_idempotent() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.client().await;

    // v1: A and B appear.
    let path = daemon.service_file(
        "- name: a\n  program: sleep\n  args: [\"60\"]\n- name: b\n  program: \"true\"\n",
    );
    let reply: LoadServicesReply = client
        .call(Call::LoadServices(LoadServicesArgs { path: path.clone() }))
        .await
        .expect("load v1");
    let mut new_names: Vec<String> = reply
        .new_services
        .iter()
        .map(|i| i.name().to_string())
        .collect();
    new_names.sort();
    assert_eq!(new_names, vec!["a", "b"]);

    client
        .call::<InfoReply>(Call::Start(NameArgs {
            name: "a".to_string(),
        }))
        .await
        .expect("start a");

    // v2: A identical, B changed, C new.
    let path = daemon.service_file(
        "- name: a\n  program: sleep\n  args: [\"60\"]\n- name: b\n  program: \"true\"\n  args: [\"x\"]\n- name: c\n  program: \"true\"\n",
    );
    let reply: LoadServicesReply = client
        .call(Call::LoadServices(LoadServicesArgs { path: path.clone() }))
        .await
        .expect("load v2");
    assert_eq!(
        reply.new_services.iter().map(|i| i.name()).collect::<Vec<_>>(),
        vec!["c"]
    );
    assert_eq!(
        reply
            .updated_services
            .iter()
            .map(|i| i.name())
            .collect::<Vec<_>>(),
        vec!["b"]
    );
    assert!(reply.deprecated_services.is_empty());
    assert!(reply.removed_services.is_empty());

    // Property: a second load of an unchanged file classifies nothing.
    let reply: LoadServicesReply = client
        .call(Call::LoadServices(LoadServicesArgs { path: path.clone() }))
        .await
        .expect("load v2 again");
    assert!(reply.new_services.is_empty());
    assert!(reply.updated_services.is_empty());
    assert!(reply.deprecated_services.is_empty());
    assert!(reply.removed_services.is_empty());

    // v3: only A remains; the stopped B and C are removed, running A stays.
    let path = daemon.service_file("- name: a\n  program: sleep\n  args: [\"60\"]\n");
    let reply: LoadServicesReply = client
        .call(Call::LoadServices(LoadServicesArgs { path: path.clone() }))
        .await
        .expect("load v3");
    let mut removed = reply.removed_services.clone();
    removed.sort();
    assert_eq!(removed, vec!["b", "c"]);
    assert!(info_of(&mut client, "a").await.running);

    // v4: empty file; the running A is deprecated, not removed, and marked
    // temp with zero grace.
    let path = daemon.service_file("[]\n");
    let reply: LoadServicesReply = client
        .call(Call::LoadServices(LoadServicesArgs { path }))
        .await
        .expect("load v4");
    assert_eq!(
        reply
            .deprecated_services
            .iter()
            .map(|i| i.name())
            .collect::<Vec<_>>(),
        vec!["a"]
    );
    let info = info_of(&mut client, "a").await;
    assert!(info.config.temp);
    assert!(info.config.clean_after.is_zero());
    assert!(info.running);

    // Once stopped, the reaper collects it immediately.
    client
        .call::<InfoReply>(Call::Stop(StopArgs {
            name: "a".to_string(),
            escalation: Duration::from_millis(200),
        }))
        .await
        .expect("stop a");
    wait_until_absent(&mut client, "a", Duration::from_secs(5)).await;

    daemon.serve.abort();
}

#[tokio::test]
async fn restart_watcher_relaunches_until_user_stop() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.client().await;

    let path = daemon
        .service_file("- name: flapper\n  program: \"false\"\n  restart-on-exit: true\n");
    client
        .call::<LoadServicesReply>(Call::LoadServices(LoadServicesArgs { path }))
        .await
        .expect("load");

    client
        .call::<InfoReply>(Call::Start(NameArgs {
            name: "flapper".to_string(),
        }))
        .await
        .expect("start");

    // Sample pids while the watcher relaunches with growing pauses
    // (restarts due roughly 0.5s, 1.5s, 3.5s after the first exit).
    let mut pids = std::collections::BTreeSet::new();
    let sampling_end = Instant::now() + Duration::from_millis(4500);
    while Instant::now() < sampling_end {
        let info = info_of(&mut client, "flapper").await;
        if info.pid != 0 {
            pids.insert(info.pid);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(
        pids.len() >= 2,
        "expected multiple relaunches, saw pids {pids:?}"
    );

    // A user stop suppresses auto-restart.
    client
        .call::<InfoReply>(Call::Stop(StopArgs {
            name: "flapper".to_string(),
            escalation: Duration::from_millis(200),
        }))
        .await
        .expect("stop");

    let settled_pid = info_of(&mut client, "flapper").await.pid;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let info = info_of(&mut client, "flapper").await;
    assert!(!info.running, "no restart after a user stop");
    assert_eq!(info.pid, settled_pid, "pid must not change after stop");

    daemon.serve.abort();
}

#[tokio::test]
async fn second_instance_is_refused_while_first_lives() {
    let daemon = TestDaemon::start().await;

    let err = endpoint::open(&daemon.settings.fifo_path)
        .err()
        .expect("second open must fail");
    assert!(matches!(err, ServerError::AnotherInstance));

    // Simulate a hard crash: the serve loop dies without unlinking, the
    // heartbeat stops, and once the file is stale the address is
    // reclaimable.
    daemon.serve.abort();
    let stale = std::time::SystemTime::now() - Duration::from_secs(21);
    filetime::set_file_mtime(
        &daemon.settings.fifo_path,
        filetime::FileTime::from_system_time(stale),
    )
    .expect("age the rendezvous file");

    let listener = endpoint::open(&daemon.settings.fifo_path)
        .expect("stale rendezvous file must be reclaimed");
    drop(listener);
}

#[tokio::test]
async fn unknown_service_reports_not_found() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.client().await;

    let err = client
        .call::<InfoReply>(Call::Info(NameArgs {
            name: "ghost".to_string(),
        }))
        .await
        .err()
        .expect("unknown service must error");
    match err {
        ServerError::Remote(message) => assert!(message.contains("not found")),
        other => panic!("unexpected error: {other}"),
    }

    daemon.serve.abort();
}

#[tokio::test]
async fn run_without_name_derives_and_replaces_exited_temp() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.client().await;

    let anonymous = |_n: u32| RunArgs {
        name: None,
        program: "/bin/true".to_string(),
        args: Vec::new(),
        dir: PathBuf::new(),
        env: Default::default(),
        clean_after: Duration::from_secs(3600),
    };

    let first: InfoReply = client.call(Call::Run(anonymous(1))).await.expect("run 1");
    assert_eq!(first.info.config.name, "true");

    wait_until_info(
        &mut client,
        "true",
        "first run to exit",
        Duration::from_secs(2),
        |i| !i.running,
    )
    .await;

    // Same anonymous program again: the exited temp holder is replaced
    // rather than suffixed.
    let second: InfoReply = client.call(Call::Run(anonymous(2))).await.expect("run 2");
    assert_eq!(second.info.config.name, "true");

    let list: ListReply = client
        .call(Call::List(ListArgs {
            running: false,
            temp: true,
        }))
        .await
        .expect("list");
    let count = list
        .services
        .iter()
        .filter(|i| i.name().starts_with("true"))
        .count();
    assert_eq!(count, 1, "replacement must not leave duplicates");

    daemon.serve.abort();
}

#[tokio::test]
async fn tail_follow_waits_for_new_output() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.client().await;

    // Emits one line after a short delay; follow must block until then.
    client
        .call::<InfoReply>(Call::Run(run_args(
            "late-talker",
            "sh",
            &["-c", "sleep 1; echo finally"],
            Duration::from_secs(3600),
        )))
        .await
        .expect("run");

    let started = Instant::now();
    let tail: TailReply = client
        .call(Call::Tail(TailArgs {
            name: "late-talker".to_string(),
            pid: 0,
            max_lines: 0,
            index: 0,
            follow: true,
        }))
        .await
        .expect("tail follow");
    assert_eq!(
        tail.lines.iter().map(|l| l.text.as_str()).collect::<Vec<_>>(),
        vec!["finally"]
    );
    assert!(
        started.elapsed() >= Duration::from_millis(500),
        "follow returned before the line could exist"
    );
    assert!(
        started.elapsed() < Duration::from_secs(9),
        "follow should return on append, not deadline"
    );

    daemon.serve.abort();
}
