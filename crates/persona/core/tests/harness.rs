//! Running dispatched personas.

use persona_core::{AppConfig, AppContext, HostKind, Id, PersonaError, Startup};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Journal = Arc<Mutex<Vec<String>>>;

fn context(app: &str, dir: &Path, args: &[&str]) -> AppContext<Startup> {
    AppContext::new(
        AppConfig::new(app)
            .with_build_dir(dir)
            .with_args(args.iter().copied()),
    )
    .unwrap()
}

fn record(journal: &Journal, entry: &str) {
    journal.lock().unwrap().push(entry.to_string());
}

fn position(journal: &Journal, entry: &str) -> usize {
    journal
        .lock()
        .unwrap()
        .iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("`{entry}` was never recorded"))
}

#[tokio::test]
async fn in_process_runs_workers_then_terminal_then_teardown() {
    let dir = tempfile::tempdir().unwrap();
    let journal: Journal = Arc::default();
    let mut ctx = context("harness-app", dir.path(), &["ping", "--times=2"]);
    let root = ctx.root().clone();

    let j = Arc::clone(&journal);
    ctx.define_worker(root.child("indexer"), move |rt| {
        let j = Arc::clone(&j);
        async move {
            assert_eq!(rt.persona().key, persona_core::IN_PROCESS_KEY);
            record(&j, "indexer");
            Ok(())
        }
    })
    .unwrap();
    ctx.define_worker(root.child("broken"), |_rt| async {
        anyhow::bail!("worker exploded")
    })
    .unwrap();

    let commands = ctx.define_commands(root.child("cli")).unwrap();
    let j = Arc::clone(&journal);
    commands
        .command("ping", "answer with pong", move |args| {
            let j = Arc::clone(&j);
            async move {
                let times: usize = args.get("times").unwrap_or("1").parse()?;
                for _ in 0..times {
                    record(&j, "pong");
                }
                Ok(())
            }
        })
        .unwrap();

    ctx.on_teardown("failing", || async { anyhow::bail!("cannot close") });
    let j = Arc::clone(&journal);
    ctx.on_teardown("journal", move || {
        let j = Arc::clone(&j);
        async move {
            record(&j, "teardown");
            Ok(())
        }
    });

    ctx.dispatch(None).unwrap().run().await.unwrap();

    assert!(position(&journal, "indexer") < position(&journal, "pong"));
    assert!(position(&journal, "pong") < position(&journal, "teardown"));
    let pongs = journal.lock().unwrap().iter().filter(|e| *e == "pong").count();
    assert_eq!(pongs, 2);
}

#[tokio::test]
async fn unknown_one_shot_command_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = context("oneshot-app", dir.path(), &["frobnicate"]);
    let commands = ctx.define_commands(ctx.root().child("cli")).unwrap();
    commands
        .command("status", "print status", |_args| async { Ok(()) })
        .unwrap();

    let err = ctx.dispatch(None).unwrap().run().await.unwrap_err();
    match err {
        PersonaError::UnknownCommand { name, available } => {
            assert_eq!(name, "frobnicate");
            assert_eq!(available, vec!["status".to_string()]);
        }
        other => panic!("expected UnknownCommand, got {other:?}"),
    }
}

#[tokio::test]
async fn placeholder_has_nothing_to_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = context("placeholder-app", dir.path(), &[]);
    let db = ctx.root().child("db");
    let placeholder = ctx.define_placeholder(db.clone()).unwrap();
    assert_eq!(placeholder.host, HostKind::Placeholder);

    let err = ctx.dispatch(Some(&db)).unwrap().run().await.unwrap_err();
    assert!(matches!(err, PersonaError::NotRunnable(key) if key == placeholder.key));
}

#[tokio::test]
async fn entry_point_failure_still_tears_down() {
    let dir = tempfile::tempdir().unwrap();
    let journal: Journal = Arc::default();
    let mut ctx = context("failing-app", dir.path(), &[]);
    let worker = ctx.root().child("worker");
    let persona = ctx
        .define_worker(worker.clone(), |_rt| async {
            Err(anyhow::anyhow!("disk full").context("flushing queue"))
        })
        .unwrap();
    let j = Arc::clone(&journal);
    ctx.on_teardown("journal", move || {
        let j = Arc::clone(&j);
        async move {
            record(&j, "teardown");
            Ok(())
        }
    });

    let err = ctx.dispatch(Some(&worker)).unwrap().run().await.unwrap_err();
    match err {
        PersonaError::EntryPoint { key, message } => {
            assert_eq!(key, persona.key);
            assert_eq!(message, "flushing queue: disk full");
        }
        other => panic!("expected EntryPoint, got {other:?}"),
    }
    assert_eq!(journal.lock().unwrap().as_slice(), ["teardown".to_string()]);
}

#[tokio::test]
async fn process_waits_for_background_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let journal: Journal = Arc::default();
    let mut ctx = context("background-app", dir.path(), &[]);
    let worker = ctx.root().child("worker");
    let j = Arc::clone(&journal);
    ctx.define_worker(worker.clone(), move |rt| {
        let j = Arc::clone(&j);
        async move {
            rt.spawn_background("drain", async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                record(&j, "drained");
                Ok(())
            })?;
            Ok(())
        }
    })
    .unwrap();

    ctx.dispatch(Some(&worker)).unwrap().run().await.unwrap();
    assert_eq!(journal.lock().unwrap().as_slice(), ["drained".to_string()]);
}

#[test]
fn dispatch_by_unknown_id_fails() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context("unknown-app", dir.path(), &[]);
    let missing = Id::root("unknown-app").child("ghost");
    match ctx.dispatch(Some(&missing)) {
        Err(PersonaError::UnknownPersona { selector, .. }) => {
            assert_eq!(selector, missing.value())
        }
        other => panic!("expected UnknownPersona, got {other:?}"),
    }
}

#[tokio::test]
async fn in_process_servers_get_ports_without_a_build() {
    let dir = tempfile::tempdir().unwrap();
    let journal: Journal = Arc::default();

    let declare = |ctx: &mut AppContext<Startup>, journal: &Journal| {
        let root = ctx.root().clone();
        let j = Arc::clone(journal);
        let api = ctx
            .define_server(root.child("api"), move |_rt, server| {
                let j = Arc::clone(&j);
                async move {
                    record(&j, &format!("api {}", server.bind_addr()?));
                    Ok(())
                }
            })
            .unwrap();
        let admin = ctx
            .define_server(root.child("admin"), |_rt, _server| async { Ok(()) })
            .unwrap();
        let commands = ctx.define_commands(root.child("cli")).unwrap();
        let j = Arc::clone(journal);
        let target = api.clone();
        commands
            .command("where", "print the api address", move |_args| {
                let j = Arc::clone(&j);
                let target = target.clone();
                async move {
                    record(&j, &format!("cli {}", target.address()?));
                    Ok(())
                }
            })
            .unwrap();
        (api, admin)
    };

    let mut ctx = context("inproc-ports-app", dir.path(), &["where"]);
    let (api, admin) = declare(&mut ctx, &journal);
    ctx.dispatch(None).unwrap().run().await.unwrap();

    assert!(!dir.path().join(".env").exists());
    assert_eq!(api.port().unwrap(), 5000);
    assert_eq!(admin.port().unwrap(), 5001);
    assert_eq!(
        journal.lock().unwrap().as_slice(),
        ["api 127.0.0.1:5000".to_string(), "cli 127.0.0.1:5000".to_string()]
    );

    // A later build replays the ports the in-process run recorded.
    let mut build = context("inproc-ports-app", dir.path(), &[]);
    let (api, _admin) = declare(&mut build, &Journal::default());
    build
        .dispatch(Some(&Id::root("inproc-ports-app").child("build")))
        .unwrap()
        .run()
        .await
        .unwrap();
    let env = std::fs::read_to_string(dir.path().join(".env")).unwrap();
    assert!(env.contains(&format!("{}=\"5000\"", api.port_secret().env_var())));
}
