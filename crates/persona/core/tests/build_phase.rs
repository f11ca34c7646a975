//! Build persona behavior across independent application contexts.

use persona_core::{AppConfig, AppContext, PersonaError, PersonaResult};
use persona_core::{Id, PortAllocator, Producer, Startup};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn context(app: &str, dir: &Path) -> AppContext<Startup> {
    AppContext::new(AppConfig::new(app).with_build_dir(dir)).unwrap()
}

fn build_id(app: &str) -> Id {
    Id::root(app).child("build")
}

#[test]
fn get_or_insert_survives_across_builds() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = Id::root("ledger-app").child("token");

    let mut first = context("ledger-app", dir.path());
    let store = first.declare_store(first.root().child("state")).unwrap();
    let _running = first.dispatch(Some(&build_id("ledger-app"))).unwrap();
    let counter = Arc::clone(&calls);
    let value: String = store
        .get_or_insert(&key, || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok("first".to_string())
        })
        .unwrap();
    assert_eq!(value, "first");

    let mut second = context("ledger-app", dir.path());
    let store = second.declare_store(second.root().child("state")).unwrap();
    let _running = second.dispatch(Some(&build_id("ledger-app"))).unwrap();
    let counter = Arc::clone(&calls);
    let value: String = store
        .get_or_insert(&key, || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok("second".to_string())
        })
        .unwrap();
    assert_eq!(value, "first");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn store_set_delete_and_entries() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = context("store-app", dir.path());
    let store = ctx.declare_store(ctx.root().child("state")).unwrap();
    let _running = ctx.dispatch(Some(&build_id("store-app"))).unwrap();

    let a = Id::root("store-app").child("a");
    let b = Id::root("store-app").child("b");
    store.set(&a, &vec![1, 2, 3]).unwrap();
    store.set(&b, &"bee").unwrap();
    assert_eq!(store.get_as::<Vec<u8>>(&a).unwrap(), Some(vec![1, 2, 3]));
    assert!(store.delete(&a).unwrap());
    assert!(!store.delete(&a).unwrap());

    let entries = store.entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[b.value()], serde_json::json!("bee"));

    let on_disk: serde_json::Value =
        serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
    assert_eq!(on_disk, serde_json::json!({ b.value(): "bee" }));
}

#[test]
fn ports_increase_from_base_and_stay_stable() {
    let dir = tempfile::tempdir().unwrap();
    let root = Id::root("port-app");

    let first = context("port-app", dir.path());
    let ports = first.ports().clone();
    let _running = first.dispatch(Some(&build_id("port-app"))).unwrap();
    let allocated: Vec<u16> = ["a", "b", "c"]
        .iter()
        .map(|name| ports.allocate(&root.child(name)).unwrap())
        .collect();
    assert_eq!(allocated, vec![5000, 5001, 5002]);
    assert_eq!(ports.allocate(&root.child("b")).unwrap(), 5001);

    let second = context("port-app", dir.path());
    let ports = second.ports().clone();
    let _running = second.dispatch(Some(&build_id("port-app"))).unwrap();
    assert_eq!(ports.allocate(&root.child("c")).unwrap(), 5002);
    assert_eq!(ports.allocate(&root.child("a")).unwrap(), 5000);
    assert_eq!(ports.allocate(&root.child("d")).unwrap(), 5003);
}

#[test]
fn port_allocation_stops_at_the_top_of_the_range() {
    let dir = tempfile::tempdir().unwrap();
    let root = Id::root("top-app");

    let mut ctx = context("top-app", dir.path());
    let store = ctx.declare_store(root.child("high-ports")).unwrap();
    let ports = PortAllocator::with_base(store, 65534);
    let _running = ctx.dispatch(Some(&build_id("top-app"))).unwrap();

    assert_eq!(ports.allocate(&root.child("a")).unwrap(), 65534);
    assert_eq!(ports.allocate(&root.child("b")).unwrap(), 65535);
    let err = ports.allocate(&root.child("c")).unwrap_err();
    assert!(matches!(err, PersonaError::Config(ref msg) if msg == "port range exhausted"));

    // Recorded ports are still served.
    assert_eq!(ports.allocate(&root.child("b")).unwrap(), 65535);
    assert!(ports.store().get_as::<u16>(&root.child("c")).unwrap().is_none());
}

#[test]
fn passwords_are_generated_once() {
    let dir = tempfile::tempdir().unwrap();
    let id = Id::root("pw-app").child("db");

    let first = context("pw-app", dir.path());
    let ledger = first.passwords().clone();
    let _running = first.dispatch(Some(&build_id("pw-app"))).unwrap();
    let password = ledger.password(&id).unwrap();
    assert_eq!(password.len(), 64);
    assert!(password.chars().all(|c| c.is_ascii_hexdigit()));

    let second = context("pw-app", dir.path());
    let ledger = second.passwords().clone();
    let _running = second.dispatch(Some(&build_id("pw-app"))).unwrap();
    assert_eq!(ledger.password(&id).unwrap(), password);
}

#[test]
fn build_state_is_rejected_outside_the_build_persona() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = context("guard-app", dir.path());
    let store = ctx.declare_store(ctx.root().child("state")).unwrap();
    let worker = ctx.root().child("worker");
    ctx.define_worker(worker.clone(), |_rt| async { Ok(()) })
        .unwrap();
    let key = Id::root("guard-app").child("k");

    assert!(matches!(
        store.get(&key),
        Err(PersonaError::Epoch { expected: "build", .. })
    ));

    let _running = ctx.dispatch(Some(&worker)).unwrap();
    assert!(matches!(
        store.set(&key, &1),
        Err(PersonaError::Epoch { expected: "build", .. })
    ));
}

#[test]
fn declarations_fail_after_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context("late-app", dir.path());
    let epoch = ctx.epoch();
    assert!(epoch.assert_startup_time("declare").is_ok());
    assert!(epoch.assert_runtime("get").is_err());

    let _running = ctx.dispatch(Some(&build_id("late-app"))).unwrap();
    assert!(matches!(
        epoch.assert_startup_time("declare"),
        Err(PersonaError::Epoch { expected: "startup", .. })
    ));
    assert!(epoch.assert_runtime("get").is_ok());
}

#[tokio::test]
async fn build_run_emits_artifacts_and_routes_secrets() {
    let dir = tempfile::tempdir().unwrap();
    let app = "route-app";

    let declare = |ctx: &mut AppContext<Startup>| -> PersonaResult<_> {
        let root = ctx.root().clone();
        let api = ctx.define_server(root.child("api"), |_rt, _server| async { Ok(()) })?;
        let greeting = ctx.declare_secret(root.child("greeting"), || {
            Ok("say \"hi\" for $5".to_string())
        })?;
        let motd: Producer = Arc::new(|| Ok(b"welcome".to_vec()));
        ctx.declare_file(root.child("motd"), None, Some(motd))?;
        Ok((api, greeting))
    };

    let mut build = context(app, dir.path());
    let (api, greeting) = declare(&mut build).unwrap();
    build
        .dispatch(Some(&build_id(app)))
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(api.port().unwrap(), 5000);
    assert_eq!(greeting.get().unwrap(), "say \"hi\" for $5");

    let build_dir = dir.path();
    assert_eq!(
        std::fs::read(build_dir.join("route-app").join("motd")).unwrap(),
        b"welcome"
    );
    let env = std::fs::read_to_string(build_dir.join(".env")).unwrap();
    assert!(env.contains(&format!("{}=\"5000\"", api.port_secret().env_var())));
    let gitignore = std::fs::read_to_string(build_dir.join(".gitignore")).unwrap();
    assert!(gitignore.lines().any(|l| l == "/.env"));
    assert!(gitignore.lines().any(|l| l == "/route-app/ports.json"));

    let manifest: serde_json::Value = serde_json::from_slice(
        &std::fs::read(build_dir.join(persona_core::deploy::MANIFEST_FILE)).unwrap(),
    )
    .unwrap();
    assert_eq!(manifest["services"][api.key()]["ports"][0], 5000);
    assert_eq!(manifest["services"][api.key()]["environment"]["PERSONA"], api.key());

    // A process persona started from the same build directory reads the
    // routed values from the emitted dotenv file.
    let mut process =
        AppContext::new(AppConfig::new(app).with_build_dir(build_dir).with_persona(api.key()))
            .unwrap();
    let (api, greeting) = declare(&mut process).unwrap();
    let _running = process.dispatch(None).unwrap();
    assert_eq!(api.port().unwrap(), 5000);
    assert_eq!(api.address().unwrap(), format!("{}:5000", api.key()));
    assert_eq!(greeting.get().unwrap(), "say \"hi\" for $5");
}
