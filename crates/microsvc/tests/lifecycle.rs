mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::*;
use microsvc::{
    EventPayload, HostConfig, RawNode, RawValue, ScriptValue, ServiceError, ServiceHost,
    ServiceState,
};
use tempfile::TempDir;

fn engine() -> Arc<ProgramEngine> {
    let engine = ProgramEngine::new();
    engine.register("quick", |ctx| async move {
        ctx.emit("ready", EventPayload::Null);
        ctx.exit(0);
    });
    engine.register("exit-code", |ctx| async move {
        ctx.exit(42);
    });
    engine.register("idle", |mut ctx| async move {
        while ctx.next_event().await.is_some() {}
    });
    engine.register("fault", |ctx| async move {
        ctx.fault("TypeError: x is not a function");
    });
    engine.register("cyclic", |mut ctx| async move {
        ctx.emit_raw(
            "bad",
            ScriptValue {
                root: RawValue::Ref(0),
                heap: vec![RawNode::Array(vec![RawValue::Ref(0)])],
            },
        );
        ctx.emit("good", 1);
        while ctx.next_event().await.is_some() {}
    });
    engine
}

#[tokio::test]
async fn test_local_start_reports_start_and_no_error() {
    let temp = TempDir::new().unwrap();
    let host = host(&temp, engine());
    let uri = bundle(&temp, "quick.js", "quick");

    let (svc, mut rx) = observe(host.service(&uri));
    assert_eq!(svc.state(), ServiceState::Created);
    svc.start().unwrap();

    assert!(matches!(next(&mut rx).await, Outcome::Started));
    assert!(matches!(next(&mut rx).await, Outcome::Exit(0)));
    assert_quiet(&mut rx).await;
    assert_eq!(svc.state(), ServiceState::Exited);
    assert_eq!(svc.exit_code(), Some(0));
}

#[tokio::test]
async fn test_local_file_uri() {
    let temp = TempDir::new().unwrap();
    let host = host(&temp, engine());
    let path = temp.path().join("exit.js");
    std::fs::write(&path, "exit-code").unwrap();

    let (svc, mut rx) = observe(host.service(&file_uri(&path)));
    svc.start().unwrap();
    assert!(matches!(terminal(&mut rx).await, Outcome::Exit(42)));
    assert_eq!(svc.exit_code(), Some(42));
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let temp = TempDir::new().unwrap();
    let host = host(&temp, engine());
    let uri = bundle(&temp, "quick.js", "quick");

    let (svc, mut rx) = observe(host.service(&uri));
    svc.start().unwrap();
    assert!(matches!(svc.start(), Err(ServiceError::AlreadyStarted(_))));
    assert!(matches!(terminal(&mut rx).await, Outcome::Exit(0)));
    assert!(matches!(svc.start(), Err(ServiceError::AlreadyStarted(_))));
}

#[test]
fn test_start_outside_runtime_fails_synchronously() {
    let temp = TempDir::new().unwrap();
    let host = ServiceHost::new(config(&temp), engine()).unwrap();
    let svc = host.service("bundle:quick.js").build();

    assert!(matches!(svc.start(), Err(ServiceError::NoRuntime)));
    assert_eq!(svc.state(), ServiceState::Created);
}

#[tokio::test]
async fn test_missing_file_is_resolution_error_without_exit() {
    let temp = TempDir::new().unwrap();
    let host = host(&temp, engine());

    let (svc, mut rx) = observe(host.service("bundle:missing.js"));
    svc.start().unwrap();

    assert!(matches!(next(&mut rx).await, Outcome::Error(ServiceError::Resolution(_))));
    assert_quiet(&mut rx).await;
    assert_eq!(svc.state(), ServiceState::Error);
    assert_eq!(svc.exit_code(), None);
}

#[tokio::test]
async fn test_invalid_uri_is_reported_through_on_error() {
    let temp = TempDir::new().unwrap();
    let host = host(&temp, engine());

    let (svc, mut rx) = observe(host.service("gopher://example.com/a.js"));
    assert!(svc.identity().is_none());
    svc.start().unwrap();

    assert!(matches!(next(&mut rx).await, Outcome::Error(ServiceError::Resolution(_))));
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_compile_failure_is_terminal() {
    let temp = TempDir::new().unwrap();
    let engine = engine();
    let host = host(&temp, engine.clone());
    let uri = bundle(&temp, "broken.js", "this is not a program");

    let (svc, mut rx) = observe(host.service(&uri));
    svc.start().unwrap();

    match next(&mut rx).await {
        Outcome::Error(ServiceError::Compile(e)) => assert!(e.0.contains("SyntaxError")),
        other => panic!("expected compile error, got {:?}", other),
    }
    assert_quiet(&mut rx).await;
    assert_eq!(svc.state(), ServiceState::Error);
    assert_eq!(engine.compiled(), 0);
}

#[tokio::test]
async fn test_runtime_fault_is_error_only_with_latched_code() {
    let temp = TempDir::new().unwrap();
    let host = host(&temp, engine());
    let uri = bundle(&temp, "fault.js", "fault");

    let (svc, mut rx) = observe(host.service(&uri));
    svc.start().unwrap();

    match terminal(&mut rx).await {
        Outcome::Error(ServiceError::RuntimeFault(description)) => {
            assert!(description.contains("TypeError"))
        }
        other => panic!("expected runtime fault, got {:?}", other),
    }
    assert_quiet(&mut rx).await;
    assert_eq!(svc.state(), ServiceState::Error);
    assert_eq!(svc.exit_code(), Some(1));
}

#[tokio::test]
async fn test_process_exit_latches_first_code() {
    let temp = TempDir::new().unwrap();
    let host = host(&temp, engine());
    let uri = bundle(&temp, "idle.js", "idle");

    let (svc, mut rx) = observe(host.service(&uri));
    assert!(!svc.process().exit(9), "exit before start is a no-op");
    svc.start().unwrap();
    assert!(matches!(next(&mut rx).await, Outcome::Started));
    wait_state(&svc, ServiceState::Running).await;

    assert!(svc.process().exit(3));
    assert!(!svc.process().exit(4));

    assert!(matches!(next(&mut rx).await, Outcome::Exit(3)));
    assert_quiet(&mut rx).await;
    assert_eq!(svc.exit_code(), Some(3));
    assert!(!svc.process().exit(5), "exit after termination is a no-op");
}

#[tokio::test]
async fn test_unreleased_synchronizer_times_out() {
    let temp = TempDir::new().unwrap();
    let config: HostConfig = config(&temp).with_start_timeout(Duration::from_millis(200));
    let host = ServiceHost::new(config, engine()).unwrap();
    let uri = bundle(&temp, "idle.js", "idle");

    let held = Arc::new(parking_lot::Mutex::new(None));
    let keep = held.clone();
    let (svc, mut rx) = observe_end(host.service(&uri).on_start(move |_, sync| {
        // Hold the synchronizer without ever releasing it
        *keep.lock() = Some(sync);
    }));
    svc.start().unwrap();

    match next(&mut rx).await {
        Outcome::Error(ServiceError::StartTimedOut(timeout)) => {
            assert_eq!(timeout, Duration::from_millis(200))
        }
        other => panic!("expected start timeout, got {:?}", other),
    }
    assert_eq!(svc.state(), ServiceState::Error);
    assert!(held.lock().is_some());
}

#[tokio::test]
async fn test_dropped_synchronizer_abandons_start() {
    let temp = TempDir::new().unwrap();
    let host = host(&temp, engine());
    let uri = bundle(&temp, "idle.js", "idle");

    let (svc, mut rx) = observe_end(host.service(&uri).on_start(|_, sync| drop(sync)));
    svc.start().unwrap();

    assert!(matches!(next(&mut rx).await, Outcome::Error(ServiceError::StartAbandoned)));
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_multiple_callbacks_run_in_registration_order() {
    let temp = TempDir::new().unwrap();
    let host = host(&temp, engine());
    let uri = bundle(&temp, "quick.js", "quick");

    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let (o1, o2, o3, o4) = (order.clone(), order.clone(), order.clone(), order.clone());
    let (done_tx, mut done) = tokio::sync::mpsc::unbounded_channel();

    let svc = host
        .service(&uri)
        .on_start(move |_, _sync| o1.lock().push("start-1"))
        .on_start(move |_, sync| {
            o2.lock().push("start-2");
            sync.release();
        })
        .on_exit(move |_, _| o3.lock().push("exit-1"))
        .on_exit(move |_, code| {
            o4.lock().push("exit-2");
            let _ = done_tx.send(code);
        })
        .build();
    svc.start().unwrap();

    assert_eq!(next(&mut done).await, 0);
    assert_eq!(*order.lock(), vec!["start-1", "start-2", "exit-1", "exit-2"]);
}

#[tokio::test]
async fn test_listener_after_termination_is_never_invoked() {
    let temp = TempDir::new().unwrap();
    let host = host(&temp, engine());
    let uri = bundle(&temp, "quick.js", "quick");

    let (svc, mut rx) = observe(host.service(&uri));
    svc.start().unwrap();
    assert!(matches!(terminal(&mut rx).await, Outcome::Exit(0)));

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    svc.add_event_listener("ready", move |_, _, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert!(svc.emit_null("anything").is_err());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cyclic_emit_is_dropped_and_service_keeps_running() {
    let temp = TempDir::new().unwrap();
    let host = host(&temp, engine());
    let uri = bundle(&temp, "cyclic.js", "cyclic");

    let (events_tx, mut events) = tokio::sync::mpsc::unbounded_channel();
    let (bad_tx, good_tx) = (events_tx.clone(), events_tx);
    let (svc, mut rx) = observe_end(host.service(&uri).on_start(move |svc, sync| {
        let bad_tx = bad_tx.clone();
        let good_tx = good_tx.clone();
        svc.add_event_listener("bad", move |_, event, _| {
            let _ = bad_tx.send(event.to_string());
        });
        svc.add_event_listener("good", move |_, event, _| {
            let _ = good_tx.send(event.to_string());
        });
        sync.release();
    }));
    svc.start().unwrap();

    assert_eq!(next(&mut events).await, "good");
    assert_eq!(svc.state(), ServiceState::Running);
    assert!(svc.process().exit(0));
    assert!(matches!(next(&mut rx).await, Outcome::Exit(0)));
    assert_quiet(&mut events).await;
}

#[tokio::test]
async fn test_running_lists_live_instances() {
    let temp = TempDir::new().unwrap();
    let host = host(&temp, engine());
    let uri = bundle(&temp, "idle.js", "idle");

    let (a, mut rx_a) = observe(host.service(&uri));
    let (b, mut rx_b) = observe(host.service(&uri));
    assert_ne!(a.id(), b.id());
    a.start().unwrap();
    b.start().unwrap();
    wait_state(&a, ServiceState::Running).await;
    wait_state(&b, ServiceState::Running).await;
    assert_eq!(host.running().len(), 2);

    a.process().exit(0);
    assert!(matches!(terminal(&mut rx_a).await, Outcome::Exit(0)));
    tokio::time::sleep(Duration::from_millis(20)).await;
    let running = host.running();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].id(), b.id());

    b.process().exit(0);
    assert!(matches!(terminal(&mut rx_b).await, Outcome::Exit(0)));
}
