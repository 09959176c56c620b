//! Integration tests for container updates: clone, fork and check-only.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bollard::models::HealthStatusEnum;
use tedge_container_agent::engine::{MockContainer, MockEngine, LABEL_FORK, LABEL_FORKED_NAME};
use tedge_container_agent::orchestrator::{
    CloneSpec, PullPolicy, Timings, UpdatePhase,
};
use tedge_container_agent::{AgentError, Orchestrator, UpdateOutcome, UpdateRequest};

fn timings() -> Timings {
    Timings {
        poll_interval: Duration::from_millis(10),
        fork_healthy_after: Duration::from_secs(1),
        running_polls: 3,
    }
}

fn fast_pulls() -> PullPolicy {
    PullPolicy {
        always_pull: false,
        attempts: 2,
        wait: Duration::from_millis(1),
    }
}

/// Orchestrator that believes it runs on the host.
fn on_host(engine: &Arc<MockEngine>) -> Orchestrator {
    Orchestrator::new(engine.clone())
        .with_timings(timings())
        .with_pull_policy(fast_pulls())
        .with_hostname("host")
        .with_container_markers(vec![PathBuf::from("/nonexistent/.dockerenv")])
}

fn request(container: &str, image: &str) -> UpdateRequest {
    UpdateRequest {
        container: Some(container.to_string()),
        spec: CloneSpec {
            image: Some(image.to_string()),
            healthy_after: Duration::from_secs(1),
            ..CloneSpec::default()
        },
        ..UpdateRequest::default()
    }
}

fn engine_with_app() -> Arc<MockEngine> {
    let engine = Arc::new(MockEngine::new());
    engine.add_container(
        MockContainer::new("app01", "app", "app:1.0")
            .running()
            .image_id("sha256:old")
            .label("tier", "web")
            .env("MODE=prod")
            .hostname("edge"),
    );
    engine
}

#[tokio::test]
async fn test_clone_replaces_container() {
    let engine = engine_with_app();
    let mut orchestrator = on_host(&engine);

    let outcome = orchestrator.update(&request("app", "app:2.0")).await.unwrap();
    let UpdateOutcome::Updated { container_id } = outcome else {
        panic!("unexpected outcome: {outcome:?}");
    };
    assert_eq!(orchestrator.phase(), UpdatePhase::Done);

    // only the clone is left, under the original name
    let containers = engine.containers();
    assert_eq!(containers.len(), 1);
    let clone = engine.container("app").unwrap();
    assert_eq!(clone.id, container_id);
    assert_eq!(clone.image, "app:2.0");
    assert!(clone.running);
    assert_eq!(clone.labels.get("tier").map(String::as_str), Some("web"));
    assert!(clone.env.contains(&"MODE=prod".to_string()));

    let calls = engine.calls();
    assert!(calls.contains(&"pull:app:2.0".to_string()));
    let stop = calls.iter().position(|c| c == "stop:app01").unwrap();
    let rename = calls
        .iter()
        .position(|c| c.starts_with("rename:app01:app-bak-"))
        .unwrap();
    let create = calls.iter().position(|c| c == "create:app").unwrap();
    assert!(stop < rename && rename < create);
    assert!(calls.contains(&"remove:app01".to_string()));
}

#[tokio::test]
async fn test_clone_keeps_both_containers_when_unhealthy() {
    let engine = engine_with_app();
    engine.fail_starts();
    let mut orchestrator = on_host(&engine);

    let mut req = request("app", "app:2.0");
    req.spec.healthy_after = Duration::from_millis(100);
    let err = orchestrator.update(&req).await.unwrap_err();

    assert!(matches!(err, AgentError::Timeout { .. }), "got {err:?}");
    assert_eq!(orchestrator.phase(), UpdatePhase::Failed);

    // no rollback: the renamed original and the clone are both left behind
    let names: Vec<String> = engine.containers().into_iter().map(|c| c.name).collect();
    assert_eq!(names.len(), 2);
    assert!(names.iter().any(|n| n.starts_with("app-bak-")));
    assert!(names.contains(&"app".to_string()));
    assert!(engine.calls().iter().any(|c| c.starts_with("logs:created")));
}

#[tokio::test]
async fn test_health_wait_survives_inspect_error() {
    let engine = engine_with_app();
    // the clone is the first container the mock creates
    engine.fail_inspects("created0001", 1);
    let mut orchestrator = on_host(&engine);

    let outcome = orchestrator.update(&request("app", "app:2.0")).await.unwrap();
    assert_eq!(
        outcome,
        UpdateOutcome::Updated {
            container_id: "created0001".to_string()
        }
    );
    assert_eq!(engine.containers().len(), 1);
}

#[tokio::test]
async fn test_unhealthy_clone_fails_before_deadline() {
    let engine = engine_with_app();
    engine.set_created_health(HealthStatusEnum::UNHEALTHY);
    let mut orchestrator = on_host(&engine);

    let mut req = request("app", "app:2.0");
    req.spec.healthy_after = Duration::from_secs(30);
    let started = std::time::Instant::now();
    let err = orchestrator.update(&req).await.unwrap_err();

    assert!(matches!(err, AgentError::Unhealthy(ref id) if id == "created0001"), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(orchestrator.phase(), UpdatePhase::Failed);
}

#[tokio::test]
async fn test_healthy_clone_replaces_container() {
    let engine = engine_with_app();
    engine.set_created_health(HealthStatusEnum::HEALTHY);
    let mut orchestrator = on_host(&engine);

    let outcome = orchestrator.update(&request("app", "app:2.0")).await.unwrap();
    assert!(matches!(outcome, UpdateOutcome::Updated { .. }));
}

#[tokio::test]
async fn test_clone_waits_for_exit() {
    let engine = engine_with_app();
    let mut orchestrator = on_host(&engine);

    let mut req = request("app", "app:2.0");
    req.spec.wait_for_exit = true;
    req.spec.stop_timeout = Duration::from_secs(1);

    let stopper = {
        let engine = engine.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            engine.set_running("app01", false);
        })
    };

    let outcome = orchestrator.update(&req).await.unwrap();
    stopper.await.unwrap();
    assert!(matches!(outcome, UpdateOutcome::Updated { .. }));

    let calls = engine.calls();
    let disable = calls.iter().position(|c| c == "disable_restart:app01").unwrap();
    let rename = calls
        .iter()
        .position(|c| c.starts_with("rename:app01:"))
        .unwrap();
    assert!(disable < rename);
    // the original exits on its own and is not stopped before the rename
    assert!(!calls[..rename].contains(&"stop:app01".to_string()));
}

#[tokio::test]
async fn test_wait_for_exit_times_out() {
    let engine = engine_with_app();
    let mut orchestrator = on_host(&engine);

    let mut req = request("app", "app:2.0");
    req.spec.wait_for_exit = true;
    req.spec.stop_timeout = Duration::from_millis(50);

    let err = orchestrator.update(&req).await.unwrap_err();
    assert!(matches!(err, AgentError::Timeout { .. }), "got {err:?}");
    assert_eq!(engine.container("app").unwrap().id, "app01");
    assert!(!engine.calls().iter().any(|c| c.starts_with("create:")));
}

#[tokio::test]
async fn test_check_only() {
    let engine = engine_with_app();
    engine.add_image("app:1.0", "sha256:old");
    let mut orchestrator = on_host(&engine);

    let mut req = request("app", "app:1.0");
    req.check_only = true;
    assert_eq!(orchestrator.update(&req).await.unwrap(), UpdateOutcome::NotNeeded);

    req.force = true;
    assert_eq!(orchestrator.update(&req).await.unwrap(), UpdateOutcome::UpdateNeeded);

    let mut req = request("app", "app:3.0");
    req.check_only = true;
    assert_eq!(orchestrator.update(&req).await.unwrap(), UpdateOutcome::UpdateNeeded);

    // nothing was touched
    let calls = engine.calls();
    assert!(!calls.iter().any(|c| c.starts_with("create:") || c.starts_with("stop:")));
    assert_eq!(engine.container("app").unwrap().id, "app01");
}

#[tokio::test]
async fn test_pull_retries() {
    let engine = engine_with_app();
    engine.fail_pulls(1);
    let mut orchestrator = on_host(&engine);

    let mut req = request("app", "app:2.0");
    req.check_only = true;
    assert_eq!(orchestrator.update(&req).await.unwrap(), UpdateOutcome::UpdateNeeded);

    let pulls = engine.calls().iter().filter(|c| *c == "pull:app:2.0").count();
    assert_eq!(pulls, 2);
}

#[tokio::test]
async fn test_pull_gives_up() {
    let engine = engine_with_app();
    engine.fail_pulls(5);
    let mut orchestrator = on_host(&engine);

    let err = orchestrator.update(&request("app", "app:2.0")).await.unwrap_err();
    match err {
        AgentError::PullFailed { image, attempts, .. } => {
            assert_eq!(image, "app:2.0");
            assert_eq!(attempts, 2);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(orchestrator.phase(), UpdatePhase::Failed);
    assert!(engine.container("app").unwrap().running);
}

#[tokio::test]
async fn test_self_update_forks_helper() {
    let marker = tempfile::NamedTempFile::new().unwrap();
    let engine = engine_with_app();
    let mut orchestrator = Orchestrator::new(engine.clone())
        .with_timings(timings())
        .with_pull_policy(fast_pulls())
        .with_hostname("edge")
        .with_container_markers(vec![marker.path().to_path_buf()]);

    let req = UpdateRequest {
        container: None,
        spec: CloneSpec {
            image: Some("app:2.0".to_string()),
            ..CloneSpec::default()
        },
        ..UpdateRequest::default()
    };
    let outcome = orchestrator.update(&req).await.unwrap();
    let UpdateOutcome::Forked { helper_id } = outcome else {
        panic!("unexpected outcome: {outcome:?}");
    };

    let helper = engine.container("app-updater").unwrap();
    assert_eq!(helper.id, helper_id);
    assert!(helper.running);
    assert_eq!(helper.labels.get(LABEL_FORK).map(String::as_str), Some("1"));
    assert_eq!(helper.labels.get(LABEL_FORKED_NAME).map(String::as_str), Some("app"));

    let entrypoint = helper
        .created_from
        .as_ref()
        .and_then(|c| c.entrypoint.clone())
        .unwrap();
    let command = entrypoint.join(" ");
    assert!(command.contains("tedge-container tools container-clone --container app01 --image app:2.0"));

    // the original is left to the helper
    let original = engine.container("app").unwrap();
    assert_eq!(original.id, "app01");
    assert!(original.running);
}

#[tokio::test]
async fn test_fork_outside_container() {
    let engine = engine_with_app();
    let mut orchestrator = on_host(&engine);

    let mut req = request("app", "app:2.0");
    req.fork = true;
    let err = orchestrator.update(&req).await.unwrap_err();
    assert!(matches!(err, AgentError::ForkOutsideContainer), "got {err:?}");
    assert!(engine.container("app-updater").is_none());
}
