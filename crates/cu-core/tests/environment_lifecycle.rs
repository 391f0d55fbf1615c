//! Environment lifecycle against the in-memory store and engine.
//!
//! Covers create / run / persist / get / list / delete, the build atomicity
//! guarantee, persist idempotence, the parent chain, and exit-code
//! transparency.

use std::sync::Arc;
use std::time::Duration;

use cu_core::{
    CreateRequest, CuError, Environment, HandlePhase, PersistOutcome, Registry, RunRequest,
    CONFIG_PATH,
};
use cu_engine::fakes::MemoryEngine;
use cu_engine::{ContainerEngine, EngineSession, EngineError};
use cu_state::fakes::MemoryVcs;
use cu_state::{FsSnapshot, ObjectId, VcsStore, WorkingTreeStatus};

struct Fixture {
    vcs: Arc<MemoryVcs>,
    engine: MemoryEngine,
    registry: Registry,
}

fn fixture(config: Option<&str>) -> Fixture {
    let mut files = vec![("README.md", "hello\n"), ("src/main.rs", "fn main() {}\n")];
    if let Some(config) = config {
        files.push((CONFIG_PATH, config));
    }
    let vcs = Arc::new(MemoryVcs::with_files(&files));
    Fixture {
        registry: Registry::new(vcs.clone()),
        vcs,
        engine: MemoryEngine::new(),
    }
}

fn create_request(from_ref: &str) -> CreateRequest {
    CreateRequest {
        title: "t".to_string(),
        description: String::new(),
        from_ref: Some(from_ref.to_string()),
    }
}

fn env_branches(vcs: &MemoryVcs) -> Vec<String> {
    vcs.ref_names()
        .into_iter()
        .filter(|r| r.starts_with("refs/heads/container-use/"))
        .collect()
}

async fn file_at(vcs: &MemoryVcs, tree: &ObjectId, path: &str) -> Option<String> {
    vcs.read_file(tree, path)
        .await
        .unwrap()
        .map(|bytes| String::from_utf8(bytes).unwrap())
}

async fn create(fx: &Fixture, session: &dyn EngineSession) -> Environment {
    fx.registry
        .create(session, create_request("HEAD"))
        .await
        .expect("create environment")
}

#[tokio::test]
async fn setup_commands_land_in_the_first_commit() {
    let fx = fixture(Some(r#"{"setup_commands": ["echo hi > f"]}"#));
    let session = fx.engine.connect().await.unwrap();
    let head = fx.vcs.current_head().await.unwrap();

    let env = create(&fx, session.as_ref()).await;

    assert_eq!(file_at(&fx.vcs, env.head_tree(), "f").await.as_deref(), Some("hi\n"));
    assert_eq!(
        file_at(&fx.vcs, env.head_tree(), "README.md").await.as_deref(),
        Some("hello\n")
    );
    assert_eq!(env.title(), "t");
    assert_eq!(env.config().setup_commands, vec!["echo hi > f"]);

    let first = fx.vcs.commit_info(env.head_commit()).unwrap();
    assert_eq!(first.parents, vec![head.id]);
    assert_eq!(
        fx.vcs.read_ref(env.branch_ref()).await.unwrap().as_ref(),
        Some(env.head_commit())
    );
    assert_eq!(fx.engine.live_containers(), 0);
}

#[tokio::test]
async fn nonzero_exit_is_a_result_and_still_persists() {
    let fx = fixture(None);
    let session = fx.engine.connect().await.unwrap();
    let mut env = create(&fx, session.as_ref()).await;
    let before = env.head_commit().clone();

    let result = env
        .run(fx.registry.snapshots(), session.as_ref(), &RunRequest::new("exit 7"))
        .await
        .unwrap();
    assert_eq!(result.exit_code, 7);
    assert_eq!(env.phase(), HandlePhase::Executed);

    let outcome = fx.registry.persist(&mut env, None).await.unwrap();
    let PersistOutcome::Committed { commit, .. } = outcome.clone() else {
        panic!("expected a commit, got {outcome:?}");
    };
    assert_ne!(commit, before);
    assert_eq!(fx.vcs.read_ref(env.branch_ref()).await.unwrap(), Some(commit.clone()));
    assert_eq!(env.phase(), HandlePhase::Persisted);

    let message = fx.vcs.commit_info(&commit).unwrap().message;
    assert!(message.starts_with("Run `exit 7` (exit 7)\n"));
}

#[tokio::test]
async fn unknown_from_ref_creates_nothing() {
    let fx = fixture(None);
    let session = fx.engine.connect().await.unwrap();

    let err = fx
        .registry
        .create(session.as_ref(), create_request("no-such-ref"))
        .await
        .unwrap_err();
    assert!(matches!(err, CuError::ReferenceNotFound(ref r) if r == "no-such-ref"));
    assert!(env_branches(&fx.vcs).is_empty());
    assert_eq!(fx.engine.created_containers(), 0);
}

#[tokio::test]
async fn opening_a_missing_id_fails() {
    let fx = fixture(None);
    let err = fx.registry.get("missing-id").await.unwrap_err();
    assert!(matches!(err, CuError::EnvironmentNotFound(ref id) if id == "missing-id"));

    let err = fx.registry.get("Missing ID").await.unwrap_err();
    assert!(matches!(err, CuError::EnvironmentNotFound(ref id) if id == "Missing ID"));

    let err = fx.registry.delete("../escape").await.unwrap_err();
    assert!(matches!(err, CuError::EnvironmentNotFound(_)));
}

#[tokio::test]
async fn failed_build_leaves_no_branch_and_no_container() {
    let fx = fixture(Some(
        r#"{"setup_commands": ["echo ok > a"], "install_commands": ["echo broken >&2; false", "echo never > b"]}"#,
    ));
    let session = fx.engine.connect().await.unwrap();

    let err = fx
        .registry
        .create(session.as_ref(), create_request("HEAD"))
        .await
        .unwrap_err();
    match err {
        CuError::EnvironmentBuild {
            command,
            exit_code,
            stderr,
        } => {
            assert_eq!(command, "echo broken >&2; false");
            assert_eq!(exit_code, 1);
            assert_eq!(stderr, "broken\n");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(env_branches(&fx.vcs).is_empty());
    assert_eq!(fx.engine.live_containers(), 0);
    // the later install command never ran
    assert_eq!(fx.engine.exec_log().len(), 2);
}

#[tokio::test]
async fn persisting_twice_writes_one_commit() {
    let fx = fixture(None);
    let session = fx.engine.connect().await.unwrap();
    let mut env = create(&fx, session.as_ref()).await;

    env.run(
        fx.registry.snapshots(),
        session.as_ref(),
        &RunRequest::new("echo x > y"),
    )
    .await
    .unwrap();

    let commits_before = fx.vcs.commit_count();
    let first = fx.registry.persist(&mut env, None).await.unwrap();
    let second = fx.registry.persist(&mut env, None).await.unwrap();

    assert!(matches!(first, PersistOutcome::Committed { .. }));
    assert_eq!(second, PersistOutcome::Unchanged);
    assert_eq!(fx.vcs.commit_count(), commits_before + 1);
}

#[tokio::test]
async fn fresh_handle_persists_nothing() {
    let fx = fixture(None);
    let session = fx.engine.connect().await.unwrap();
    let env = create(&fx, session.as_ref()).await;

    let mut reopened = fx.registry.get(env.id().as_str()).await.unwrap();
    let commits_before = fx.vcs.commit_count();
    assert_eq!(
        fx.registry.persist(&mut reopened, Some("noop")).await.unwrap(),
        PersistOutcome::Unchanged
    );
    assert_eq!(fx.vcs.commit_count(), commits_before);
}

#[tokio::test]
async fn commits_chain_back_to_the_origin() {
    let fx = fixture(None);
    let origin = fx.vcs.current_head().await.unwrap().id;
    let session = fx.engine.connect().await.unwrap();
    let mut env = create(&fx, session.as_ref()).await;

    for n in 0..3 {
        env.run(
            fx.registry.snapshots(),
            session.as_ref(),
            &RunRequest::new(format!("echo {n} >> log.txt")),
        )
        .await
        .unwrap();
        fx.registry.persist(&mut env, None).await.unwrap();
    }

    let mut chain = Vec::new();
    let mut cursor = fx.vcs.read_ref(env.branch_ref()).await.unwrap().unwrap();
    while cursor != origin {
        let info = fx.vcs.commit_info(&cursor).unwrap();
        assert_eq!(info.parents.len(), 1);
        chain.push(cursor);
        cursor = info.parents[0].clone();
    }
    assert_eq!(chain.len(), 4);
    assert_eq!(
        file_at(&fx.vcs, env.head_tree(), "log.txt").await.as_deref(),
        Some("0\n1\n2\n")
    );
}

#[tokio::test]
async fn failing_command_side_effects_are_kept() {
    let fx = fixture(None);
    let session = fx.engine.connect().await.unwrap();
    let mut env = create(&fx, session.as_ref()).await;

    let result = env
        .run(
            fx.registry.snapshots(),
            session.as_ref(),
            &RunRequest::new("echo partial > test.log; rm README.md; exit 3"),
        )
        .await
        .unwrap();
    assert_eq!(result.exit_code, 3);

    assert_eq!(
        file_at(&fx.vcs, env.head_tree(), "test.log").await.as_deref(),
        Some("partial\n")
    );
    assert_eq!(file_at(&fx.vcs, env.head_tree(), "README.md").await, None);

    fx.registry.persist(&mut env, None).await.unwrap();
    let reopened = fx.registry.get(env.id().as_str()).await.unwrap();
    assert_eq!(reopened.head_tree(), env.head_tree());
}

#[tokio::test]
async fn reopened_environment_matches_persisted_state() {
    let fx = fixture(Some(r#"{"base_image": "alpine:3.20", "env": {"GREETING": "hi"}}"#));
    let session = fx.engine.connect().await.unwrap();
    let mut env = fx
        .registry
        .create(
            session.as_ref(),
            CreateRequest {
                title: "My env".into(),
                description: "for testing".into(),
                from_ref: None,
            },
        )
        .await
        .unwrap();

    let result = env
        .run(
            fx.registry.snapshots(),
            session.as_ref(),
            &RunRequest::new("printenv GREETING > greeting"),
        )
        .await
        .unwrap();
    assert!(result.success());
    fx.registry.persist(&mut env, Some("save greeting")).await.unwrap();

    let reopened = fx.registry.get(env.id().as_str()).await.unwrap();
    assert_eq!(reopened.title(), "My env");
    assert_eq!(reopened.description(), "for testing");
    assert_eq!(reopened.config().base_image, "alpine:3.20");
    assert_eq!(reopened.head_commit(), env.head_commit());
    assert_eq!(
        file_at(&fx.vcs, reopened.head_tree(), "greeting").await.as_deref(),
        Some("hi\n")
    );
    assert!(reopened.state().updated_at >= reopened.state().created_at);

    let message = fx.vcs.commit_info(env.head_commit()).unwrap().message;
    assert!(message.starts_with("save greeting\n\n- `printenv GREETING > greeting` (exit 0)"));
}

#[tokio::test]
async fn timeout_leaves_head_tree_alone() {
    let fx = fixture(None);
    let session = fx.engine.connect().await.unwrap();
    let mut env = create(&fx, session.as_ref()).await;
    let before = env.head_tree().clone();

    let request = RunRequest::new("echo started > s; sleep 5").with_timeout(Duration::from_millis(20));
    let err = env
        .run(fx.registry.snapshots(), session.as_ref(), &request)
        .await
        .unwrap_err();
    assert!(matches!(err, CuError::ExecutionEngine(EngineError::Timeout { .. })));
    assert_eq!(env.head_tree(), &before);
    assert!(env.pending_runs().is_empty());
    assert_eq!(fx.engine.live_containers(), 0);
    assert_eq!(
        fx.registry.persist(&mut env, None).await.unwrap(),
        PersistOutcome::Unchanged
    );
}

#[tokio::test]
async fn export_failure_is_an_engine_error() {
    let fx = fixture(None);
    let session = fx.engine.connect().await.unwrap();
    let mut env = create(&fx, session.as_ref()).await;
    let before = env.head_tree().clone();

    fx.engine.fail_exports(true);
    let err = env
        .run(fx.registry.snapshots(), session.as_ref(), &RunRequest::new("touch x"))
        .await
        .unwrap_err();
    assert!(matches!(err, CuError::ExecutionEngine(_)));
    assert_eq!(env.head_tree(), &before);
    assert_eq!(fx.engine.live_containers(), 0);
}

#[tokio::test]
async fn cancelled_run_tears_down_its_container() {
    let fx = fixture(None);
    let session = fx.engine.connect().await.unwrap();
    let mut env = create(&fx, session.as_ref()).await;
    let before = env.head_tree().clone();

    let request = RunRequest::new("sleep 5");
    let cancelled = tokio::time::timeout(
        Duration::from_millis(20),
        env.run(fx.registry.snapshots(), session.as_ref(), &request),
    )
    .await;
    assert!(cancelled.is_err());

    assert_eq!(env.phase(), HandlePhase::Running);
    assert_eq!(env.head_tree(), &before);
    assert_eq!(fx.engine.live_containers(), 0);
}

#[tokio::test]
async fn discard_drops_unpersisted_runs() {
    let fx = fixture(None);
    let session = fx.engine.connect().await.unwrap();
    let mut env = create(&fx, session.as_ref()).await;

    env.run(fx.registry.snapshots(), session.as_ref(), &RunRequest::new("touch scratch"))
        .await
        .unwrap();
    assert!(env.has_unpersisted_changes());

    env.discard();
    assert_eq!(env.phase(), HandlePhase::Discarded);
    assert_eq!(
        fx.registry.persist(&mut env, None).await.unwrap(),
        PersistOutcome::Unchanged
    );
}

#[tokio::test]
async fn entrypoint_receives_split_arguments() {
    let fx = fixture(None);
    let engine = MemoryEngine::new().with_entrypoint("ubuntu:24.04", &["sh", "-c"]);
    let session = engine.connect().await.unwrap();
    let mut env = fx
        .registry
        .create(session.as_ref(), create_request("HEAD"))
        .await
        .unwrap();

    let request = RunRequest::new("'echo via entrypoint > out'").with_entrypoint(true);
    let result = env
        .run(fx.registry.snapshots(), session.as_ref(), &request)
        .await
        .unwrap();
    assert_eq!(result.exit_code, 0);
    assert_eq!(
        file_at(&fx.vcs, env.head_tree(), "out").await.as_deref(),
        Some("via entrypoint\n")
    );
    let last = engine.exec_log().pop().unwrap();
    assert_eq!(last.argv, vec!["sh", "-c", "echo via entrypoint > out"]);
}

#[tokio::test]
async fn list_and_delete() {
    let fx = fixture(None);
    let session = fx.engine.connect().await.unwrap();
    let a = create(&fx, session.as_ref()).await;
    let b = create(&fx, session.as_ref()).await;
    assert_ne!(a.id(), b.id());

    let listed = fx.registry.list().await.unwrap();
    let mut expected = vec![a.id().clone(), b.id().clone()];
    expected.sort();
    assert_eq!(
        listed.iter().map(|s| s.id.clone()).collect::<Vec<_>>(),
        expected
    );

    fx.registry.delete(a.id().as_str()).await.unwrap();
    assert!(matches!(
        fx.registry.get(a.id().as_str()).await,
        Err(CuError::EnvironmentNotFound(_))
    ));
    assert!(matches!(
        fx.registry.delete(a.id().as_str()).await,
        Err(CuError::EnvironmentNotFound(_))
    ));
    assert!(fx.vcs.ref_names().contains(&a.id().retired_ref()));

    let listed = fx.registry.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(&listed[0].id, b.id());
}

#[tokio::test]
async fn stale_handle_cannot_persist_after_delete() {
    let fx = fixture(None);
    let session = fx.engine.connect().await.unwrap();
    let mut env = create(&fx, session.as_ref()).await;

    env.run(fx.registry.snapshots(), session.as_ref(), &RunRequest::new("touch late"))
        .await
        .unwrap();
    fx.registry.delete(env.id().as_str()).await.unwrap();

    let err = fx.registry.persist(&mut env, None).await.unwrap_err();
    assert!(matches!(err, CuError::ConcurrentModification { .. }));
    assert!(env_branches(&fx.vcs).is_empty());
}

#[tokio::test]
async fn branch_without_state_is_corrupt() {
    let fx = fixture(None);
    let mut snapshot = FsSnapshot::new();
    snapshot.insert_file("x", "y").unwrap();
    fx.vcs
        .commit_snapshot("refs/heads/container-use/hand-made", &snapshot, "manual commit")
        .unwrap();

    let err = fx.registry.get("hand-made").await.unwrap_err();
    assert!(matches!(err, CuError::CorruptState { .. }));
    assert!(fx.registry.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn dirty_worktree_is_reported() {
    let fx = fixture(None);
    assert_eq!(fx.registry.is_dirty().await.unwrap(), (false, String::new()));

    fx.vcs.set_working_tree_status(WorkingTreeStatus {
        dirty: true,
        status_text: " M README.md\n".into(),
    });
    let (dirty, text) = fx.registry.is_dirty().await.unwrap();
    assert!(dirty);
    assert!(text.contains("README.md"));
}

#[tokio::test]
async fn unreachable_engine_has_a_remediation() {
    let engine = MemoryEngine::new().unreachable();
    let err: CuError = engine.connect().await.err().unwrap().into();
    assert!(matches!(err, CuError::DaemonUnreachable(_)));
    assert!(err.remediation().unwrap().contains("start the container engine"));
}

#[tokio::test]
async fn missing_base_image_is_an_engine_error() {
    let fx = fixture(Some(r#"{"base_image": "does-not-exist:1"}"#));
    let engine = MemoryEngine::new().with_missing_image("does-not-exist:1");
    let session = engine.connect().await.unwrap();

    let err = fx
        .registry
        .create(session.as_ref(), create_request("HEAD"))
        .await
        .unwrap_err();
    assert!(matches!(err, CuError::ExecutionEngine(EngineError::ImagePull { .. })));
    assert!(env_branches(&fx.vcs).is_empty());
}

#[tokio::test]
async fn invalid_config_is_rejected_before_building() {
    let fx = fixture(Some(r#"{"setup": ["typo"]}"#));
    let session = fx.engine.connect().await.unwrap();

    let err = fx
        .registry
        .create(session.as_ref(), create_request("HEAD"))
        .await
        .unwrap_err();
    assert!(matches!(err, CuError::InvalidConfig(_)));
    assert_eq!(fx.engine.created_containers(), 0);
}
