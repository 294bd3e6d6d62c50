//! 运行时隔离集成测试：按 (user_id, conversation_id) 划分工作区与端口

use std::sync::Arc;

use uuid::Uuid;

use hive::runtime::{
    BackendFactory, RuntimeAction, RuntimeFactory, RuntimeKind, RuntimeSession, RuntimeSettings,
    SessionSpec,
};

fn factory(root: &std::path::Path) -> BackendFactory {
    BackendFactory::new(RuntimeSettings {
        workspace_root: root.to_path_buf(),
        ..RuntimeSettings::default()
    })
    .unwrap()
}

fn session(factory: &BackendFactory, user: &str, conv: &str) -> Box<dyn RuntimeSession> {
    factory
        .create(RuntimeKind::Local, SessionSpec::new(user, conv))
        .unwrap()
}

#[tokio::test]
async fn test_two_users_same_conversation_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(dir.path());
    let alice = session(&factory, "alice", "conv-1");
    let bob = session(&factory, "bob", "conv-1");

    let alice_info = alice.connect().await.unwrap();
    let bob_info = bob.connect().await.unwrap();
    assert_ne!(alice_info.workspace, bob_info.workspace);

    let (pa, pb) = (alice_info.ports.unwrap(), bob_info.ports.unwrap());
    assert_ne!(pa.slot, pb.slot);
    for a in pa.ranges() {
        for b in pb.ranges() {
            assert!(!a.overlaps(&b));
        }
    }

    alice.write_file("notes.txt", b"alice only").await.unwrap();
    assert!(bob.read_file("notes.txt").await.is_err());

    alice.release().await.unwrap();
    assert_eq!(factory.ports().in_use(), 1);
    let obs = bob
        .do_action(&RuntimeAction::run(Uuid::new_v4(), "echo still here", None))
        .await
        .unwrap();
    assert!(obs.is_success());
    bob.release().await.unwrap();
    assert_eq!(factory.ports().in_use(), 0);
}

#[tokio::test]
async fn test_superseded_run_does_not_free_live_slot() {
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(dir.path());
    let old_run = session(&factory, "u1", "c1");
    let new_run = session(&factory, "u1", "c1");

    let old_slot = old_run.connect().await.unwrap().ports.unwrap().slot;
    let new_slot = new_run.connect().await.unwrap().ports.unwrap().slot;
    assert_eq!(old_slot, new_slot);

    // 旧运行迟到的释放不能把新运行的端口交给别人
    old_run.release().await.unwrap();
    assert_eq!(factory.ports().in_use(), 1);
    let other = session(&factory, "u2", "c1");
    let other_slot = other.connect().await.unwrap().ports.unwrap().slot;
    assert_ne!(other_slot, new_slot);

    new_run.release().await.unwrap();
    other.release().await.unwrap();
    assert_eq!(factory.ports().in_use(), 0);
}

#[tokio::test]
async fn test_lookalike_ids_map_to_distinct_sessions() {
    let pairs = [
        (("u", "a/b"), ("u", "a_b")),
        (("Alice", "c"), ("alice", "c")),
        (("a/b", "c"), ("a", "b/c")),
    ];
    for ((u1, c1), (u2, c2)) in pairs {
        let a = SessionSpec::new(u1, c1);
        let b = SessionSpec::new(u2, c2);
        assert_ne!(a.key(), b.key(), "{:?} vs {:?}", a, b);
        assert_ne!(a.workspace_rel(), b.workspace_rel());
        assert_ne!(a.slug(), b.slug());
    }
}
