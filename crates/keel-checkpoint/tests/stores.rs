//! Behaviour shared by every in-process store, driven through the trait.

use std::sync::Arc;
use std::time::Duration;

use keel_checkpoint::{
    Checkpointer, DistributedCheckpointer, DistributedConfig, MemoryCheckpointer, ReplicationMode,
    State,
};
use serde_json::json;

fn session(turn: u64) -> State {
    let mut state = State::new();
    state.insert("turn".into(), json!(turn));
    state.insert("messages".into(), json!([{ "role": "user", "text": "hello" }]));
    state.insert("meta".into(), json!({ "locale": "en", "tags": ["a", "b"] }));
    state
}

fn stores() -> Vec<(&'static str, Arc<dyn Checkpointer>)> {
    let distributed = |mode| {
        let primary: Arc<dyn Checkpointer> = Arc::new(MemoryCheckpointer::new());
        let secondary: Arc<dyn Checkpointer> = Arc::new(MemoryCheckpointer::new());
        DistributedCheckpointer::new(
            primary,
            Some(secondary),
            DistributedConfig {
                replication_mode: mode,
                health_check_interval: Duration::from_secs(3600),
                ..DistributedConfig::default()
            },
        )
        .unwrap()
    };
    let memory: Arc<dyn Checkpointer> = Arc::new(MemoryCheckpointer::new());
    let sync: Arc<dyn Checkpointer> = Arc::new(distributed(ReplicationMode::Sync));
    let asynchronous: Arc<dyn Checkpointer> = Arc::new(distributed(ReplicationMode::Async));
    vec![
        ("memory", memory),
        ("distributed-sync", sync),
        ("distributed-async", asynchronous),
    ]
}

#[tokio::test]
async fn test_load_returns_what_was_saved() {
    for (name, store) in stores() {
        for turn in 0..3 {
            store.save("thread", &session(turn)).await.unwrap();
            assert_eq!(store.load("thread").await.unwrap(), session(turn), "{name}");
        }
        store.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_list_and_delete() {
    for (name, store) in stores() {
        store.save("a", &session(1)).await.unwrap();
        store.save("b", &session(2)).await.unwrap();

        let mut threads: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|info| info.thread_id)
            .collect();
        threads.sort();
        assert_eq!(threads, ["a", "b"], "{name}");

        store.delete("a").await.unwrap();
        assert!(!store.exists("a").await.unwrap(), "{name}");
        assert!(store.exists("b").await.unwrap(), "{name}");
        store.ping().await.unwrap();
        store.close().await.unwrap();
    }
}
