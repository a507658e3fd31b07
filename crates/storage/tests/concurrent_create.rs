use std::collections::HashSet;

use chrono::Utc;
use shared::domain::ConversationId;
use storage::{CreateConversationOutcome, ParticipantSet, Storage};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creators_of_one_set_leave_a_single_conversation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let database_url = format!(
        "sqlite://{}",
        dir.path()
            .join("race.db")
            .to_string_lossy()
            .replace('\\', "/")
    );
    let storage = Storage::new(&database_url).await.expect("db");
    let alice = storage.create_user("alice").await.expect("alice");
    let bob = storage.create_user("bob").await.expect("bob");

    let mut tasks = Vec::new();
    for i in 0..8 {
        let storage = storage.clone();
        let set = if i % 2 == 0 {
            ParticipantSet::new(alice, [bob])
        } else {
            ParticipantSet::new(bob, [alice])
        };
        tasks.push(tokio::spawn(async move {
            storage.create_conversation(&set, Utc::now()).await
        }));
    }

    let mut created = Vec::new();
    for task in tasks {
        match task.await.expect("join").expect("create") {
            CreateConversationOutcome::Created(id) => created.push(id),
            CreateConversationOutcome::Conflict => {}
        }
    }
    assert_eq!(created.len(), 1, "exactly one creator wins");

    let key = ParticipantSet::new(alice, [bob]).key();
    let found: HashSet<ConversationId> = storage
        .find_conversation_by_key(&key)
        .await
        .expect("find")
        .into_iter()
        .collect();
    assert_eq!(found, created.into_iter().collect());
}
