#![cfg(feature = "inmem-store")]

use chrono::Utc;
use convo::error::Resource;
use convo::models::*;
use convo::repo::{inmem::InMemRepo, RepoError};
// Bring trait method namespaces into scope so calls on InMemRepo resolve.
use convo::repo::{ChangeFeed, MessageRepo, ParticipantRepo, ReadStateRepo, ThreadRepo};

fn new_thread(intervention_id: Id, thread_type: ThreadType, created_by: Id, participants: Vec<Id>) -> NewThread {
    NewThread {
        intervention_id,
        team_id: 10,
        thread_type,
        title: thread_type.default_title().into(),
        created_by,
        participants,
    }
}

fn text(thread_id: Id, author_id: Id, content: &str) -> NewMessage {
    NewMessage { thread_id, author_id, content: content.into(), attachments: vec![], metadata: None }
}

fn page(page: u32, limit: u32, direction: PageDirection) -> Page {
    Page { page, limit, direction }
}

#[tokio::test]
async fn thread_type_is_unique_per_intervention() {
    let r = InMemRepo::new();
    let t = r.create_thread(new_thread(1, ThreadType::Group, 5, vec![])).await.unwrap();
    assert_eq!(t.message_count, 0);
    assert!(t.last_message_at.is_none());

    let err = r.create_thread(new_thread(1, ThreadType::Group, 6, vec![])).await.unwrap_err();
    assert!(matches!(err, RepoError::Conflict(_)));
    r.create_thread(new_thread(2, ThreadType::Group, 6, vec![])).await.unwrap();
    assert_eq!(r.list_threads_by_intervention(1).await.unwrap().len(), 1);

    let err = r.get_thread(404).await.unwrap_err();
    assert_eq!(err, RepoError::not_found(Resource::Thread, 404));
}

#[tokio::test]
async fn creator_is_always_seeded_once() {
    let r = InMemRepo::new();
    let t = r.create_thread(new_thread(1, ThreadType::TenantToManagers, 5, vec![5, 7, 7, 8])).await.unwrap();
    let mut ids: Vec<Id> = r.list_participants(t.id).await.unwrap().into_iter().map(|p| p.user_id).collect();
    ids.sort();
    assert_eq!(ids, vec![5, 7, 8]);

    let mine: Vec<Id> = r.list_threads_for_participant(7).await.unwrap().into_iter().map(|t| t.id).collect();
    assert_eq!(mine, vec![t.id]);
    assert!(r.list_threads_for_participant(99).await.unwrap().is_empty());
}

#[tokio::test]
async fn last_participant_cannot_be_removed() {
    let r = InMemRepo::new();
    let t = r.create_thread(new_thread(1, ThreadType::Group, 5, vec![6])).await.unwrap();

    let again = r.add_participant(t.id, 6).await.unwrap();
    assert_eq!(r.list_participants(t.id).await.unwrap().len(), 2);
    assert_eq!(again.user_id, 6);

    r.remove_participant(t.id, 6).await.unwrap();
    let err = r.remove_participant(t.id, 5).await.unwrap_err();
    assert!(matches!(err, RepoError::Conflict(_)));
    let err = r.remove_participant(t.id, 6).await.unwrap_err();
    assert_eq!(err, RepoError::not_found(Resource::Participant, 6));
    assert_eq!(r.list_participants(t.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn messages_are_validated_and_paged() {
    let r = InMemRepo::new();
    let t = r.create_thread(new_thread(1, ThreadType::Group, 5, vec![])).await.unwrap();

    let err = r.create_message(text(t.id, 5, "  ")).await.unwrap_err();
    assert!(matches!(err, RepoError::Validation(_)));
    let err = r.create_message(text(404, 5, "hello")).await.unwrap_err();
    assert_eq!(err, RepoError::not_found(Resource::Thread, 404));

    let mut ids = vec![];
    for i in 1..=5 {
        ids.push(r.create_message(text(t.id, 5, &format!("msg {i}"))).await.unwrap().id);
    }

    let newest: Vec<Id> = r.list_messages(t.id, page(0, 2, PageDirection::Newest)).await.unwrap().iter().map(|m| m.id).collect();
    assert_eq!(newest, ids[3..5]);
    let older: Vec<Id> = r.list_messages(t.id, page(1, 2, PageDirection::Newest)).await.unwrap().iter().map(|m| m.id).collect();
    assert_eq!(older, ids[1..3]);
    let tail: Vec<Id> = r.list_messages(t.id, page(2, 2, PageDirection::Newest)).await.unwrap().iter().map(|m| m.id).collect();
    assert_eq!(tail, ids[0..1]);
    assert!(r.list_messages(t.id, page(3, 2, PageDirection::Newest)).await.unwrap().is_empty());

    let oldest: Vec<Id> = r.list_messages(t.id, page(0, 2, PageDirection::Oldest)).await.unwrap().iter().map(|m| m.id).collect();
    assert_eq!(oldest, ids[0..2]);

    let latest = r.latest_message(t.id).await.unwrap().unwrap();
    assert_eq!(latest.id, ids[4]);
}

#[tokio::test]
async fn soft_delete_is_idempotent_and_redacts() {
    let r = InMemRepo::new();
    let t = r.create_thread(new_thread(1, ThreadType::Group, 5, vec![])).await.unwrap();
    let m = r
        .create_message(NewMessage {
            thread_id: t.id,
            author_id: 5,
            content: "secret".into(),
            attachments: vec!["a1".into()],
            metadata: Some(serde_json::json!({"k": "v"})),
        })
        .await
        .unwrap();

    let first = r.soft_delete_message(m.id, 9).await.unwrap();
    assert!(first.content.is_none() && first.attachments.is_empty() && first.metadata.is_none());
    let second = r.soft_delete_message(m.id, 5).await.unwrap();
    assert_eq!(second.deleted_at, first.deleted_at);
    assert_eq!(second.deleted_by, Some(9));

    let fetched = r.get_message(m.id).await.unwrap();
    assert!(fetched.is_deleted() && fetched.content.is_none());
    let listed = r.list_messages(t.id, page(0, 10, PageDirection::Newest)).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].content.is_none());
}

#[tokio::test]
async fn count_after_uses_position_and_skips_tombstones() {
    let r = InMemRepo::new();
    let t = r.create_thread(new_thread(1, ThreadType::Group, 5, vec![])).await.unwrap();
    let a = r.create_message(text(t.id, 5, "a")).await.unwrap();
    let b = r.create_message(text(t.id, 5, "b")).await.unwrap();
    let c = r.create_message(text(t.id, 5, "c")).await.unwrap();

    assert_eq!(r.count_after(t.id, None).await.unwrap(), 3);
    assert_eq!(r.count_after(t.id, Some(a.position())).await.unwrap(), 2);
    assert_eq!(r.count_after(t.id, Some(c.position())).await.unwrap(), 0);

    r.soft_delete_message(b.id, 5).await.unwrap();
    assert_eq!(r.count_after(t.id, Some(a.position())).await.unwrap(), 1);
    assert_eq!(r.count_after(t.id, None).await.unwrap(), 2);
}

#[tokio::test]
async fn read_markers_only_move_forward() {
    let r = InMemRepo::new();
    let t = r.create_thread(new_thread(1, ThreadType::Group, 5, vec![6])).await.unwrap();
    let a = r.create_message(text(t.id, 5, "a")).await.unwrap();
    let b = r.create_message(text(t.id, 5, "b")).await.unwrap();

    assert!(r.get_read_marker(t.id, 6).await.unwrap().is_none());
    let m = r.advance_read_marker(t.id, 6, &b).await.unwrap();
    assert_eq!(m.message_id, b.id);
    let stale = r.advance_read_marker(t.id, 6, &a).await.unwrap();
    assert_eq!(stale.message_id, b.id);
    assert_eq!(r.get_read_marker(t.id, 6).await.unwrap().unwrap().message_id, b.id);

    let p = r.list_participants(t.id).await.unwrap().into_iter().find(|p| p.user_id == 6).unwrap();
    assert_eq!(p.last_read_message_id, Some(b.id));
}

#[tokio::test]
async fn bump_activity_counts_and_keeps_latest_timestamp() {
    let r = InMemRepo::new();
    let t = r.create_thread(new_thread(1, ThreadType::Group, 5, vec![])).await.unwrap();
    let later = Utc::now() + chrono::Duration::seconds(10);
    r.bump_activity(t.id, later).await.unwrap();
    r.bump_activity(t.id, Utc::now()).await.unwrap();
    let th = r.get_thread(t.id).await.unwrap();
    assert_eq!(th.message_count, 2);
    assert_eq!(th.last_message_at, Some(later));
}

#[tokio::test]
async fn change_feed_follows_insertion_order() {
    let r = InMemRepo::new();
    let mut feed = r.message_feed();
    let t = r.create_thread(new_thread(1, ThreadType::Group, 5, vec![])).await.unwrap();
    let a = r.create_message(text(t.id, 5, "a")).await.unwrap();
    let b = r.create_message(text(t.id, 5, "b")).await.unwrap();
    assert_eq!(feed.recv().await.unwrap().id, a.id);
    assert_eq!(feed.recv().await.unwrap().id, b.id);
}

#[tokio::test]
async fn snapshot_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conversations.json");
    let (thread_id, message_id) = {
        let r = InMemRepo::with_snapshot(&path);
        let t = r.create_thread(new_thread(1, ThreadType::Group, 5, vec![6])).await.unwrap();
        let m = r.create_message(text(t.id, 5, "persisted")).await.unwrap();
        r.soft_delete_message(m.id, 5).await.unwrap();
        (t.id, m.id)
    };

    let reopened = InMemRepo::with_snapshot(&path);
    assert_eq!(reopened.list_participants(thread_id).await.unwrap().len(), 2);
    assert!(reopened.get_message(message_id).await.unwrap().is_deleted());
    // ids keep increasing after reload
    let next = reopened.create_message(text(thread_id, 6, "after restart")).await.unwrap();
    assert!(next.id > message_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writes_leave_a_complete_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conversations.json");
    let r = InMemRepo::with_snapshot(&path);
    let thread_id = r.create_thread(new_thread(1, ThreadType::Group, 5, vec![])).await.unwrap().id;

    let writers: Vec<_> = (0..8)
        .map(|w| {
            let r = r.clone();
            tokio::spawn(async move {
                for i in 0..10 {
                    r.create_message(text(thread_id, 5, &format!("{w}-{i}"))).await.unwrap();
                }
            })
        })
        .collect();
    for w in writers {
        w.await.unwrap();
    }

    let reopened = InMemRepo::with_snapshot(&path);
    assert_eq!(reopened.count_after(thread_id, None).await.unwrap(), 80);
    assert!(!path.with_extension("json.tmp").exists());
}
