use super::*;
use crate::{
    attachments::AttachmentDraft,
    messages::Author,
    test_support::{png_bytes, Harness, RecordingBlobStore},
};

async fn seed_room(h: &Harness, texts: usize, images: usize, audio: usize) -> (Room, Vec<MessageId>) {
    let room = h.room("doomed").await;
    let author = Author::new(UserId(1), "alice");
    let mut ids = Vec::new();
    for i in 0..texts {
        let receipt = h
            .core
            .messages
            .send(room.id, &author, &format!("text {i}"), None)
            .await
            .expect("send text");
        ids.push(receipt.message_id());
    }
    for _ in 0..images {
        let receipt = h
            .core
            .messages
            .send(room.id, &author, "", Some(AttachmentDraft::image(png_bytes(8, 8))))
            .await
            .expect("send image");
        ids.push(receipt.message_id());
        receipt.attachment_settled().await;
    }
    for _ in 0..audio {
        let receipt = h
            .core
            .messages
            .send(room.id, &author, "", Some(AttachmentDraft::audio(vec![1; 16])))
            .await
            .expect("send audio");
        ids.push(receipt.message_id());
        receipt.attachment_settled().await;
    }
    (room, ids)
}

#[tokio::test]
async fn cascade_issues_every_delete_exactly_once() {
    let h = Harness::new().await;
    let (room, ids) = seed_room(&h, 3, 2, 1).await;

    let report = h.core.rooms.delete_room(room.id, UserId(1)).await;

    assert!(report.is_complete(), "{:?}", report.failures);
    assert_eq!(report.messages_deleted, 6);
    assert_eq!(report.blobs_deleted, 3);
    assert_eq!(h.docs.counts(), (1, 1, 6));

    let deletes = h.blobs.deletes.lock().await.clone();
    assert_eq!(deletes.len(), 3);
    assert_eq!(
        deletes
            .iter()
            .filter(|(kind, _)| *kind == AttachmentKind::Image)
            .count(),
        2
    );
    assert_eq!(
        deletes
            .iter()
            .filter(|(kind, _)| *kind == AttachmentKind::Audio)
            .count(),
        1
    );

    for id in ids {
        assert!(h.docs.load_message(id).await.expect("load").is_none());
    }
    assert!(h.docs.load_room(room.id).await.expect("load").is_none());
    assert!(h
        .core
        .rooms
        .recent_rooms(UserId(1))
        .await
        .expect("recent")
        .is_empty());
    assert!(!h.core.rooms.is_deleting());
}

#[tokio::test]
async fn empty_room_cascade_touches_only_index_and_record() {
    let h = Harness::new().await;
    let room = h.room("quiet").await;

    let report = h.core.rooms.delete_room(room.id, UserId(5)).await;

    assert!(report.is_complete());
    assert_eq!((report.messages_deleted, report.blobs_deleted), (0, 0));
    assert_eq!(h.docs.counts(), (1, 1, 0));
    assert!(h.blobs.deletes.lock().await.is_empty());
}

#[tokio::test]
async fn partial_failures_are_reported_and_the_rest_still_runs() {
    let h = Harness::builder()
        .blobs(RecordingBlobStore::failing_deletes("bucket offline"))
        .docs(|docs| docs.fail_room_delete = true)
        .build()
        .await;
    let (room, ids) = seed_room(&h, 2, 1, 0).await;

    let report = h.core.rooms.delete_room(room.id, UserId(1)).await;

    assert!(!report.is_complete());
    assert_eq!(report.messages_deleted, 3);
    assert_eq!(report.blobs_deleted, 0);
    let targets: Vec<&CascadeTarget> = report.failures.iter().map(|f| &f.target).collect();
    assert_eq!(targets.len(), 2);
    assert!(targets.contains(&&CascadeTarget::RoomRecord));
    assert!(targets
        .iter()
        .any(|t| matches!(t, CascadeTarget::Blob { kind: AttachmentKind::Image, .. })));

    for id in ids {
        assert!(h.docs.load_message(id).await.expect("load").is_none());
    }
    assert!(!h.core.rooms.is_deleting());
}

#[tokio::test]
async fn failing_message_delete_is_listed_by_id() {
    let h = Harness::builder()
        .docs(|docs| {
            docs.fail_message_deletes.insert(MessageId(2));
        })
        .build()
        .await;
    let (room, ids) = seed_room(&h, 3, 0, 0).await;
    assert!(ids.contains(&MessageId(2)));

    let report = h.core.rooms.delete_room(room.id, UserId(1)).await;

    assert_eq!(report.messages_deleted, 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].target, CascadeTarget::Message(MessageId(2)));
    assert_eq!(report.failures[0].target.to_string(), "message 2");
    assert!(h.docs.load_message(MessageId(2)).await.expect("load").is_some());
}

#[tokio::test]
async fn unreadable_snapshot_still_removes_index_and_room() {
    let h = Harness::builder()
        .docs(|docs| docs.fail_room_load = true)
        .build()
        .await;
    let room = h.room("broken").await;

    let report = h.core.rooms.delete_room(room.id, UserId(1)).await;

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].target, CascadeTarget::MessageSnapshot);
    assert_eq!(h.docs.counts(), (1, 1, 0));
    assert!(h.docs.load_room(room.id).await.expect("load").is_none());
}

#[tokio::test]
async fn deleting_flag_is_raised_during_cascade_and_lowered_after() {
    let h = Harness::new().await;
    let (room, _) = seed_room(&h, 1, 0, 0).await;
    let mut flag = h.core.rooms.subscribe_deleting();
    assert!(!*flag.borrow_and_update());

    let watcher = tokio::spawn(async move {
        let mut seen = Vec::new();
        while flag.changed().await.is_ok() {
            let raised = *flag.borrow_and_update();
            seen.push(raised);
            if !raised {
                break;
            }
        }
        seen
    });
    tokio::task::yield_now().await;

    h.core.rooms.delete_room(room.id, UserId(1)).await;
    let seen = watcher.await.expect("watcher");
    assert_eq!(seen.last(), Some(&false));
    assert!(!h.core.rooms.is_deleting());
}

#[tokio::test]
async fn cascade_publishes_room_deleted_to_listeners() {
    let h = Harness::new().await;
    let (room, _) = seed_room(&h, 1, 0, 0).await;
    let mut feed = h.docs.subscribe();

    h.core.rooms.delete_room(room.id, UserId(1)).await;

    let mut saw_deleted = false;
    while let Ok(event) = feed.try_recv() {
        if matches!(event, shared::protocol::FeedEvent::RoomDeleted { room_id } if room_id == room.id) {
            saw_deleted = true;
        }
    }
    assert!(saw_deleted);
}

#[tokio::test]
async fn create_room_trims_and_rejects_blank_names() {
    let h = Harness::new().await;
    let room = h
        .core
        .rooms
        .create_room("  Book club ", Some("https://img.test/club.png"))
        .await
        .expect("create");
    assert_eq!(room.display_name, "Book club");

    let err = h
        .core
        .rooms
        .create_room("   ", None)
        .await
        .expect_err("blank");
    assert!(matches!(err, CoreError::Validation(_)));
}

#[tokio::test]
async fn profile_falls_back_to_placeholder_avatar() {
    let h = Harness::new().await;
    let with_photo = h
        .core
        .rooms
        .create_room("photos", Some("https://img.test/p.png"))
        .await
        .expect("create");
    let without = h.room("plain").await;

    let profile = h.core.rooms.room_profile(with_photo.id).await.expect("profile");
    assert_eq!(profile.photo_url, "https://img.test/p.png");

    let profile = h.core.rooms.room_profile(without.id).await.expect("profile");
    assert_eq!(profile.display_name, "plain");
    assert_eq!(
        profile.photo_url,
        format!("{PLACEHOLDER_AVATAR_BASE}{}", without.id)
    );

    let err = h
        .core
        .rooms
        .room_profile(RoomId(4040))
        .await
        .expect_err("missing");
    assert!(matches!(err, CoreError::RoomNotFound(RoomId(4040))));
}

#[test]
fn blank_photo_ref_uses_placeholder() {
    assert_eq!(
        photo_url_or_placeholder(RoomId(3), Some("  ")),
        format!("{PLACEHOLDER_AVATAR_BASE}3")
    );
}
