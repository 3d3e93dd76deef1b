use super::*;
use chrono::Duration;

async fn mem() -> Storage {
    Storage::new("sqlite::memory:").await.expect("db")
}

fn user(id: &str) -> UserId {
    UserId(id.to_string())
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = mem().await;
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("beamchat_storage_test_{suffix}"));
    let db_path = temp_root.join("nested").join("storage.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}

#[tokio::test]
async fn creates_chat_with_members_in_supplied_order_without_duplicates() {
    let storage = mem().await;
    let chat = storage
        .create_chat(
            &user("alice"),
            &[user("bob"), user("carol"), user("bob")],
            false,
            Some("alice-pk"),
        )
        .await
        .expect("chat");

    let participants = storage.participants(chat).await.expect("participants");
    let ids: Vec<&str> = participants
        .iter()
        .map(|p| p.user_id.0.as_str())
        .collect();
    assert_eq!(ids, vec!["alice", "bob", "carol"]);
    assert_eq!(participants[0].public_key.as_deref(), Some("alice-pk"));
}

#[tokio::test]
async fn add_participant_is_idempotent() {
    let storage = mem().await;
    let chat = storage
        .create_chat(&user("alice"), &[], true, None)
        .await
        .expect("chat");

    let first = storage
        .add_participant(chat, &user("bob"), Some("bob-pk"))
        .await
        .expect("first join");
    let second = storage
        .add_participant(chat, &user("bob"), Some("bob-pk"))
        .await
        .expect("second join");

    assert!(first);
    assert!(!second);
    assert_eq!(storage.participants(chat).await.expect("list").len(), 2);
}

#[tokio::test]
async fn lists_chats_only_for_participants() {
    let storage = mem().await;
    let shared_chat = storage
        .create_chat(&user("alice"), &[user("bob")], false, None)
        .await
        .expect("chat");
    let _other = storage
        .create_chat(&user("carol"), &[user("dave")], false, None)
        .await
        .expect("chat");

    let bobs = storage
        .list_chats_for_user(&user("bob"))
        .await
        .expect("chats");
    assert_eq!(bobs.len(), 1);
    assert_eq!(bobs[0].chat_id, shared_chat);

    assert!(storage
        .list_chats_for_user(&user("nobody"))
        .await
        .expect("chats")
        .is_empty());
}

#[tokio::test]
async fn paginates_history_newest_first_without_overlap_or_gap() {
    let storage = mem().await;
    let alice = user("alice");
    let chat = storage
        .create_chat(&alice, &[user("bob")], false, None)
        .await
        .expect("chat");

    let base = Utc::now();
    let mut ids = Vec::new();
    for i in 0..5i64 {
        let stored = storage
            .append_message_at(
                chat,
                &alice,
                &format!("m{i}"),
                None,
                MessageId::generate(),
                base + Duration::seconds(i),
            )
            .await
            .expect("append");
        ids.push(stored.message_id);
    }

    let first_page = storage.list_messages(chat, 0, 2).await.expect("page 1");
    let second_page = storage.list_messages(chat, 2, 2).await.expect("page 2");

    let got: Vec<MessageId> = first_page
        .iter()
        .chain(second_page.iter())
        .map(|m| m.message_id)
        .collect();
    assert_eq!(got, vec![ids[4], ids[3], ids[2], ids[1]]);
}

#[tokio::test]
async fn equal_timestamps_order_deterministically_by_message_id() {
    let storage = mem().await;
    let alice = user("alice");
    let chat = storage
        .create_chat(&alice, &[user("bob")], false, None)
        .await
        .expect("chat");

    let ts = Utc::now();
    for i in 0..4 {
        storage
            .append_message_at(chat, &alice, &format!("tied-{i}"), None, MessageId::generate(), ts)
            .await
            .expect("append");
    }

    let once = storage.list_messages(chat, 0, 10).await.expect("first read");
    let twice = storage.list_messages(chat, 0, 10).await.expect("second read");
    let order_once: Vec<MessageId> = once.iter().map(|m| m.message_id).collect();
    let order_twice: Vec<MessageId> = twice.iter().map(|m| m.message_id).collect();
    assert_eq!(order_once, order_twice);

    // Paging through tied timestamps must not repeat or skip entries either.
    let head = storage.list_messages(chat, 0, 2).await.expect("head");
    let tail = storage.list_messages(chat, 2, 2).await.expect("tail");
    let paged: Vec<MessageId> = head
        .iter()
        .chain(tail.iter())
        .map(|m| m.message_id)
        .collect();
    assert_eq!(paged, order_once);
}

#[tokio::test]
async fn history_order_follows_timestamps_not_insertion_order() {
    let storage = mem().await;
    let alice = user("alice");
    let chat = storage
        .create_chat(&alice, &[user("bob")], false, None)
        .await
        .expect("chat");

    // Under concurrent publishes a message can land in the store after one
    // that carries a later timestamp. History reconciles on timestamps, so
    // its order may disagree with the order writes (and live deliveries)
    // actually happened in.
    let base = Utc::now();
    let landed_first = storage
        .append_message_at(
            chat,
            &alice,
            "landed first, stamped later",
            None,
            MessageId::generate(),
            base + Duration::seconds(1),
        )
        .await
        .expect("append");
    let landed_second = storage
        .append_message_at(
            chat,
            &alice,
            "landed second, stamped earlier",
            None,
            MessageId::generate(),
            base,
        )
        .await
        .expect("append");

    let history = storage.list_messages(chat, 0, 10).await.expect("history");
    assert_eq!(history[0].message_id, landed_first.message_id);
    assert_eq!(history[1].message_id, landed_second.message_id);
}

#[tokio::test]
async fn stores_message_fields_verbatim() {
    let storage = mem().await;
    let alice = user("alice");
    let chat = storage
        .create_chat(&alice, &[user("bob")], true, None)
        .await
        .expect("chat");

    storage
        .append_message(chat, &alice, "opaque-ciphertext", Some("aabbcc"))
        .await
        .expect("append");

    let messages = storage.list_messages(chat, 0, 10).await.expect("messages");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].text, "opaque-ciphertext");
    assert_eq!(messages[0].iv.as_deref(), Some("aabbcc"));
    assert_eq!(messages[0].sender_id, alice);
}

#[tokio::test]
async fn settles_pending_invitation_exactly_once() {
    let storage = mem().await;
    let chat = storage
        .create_chat(&user("alice"), &[], true, None)
        .await
        .expect("chat");
    let invitation = storage
        .create_invitation(chat, &user("alice"), &user("bob"))
        .await
        .expect("invitation");
    assert_eq!(invitation.status, InvitationStatus::Pending);
    assert!(invitation.responded_at.is_none());

    let settled = storage
        .settle_invitation(invitation.id, InvitationStatus::Accepted)
        .await
        .expect("settle")
        .expect("was pending");
    assert_eq!(settled.status, InvitationStatus::Accepted);
    assert!(settled.responded_at.is_some());

    let again = storage
        .settle_invitation(invitation.id, InvitationStatus::Rejected)
        .await
        .expect("settle");
    assert!(again.is_none(), "terminal invitation must not transition");

    let current = storage
        .invitation(invitation.id)
        .await
        .expect("load")
        .expect("exists");
    assert_eq!(current.status, InvitationStatus::Accepted);
}

#[tokio::test]
async fn concurrent_settles_have_a_single_winner() {
    let storage = mem().await;
    let chat = storage
        .create_chat(&user("alice"), &[], true, None)
        .await
        .expect("chat");
    let invitation = storage
        .create_invitation(chat, &user("alice"), &user("bob"))
        .await
        .expect("invitation");

    let storage_a = storage.clone();
    let storage_b = storage.clone();
    let (left, right) = tokio::join!(
        async move {
            storage_a
                .settle_invitation(invitation.id, InvitationStatus::Accepted)
                .await
                .expect("left settle")
        },
        async move {
            storage_b
                .settle_invitation(invitation.id, InvitationStatus::Accepted)
                .await
                .expect("right settle")
        }
    );

    let winners = [left, right].into_iter().flatten().count();
    assert_eq!(winners, 1, "exactly one response should win the transition");
}

#[tokio::test]
async fn lists_only_pending_invitations_for_receiver() {
    let storage = mem().await;
    let chat = storage
        .create_chat(&user("alice"), &[], true, None)
        .await
        .expect("chat");

    let kept = storage
        .create_invitation(chat, &user("alice"), &user("bob"))
        .await
        .expect("kept");
    let settled = storage
        .create_invitation(chat, &user("carol"), &user("bob"))
        .await
        .expect("settled");
    storage
        .settle_invitation(settled.id, InvitationStatus::Rejected)
        .await
        .expect("settle");
    storage
        .create_invitation(chat, &user("alice"), &user("dave"))
        .await
        .expect("other receiver");

    let pending = storage
        .list_pending_invitations(&user("bob"))
        .await
        .expect("pending");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, kept.id);
    assert_eq!(pending[0].kind, "chat_invite");
}

#[tokio::test]
async fn profile_projection_round_trips() {
    let storage = mem().await;
    let profile = UserProfile {
        user_id: user("alice"),
        email: "alice@example.com".to_string(),
        display_name: "Alice".to_string(),
    };
    storage.upsert_profile(&profile).await.expect("upsert");
    storage
        .upsert_profile(&UserProfile {
            display_name: "Alice L.".to_string(),
            ..profile.clone()
        })
        .await
        .expect("update");

    let by_email = storage
        .find_profile_by_email("alice@example.com")
        .await
        .expect("lookup")
        .expect("exists");
    assert_eq!(by_email.display_name, "Alice L.");

    let found = storage
        .find_profiles_by_ids(&[user("alice"), user("ghost")])
        .await
        .expect("bulk lookup");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].user_id, user("alice"));
}
