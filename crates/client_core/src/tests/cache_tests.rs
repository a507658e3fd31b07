use super::*;
use chrono::{DateTime, Duration, TimeZone, Utc};

const ME: UserId = UserId(1);
const BOB: UserId = UserId(2);
const CAROL: UserId = UserId(3);
const CONV: ConversationId = ConversationId(10);

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).single().expect("valid timestamp") + Duration::seconds(seconds)
}

fn message(id: i64, sender: UserId, seconds: i64) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(id),
        conversation_id: CONV,
        sender_id: sender,
        content: format!("message {id}"),
        sent_at: at(seconds),
        is_read: false,
        metadata: serde_json::json!({}),
        attachments: Vec::new(),
    }
}

fn summary(unread: u64, last: Option<&MessagePayload>) -> ConversationSummary {
    ConversationSummary {
        conversation_id: CONV,
        participants: Vec::new(),
        last_message: last.map(|m| MessagePreview {
            message_id: m.message_id,
            sender_id: m.sender_id,
            content: m.content.clone(),
            sent_at: m.sent_at,
        }),
        unread_count: unread,
        pinned: false,
        last_activity_at: last.map_or(at(0), |m| m.sent_at),
    }
}

fn created(message: &MessagePayload) -> ServerEvent {
    ServerEvent::MessageCreated {
        message: message.clone(),
    }
}

fn read_by(reader: UserId, ids: &[i64]) -> ServerEvent {
    ServerEvent::MessagesRead {
        conversation_id: CONV,
        reader_id: reader,
        message_ids: ids.iter().copied().map(MessageId).collect(),
        last_read_at: at(100),
    }
}

#[test]
fn new_message_extends_page_and_counts_unread() {
    let first = message(1, BOB, 1);
    let mut cache = ConversationCache::new(ME);
    cache.replace_conversations(vec![summary(1, Some(&first))]);
    cache.replace_messages(CONV, vec![first]);

    let second = message(2, BOB, 2);
    assert_eq!(cache.apply(&created(&second)), CacheUpdate::Applied);
    assert_eq!(cache.total_unread(), 2);
    let ids: Vec<_> = cache.messages(CONV).unwrap().iter().map(|m| m.message_id).collect();
    assert_eq!(ids, vec![MessageId(1), MessageId(2)]);

    assert_eq!(cache.apply(&created(&second)), CacheUpdate::Ignored);
    assert_eq!(cache.total_unread(), 2);
}

#[test]
fn own_messages_do_not_count_as_unread() {
    let mut cache = ConversationCache::new(ME);
    cache.replace_conversations(vec![summary(0, None)]);

    assert_eq!(cache.apply(&created(&message(5, ME, 5))), CacheUpdate::Applied);
    assert_eq!(cache.total_unread(), 0);
    let preview = cache.conversation(CONV).unwrap().last_message.clone().unwrap();
    assert_eq!(preview.message_id, MessageId(5));
}

#[test]
fn out_of_order_arrival_requests_refetch() {
    let mut cache = ConversationCache::new(ME);
    cache.replace_conversations(vec![summary(0, None)]);
    cache.replace_messages(CONV, vec![message(1, BOB, 1), message(3, BOB, 30)]);

    assert_eq!(
        cache.apply(&created(&message(2, BOB, 20))),
        CacheUpdate::NeedsRefetch
    );
}

#[test]
fn older_message_without_loaded_page_requests_refetch() {
    let mut cache = ConversationCache::new(ME);
    cache.replace_conversations(vec![summary(0, None)]);

    let newer = message(2, CAROL, 6);
    assert_eq!(cache.apply(&created(&newer)), CacheUpdate::Applied);
    assert_eq!(
        cache.apply(&created(&message(1, BOB, 5))),
        CacheUpdate::NeedsRefetch
    );
    assert_eq!(cache.apply(&created(&newer)), CacheUpdate::Ignored);
    assert_eq!(cache.total_unread(), 1);
}

#[test]
fn message_for_unknown_conversation_requests_refetch() {
    let mut cache = ConversationCache::new(ME);
    assert_eq!(
        cache.apply(&created(&message(1, BOB, 1))),
        CacheUpdate::NeedsRefetch
    );
}

#[test]
fn own_receipt_clears_unread() {
    let newest = message(2, BOB, 2);
    let mut cache = ConversationCache::new(ME);
    cache.replace_conversations(vec![summary(2, Some(&newest))]);
    cache.replace_messages(CONV, vec![message(1, BOB, 1), newest]);

    assert_eq!(cache.apply(&read_by(ME, &[1, 2])), CacheUpdate::Applied);
    assert_eq!(cache.total_unread(), 0);
    assert!(cache.messages(CONV).unwrap().iter().all(|m| m.is_read));
}

#[test]
fn third_party_receipt_needs_loaded_messages() {
    let mine = message(1, ME, 1);
    let bobs = message(2, BOB, 2);
    let mut cache = ConversationCache::new(ME);
    cache.replace_conversations(vec![summary(1, Some(&bobs))]);

    assert_eq!(cache.apply(&read_by(CAROL, &[1, 2])), CacheUpdate::NeedsRefetch);

    cache.replace_messages(CONV, vec![mine, bobs]);
    assert_eq!(cache.apply(&read_by(CAROL, &[1, 2])), CacheUpdate::Applied);
    assert_eq!(cache.total_unread(), 0);
}

#[test]
fn pin_changes_apply_and_membership_changes_refetch() {
    let mut cache = ConversationCache::new(ME);
    cache.replace_conversations(vec![summary(0, None)]);

    let pinned = ServerEvent::ConversationUpdated {
        conversation_id: CONV,
        change: ConversationChange::Pinned,
    };
    assert_eq!(cache.apply(&pinned), CacheUpdate::Applied);
    assert!(cache.conversations()[0].pinned);

    let left = ServerEvent::ConversationUpdated {
        conversation_id: CONV,
        change: ConversationChange::Left,
    };
    assert_eq!(cache.apply(&left), CacheUpdate::NeedsRefetch);
    assert_eq!(cache.apply(&ServerEvent::ResyncRequired), CacheUpdate::NeedsRefetch);
}

#[test]
fn conversations_sort_pinned_then_recent() {
    let mut older_pinned = summary(0, None);
    older_pinned.conversation_id = ConversationId(1);
    older_pinned.pinned = true;
    let mut newer = summary(0, None);
    newer.conversation_id = ConversationId(2);
    newer.last_activity_at = at(50);
    let mut newest = summary(0, None);
    newest.conversation_id = ConversationId(3);
    newest.last_activity_at = at(90);

    let mut cache = ConversationCache::new(ME);
    cache.replace_conversations(vec![newer, older_pinned, newest]);
    let order: Vec<_> = cache.conversations().iter().map(|s| s.conversation_id).collect();
    assert_eq!(
        order,
        vec![ConversationId(1), ConversationId(3), ConversationId(2)]
    );
}
