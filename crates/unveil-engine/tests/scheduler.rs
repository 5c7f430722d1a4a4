mod common;

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use common::{Harness, harness, minutes_from_now};
use unveil_engine::{BackfillReport, ClaimOutcome, EngineError};
use unveil_engine::scheduler::CLAIM_EXPIRED_REASON;
use unveil_types::api::ScheduleMessageRequest;
use unveil_types::{
    ChannelSet, MessageType, RecipientFilter, ScheduleStatus, ScheduledMessage, TargetSelector,
};

fn request(content: &str, filter: RecipientFilter, minutes: i64) -> ScheduleMessageRequest {
    ScheduleMessageRequest {
        content: content.into(),
        message_type: MessageType::Announcement,
        filter,
        channels: ChannelSet::sms_only(),
        send_at: minutes_from_now(minutes),
    }
}

fn all_guests() -> RecipientFilter {
    RecipientFilter {
        all_guests: true,
        ..RecipientFilter::default()
    }
}

fn guest_ids(ids: &[Uuid]) -> RecipientFilter {
    RecipientFilter {
        guest_ids: Some(ids.to_vec()),
        ..RecipientFilter::default()
    }
}

/// Insert a row directly, bypassing validation, the way older data looks.
fn raw_scheduled(h: &Harness, target: TargetSelector, recipient_count: u32) -> ScheduledMessage {
    raw_scheduled_in(h, target, recipient_count, ScheduleStatus::Scheduled)
}

fn raw_scheduled_in(
    h: &Harness,
    target: TargetSelector,
    recipient_count: u32,
    status: ScheduleStatus,
) -> ScheduledMessage {
    let row = ScheduledMessage {
        id: Uuid::new_v4(),
        event_id: h.event.id,
        sender_user_id: h.host.id,
        content: "Legacy".into(),
        message_type: MessageType::Announcement,
        target,
        channels: ChannelSet::sms_only(),
        send_at: minutes_from_now(60),
        recipient_count,
        status,
        created_at: Utc::now(),
        claimed_at: None,
        processed_at: None,
        failure_reason: None,
        message_id: None,
        success_count: 0,
        failure_count: 0,
    };
    h.db.insert_scheduled(&row).unwrap();
    row
}

#[tokio::test]
async fn schedule_rejects_past_send_time() {
    let h = harness();
    h.guest("Alice", "+15551111111");
    let err = h
        .engine
        .scheduler
        .schedule(h.event.id, h.host.id, request("Hi", all_guests(), -1), Utc::now())
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));
}

#[tokio::test]
async fn schedule_snapshots_recipient_count() {
    let h = harness();
    h.guest("Alice", "+15551111111");
    h.guest("Bob", "+15552222222");

    let scheduled = h
        .engine
        .scheduler
        .schedule(h.event.id, h.host.id, request("Hi", all_guests(), 30), Utc::now())
        .unwrap();
    assert_eq!(scheduled.recipient_count, 2);
    assert_eq!(scheduled.status, ScheduleStatus::Scheduled);
    assert_eq!(h.engine.scheduler.list_for_event(h.event.id).unwrap().len(), 1);
}

#[tokio::test]
async fn due_message_is_sent_with_corrected_count() {
    let h = harness();
    h.guest("Alice", "+15551111111");
    let bob = h.guest("Bob", "+15552222222");

    let scheduled = h
        .engine
        .scheduler
        .schedule(h.event.id, h.host.id, request("Welcome to our wedding!", all_guests(), 5), Utc::now())
        .unwrap();
    assert_eq!(scheduled.recipient_count, 2);

    // Bob opts out between scheduling and dispatch.
    h.db.set_guest_opt_out(bob.id, true).unwrap();

    let report = h.engine.scheduler.process_due(minutes_from_now(10)).await.unwrap();
    assert_eq!(report.due, 1);
    assert_eq!(report.sent, 1);

    let done = h.engine.scheduler.get(scheduled.id).unwrap();
    assert_eq!(done.status, ScheduleStatus::Sent);
    assert_eq!(done.recipient_count, 1);
    assert_eq!(done.success_count, 1);
    let message_id = done.message_id.unwrap();
    let message = h.db.get_message(message_id).unwrap().unwrap();
    assert_eq!(message.scheduled_message_id, Some(scheduled.id));
    assert_eq!(
        h.sms.bodies(),
        vec!["[TestWed]\nWelcome to our wedding!\n\nvia Unveil\nReply STOP to opt out.".to_string()]
    );

    let again = h.engine.scheduler.process_due(minutes_from_now(20)).await.unwrap();
    assert_eq!(again.due, 0);
}

#[tokio::test]
async fn unresolvable_message_fails_with_reason() {
    let h = harness();
    let alice = h.guest("Alice", "+15551111111");
    let scheduled = h
        .engine
        .scheduler
        .schedule(h.event.id, h.host.id, request("Hi", all_guests(), 5), Utc::now())
        .unwrap();
    h.db.remove_guest(alice.id, Utc::now()).unwrap();

    let report = h.engine.scheduler.process_due(minutes_from_now(10)).await.unwrap();
    assert_eq!(report.failed, 1);

    let failed = h.engine.scheduler.get(scheduled.id).unwrap();
    assert_eq!(failed.status, ScheduleStatus::Failed);
    assert!(failed.failure_reason.unwrap().contains("no eligible recipients"));
    assert!(h.sms.sent().is_empty());
}

#[test]
fn concurrent_claims_have_one_winner() {
    let h = harness();
    h.guest("Alice", "+15551111111");
    let scheduled = h
        .engine
        .scheduler
        .schedule(h.event.id, h.host.id, request("Hi", all_guests(), 5), Utc::now())
        .unwrap();

    let now = minutes_from_now(10);
    let outcomes: Vec<ClaimOutcome> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..2)
            .map(|_| {
                let scheduler = Arc::clone(&h.engine.scheduler);
                s.spawn(move || scheduler.claim(scheduled.id, now).unwrap())
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    assert_eq!(outcomes.iter().filter(|o| **o == ClaimOutcome::Claimed).count(), 1);
    assert_eq!(outcomes.iter().filter(|o| **o == ClaimOutcome::Conflict).count(), 1);
    assert_eq!(h.engine.scheduler.get(scheduled.id).unwrap().status, ScheduleStatus::Sending);
}

#[tokio::test]
async fn cancel_only_from_scheduled() {
    let h = harness();
    h.guest("Alice", "+15551111111");
    let scheduler = &h.engine.scheduler;

    let first = scheduler
        .schedule(h.event.id, h.host.id, request("Hi", all_guests(), 5), Utc::now())
        .unwrap();
    let cancelled = scheduler.cancel(first.id, Utc::now()).unwrap();
    assert_eq!(cancelled.status, ScheduleStatus::Cancelled);
    assert!(matches!(
        scheduler.cancel(first.id, Utc::now()),
        Err(EngineError::InvalidTransition {
            from: ScheduleStatus::Cancelled,
            to: ScheduleStatus::Cancelled
        })
    ));

    let second = scheduler
        .schedule(h.event.id, h.host.id, request("Hi", all_guests(), 5), Utc::now())
        .unwrap();
    scheduler.claim(second.id, minutes_from_now(10)).unwrap();
    assert!(matches!(
        scheduler.cancel(second.id, Utc::now()),
        Err(EngineError::InvalidTransition {
            from: ScheduleStatus::Sending,
            ..
        })
    ));

    assert!(matches!(
        scheduler.cancel(Uuid::new_v4(), Utc::now()),
        Err(EngineError::NotFound(_))
    ));

    // A cancelled row is never picked up.
    let report = scheduler.process_due(minutes_from_now(10)).await.unwrap();
    assert_eq!(report.due, 0);
}

#[test]
fn backfill_counts_distinct_explicit_ids() {
    let h = harness();
    let ids: Vec<Uuid> = ["Alice", "Bob", "Cy"]
        .iter()
        .enumerate()
        .map(|(i, name)| h.guest(name, &format!("+1555000000{i}")).id)
        .collect();
    let mut target_ids = ids.clone();
    target_ids.push(ids[0]);

    let legacy = raw_scheduled(
        &h,
        TargetSelector::GuestIds {
            guest_ids: target_ids.clone(),
        },
        6,
    );

    let first = h.engine.scheduler.backfill_recipient_counts().unwrap();
    assert_eq!(first, BackfillReport { examined: 1, corrected: 1 });

    let repaired = h.engine.scheduler.get(legacy.id).unwrap();
    assert_eq!(repaired.recipient_count, 3);
    assert_eq!(
        repaired.target,
        TargetSelector::GuestIds {
            guest_ids: target_ids
        }
    );

    let second = h.engine.scheduler.backfill_recipient_counts().unwrap();
    assert_eq!(second, BackfillReport { examined: 1, corrected: 0 });
}

#[test]
fn backfill_re_resolves_pending_implicit_targets() {
    let h = harness();
    h.guest("Alice", "+15551111111");
    h.guest("Bob", "+15552222222");
    let stale = raw_scheduled(&h, TargetSelector::AllGuests, 7);

    let report = h.engine.scheduler.backfill_recipient_counts().unwrap();
    assert_eq!(report.corrected, 1);
    assert_eq!(h.engine.scheduler.get(stale.id).unwrap().recipient_count, 2);
    assert_eq!(h.engine.scheduler.backfill_recipient_counts().unwrap().corrected, 0);
}

#[test]
fn stale_claims_expire_to_failed() {
    let h = harness();
    h.guest("Alice", "+15551111111");
    let scheduled = h
        .engine
        .scheduler
        .schedule(h.event.id, h.host.id, request("Hi", all_guests(), 5), Utc::now())
        .unwrap();
    let claimed_at = minutes_from_now(10);
    h.engine.scheduler.claim(scheduled.id, claimed_at).unwrap();

    let max_age = chrono::Duration::minutes(15);
    assert_eq!(h.engine.scheduler.expire_stale_claims(max_age, claimed_at).unwrap(), 0);

    let later = claimed_at + chrono::Duration::minutes(16);
    assert_eq!(h.engine.scheduler.expire_stale_claims(max_age, later).unwrap(), 1);

    let expired = h.engine.scheduler.get(scheduled.id).unwrap();
    assert_eq!(expired.status, ScheduleStatus::Failed);
    assert_eq!(expired.failure_reason.as_deref(), Some(CLAIM_EXPIRED_REASON));
}

#[tokio::test]
async fn backfill_keeps_opt_outs_out_of_explicit_counts() {
    let h = harness();
    let alice = h.guest("Alice", "+15551111111");
    let bob = h.guest("Bob", "+15552222222");
    h.db.set_guest_opt_out(bob.id, true).unwrap();

    let scheduled = h
        .engine
        .scheduler
        .schedule(h.event.id, h.host.id, request("Hi", guest_ids(&[alice.id, bob.id]), 5), Utc::now())
        .unwrap();
    assert_eq!(scheduled.recipient_count, 1);

    let pending = h.engine.scheduler.backfill_recipient_counts().unwrap();
    assert_eq!(pending.corrected, 0);
    assert_eq!(h.engine.scheduler.get(scheduled.id).unwrap().recipient_count, 1);

    let report = h.engine.scheduler.process_due(minutes_from_now(10)).await.unwrap();
    assert_eq!(report.sent, 1);

    let settled = h.engine.scheduler.backfill_recipient_counts().unwrap();
    assert_eq!(settled.corrected, 0);
    let done = h.engine.scheduler.get(scheduled.id).unwrap();
    assert_eq!(done.status, ScheduleStatus::Sent);
    assert_eq!(done.recipient_count, 1);
}

#[test]
fn backfill_only_lowers_settled_explicit_counts() {
    let h = harness();
    let ids: Vec<Uuid> = ["Alice", "Bob", "Cy"]
        .iter()
        .enumerate()
        .map(|(i, name)| h.guest(name, &format!("+1555000000{i}")).id)
        .collect();
    let target = TargetSelector::GuestIds { guest_ids: ids };

    let inflated = raw_scheduled_in(&h, target.clone(), 6, ScheduleStatus::Sent);
    let narrowed = raw_scheduled_in(&h, target, 1, ScheduleStatus::Sent);

    let report = h.engine.scheduler.backfill_recipient_counts().unwrap();
    assert_eq!(report, BackfillReport { examined: 2, corrected: 1 });
    assert_eq!(h.engine.scheduler.get(inflated.id).unwrap().recipient_count, 3);
    assert_eq!(h.engine.scheduler.get(narrowed.id).unwrap().recipient_count, 1);
}

#[tokio::test]
async fn tracking_gap_fails_the_row_and_keeps_the_message() {
    let h = harness();
    h.guest("Alice", "+15551111111");
    let scheduled = h
        .engine
        .scheduler
        .schedule(h.event.id, h.host.id, request("Hi", all_guests(), 5), Utc::now())
        .unwrap();
    h.break_delivery_tracking();

    let report = h.engine.scheduler.process_due(minutes_from_now(10)).await.unwrap();
    assert_eq!(report.sent, 0);
    assert_eq!(report.failed, 1);

    let failed = h.engine.scheduler.get(scheduled.id).unwrap();
    assert_eq!(failed.status, ScheduleStatus::Failed);
    assert!(failed.failure_reason.unwrap().contains("were not written"));
    let message_id = failed.message_id.expect("stored message is linked");
    let message = h.db.get_message(message_id).unwrap().unwrap();
    assert_eq!(message.scheduled_message_id, Some(scheduled.id));
    assert!(h.sms.sent().is_empty());
}

#[tokio::test]
async fn claim_lost_mid_send_is_a_conflict() {
    let h = harness();
    h.guest("Alice", "+15551111111");
    let scheduled = h
        .engine
        .scheduler
        .schedule(h.event.id, h.host.id, request("Hi", all_guests(), 5), Utc::now())
        .unwrap();

    // Another worker expires the claim while the provider call is in flight.
    let expiring = Arc::clone(&h.engine.scheduler);
    h.sms.on_send(move || {
        let expired = expiring
            .expire_stale_claims(chrono::Duration::zero(), minutes_from_now(60))
            .unwrap();
        assert_eq!(expired, 1);
    });

    let report = h.engine.scheduler.process_due(minutes_from_now(10)).await.unwrap();
    assert_eq!(report.sent, 0);
    assert_eq!(report.failed, 0);
    assert_eq!(report.conflicts, 1);

    let row = h.engine.scheduler.get(scheduled.id).unwrap();
    assert_eq!(row.status, ScheduleStatus::Failed);
    assert_eq!(row.failure_reason.as_deref(), Some(CLAIM_EXPIRED_REASON));
    assert!(row.message_id.is_some());
    assert_eq!(h.sms.sent().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_send_a_row_once() {
    let h = harness();
    h.guest("Alice", "+15551111111");
    let scheduled = h
        .engine
        .scheduler
        .schedule(h.event.id, h.host.id, request("Hi", all_guests(), 5), Utc::now())
        .unwrap();

    let now = minutes_from_now(10);
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let scheduler = Arc::clone(&h.engine.scheduler);
            tokio::spawn(async move { scheduler.process_due(now).await.unwrap() })
        })
        .collect();
    let mut reports = Vec::new();
    for worker in workers {
        reports.push(worker.await.unwrap());
    }

    let sent: usize = reports.iter().map(|r| r.sent).sum();
    let conflicts: usize = reports.iter().map(|r| r.conflicts).sum();
    let due: usize = reports.iter().map(|r| r.due).sum();
    assert_eq!(sent, 1);
    assert_eq!(reports.iter().map(|r| r.failed).sum::<usize>(), 0);
    // Every worker that saw the row either sent it or lost the claim.
    assert_eq!(due, sent + conflicts);
    assert_eq!(h.sms.sent().len(), 1);
    assert_eq!(h.engine.scheduler.get(scheduled.id).unwrap().status, ScheduleStatus::Sent);
}
