// Tests for the sync actor: selection, notifications, reconnect and coalescing.
mod common;

use chrono::{TimeZone, Utc};
use common::{FakeBackend, Harness, raw_event, settings};
use roomcal::SyncError;
use roomcal::channel::Inbound;
use roomcal::model::{CalendarRef, RawNotification};
use roomcal::sync::Notice;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn standup() -> roomcal::model::RawEvent {
    raw_event(
        "e1",
        "Standup",
        "2024-01-01T09:00:00.0000000",
        "2024-01-01T09:30:00.0000000",
    )
}

fn room_101() -> FakeBackend {
    FakeBackend::new().with_calendar("cal-1", "Room 101", vec![standup()])
}

fn notification(id: &str, subject: &str) -> RawNotification {
    RawNotification {
        id: id.to_string(),
        subject: Some(subject.to_string()),
        start: Some("1704103200000".to_string()),
        end: Some("1704105000000".to_string()),
        organizer: Some("Bob".to_string()),
    }
}

#[tokio::test(start_paused = true)]
async fn test_room_calendar_end_to_end() {
    let h = Harness::start(room_101());
    h.settle().await;
    assert_eq!(h.handle.calendars()[0].name, "Room 101");

    // 1. Select: one join, one fetch, one subscription
    h.handle.select("cal-1").await.unwrap();
    h.settle().await;

    let view = h.handle.view();
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].title, "Standup");
    assert_eq!(view[0].organizer, "Alice");
    assert_eq!(
        view[0].start,
        Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()
    );
    assert_eq!(h.channel.joins(), vec!["cal-1"]);
    assert_eq!(h.backend.created_count(), 1);
    let created = h.backend.created.lock().unwrap()[0].clone();
    assert_eq!(created.resource, "me/calendars/cal-1/events");
    assert_eq!(created.notification_url, common::HOOK_URL);

    // 2. Partial update: title replaced, times untouched
    let inbound = h.handle.inbound();
    inbound
        .send(Inbound::UpdateEvent {
            calendar_id: Some("cal-1".into()),
            event: RawNotification {
                id: "e1".into(),
                subject: Some("Standup (moved)".into()),
                ..Default::default()
            },
        })
        .await
        .unwrap();
    h.settle().await;

    let view = h.handle.view();
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].title, "Standup (moved)");
    assert_eq!(view[0].duration(), chrono::Duration::minutes(30));

    // 3. Delete
    inbound
        .send(Inbound::DeleteEvent {
            event_id: "e1".into(),
            calendar_id: Some("cal-1".into()),
        })
        .await
        .unwrap();
    h.settle().await;
    assert!(h.handle.view().is_empty());

    // 4. Shutdown leaves the room and deletes the subscription
    let backend = h.backend.clone();
    let channel = h.channel.clone();
    h.stop().await;
    assert_eq!(channel.leaves(), vec!["cal-1"]);
    assert_eq!(backend.deleted_ids(), vec!["sub-1"]);
}

#[tokio::test(start_paused = true)]
async fn test_deselect_before_fetch_completes_discards_result() {
    let (backend, gate) = FakeBackend::gated();
    let h = Harness::start(backend.with_calendar("cal-1", "Room 101", vec![standup()]));
    h.settle().await;

    h.handle.select("cal-1").await.unwrap();
    h.handle.deselect("cal-1").await.unwrap();
    h.settle().await;

    // Let the in-flight fetch finish after the deselect
    gate.add_permits(1);
    h.settle().await;

    assert!(h.handle.view().is_empty());
    assert_eq!(h.backend.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(h.channel.joins(), vec!["cal-1"]);
    assert_eq!(h.channel.leaves(), vec!["cal-1"]);
    // The create raced the deselect; its subscription must not outlive it.
    assert_eq!(h.backend.deleted_ids(), vec!["sub-1"]);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_reselect_uses_fresh_generation() {
    let (backend, gate) = FakeBackend::gated();
    let h = Harness::start(backend.with_calendar("cal-1", "Room 101", vec![standup()]));
    h.settle().await;

    h.handle.select("cal-1").await.unwrap();
    h.handle.deselect("cal-1").await.unwrap();
    h.handle.select("cal-1").await.unwrap();
    h.settle().await;

    gate.add_permits(2);
    h.settle().await;

    assert_eq!(h.handle.view().len(), 1);
    assert_eq!(h.backend.fetches.load(Ordering::SeqCst), 2);
    h.stop().await;
}

/// Room 101 selected and loaded, with every further fetch held at the gate.
async fn loaded_gated_room() -> (Harness, Arc<tokio::sync::Semaphore>) {
    let (backend, gate) = FakeBackend::gated();
    let h = Harness::start(backend.with_calendar("cal-1", "Room 101", vec![standup()]));
    h.settle().await;
    h.handle.select("cal-1").await.unwrap();
    gate.add_permits(1);
    h.settle().await;
    assert_eq!(h.handle.view().len(), 1);
    (h, gate)
}

#[tokio::test(start_paused = true)]
async fn test_delete_during_refresh_is_not_undone() {
    let (h, gate) = loaded_gated_room().await;

    h.handle.refresh().await.unwrap();
    h.settle().await;
    h.handle
        .inbound()
        .send(Inbound::DeleteEvent {
            event_id: "e1".into(),
            calendar_id: Some("cal-1".into()),
        })
        .await
        .unwrap();
    h.settle().await;
    assert!(h.handle.view().is_empty());

    // The refetch was answered before the delete and still lists e1
    gate.add_permits(1);
    h.settle().await;
    assert_eq!(h.backend.fetches.load(Ordering::SeqCst), 2);
    assert!(h.handle.view().is_empty());
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_add_during_refresh_is_kept() {
    let (h, gate) = loaded_gated_room().await;

    h.handle.refresh().await.unwrap();
    h.settle().await;
    h.handle
        .inbound()
        .send(Inbound::AddEvent {
            calendar_id: Some("cal-1".into()),
            event: notification("e2", "Walk-in"),
        })
        .await
        .unwrap();
    h.settle().await;
    assert_eq!(h.handle.view().len(), 2);

    gate.add_permits(1);
    h.settle().await;
    let ids: Vec<String> = h.handle.view().iter().map(|e| e.id.clone()).collect();
    assert_eq!(ids, vec!["e1", "e2"]);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_delete_before_initial_fetch_sticks() {
    let (backend, gate) = FakeBackend::gated();
    let h = Harness::start(backend.with_calendar("cal-1", "Room 101", vec![standup()]));
    h.settle().await;

    h.handle.select("cal-1").await.unwrap();
    h.handle
        .inbound()
        .send(Inbound::DeleteEvent {
            event_id: "e1".into(),
            calendar_id: None,
        })
        .await
        .unwrap();
    h.settle().await;

    gate.add_permits(1);
    h.settle().await;
    assert!(h.handle.view().is_empty());

    // A refresh started afterwards is authoritative again
    h.handle.refresh().await.unwrap();
    gate.add_permits(1);
    h.settle().await;
    assert_eq!(h.handle.view().len(), 1);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_select_is_idempotent() {
    let h = Harness::start(room_101());
    h.settle().await;

    h.handle.select("cal-1").await.unwrap();
    h.handle.select("cal-1").await.unwrap();
    h.settle().await;

    assert_eq!(h.channel.joins(), vec!["cal-1"]);
    assert_eq!(h.backend.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(h.backend.created_count(), 1);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_rejoins_each_selected_room_once() {
    let backend = FakeBackend::new()
        .with_calendar("cal-a", "Room A", vec![standup()])
        .with_calendar("cal-b", "Room B", vec![]);
    let h = Harness::start(backend);
    let mut notices = h.handle.notices();
    h.settle().await;

    h.handle.select("cal-a").await.unwrap();
    h.handle.select("cal-b").await.unwrap();
    h.settle().await;
    assert_eq!(h.handle.view().len(), 1);

    // Server-side removal while the channel was down
    h.backend.set_events("cal-a", vec![]);
    h.channel.clear();

    h.handle.inbound().send(Inbound::Reconnect).await.unwrap();
    h.settle().await;

    let mut joins = h.channel.joins();
    joins.sort();
    assert_eq!(joins, vec!["cal-a", "cal-b"]);
    assert_eq!(h.channel.tokens().len(), 1);
    assert!(h.handle.view().is_empty());

    let mut saw_reconnect = false;
    while let Ok(n) = notices.try_recv() {
        saw_reconnect |= matches!(n, Notice::Reconnected);
    }
    assert!(saw_reconnect);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_notification_for_unjoined_room_is_dropped() {
    let h = Harness::start(room_101());
    h.settle().await;

    h.handle
        .inbound()
        .send(Inbound::AddEvent {
            calendar_id: Some("cal-9".into()),
            event: notification("e9", "Board"),
        })
        .await
        .unwrap();
    h.settle().await;

    assert!(h.handle.view().is_empty());
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_add_without_calendar_goes_to_only_joined_room() {
    let h = Harness::start(room_101());
    h.settle().await;
    h.handle.select("cal-1").await.unwrap();
    h.settle().await;

    let inbound = h.handle.inbound();
    inbound
        .send(Inbound::AddEvent {
            calendar_id: None,
            event: notification("e2", "Retro"),
        })
        .await
        .unwrap();
    // Same add delivered twice
    inbound
        .send(Inbound::AddEvent {
            calendar_id: None,
            event: notification("e2", "Retro"),
        })
        .await
        .unwrap();
    h.settle().await;

    let view = h.handle.view();
    assert_eq!(view.len(), 2);
    let retro = view.iter().find(|e| e.id == "e2").unwrap();
    assert_eq!(retro.calendar_id, "cal-1");
    assert_eq!(retro.organizer, "Bob");
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_update_for_unknown_event_is_ignored() {
    let h = Harness::start(room_101());
    h.settle().await;
    h.handle.select("cal-1").await.unwrap();
    h.settle().await;

    h.handle
        .inbound()
        .send(Inbound::UpdateEvent {
            calendar_id: Some("cal-1".into()),
            event: notification("ghost", "Nobody"),
        })
        .await
        .unwrap();
    h.settle().await;

    let view = h.handle.view();
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].id, "e1");
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_batch_of_notifications_publishes_once() {
    let h = Harness::start(room_101());
    h.settle().await;
    h.handle.select("cal-1").await.unwrap();
    h.settle().await;

    let mut rx = h.handle.subscribe_view();
    let _ = rx.borrow_and_update();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let watcher = tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            seen_clone.lock().unwrap().push(rx.borrow_and_update().len());
        }
    });

    let inbound = h.handle.inbound();
    for id in ["e2", "e3", "e4"] {
        inbound
            .send(Inbound::AddEvent {
                calendar_id: Some("cal-1".into()),
                event: notification(id, "Walk-in"),
            })
            .await
            .unwrap();
    }
    h.settle().await;

    assert_eq!(*seen.lock().unwrap(), vec![4]);
    h.stop().await;
    watcher.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_vanished_calendar_is_deselected() {
    let backend = FakeBackend::new()
        .with_calendar("cal-a", "Room A", vec![])
        .with_calendar("cal-b", "Room B", vec![standup()]);
    let h = Harness::start(backend);
    h.settle().await;
    h.handle.select("cal-b").await.unwrap();
    h.settle().await;
    assert_eq!(h.handle.view().len(), 1);

    *h.backend.calendars.lock().unwrap() = vec![CalendarRef {
        index: 0,
        name: "Room A".into(),
        id: "cal-a".into(),
    }];
    h.handle.refresh_calendars().await.unwrap();
    h.settle().await;

    assert!(h.handle.view().is_empty());
    assert_eq!(h.handle.calendars().len(), 1);
    assert_eq!(h.channel.leaves(), vec!["cal-b"]);
    assert_eq!(h.backend.deleted_ids(), vec!["sub-1"]);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_select_all_on_start_waits_for_calendar_list() {
    let backend = FakeBackend::new()
        .with_calendar("cal-a", "Room A", vec![])
        .with_calendar("cal-b", "Room B", vec![standup()]);
    let mut s = settings();
    s.select_all_on_start = true;
    let h = Harness::start_with(backend, s);
    h.settle().await;

    let mut joins = h.channel.joins();
    joins.sort();
    assert_eq!(joins, vec!["cal-a", "cal-b"]);
    assert_eq!(h.handle.view().len(), 1);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_deselect_all_empties_view() {
    let backend = FakeBackend::new()
        .with_calendar("cal-a", "Room A", vec![standup()])
        .with_calendar(
            "cal-b",
            "Room B",
            vec![raw_event(
                "e7",
                "Demo",
                "2024-01-01T11:00:00",
                "2024-01-01T12:00:00",
            )],
        );
    let h = Harness::start(backend);
    h.settle().await;
    h.handle.select_all().await.unwrap();
    h.settle().await;
    assert_eq!(h.handle.view().len(), 2);

    h.handle.deselect_all().await.unwrap();
    h.settle().await;
    assert!(h.handle.view().is_empty());
    assert_eq!(h.backend.deleted_ids().len(), 2);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_token_pushed_on_start_and_on_interval() {
    let h = Harness::start(FakeBackend::new());
    h.settle().await;
    assert_eq!(h.channel.tokens(), vec!["tok-1"]);
    assert_eq!(h.tokens.forced.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_secs(600)).await;
    h.settle().await;
    assert_eq!(h.channel.tokens(), vec!["tok-1", "tok-2"]);
    assert_eq!(h.tokens.forced.load(Ordering::SeqCst), 1);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_token_failure_is_surfaced() {
    let h = Harness::start(FakeBackend::new());
    *h.tokens.fail.lock().unwrap() = Some(SyncError::AuthExpired("login required".into()));
    let mut notices = h.handle.notices();
    h.settle().await;

    assert!(h.channel.tokens().is_empty());
    let mut errors = Vec::new();
    while let Ok(n) = notices.try_recv() {
        if let Notice::Error(e) = n {
            errors.push(e);
        }
    }
    assert_eq!(
        errors,
        vec![SyncError::AuthExpired("login required".into())]
    );
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_fetch_failure_keeps_previous_view() {
    let h = Harness::start(room_101());
    h.settle().await;
    h.handle.select("cal-1").await.unwrap();
    h.settle().await;

    *h.backend.fail_events.lock().unwrap() = Some(SyncError::BackendUnavailable("503".into()));
    h.handle.refresh().await.unwrap();
    h.settle().await;

    assert_eq!(h.handle.view().len(), 1);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_periodic_refresh_replaces_calendar_contents() {
    let mut s = settings();
    s.auto_refresh_interval = Some(Duration::from_secs(60));
    let h = Harness::start_with(room_101(), s);
    h.settle().await;
    h.handle.select("cal-1").await.unwrap();
    h.settle().await;

    h.backend.set_events(
        "cal-1",
        vec![raw_event(
            "e5",
            "Interview",
            "2024-01-01T14:00:00",
            "2024-01-01T15:00:00",
        )],
    );
    tokio::time::sleep(Duration::from_secs(60)).await;
    h.settle().await;

    let view = h.handle.view();
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].id, "e5");
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_dropping_every_handle_stops_actor() {
    let h = Harness::start(FakeBackend::new());
    h.settle().await;
    let Harness { handle, task, .. } = h;
    drop(handle);
    task.await.unwrap();
}
