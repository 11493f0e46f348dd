//! Cron scheduler persistence and firing

use rankflow::backend::{ScheduleEntry, SqliteBackend};
use rankflow::events::{Event, EventBus, EventType};
use rankflow::runtime::{CronSchedulerService, ScheduleError};
use rankflow::workflow::templates::{register_builtin_templates, MONITORING_SWEEP};
use rankflow::workflow::{FlowComposer, FlowInput, TemplateRegistry};
use std::sync::{Arc, Mutex};
use std::time::Duration;

async fn service(url: &str, events: &EventBus) -> (CronSchedulerService, SqliteBackend) {
    let backend = SqliteBackend::connect(url, 5).await.unwrap();
    let templates = Arc::new(TemplateRegistry::new());
    register_builtin_templates(&templates);
    let composer = Arc::new(FlowComposer::new(templates, backend.clone(), events.clone()));
    let service = CronSchedulerService::new(backend.clone(), composer, events.clone())
        .await
        .unwrap()
        .with_sync_interval(Duration::from_millis(100));
    (service, backend)
}

fn sweep(id: &str, cron: &str) -> ScheduleEntry {
    ScheduleEntry::new(
        id,
        cron,
        MONITORING_SWEEP,
        FlowInput::new("tenant-a", "proj-1").with_keywords(["rust"]),
    )
}

#[tokio::test]
async fn schedules_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("rankflow.db").display());
    let events = EventBus::in_memory("itest");

    {
        let (first, _) = service(&url, &events).await;
        first
            .upsert_schedule(sweep("weekly", "0 9 * * 1").with_timezone("Europe/Berlin"))
            .await
            .unwrap();
        first.upsert_schedule(sweep("paused", "0 * * * *")).await.unwrap();
        first.set_enabled("paused", false).await.unwrap();
    }

    let (second, _) = service(&url, &events).await;
    let entries = second.list_schedules().await.unwrap();
    assert_eq!(entries.len(), 2);
    let weekly = entries.iter().find(|e| e.id == "weekly").unwrap();
    assert_eq!(weekly.timezone, "Europe/Berlin");
    assert!(weekly.enabled);

    second.start().await.unwrap();
    assert_eq!(second.active_timers().await, 1);
    second.stop().await.unwrap();
}

#[tokio::test]
async fn invalid_entries_are_rejected_before_storage() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("rankflow.db").display());
    let (service, _) = service(&url, &EventBus::in_memory("itest")).await;

    assert!(matches!(
        service.upsert_schedule(sweep("bad", "every tuesday")).await,
        Err(ScheduleError::InvalidCron { .. })
    ));
    assert!(matches!(
        service
            .upsert_schedule(sweep("bad", "0 9 * * 1").with_timezone("Nowhere/Special"))
            .await,
        Err(ScheduleError::InvalidTimezone(_))
    ));
    assert!(service.list_schedules().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn enabled_schedule_fires_and_records_it() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("rankflow.db").display());
    let events = EventBus::in_memory("itest");

    let seen = Arc::new(Mutex::new(Vec::<Event>::new()));
    let sink = Arc::clone(&seen);
    let subscription = events.subscribe("tenant-a", move |event: Event| sink.lock().unwrap().push(event));
    subscription.start().await.unwrap();

    let (service, backend) = service(&url, &events).await;
    service.upsert_schedule(sweep("every-second", "* * * * * *")).await.unwrap();
    service.start().await.unwrap();

    let mut fired = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if backend
            .get_schedule("every-second")
            .await
            .unwrap()
            .and_then(|e| e.last_fired_at)
            .is_some()
        {
            fired = true;
            break;
        }
    }
    service.stop().await.unwrap();
    assert!(fired, "schedule never fired");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let seen = seen.lock().unwrap();
    let triggered = seen
        .iter()
        .find(|e| e.event_type == EventType::ScheduleTriggered)
        .expect("schedule.triggered was not published");
    assert_eq!(triggered.payload["scheduleId"], "every-second");
    assert!(seen.iter().any(|e| e.event_type == EventType::FlowSubmitted));
}

#[tokio::test]
async fn run_now_does_not_move_the_cadence() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("rankflow.db").display());
    let (service, backend) = service(&url, &EventBus::in_memory("itest")).await;

    service.upsert_schedule(sweep("nightly", "30 2 * * *")).await.unwrap();
    let handle = service.run_now("nightly").await.unwrap();

    let status = backend.flow_status(&handle.flow_id).await.unwrap().unwrap();
    assert_eq!(status.template, MONITORING_SWEEP);
    assert!(service.get_schedule("nightly").await.unwrap().last_fired_at.is_none());
}

async fn wait_for_first_firing(backend: &SqliteBackend, id: &str) -> bool {
    for _ in 0..60 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if backend
            .get_schedule(id)
            .await
            .unwrap()
            .and_then(|e| e.last_fired_at)
            .is_some()
        {
            return true;
        }
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn running_scheduler_follows_edits_from_another_process() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("rankflow.db").display());
    let events = EventBus::in_memory("itest");

    let (running, backend) = service(&url, &events).await;
    running.start().await.unwrap();
    assert_eq!(running.active_timers().await, 0);

    // a CLI invocation: its own connection, never started
    let (cli, _) = service(&url, &events).await;
    cli.upsert_schedule(sweep("every-second", "* * * * * *")).await.unwrap();

    assert!(
        wait_for_first_firing(&backend, "every-second").await,
        "schedule created elsewhere never fired"
    );
    assert_eq!(running.active_timers().await, 1);

    cli.remove_schedule("every-second").await.unwrap();
    let mut dropped = false;
    for _ in 0..30 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if running.active_timers().await == 0 {
            dropped = true;
            break;
        }
    }
    running.stop().await.unwrap();
    assert!(dropped, "timer of a removed schedule is still live");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_schedulers_submit_each_tick_once() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("rankflow.db").display());
    let events = EventBus::in_memory("itest");

    let (first, backend) = service(&url, &events).await;
    let (second, _) = service(&url, &events).await;
    first.upsert_schedule(sweep("every-second", "* * * * * *")).await.unwrap();
    first.start().await.unwrap();
    second.start().await.unwrap();
    assert_eq!(second.active_timers().await, 1);

    tokio::time::sleep(Duration::from_millis(3500)).await;
    first.stop().await.unwrap();
    second.stop().await.unwrap();

    let submitted: Vec<i64> = sqlx::query_scalar("SELECT created_at FROM flows ORDER BY created_at")
        .fetch_all(backend.pool())
        .await
        .unwrap();
    assert!(submitted.len() >= 2, "only {} flow(s) submitted", submitted.len());
    for pair in submitted.windows(2) {
        assert!(
            pair[1] - pair[0] >= 500,
            "two flows submitted {} ms apart",
            pair[1] - pair[0]
        );
    }
}
