//! Shared resource budgets.

use batchd_scheduler::{AddTaskRequest, ConfigFile, Scheduler, SchedulerOptions, TaskStatus};

fn gpu_scheduler(capacity: u32) -> Scheduler {
    Scheduler::with_options(SchedulerOptions::default().resource("gpu", capacity))
}

#[test]
fn budget_blocks_oversubscription() {
    let scheduler = gpu_scheduler(3);
    for id in ["a", "b", "c"] {
        scheduler
            .add_task(AddTaskRequest::new("w", id).resource("gpu", 2))
            .unwrap();
    }

    assert_eq!(scheduler.get_work("w").unwrap().task_id.as_deref(), Some("a"));
    let blocked = scheduler.get_work("w").unwrap();
    assert!(!blocked.has_work());
    assert_eq!(blocked.n_pending_tasks, 2);
    assert_eq!(scheduler.resources_in_use().unwrap().get("gpu"), Some(&2));
}

#[test]
fn smaller_task_fills_remaining_capacity() {
    let scheduler = gpu_scheduler(3);
    scheduler
        .add_task(AddTaskRequest::new("w", "a").resource("gpu", 2))
        .unwrap();
    scheduler
        .add_task(AddTaskRequest::new("w", "b").resource("gpu", 2))
        .unwrap();
    scheduler
        .add_task(AddTaskRequest::new("w", "c").resource("gpu", 1))
        .unwrap();

    let order: Vec<_> = (0..3)
        .filter_map(|_| scheduler.get_work("w").unwrap().task_id)
        .collect();
    assert_eq!(order, vec!["a", "c"]);
}

#[test]
fn completion_and_failure_release_units() {
    let scheduler = gpu_scheduler(1);
    scheduler
        .add_task(AddTaskRequest::new("w", "a").resource("gpu", 1))
        .unwrap();
    scheduler
        .add_task(AddTaskRequest::new("w", "b").resource("gpu", 1))
        .unwrap();

    assert!(scheduler.get_work("w").unwrap().has_work());
    scheduler
        .add_task(AddTaskRequest::new("w", "a").status(TaskStatus::Failed))
        .unwrap();
    assert!(scheduler.resources_in_use().unwrap().is_empty());

    assert_eq!(scheduler.get_work("w").unwrap().task_id.as_deref(), Some("b"));
    scheduler
        .add_task(AddTaskRequest::new("w", "b").status(TaskStatus::Done))
        .unwrap();
    assert!(scheduler.resources_in_use().unwrap().is_empty());
}

#[test]
fn unknown_resources_are_unconstrained() {
    let scheduler = gpu_scheduler(1);
    for id in ["a", "b"] {
        scheduler
            .add_task(AddTaskRequest::new("w", id).resource("licenses", 1_000))
            .unwrap();
    }

    assert!(scheduler.get_work("w").unwrap().has_work());
    assert!(scheduler.get_work("w").unwrap().has_work());
    assert_eq!(scheduler.resources_in_use().unwrap().get("licenses"), Some(&2_000));
}

#[test]
fn capacities_come_from_config_strings() {
    let file = ConfigFile::from_toml(
        r#"
        [resources]
        gpu = "1"
        db_connections = 10
        "#,
    )
    .unwrap();
    let scheduler = Scheduler::from_config(SchedulerOptions::default(), &file).unwrap();

    assert_eq!(scheduler.resources().get("gpu"), Some(&1));
    assert_eq!(scheduler.resources().get("db_connections"), Some(&10));

    let stats = scheduler.stats().unwrap();
    assert_eq!(stats.utilization("gpu"), Some(0.0));
}

#[test]
fn work_response_carries_requirements() {
    let scheduler = gpu_scheduler(4);
    scheduler
        .add_task(AddTaskRequest::new("w", "a").resource("gpu", 2).priority(7))
        .unwrap();

    let work = scheduler.get_work("w").unwrap();
    let json = serde_json::to_value(&work).unwrap();
    assert_eq!(json["task_id"], "a");
    assert_eq!(json["priority"], 7);
    assert_eq!(json["resources"]["gpu"], 2);
    assert_eq!(json["n_pending_tasks"], 0);
}

#[test]
fn huge_unconstrained_requests_do_not_poison_the_scheduler() {
    let scheduler = Scheduler::new();
    for id in ["a", "b"] {
        scheduler
            .add_task(AddTaskRequest::new("w", id).resource("licenses", 3_000_000_000))
            .unwrap();
    }

    assert_eq!(scheduler.get_work("w").unwrap().task_id.as_deref(), Some("a"));
    assert_eq!(scheduler.get_work("w").unwrap().task_id.as_deref(), Some("b"));
    assert_eq!(scheduler.resources_in_use().unwrap().get("licenses"), Some(&u32::MAX));

    scheduler
        .add_task(AddTaskRequest::new("w", "a").status(TaskStatus::Done))
        .unwrap();
    assert!(scheduler.stats().is_ok());
}
