#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use batchd_core::{
        ConfigFile, PruneConfig, RetryPolicy, SchedulerOptions, TaskStatus,
    };
    use chrono::{TimeDelta, Utc};
    use tokio::sync::Notify;

    use crate::runner::Scheduler;
    use crate::snapshot::LoadOutcome;
    use crate::types::AddTaskRequest;

    /// Prune config that forgets every worker with any recorded activity.
    struct Immediate;

    impl PruneConfig for Immediate {
        fn worker_disconnect_delay(&self) -> u64 {
            0
        }
    }

    /// Rewind a worker's clock so it looks silent.
    fn age_worker(scheduler: &Scheduler, worker: &str, secs: i64) {
        let mut inner = scheduler.inner.lock().unwrap();
        let w = inner.state.workers.get_mut(worker).unwrap();
        w.last_active = Some(Utc::now() - TimeDelta::seconds(secs));
    }

    #[test]
    fn scheduler_creation() {
        let scheduler = Scheduler::new();
        assert_eq!(scheduler.default_retry_policy(), RetryPolicy::default());
        assert!(scheduler.get_worker_ids().unwrap().is_empty());
        assert_eq!(scheduler.get_active_tasks().unwrap().len(), 0);
        assert_eq!(scheduler.stats().unwrap().total_tasks(), 0);
    }

    #[test]
    fn from_config_applies_precedence() {
        let file = ConfigFile::default()
            .with_scheduler("disable-num-failures", "44")
            .with_scheduler("retry-delay", "30")
            .with_resource("gpu", "2");
        let scheduler =
            Scheduler::from_config(SchedulerOptions::default().retry_delay(5), &file).unwrap();

        assert_eq!(scheduler.config().disable_failures, 44);
        assert_eq!(scheduler.config().retry_delay, 5);
        assert_eq!(scheduler.resources().get("gpu"), Some(&2));
    }

    #[test]
    fn from_config_surfaces_bad_values() {
        let file = ConfigFile::default().with_resource("gpu", "many");
        assert!(Scheduler::from_config(SchedulerOptions::default(), &file).is_err());
    }

    #[test]
    fn get_work_reports_pending_count() {
        let scheduler = Scheduler::new();
        scheduler.add_task(AddTaskRequest::new("w", "A")).unwrap();
        scheduler.add_task(AddTaskRequest::new("w", "B")).unwrap();

        let first = scheduler.get_work("w").unwrap();
        assert_eq!(first.task_id.as_deref(), Some("A"));
        assert_eq!(first.n_pending_tasks, 1);

        let second = scheduler.get_work("w").unwrap();
        assert_eq!(second.task_id.as_deref(), Some("B"));
        assert_eq!(second.n_pending_tasks, 0);

        let none = scheduler.get_work("w").unwrap();
        assert!(!none.has_work());
        assert_eq!(scheduler.stats().unwrap().assignments, 2);
    }

    #[test]
    fn done_report_releases_resources() {
        let scheduler = Scheduler::with_options(SchedulerOptions::default().resource("gpu", 1));
        scheduler
            .add_task(AddTaskRequest::new("w", "A").resource("gpu", 1))
            .unwrap();
        scheduler
            .add_task(AddTaskRequest::new("w", "B").resource("gpu", 1))
            .unwrap();

        assert_eq!(scheduler.get_work("w").unwrap().task_id.as_deref(), Some("A"));
        assert!(!scheduler.get_work("w").unwrap().has_work());
        assert_eq!(scheduler.resources_in_use().unwrap().get("gpu"), Some(&1));

        scheduler
            .add_task(AddTaskRequest::new("w", "A").status(TaskStatus::Done))
            .unwrap();
        assert!(scheduler.resources_in_use().unwrap().is_empty());
        assert_eq!(scheduler.get_work("w").unwrap().task_id.as_deref(), Some("B"));
    }

    #[test]
    fn ping_registers_worker() {
        let scheduler = Scheduler::new();
        scheduler.ping("w9").unwrap();
        assert!(scheduler.get_worker_ids().unwrap().contains("w9"));
    }

    #[test]
    fn prune_with_narrow_config() {
        let scheduler = Scheduler::new();
        scheduler.ping("w").unwrap();
        age_worker(&scheduler, "w", 5);

        let pruned = scheduler.prune_with(&Immediate).unwrap();
        assert_eq!(pruned, vec!["w"]);
        assert!(scheduler.get_worker_ids().unwrap().is_empty());

        let stats = scheduler.stats().unwrap();
        assert_eq!(stats.workers_pruned, 1);
        assert!(stats.last_prune.is_some());
    }

    #[test]
    fn prune_keeps_recent_workers() {
        let scheduler =
            Scheduler::with_options(SchedulerOptions::default().worker_disconnect_delay(60));
        scheduler.ping("fresh").unwrap();
        scheduler.ping("stale").unwrap();
        age_worker(&scheduler, "stale", 120);

        assert_eq!(scheduler.prune().unwrap(), vec!["stale"]);
        assert_eq!(
            scheduler.get_worker_ids().unwrap().into_iter().collect::<Vec<_>>(),
            vec!["fresh"]
        );
    }

    #[test]
    fn prune_requeues_failed_tasks_after_retry_delay() {
        let scheduler = Scheduler::with_options(SchedulerOptions::default().retry_delay(0));
        scheduler.add_task(AddTaskRequest::new("w", "A")).unwrap();
        scheduler
            .add_task(AddTaskRequest::new("w", "A").status(TaskStatus::Failed))
            .unwrap();
        assert_eq!(scheduler.task("A").unwrap().unwrap().status, TaskStatus::Failed);

        scheduler.prune().unwrap();
        assert_eq!(scheduler.task("A").unwrap().unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn load_rebuilds_resource_usage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.msgpack");
        let options = SchedulerOptions::default().resource("gpu", 2);

        let scheduler = Scheduler::with_options(options.clone());
        scheduler
            .add_task(AddTaskRequest::new("w", "A").resource("gpu", 2))
            .unwrap();
        assert!(scheduler.get_work("w").unwrap().has_work());
        scheduler.dump(&path).unwrap();

        let restored = Scheduler::with_options(options);
        assert!(restored.load(&path).unwrap().is_restored());
        assert_eq!(restored.resources_in_use().unwrap().get("gpu"), Some(&2));
    }

    #[test]
    fn load_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Scheduler::new();
        scheduler.ping("w").unwrap();

        let outcome = scheduler.load(dir.path().join("absent")).unwrap();
        assert_eq!(outcome, LoadOutcome::Missing);
        assert!(scheduler.get_worker_ids().unwrap().is_empty());
    }

    #[test]
    fn re_enable_unknown_task_is_an_error() {
        let scheduler = Scheduler::new();
        assert!(scheduler.re_enable_task("ghost").is_err());
    }

    #[test]
    fn poisoned_lock_is_reported() {
        let scheduler = Arc::new(Scheduler::new());
        let clone = Arc::clone(&scheduler);
        let _ = std::thread::spawn(move || {
            let _guard = clone.inner.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        let err = scheduler.get_work("w").unwrap_err();
        assert!(matches!(err, crate::SchedulerError::LockPoisoned(_)));
    }

    #[tokio::test]
    async fn sweeper_prunes_until_shutdown() {
        let scheduler = Arc::new(Scheduler::new());
        scheduler.ping("w").unwrap();
        age_worker(&scheduler, "w", 3600);

        let shutdown = Arc::new(Notify::new());
        let handle = Arc::clone(&scheduler)
            .spawn_sweeper(Duration::from_millis(10), Arc::clone(&shutdown));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(scheduler.get_worker_ids().unwrap().is_empty());

        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
