use kube_pico_cd::{
    ApplyError, ApplyFailurePolicy, Applier, InMemoryQueue, ListenerConfig, QueueError, QueueSink,
    ReconciliationDecision, ReconciliationLoop, StaticWatermarks, WatermarkReadError,
    WatermarkStore,
};
use serde_json::json;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

#[derive(Clone, Default)]
struct RecordingApplier {
    applied: Rc<RefCell<Vec<String>>>,
    failures: Rc<RefCell<VecDeque<ApplyError>>>,
}

impl RecordingApplier {
    fn applied(&self) -> Vec<String> {
        self.applied.borrow().clone()
    }

    fn fail_next(&self, error: ApplyError) {
        self.failures.borrow_mut().push_back(error);
    }
}

impl Applier for RecordingApplier {
    fn apply(&mut self, manifest_bundle: &str) -> Result<(), ApplyError> {
        self.applied.borrow_mut().push(manifest_bundle.to_string());
        match self.failures.borrow_mut().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

struct UnreachableWatermarks;

impl WatermarkStore for UnreachableWatermarks {
    fn read(&mut self, _key: &str) -> Result<u64, WatermarkReadError> {
        Err(WatermarkReadError::Unreachable("connection refused".into()))
    }
}

fn config() -> ListenerConfig {
    let mut config = ListenerConfig::new("deploy-queue", "apps");
    config.max_messages = 10;
    config.wait = Duration::ZERO;
    config.receive_backoff = Duration::ZERO;
    config.receive_backoff_max = Duration::ZERO;
    config
}

fn deployment(identifier: u64) -> String {
    json!({
        "data": { "BUILD_TIMESTAMP": identifier.to_string() },
        "manifests": format!("doc-{identifier}"),
    })
    .to_string()
}

fn queue_with(bodies: &[String]) -> InMemoryQueue {
    let mut queue = InMemoryQueue::new();
    for body in bodies {
        queue.send(body).unwrap();
    }
    queue
}

#[test]
fn out_of_order_batch_is_decided_per_message() {
    let queue = queue_with(&[deployment(5), deployment(3), deployment(7)]);
    let applier = RecordingApplier::default();
    let watermarks = StaticWatermarks::new().with("build-info", 4);
    let mut reconciler =
        ReconciliationLoop::new(queue.clone(), watermarks, applier.clone(), config());

    let report = reconciler.poll_once();

    assert_eq!(
        report.decisions(),
        vec![
            ReconciliationDecision::Apply,
            ReconciliationDecision::Skip,
            ReconciliationDecision::Apply,
        ]
    );
    assert_eq!(applier.applied(), vec!["doc-5", "doc-7"]);
    assert_eq!(queue.deleted_ids().len(), 3);
    assert_eq!(queue.in_flight_len(), 0);
    let stats = reconciler.stats();
    assert_eq!(stats.applied, 2);
    assert_eq!(stats.skipped, 1);
}

#[test]
fn equal_identifier_is_reapplied() {
    let queue = queue_with(&[deployment(1000)]);
    let applier = RecordingApplier::default();
    let watermarks = StaticWatermarks::new().with("build-info", 1000);
    let mut reconciler = ReconciliationLoop::new(queue, watermarks, applier.clone(), config());

    let report = reconciler.poll_once();

    assert_eq!(report.decisions(), vec![ReconciliationDecision::Apply]);
    assert_eq!(report.outcomes[0].watermark, Some(1000));
    assert_eq!(applier.applied(), vec!["doc-1000"]);
}

#[test]
fn older_identifier_is_skipped_without_applying() {
    let queue = queue_with(&[deployment(999)]);
    let applier = RecordingApplier::default();
    let watermarks = StaticWatermarks::new().with("build-info", 1000);
    let mut reconciler =
        ReconciliationLoop::new(queue.clone(), watermarks, applier.clone(), config());

    let report = reconciler.poll_once();

    assert_eq!(report.decisions(), vec![ReconciliationDecision::Skip]);
    assert!(applier.applied().is_empty());
    assert!(report.outcomes[0].acknowledged);
    assert_eq!(queue.deleted_ids(), vec!["msg-1".to_string()]);
}

#[test]
fn unreadable_watermark_falls_back_to_apply() {
    let queue = queue_with(&[deployment(1)]);
    let applier = RecordingApplier::default();
    let mut reconciler =
        ReconciliationLoop::new(queue, UnreachableWatermarks, applier.clone(), config());

    let report = reconciler.poll_once();

    assert_eq!(report.decisions(), vec![ReconciliationDecision::Apply]);
    assert_eq!(report.outcomes[0].watermark, Some(0));
    assert_eq!(applier.applied(), vec!["doc-1"]);
    assert_eq!(reconciler.stats().watermark_fallbacks, 1);
}

#[test]
fn missing_watermark_config_map_counts_as_nothing_applied() {
    let queue = queue_with(&[deployment(42)]);
    let applier = RecordingApplier::default();
    let mut reconciler =
        ReconciliationLoop::new(queue, StaticWatermarks::new(), applier.clone(), config());

    let report = reconciler.poll_once();

    assert_eq!(report.decisions(), vec![ReconciliationDecision::Apply]);
    assert_eq!(applier.applied().len(), 1);
}

#[test]
fn malformed_messages_are_acknowledged_without_applying() {
    let bodies = vec![
        json!({ "data": { "BRANCH_NAME": "main" }, "manifests": "doc" }).to_string(),
        json!({ "data": { "BUILD_TIMESTAMP": "yesterday" }, "manifests": "doc" }).to_string(),
        "not json at all".to_string(),
        json!({ "manifests": "doc" }).to_string(),
    ];
    let queue = queue_with(&bodies);
    let applier = RecordingApplier::default();
    let mut reconciler = ReconciliationLoop::new(
        queue.clone(),
        StaticWatermarks::new(),
        applier.clone(),
        config(),
    );

    let report = reconciler.poll_once();

    assert_eq!(
        report.decisions(),
        vec![ReconciliationDecision::DeferUnparseable; 4]
    );
    assert!(report.outcomes.iter().all(|outcome| outcome.acknowledged));
    assert!(report.outcomes.iter().all(|outcome| outcome.identifier.is_none()));
    assert!(applier.applied().is_empty());
    assert_eq!(queue.deleted_ids().len(), 4);
    assert_eq!(reconciler.stats().discarded, 4);
}

#[test]
fn message_names_its_watermark_config_map() {
    let body = json!({
        "data": { "BUILD_TIMESTAMP": "50", "CONFIG_MAP_NAME": "payments-build" },
        "manifests": "doc-50",
    })
    .to_string();
    let queue = queue_with(&[body]);
    let applier = RecordingApplier::default();
    let watermarks = StaticWatermarks::new()
        .with("build-info", 0)
        .with("payments-build", 100);
    let mut reconciler = ReconciliationLoop::new(queue, watermarks, applier.clone(), config());

    let report = reconciler.poll_once();

    assert_eq!(report.decisions(), vec![ReconciliationDecision::Skip]);
    assert_eq!(
        report.outcomes[0].config_map.as_deref(),
        Some("payments-build")
    );
    assert!(applier.applied().is_empty());
}

#[test]
fn configured_identifier_key_is_used() {
    let body = json!({
        "data": { "RUN_ID": "12", "BUILD_TIMESTAMP": "1" },
        "manifests": "doc-12",
    })
    .to_string();
    let queue = queue_with(&[body]);
    let applier = RecordingApplier::default();
    let mut config = config();
    config.identifier_key = "RUN_ID".into();
    let watermarks = StaticWatermarks::new().with("build-info", 10);
    let mut reconciler = ReconciliationLoop::new(queue, watermarks, applier.clone(), config);

    let report = reconciler.poll_once();

    assert_eq!(report.outcomes[0].identifier, Some(12));
    assert_eq!(report.decisions(), vec![ReconciliationDecision::Apply]);
}

#[test]
fn failed_apply_is_dropped_by_default() {
    let queue = queue_with(&[deployment(8)]);
    let applier = RecordingApplier::default();
    applier.fail_next(ApplyError::Failed {
        status: "exit status: 1".into(),
        stderr: "admission webhook denied".into(),
    });
    let mut reconciler = ReconciliationLoop::new(
        queue.clone(),
        StaticWatermarks::new(),
        applier.clone(),
        config(),
    );

    let report = reconciler.poll_once();

    let outcome = &report.outcomes[0];
    assert_eq!(outcome.decision, ReconciliationDecision::Apply);
    assert!(outcome.apply_error.is_some());
    assert!(outcome.acknowledged);
    assert_eq!(queue.in_flight_len(), 0);
    assert_eq!(queue.visible_len(), 0);
    assert_eq!(reconciler.stats().apply_failures, 1);
}

#[test]
fn failed_apply_is_redelivered_when_configured() {
    let queue = queue_with(&[deployment(8)]);
    let applier = RecordingApplier::default();
    applier.fail_next(ApplyError::Rejected("invalid manifest".into()));
    let mut config = config();
    config.apply_failure_policy = ApplyFailurePolicy::Redeliver;
    let mut reconciler = ReconciliationLoop::new(
        queue.clone(),
        StaticWatermarks::new(),
        applier.clone(),
        config,
    );

    let first = reconciler.poll_once();
    assert!(!first.outcomes[0].acknowledged);
    assert_eq!(queue.in_flight_len(), 1);

    assert_eq!(queue.redeliver_in_flight(), 1);
    let second = reconciler.poll_once();
    assert!(second.outcomes[0].acknowledged);
    assert!(second.outcomes[0].apply_error.is_none());
    assert_eq!(applier.applied(), vec!["doc-8", "doc-8"]);
    assert_eq!(queue.deleted_ids().len(), 1);
}

#[test]
fn failed_delete_leaves_message_for_redelivery() {
    let queue = queue_with(&[deployment(20)]);
    queue.fail_next_delete(QueueError::Transport("connection reset".into()));
    let applier = RecordingApplier::default();
    let mut reconciler = ReconciliationLoop::new(
        queue.clone(),
        StaticWatermarks::new(),
        applier.clone(),
        config(),
    );

    let first = reconciler.poll_once();
    assert!(!first.outcomes[0].acknowledged);
    assert_eq!(reconciler.stats().ack_failures, 1);

    // The bundle carried the watermark, so the cluster now records 20.
    reconciler.watermarks_mut().set("build-info", 20);
    queue.redeliver_in_flight();
    let second = reconciler.poll_once();

    assert_eq!(second.decisions(), vec![ReconciliationDecision::Apply]);
    assert!(second.outcomes[0].acknowledged);
    assert_eq!(applier.applied(), vec!["doc-20", "doc-20"]);
}

#[test]
fn receive_failure_does_not_stop_polling() {
    let queue = queue_with(&[deployment(3)]);
    queue.fail_next_receive(QueueError::Transport("timed out".into()));
    let applier = RecordingApplier::default();
    let mut reconciler = ReconciliationLoop::new(
        queue.clone(),
        StaticWatermarks::new(),
        applier.clone(),
        config(),
    );

    let failed = reconciler.poll_once();
    assert!(failed.receive_error.is_some());
    assert!(failed.outcomes.is_empty());
    assert_eq!(failed.backoff, Some(Duration::ZERO));

    let recovered = reconciler.poll_once();
    assert_eq!(recovered.decisions(), vec![ReconciliationDecision::Apply]);
    assert_eq!(reconciler.stats().receive_failures, 1);
}

#[test]
fn empty_polls_count_as_idle_until_a_message_arrives() {
    let mut queue = InMemoryQueue::new();
    let applier = RecordingApplier::default();
    let mut reconciler = ReconciliationLoop::new(
        queue.clone(),
        StaticWatermarks::new(),
        applier.clone(),
        config(),
    );

    for _ in 0..3 {
        assert!(reconciler.poll_once().is_idle());
    }
    assert_eq!(reconciler.idle_polls(), 3);
    assert_eq!(reconciler.stats().empty_polls, 3);

    queue.send(&deployment(1)).unwrap();
    let report = reconciler.poll_once();
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(reconciler.idle_polls(), 0);
}

#[test]
fn batch_size_is_bounded_by_max_messages() {
    let queue = queue_with(&[deployment(1), deployment(2), deployment(3)]);
    let applier = RecordingApplier::default();
    let mut config = config();
    config.max_messages = 2;
    let mut reconciler =
        ReconciliationLoop::new(queue.clone(), StaticWatermarks::new(), applier, config);

    assert_eq!(reconciler.poll_once().outcomes.len(), 2);
    assert_eq!(reconciler.poll_once().outcomes.len(), 1);
    assert_eq!(queue.visible_len(), 0);
}

#[test]
fn receive_backoff_doubles_up_to_the_cap_and_resets() {
    let queue = InMemoryQueue::new();
    for _ in 0..4 {
        queue.fail_next_receive(QueueError::Transport("throttled".into()));
    }
    let mut config = config();
    config.receive_backoff = Duration::from_millis(1);
    config.receive_backoff_max = Duration::from_millis(4);
    let mut reconciler = ReconciliationLoop::new(
        queue.clone(),
        StaticWatermarks::new(),
        RecordingApplier::default(),
        config,
    );

    let delays: Vec<_> = (0..4).map(|_| reconciler.poll_once().backoff).collect();
    assert_eq!(
        delays,
        vec![
            Some(Duration::from_millis(1)),
            Some(Duration::from_millis(2)),
            Some(Duration::from_millis(4)),
            Some(Duration::from_millis(4)),
        ]
    );

    let recovered = reconciler.poll_once();
    assert!(recovered.receive_error.is_none());
    assert_eq!(recovered.backoff, None);

    queue.fail_next_receive(QueueError::Transport("throttled".into()));
    assert_eq!(
        reconciler.poll_once().backoff,
        Some(Duration::from_millis(1))
    );
    assert_eq!(reconciler.stats().receive_failures, 5);
}

#[test]
fn failed_receives_do_not_count_as_idle() {
    let queue = InMemoryQueue::new();
    queue.fail_next_receive(QueueError::Transport("timed out".into()));
    queue.fail_next_receive(QueueError::Transport("timed out".into()));
    let mut reconciler = ReconciliationLoop::new(
        queue,
        StaticWatermarks::new(),
        RecordingApplier::default(),
        config(),
    );

    reconciler.poll_once();
    reconciler.poll_once();
    assert_eq!(reconciler.idle_polls(), 0);

    assert!(reconciler.poll_once().is_idle());
    assert_eq!(reconciler.idle_polls(), 1);
}
