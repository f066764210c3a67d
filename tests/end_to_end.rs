use kube_pico_cd::{
    ApplyError, Applier, InMemoryBroker, ListenerConfig, Publisher, PublisherConfig, QueueSink,
    ReconciliationDecision, ReconciliationLoop, StaticWatermarks,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Default)]
struct SharedApplier {
    applied: Arc<Mutex<Vec<String>>>,
}

impl Applier for SharedApplier {
    fn apply(&mut self, manifest_bundle: &str) -> Result<(), ApplyError> {
        self.applied.lock().unwrap().push(manifest_bundle.to_string());
        Ok(())
    }
}

fn listener_config() -> ListenerConfig {
    let mut config = ListenerConfig::new("deploy-prod", "prod");
    config.wait = Duration::ZERO;
    config.receive_backoff = Duration::ZERO;
    config.receive_backoff_max = Duration::ZERO;
    config
}

#[test]
fn raw_message_bundle_is_applied_verbatim() {
    let broker = InMemoryBroker::new();
    let mut queue = broker.create_queue("deploy-prod");
    queue
        .send(&json!({ "data": { "BUILD_TIMESTAMP": "1000" }, "manifests": "<doc>" }).to_string())
        .unwrap();
    let applier = SharedApplier::default();
    let watermarks = StaticWatermarks::new().with("build-info", 900);
    let mut reconciler =
        ReconciliationLoop::new(queue.clone(), watermarks, applier.clone(), listener_config());

    let report = reconciler.poll_once();

    assert_eq!(report.decisions(), vec![ReconciliationDecision::Apply]);
    assert_eq!(*applier.applied.lock().unwrap(), vec!["<doc>".to_string()]);
    assert_eq!(queue.deleted_ids(), vec!["msg-1".to_string()]);
    assert_eq!(queue.visible_len() + queue.in_flight_len(), 0);
}

#[test]
fn published_build_is_applied_and_redelivery_is_reapplied() {
    let broker = InMemoryBroker::new();
    let queue = broker.create_queue("deploy-prod");
    let mut publisher = Publisher::new(broker.clone(), PublisherConfig::default());
    let receipt = publisher
        .publish("deploy-prod", "<doc>", Some(1000), BTreeMap::new())
        .unwrap();

    let applier = SharedApplier::default();
    let watermarks = StaticWatermarks::new().with("build-info", 900);
    let mut reconciler =
        ReconciliationLoop::new(queue.clone(), watermarks, applier.clone(), listener_config());

    let first = reconciler.poll_once();
    assert_eq!(first.decisions(), vec![ReconciliationDecision::Apply]);
    assert_eq!(
        *applier.applied.lock().unwrap(),
        vec![receipt.message.manifest_bundle.clone()]
    );
    assert_eq!(queue.deleted_ids(), vec![receipt.message_id.clone()]);

    // The applied bundle carried the build-info ConfigMap.
    reconciler.watermarks_mut().set("build-info", 1000);
    let mut producer = queue.clone();
    producer.send(&receipt.message.to_body().unwrap()).unwrap();

    let second = reconciler.poll_once();
    assert_eq!(second.decisions(), vec![ReconciliationDecision::Apply]);
    let applied = applier.applied.lock().unwrap();
    assert_eq!(applied.len(), 2);
    assert_eq!(applied[0], applied[1]);
}

#[test]
fn stale_build_published_after_newer_one_is_skipped() {
    let broker = InMemoryBroker::new();
    let queue = broker.create_queue("deploy-prod");
    let mut publisher = Publisher::new(broker.clone(), PublisherConfig::default());
    publisher
        .publish("deploy-prod", "new", Some(2000), BTreeMap::new())
        .unwrap();
    publisher
        .publish("deploy-prod", "old", Some(1500), BTreeMap::new())
        .unwrap();

    let applier = SharedApplier::default();
    let mut reconciler = ReconciliationLoop::new(
        queue.clone(),
        StaticWatermarks::new().with("build-info", 2000),
        applier.clone(),
        listener_config(),
    );

    let first = reconciler.poll_once();
    let second = reconciler.poll_once();

    assert_eq!(first.decisions(), vec![ReconciliationDecision::Apply]);
    assert_eq!(second.decisions(), vec![ReconciliationDecision::Skip]);
    assert_eq!(applier.applied.lock().unwrap().len(), 1);
    assert_eq!(queue.deleted_ids().len(), 2);
}
