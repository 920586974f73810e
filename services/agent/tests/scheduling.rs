//! End-to-end scheduling against the mock process manager.

use std::sync::Arc;
use std::time::Duration;

use tilth_agent::allocation::{Allocation, SystemPaths};
use tilth_agent::manager::{MockCall, MockConnector};
use tilth_agent::scheduler::{Evaluator, EvaluatorState, Scheduler, Source};
use tilth_bus::{Consumer, Message};
use tilth_manifest::{parse_pods, Constraint, FlatMap, Pod, UnitCommand};
use tokio::sync::watch;

const WEB: &str = r#"[{
    "name": "web",
    "constraint": {"${meta.consul}": "true"},
    "units": [{
        "name": "web.service",
        "source": "[Service]\nExecStart=/usr/bin/web --consul=${meta.consul}",
        "transition": {"create": "start", "update": "restart", "destroy": "stop"}
    }]
}]"#;

struct Harness {
    connector: MockConnector,
    evaluator: Evaluator,
    scheduler: Scheduler,
    shutdown: watch::Sender<bool>,
}

fn harness(recovered: Vec<Allocation>) -> Harness {
    let connector = MockConnector::new();
    let evaluator = Evaluator::new(
        EvaluatorState::new(recovered),
        Arc::new(connector.clone()),
        SystemPaths::default(),
    );
    let (shutdown, shutdown_rx) = watch::channel(false);
    let sources = [
        Source::new("agent").with_required(Constraint::new().with("${agent.drain}", "!= true")),
        Source::new("meta"),
    ];
    let scheduler = Scheduler::new(
        &sources,
        vec!["private".to_string(), "public".to_string()],
        evaluator.clone(),
        shutdown_rx,
    );
    Harness {
        connector,
        evaluator,
        scheduler,
        shutdown,
    }
}

fn pods(namespace: &str, src: &str) -> Vec<Pod> {
    parse_pods(namespace, src).unwrap()
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

async fn facts(scheduler: &Scheduler, drain: &str, consul: &str) {
    scheduler
        .consume_message(Message::from_pairs("agent", [("drain", drain)]))
        .await;
    scheduler
        .consume_message(Message::from_pairs("meta", [("consul", consul)]))
        .await;
}

fn command(unit: &str, command: UnitCommand) -> MockCall {
    MockCall::Command {
        unit: unit.to_string(),
        command,
    }
}

#[tokio::test]
async fn test_pod_follows_constraint() {
    let h = harness(Vec::new());
    h.scheduler.sync("private", pods("private", WEB)).await;
    facts(&h.scheduler, "false", "true").await;

    wait_for(|| h.evaluator.metrics().evaluations == 1).await;
    assert!(h
        .connector
        .calls_for("web.service")
        .contains(&command("web.service", UnitCommand::Start)));
    assert!(h
        .connector
        .calls_for("pod-private-web.service")
        .contains(&command("pod-private-web.service", UnitCommand::Start)));
    assert!(h.evaluator.list_actual().contains_key("web"));

    facts(&h.scheduler, "false", "false").await;
    wait_for(|| h.evaluator.metrics().evaluations == 2).await;
    assert!(h
        .connector
        .calls_for("web.service")
        .contains(&MockCall::Delete {
            unit: "web.service".to_string()
        }));
    wait_for(|| h.evaluator.list_actual().is_empty()).await;
    assert_eq!(h.evaluator.metrics().failures, 0);
}

#[tokio::test]
async fn test_fact_change_rerenders_pod() {
    let h = harness(Vec::new());
    let src = WEB.replace(r#""${meta.consul}": "true""#, r#""${meta.consul}": "!= false""#);
    h.scheduler.sync("private", pods("private", &src)).await;
    facts(&h.scheduler, "false", "true").await;
    wait_for(|| h.evaluator.metrics().evaluations == 1).await;

    facts(&h.scheduler, "false", "yes").await;
    wait_for(|| h.evaluator.metrics().evaluations == 2).await;
    assert!(h
        .connector
        .calls_for("web.service")
        .contains(&command("web.service", UnitCommand::Restart)));
}

#[tokio::test]
async fn test_drain_removes_pods() {
    let h = harness(Vec::new());
    h.scheduler.sync("private", pods("private", WEB)).await;
    facts(&h.scheduler, "false", "true").await;
    wait_for(|| h.evaluator.metrics().evaluations == 1).await;

    facts(&h.scheduler, "true", "true").await;
    wait_for(|| h.evaluator.metrics().evaluations == 2).await;
    wait_for(|| h.evaluator.list_actual().is_empty()).await;
    assert!(h
        .connector
        .calls_for("web.service")
        .contains(&command("web.service", UnitCommand::Stop)));
}

#[tokio::test]
async fn test_nothing_runs_until_all_sources_report() {
    let h = harness(Vec::new());
    h.scheduler.sync("private", pods("private", WEB)).await;
    h.scheduler
        .consume_message(Message::from_pairs("meta", [("consul", "true")]))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.evaluator.metrics().evaluations, 0);

    h.scheduler
        .consume_message(Message::from_pairs("agent", [("drain", "false")]))
        .await;
    wait_for(|| h.evaluator.metrics().evaluations == 1).await;
}

#[tokio::test]
async fn test_undeclared_pod_is_removed() {
    let h = harness(Vec::new());
    h.scheduler.sync("private", pods("private", WEB)).await;
    facts(&h.scheduler, "false", "true").await;
    wait_for(|| h.evaluator.metrics().evaluations == 1).await;

    h.scheduler.sync("private", Vec::new()).await;
    wait_for(|| h.evaluator.metrics().evaluations == 2).await;
    wait_for(|| h.evaluator.list_actual().is_empty()).await;
}

#[tokio::test]
async fn test_recovered_orphan_is_removed() {
    let old = pods("private", r#"[{"name": "old", "units": [{"name": "old.service"}]}]"#);
    let recovered =
        Allocation::from_manifest(&old[0], &FlatMap::new(), &SystemPaths::default()).unwrap();
    let h = harness(vec![recovered]);
    assert!(h.evaluator.list_actual().contains_key("old"));

    // Another namespace does not touch it.
    h.scheduler.sync("public", Vec::new()).await;
    assert!(h.evaluator.list_actual().contains_key("old"));

    h.scheduler.sync("private", Vec::new()).await;
    wait_for(|| h.evaluator.metrics().evaluations == 1).await;
    wait_for(|| h.evaluator.list_actual().is_empty()).await;
    assert!(h
        .connector
        .calls_for("old.service")
        .contains(&MockCall::Delete {
            unit: "old.service".to_string()
        }));
}

#[tokio::test]
async fn test_namespace_priority() {
    let h = harness(Vec::new());
    facts(&h.scheduler, "false", "true").await;

    let declare = |unit: &str| {
        format!(
            r#"[{{"name": "web", "units": [{{"name": "{unit}",
                "transition": {{"create": "start", "destroy": "stop"}}}}]}}]"#
        )
    };
    let public = declare("public.service");
    let private = declare("private.service");

    h.scheduler.sync("public", pods("public", &public)).await;
    wait_for(|| h.evaluator.metrics().evaluations == 1).await;

    h.scheduler.sync("private", pods("private", &private)).await;
    wait_for(|| {
        h.evaluator
            .list_actual()
            .get("web")
            .is_some_and(|header| header.namespace == "private")
    })
    .await;
    wait_for(|| h.evaluator.metrics().evaluations == 2).await;

    assert!(h
        .connector
        .calls_for("public.service")
        .contains(&command("public.service", UnitCommand::Stop)));
    assert!(h
        .connector
        .calls_for("private.service")
        .contains(&command("private.service", UnitCommand::Start)));

    // A lower priority namespace cannot take the name back.
    h.scheduler.sync("public", pods("public", &public)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.evaluator.metrics().evaluations, 2);
}

#[tokio::test]
async fn test_shutdown_lets_started_plan_finish() {
    let h = harness(Vec::new());
    h.connector.delay_calls(Duration::from_millis(20));
    h.scheduler.sync("private", pods("private", WEB)).await;
    facts(&h.scheduler, "false", "true").await;

    wait_for(|| !h.connector.calls().is_empty()).await;
    h.shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), h.scheduler.evaluator().drain())
        .await
        .expect("evaluations did not finish");

    assert_eq!(h.evaluator.metrics().evaluations, 1);
    assert_eq!(h.connector.calls().len(), 6);
    assert!(h.evaluator.list_actual().contains_key("web"));
}
