mod common;

use common::{instances, latest, run_to_end, scripted, vars, wait_for_task, wait_until, TestCluster, WAIT};
use dagrun::model::{Edge, RetryPolicy, TaskDefinition, TaskState, TaskType, WorkflowDefinition, WorkflowState};
use dagrun::store::MetadataStore;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

fn long_then_short() -> WorkflowDefinition {
    WorkflowDefinition::new("long", 1)
        .with_task(scripted("a", json!({"sleep_ms": 10_000, "sleep_times": 1})))
        .with_task(scripted("b", json!({})))
        .with_edge(Edge::new("a", "b"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pause_kills_running_and_resume_recreates() {
    let cluster = TestCluster::new();
    let master = cluster.start_master("m1", &[long_then_short()]).await;
    let worker = cluster.start_worker("w1").await;

    let id = master.runtime.start_workflow("long", None, HashMap::new()).await.unwrap();
    assert!(wait_for_task(&master.runtime, &id, "a", TaskState::Running).await);

    println!("Step 1: pausing while a is running");
    master.runtime.pause(&id).await.expect("pause should be accepted");
    let runtime = master.runtime.clone();
    let paused = wait_until(WAIT, || {
        let runtime = runtime.clone();
        let id = id.clone();
        async move {
            runtime
                .workflow_status(&id)
                .await
                .map(|s| s.workflow.state == WorkflowState::Pause)
                .unwrap_or(false)
        }
    })
    .await;
    assert!(paused, "workflow should reach PAUSE");
    assert!(wait_for_task(&master.runtime, &id, "a", TaskState::Killed).await);

    let worker_runtime = worker.runtime.clone();
    assert!(
        wait_until(WAIT, || {
            let worker_runtime = worker_runtime.clone();
            async move { worker_runtime.running_count().await == 0 }
        })
        .await,
        "kill should reach the worker"
    );

    println!("Step 2: resuming");
    master.runtime.resume(&id).await.expect("resume should be accepted");
    let (state, snapshot) = run_to_end(&master.runtime, &id).await;

    assert_eq!(state, WorkflowState::Success);
    let attempts = instances(&snapshot, "a");
    assert_eq!(attempts.len(), 2, "resume creates a fresh instance of the cancelled node");
    assert_eq!(attempts[0].state, TaskState::Killed);
    assert_eq!(attempts[1].state, TaskState::Success);
    assert_eq!(latest(&snapshot, "b").state, TaskState::Success);
    assert!(snapshot.workflow.paused_nodes.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resume_requires_pause() {
    let cluster = TestCluster::new();
    let master = cluster.start_master("m1", &[long_then_short()]).await;
    let _worker = cluster.start_worker("w1").await;

    let id = master.runtime.start_workflow("long", None, HashMap::new()).await.unwrap();
    assert!(wait_for_task(&master.runtime, &id, "a", TaskState::Running).await);

    assert!(master.runtime.resume(&id).await.is_err(), "resume of a running workflow is invalid");
    master.runtime.stop(&id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_kills_tasks_and_is_final() {
    let cluster = TestCluster::new();
    let master = cluster.start_master("m1", &[long_then_short()]).await;
    let _worker = cluster.start_worker("w1").await;

    let id = master.runtime.start_workflow("long", None, HashMap::new()).await.unwrap();
    assert!(wait_for_task(&master.runtime, &id, "a", TaskState::Running).await);

    master.runtime.stop(&id).await.expect("stop should be accepted");
    let (state, snapshot) = run_to_end(&master.runtime, &id).await;

    assert_eq!(state, WorkflowState::Stop);
    assert_eq!(latest(&snapshot, "a").state, TaskState::Killed);
    assert!(snapshot.latest("b").is_none(), "no task is created after stop");
    assert!(cluster.tap.kills(&latest(&snapshot, "a").id) >= 1);

    assert!(master.runtime.stop(&id).await.is_err(), "a stopped workflow cannot be stopped again");
    assert!(master.runtime.resume(&id).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_kill_task_is_idempotent() {
    let cluster = TestCluster::new();
    let master = cluster.start_master("m1", &[long_then_short()]).await;
    let _worker = cluster.start_worker("w1").await;

    let id = master.runtime.start_workflow("long", None, HashMap::new()).await.unwrap();
    assert!(wait_for_task(&master.runtime, &id, "a", TaskState::Running).await);
    let task_id = master.runtime.workflow_status(&id).await.unwrap().latest("a").unwrap().id.clone();

    master.runtime.kill_task(&id, &task_id).await.expect("first kill");
    let (state, snapshot) = run_to_end(&master.runtime, &id).await;
    assert_eq!(state, WorkflowState::Failure);
    let killed = latest(&snapshot, "a").clone();
    assert_eq!(killed.state, TaskState::Killed);

    // Killing a terminal task changes nothing
    let _ = master.runtime.kill_task(&id, &task_id).await;
    let again = master.runtime.workflow_status(&id).await.unwrap();
    assert_eq!(latest(&again, "a").history, killed.history);
    assert_eq!(again.workflow.state, WorkflowState::Failure);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_kill_of_finished_task_is_noop() {
    let cluster = TestCluster::new();
    let definition = WorkflowDefinition::new("quick_then_long", 1)
        .with_task(scripted("a", json!({})))
        .with_task(scripted("b", json!({"sleep_ms": 10_000})))
        .with_edge(Edge::new("a", "b"));
    let master = cluster.start_master("m1", &[definition]).await;
    let _worker = cluster.start_worker("w1").await;

    let id = master.runtime.start_workflow("quick_then_long", None, HashMap::new()).await.unwrap();
    assert!(wait_for_task(&master.runtime, &id, "b", TaskState::Running).await);
    let snapshot = master.runtime.workflow_status(&id).await.unwrap();
    let a = latest(&snapshot, "a").clone();

    master.runtime.kill_task(&id, &a.id).await.expect("kill of a finished task is accepted");
    let snapshot = master.runtime.workflow_status(&id).await.unwrap();
    assert_eq!(latest(&snapshot, "a").state, TaskState::Success);
    assert_eq!(latest(&snapshot, "a").history, a.history);
    assert_eq!(snapshot.workflow.state, WorkflowState::Running);

    master.runtime.stop(&id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_kills_then_retries() {
    let cluster = TestCluster::new();
    let definition = WorkflowDefinition::new("slow", 1).with_task(
        scripted("a", json!({"sleep_ms": 5_000, "sleep_times": 1}))
            .with_timeout(Duration::from_millis(200))
            .with_retry(RetryPolicy::fixed(1, Duration::from_millis(50))),
    );
    let master = cluster.start_master("m1", &[definition]).await;
    let _worker = cluster.start_worker("w1").await;

    let id = master.runtime.start_workflow("slow", None, HashMap::new()).await.unwrap();
    let (state, snapshot) = run_to_end(&master.runtime, &id).await;

    assert_eq!(state, WorkflowState::Success);
    let task = latest(&snapshot, "a");
    assert_eq!(task.retry_count, 1);
    assert!(task.history.contains(&TaskState::Retry));
    assert!(cluster.tap.kills(&task.id) >= 1, "the timed-out attempt is killed");
    assert_eq!(cluster.tap.dispatches("a").len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sub_workflow_mirrors_child() {
    let cluster = TestCluster::new();
    let child = WorkflowDefinition::new("child", 1).with_task(scripted("c", json!({"vars": {"child_out": "42"}})));
    let parent = WorkflowDefinition::new("parent", 1)
        .with_task(
            TaskDefinition::new("sub", TaskType::new(TaskType::SUB_WORKFLOW))
                .with_params(json!({"workflow": "child", "check_interval_ms": 100})),
        )
        .with_task(scripted("after", json!({})))
        .with_edge(Edge::new("sub", "after"));
    let master = cluster.start_master("m1", &[child, parent]).await;
    let _worker = cluster.start_worker("w1").await;

    let id = master
        .runtime
        .start_workflow("parent", None, vars(&[("who", "parent")]))
        .await
        .unwrap();
    let (state, snapshot) = run_to_end(&master.runtime, &id).await;

    assert_eq!(state, WorkflowState::Success);
    let sub = latest(&snapshot, "sub");
    assert_eq!(sub.state, TaskState::Success);
    let child_id = sub.sub_workflow_instance_id.clone().expect("child instance recorded");
    assert_eq!(snapshot.workflow.variables.get("child_out").map(String::as_str), Some("42"));
    assert_eq!(latest(&snapshot, "after").state, TaskState::Success);

    let child = master.runtime.workflow_status(&child_id).await.unwrap();
    assert_eq!(child.workflow.state, WorkflowState::Success);
    let link = child.workflow.parent.expect("child links back to its parent");
    assert_eq!(link.workflow_instance_id, id);
    assert_eq!(link.task_instance_id, sub.id);
    assert_eq!(child.workflow.variables.get("who").map(String::as_str), Some("parent"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_child_fails_sub_workflow_task() {
    let cluster = TestCluster::new();
    let child = WorkflowDefinition::new("bad_child", 1).with_task(scripted("c", json!({"fail_times": 1})));
    let parent = WorkflowDefinition::new("bad_parent", 1).with_task(
        TaskDefinition::new("sub", TaskType::new(TaskType::SUB_WORKFLOW)).with_params(json!({"workflow": "bad_child"})),
    );
    let master = cluster.start_master("m1", &[child, parent]).await;
    let _worker = cluster.start_worker("w1").await;

    let id = master.runtime.start_workflow("bad_parent", None, HashMap::new()).await.unwrap();
    let (state, snapshot) = run_to_end(&master.runtime, &id).await;
    assert_eq!(state, WorkflowState::Failure);
    assert_eq!(latest(&snapshot, "sub").state, TaskState::Failure);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_task_pauses_until_resumed() {
    let cluster = TestCluster::new();
    let definition = WorkflowDefinition::new("gated", 1)
        .with_task(scripted("a", json!({})))
        .with_task(
            TaskDefinition::new("gate", TaskType::new(TaskType::BLOCKING))
                .with_params(json!({"dependence": {"items": [{"task": "a", "state": "SUCCESS"}]}})),
        )
        .with_task(scripted("b", json!({})))
        .with_edge(Edge::new("a", "gate"))
        .with_edge(Edge::new("gate", "b"));
    let master = cluster.start_master("m1", &[definition]).await;
    let _worker = cluster.start_worker("w1").await;

    let id = master.runtime.start_workflow("gated", None, HashMap::new()).await.unwrap();
    let runtime = master.runtime.clone();
    let id_for_wait = id.clone();
    let paused = wait_until(WAIT, move || {
        let runtime = runtime.clone();
        let id = id_for_wait.clone();
        async move {
            runtime
                .workflow_status(&id)
                .await
                .map(|s| s.workflow.state == WorkflowState::Pause)
                .unwrap_or(false)
        }
    })
    .await;
    assert!(paused, "the gate should pause the workflow");
    let snapshot = master.runtime.workflow_status(&id).await.unwrap();
    assert_eq!(latest(&snapshot, "gate").state, TaskState::Success);
    assert!(snapshot.latest("b").is_none());

    master.runtime.resume(&id).await.unwrap();
    let (state, snapshot) = run_to_end(&master.runtime, &id).await;
    assert_eq!(state, WorkflowState::Success);
    assert_eq!(latest(&snapshot, "b").state, TaskState::Success);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dependent_waits_for_other_definition() {
    let cluster = TestCluster::new();
    let upstream = WorkflowDefinition::new("upstream", 1).with_task(scripted("u", json!({"sleep_ms": 300})));
    let downstream = WorkflowDefinition::new("downstream", 1)
        .with_task(
            TaskDefinition::new("wait", TaskType::new(TaskType::DEPENDENT)).with_params(json!({
                "dependencies": [{"workflow": "upstream"}],
                "check_interval_ms": 50
            })),
        )
        .with_task(scripted("d", json!({})))
        .with_edge(Edge::new("wait", "d"));
    let master = cluster.start_master("m1", &[upstream, downstream]).await;
    let _worker = cluster.start_worker("w1").await;

    let down = master.runtime.start_workflow("downstream", None, HashMap::new()).await.unwrap();
    assert!(wait_for_task(&master.runtime, &down, "wait", TaskState::Running).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let snapshot = master.runtime.workflow_status(&down).await.unwrap();
    assert_eq!(latest(&snapshot, "wait").state, TaskState::Running, "no upstream instance yet");

    let up = master.runtime.start_workflow("upstream", None, HashMap::new()).await.unwrap();
    let (state, _) = run_to_end(&master.runtime, &up).await;
    assert_eq!(state, WorkflowState::Success);

    let (state, snapshot) = run_to_end(&master.runtime, &down).await;
    assert_eq!(state, WorkflowState::Success);
    assert_eq!(latest(&snapshot, "d").state, TaskState::Success);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dependent_task_times_out() {
    let cluster = TestCluster::new();
    let never_started = WorkflowDefinition::new("never_started", 1).with_task(scripted("n", json!({})));
    let downstream = WorkflowDefinition::new("impatient", 1).with_task(
        TaskDefinition::new("wait", TaskType::new(TaskType::DEPENDENT))
            .with_params(json!({
                "dependencies": [{"workflow": "never_started"}],
                "check_interval_ms": 50
            }))
            .with_timeout(Duration::from_millis(200))
            .with_retry(RetryPolicy::fixed(1, Duration::from_millis(50))),
    );
    let master = cluster.start_master("m1", &[never_started, downstream]).await;
    let _worker = cluster.start_worker("w1").await;

    let id = master.runtime.start_workflow("impatient", None, HashMap::new()).await.unwrap();
    let (state, snapshot) = run_to_end(&master.runtime, &id).await;

    assert_eq!(state, WorkflowState::Failure);
    let wait = latest(&snapshot, "wait");
    assert_eq!(wait.state, TaskState::Failure);
    assert_eq!(wait.retry_count, 1, "the timeout goes through the retry path");
    assert!(wait.history.contains(&TaskState::Retry));
    assert!(wait.message.as_deref().unwrap_or("").contains("timed out"), "message: {:?}", wait.message);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sub_workflow_timeout_stops_child() {
    let cluster = TestCluster::new();
    let child = WorkflowDefinition::new("slow_child", 1).with_task(scripted("c", json!({"sleep_ms": 10_000})));
    let parent = WorkflowDefinition::new("strict_parent", 1).with_task(
        TaskDefinition::new("sub", TaskType::new(TaskType::SUB_WORKFLOW))
            .with_params(json!({"workflow": "slow_child", "check_interval_ms": 100}))
            .with_timeout(Duration::from_millis(300)),
    );
    let master = cluster.start_master("m1", &[child, parent]).await;
    let _worker = cluster.start_worker("w1").await;

    let id = master.runtime.start_workflow("strict_parent", None, HashMap::new()).await.unwrap();
    let (state, snapshot) = run_to_end(&master.runtime, &id).await;
    assert_eq!(state, WorkflowState::Failure);
    let sub = latest(&snapshot, "sub");
    assert_eq!(sub.state, TaskState::Failure);
    assert!(sub.message.as_deref().unwrap_or("").contains("timed out"));

    let child = cluster
        .store
        .latest_workflow_by_definition("slow_child")
        .await
        .unwrap()
        .expect("the child was launched");
    assert_eq!(child.parent.as_ref().map(|p| p.workflow_instance_id.as_str()), Some(id.as_str()));
    let child_state = master.runtime.wait_for_terminal(&child.id, WAIT).await.unwrap();
    assert_eq!(child_state, WorkflowState::Stop, "the child is stopped with its parent task");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stopping_parent_stops_paused_child() {
    let cluster = TestCluster::new();
    let child = WorkflowDefinition::new("gated_child", 1)
        .with_task(scripted("a", json!({})))
        .with_task(
            TaskDefinition::new("gate", TaskType::new(TaskType::BLOCKING))
                .with_params(json!({"dependence": {"items": [{"task": "a", "state": "SUCCESS"}]}})),
        )
        .with_task(scripted("b", json!({})))
        .with_edge(Edge::new("a", "gate"))
        .with_edge(Edge::new("gate", "b"));
    let parent = WorkflowDefinition::new("outer", 1).with_task(
        TaskDefinition::new("sub", TaskType::new(TaskType::SUB_WORKFLOW))
            .with_params(json!({"workflow": "gated_child", "check_interval_ms": 100})),
    );
    let master = cluster.start_master("m1", &[child, parent]).await;
    let _worker = cluster.start_worker("w1").await;

    let id = master.runtime.start_workflow("outer", None, HashMap::new()).await.unwrap();
    let runtime = master.runtime.clone();
    let parent_id = id.clone();
    let child_paused = wait_until(WAIT, move || {
        let runtime = runtime.clone();
        let parent_id = parent_id.clone();
        async move {
            let Ok(snapshot) = runtime.workflow_status(&parent_id).await else {
                return false;
            };
            let Some(child_id) = snapshot.latest("sub").and_then(|t| t.sub_workflow_instance_id.clone()) else {
                return false;
            };
            runtime
                .workflow_status(&child_id)
                .await
                .map(|s| s.workflow.state == WorkflowState::Pause)
                .unwrap_or(false)
        }
    })
    .await;
    assert!(child_paused, "the gate should pause the child");
    let snapshot = master.runtime.workflow_status(&id).await.unwrap();
    let child_id = latest(&snapshot, "sub").sub_workflow_instance_id.clone().unwrap();
    assert!(master.runtime.stop(&child_id).await.is_err(), "an operator stop of a paused instance is refused");

    master.runtime.stop(&id).await.expect("parent stop should be accepted");
    let (state, snapshot) = run_to_end(&master.runtime, &id).await;
    assert_eq!(state, WorkflowState::Stop);
    assert_eq!(latest(&snapshot, "sub").state, TaskState::Killed);

    let child_state = master.runtime.wait_for_terminal(&child_id, WAIT).await.unwrap();
    assert_eq!(child_state, WorkflowState::Stop, "the paused child is not left behind");
    let child = master.runtime.workflow_status(&child_id).await.unwrap();
    assert!(child.workflow.paused_nodes.is_empty());
    assert!(child.latest("b").is_none());
}
