//! Fan-out/fan-in behavior: submission-order results, barrier sequencing,
//! aggregate failure reporting, and races.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use durafan::providers::{InMemoryProvider, Provider};
use durafan::runtime::registry::ActivityRegistry;
use durafan::runtime::{self, OrchestrationStatus};
use durafan::{Client, Event, OrchestrationContext, OrchestrationRegistry, TaskOutput};
use futures::future::join3;

/// Greeting activity where later-submitted inputs finish first, so completion
/// order inverts submission order.
fn greet_registry() -> Arc<ActivityRegistry> {
    Arc::new(
        ActivityRegistry::builder()
            .register("Greet", |city: String| async move {
                let delay_ms = match city.as_str() {
                    "Casablanca" => 120,
                    "Gabbar" => 90,
                    "Marrakesh" | "Samba" => 60,
                    _ => 5,
                };
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                format!("Hello {city}")
            })
            .build(),
    )
}

#[tokio::test]
async fn fan_in_preserves_submission_order() {
    let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    let orchestrations = OrchestrationRegistry::builder()
        .register(
            "GreetCities",
            |ctx: OrchestrationContext, input: String| async move {
                let handles: Vec<_> = input
                    .split(',')
                    .map(|city| ctx.schedule_activity("Greet", city))
                    .collect();
                let results = ctx.wait_all(handles).await?;
                Ok(results.join(";"))
            },
        )
        .build();

    let rt = runtime::Runtime::start_with_store(store.clone(), greet_registry(), orchestrations).await;
    let client = Client::new(store.clone());
    client
        .start_orchestration("fanin-order", "GreetCities", "Casablanca,Marrakesh,Fes")
        .await
        .unwrap();

    let status = client
        .wait_for_orchestration("fanin-order", Duration::from_secs(5))
        .await
        .unwrap();
    match status {
        OrchestrationStatus::Completed { output } => {
            assert_eq!(output, "Hello Casablanca;Hello Marrakesh;Hello Fes");
        }
        other => panic!("expected Completed, got {other:?}"),
    }

    // The activities really did complete in reverse: the barrier, not the
    // arrival order, produced the submission-ordered result.
    let history = store.read("fanin-order").await;
    let scheduled: HashMap<u64, String> = history
        .iter()
        .filter_map(|e| match e {
            Event::ActivityScheduled { event_id, input, .. } => Some((*event_id, input.clone())),
            _ => None,
        })
        .collect();
    let completion_order: Vec<&str> = history
        .iter()
        .filter_map(|e| match e {
            Event::ActivityCompleted { source_event_id, .. } => {
                Some(scheduled[source_event_id].as_str())
            }
            _ => None,
        })
        .collect();
    assert_eq!(completion_order, vec!["Fes", "Marrakesh", "Casablanca"]);

    rt.shutdown().await;
}

#[tokio::test]
async fn sequential_call_starts_only_after_barrier() {
    let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    let orchestrations = OrchestrationRegistry::builder()
        .register(
            "GreetThenTokyo",
            |ctx: OrchestrationContext, input: String| async move {
                let handles: Vec<_> = input
                    .split(',')
                    .map(|city| ctx.schedule_activity("Greet", city))
                    .collect();
                let mut results = ctx.wait_all(handles).await?;
                let tokyo = ctx.schedule_activity("Greet", "Tokyo").into_activity().await?;
                results.push(tokyo);
                Ok(results.join(";"))
            },
        )
        .build();

    let rt = runtime::Runtime::start_with_store(store.clone(), greet_registry(), orchestrations).await;
    let client = Client::new(store.clone());
    client
        .start_orchestration("fanin-seq", "GreetThenTokyo", "Casablanca,Marrakesh,Fes")
        .await
        .unwrap();

    let status = client
        .wait_for_orchestration("fanin-seq", Duration::from_secs(5))
        .await
        .unwrap();
    match status {
        OrchestrationStatus::Completed { output } => {
            assert_eq!(
                output,
                "Hello Casablanca;Hello Marrakesh;Hello Fes;Hello Tokyo"
            );
        }
        other => panic!("expected Completed, got {other:?}"),
    }

    // The sequential call was only dispatched once every fan-out member had a
    // completion recorded.
    let history = store.read("fanin-seq").await;
    let tokyo_scheduled_at = history
        .iter()
        .position(|e| matches!(e, Event::ActivityScheduled { input, .. } if input == "Tokyo"))
        .expect("Tokyo was scheduled");
    let completions_before_tokyo = history[..tokyo_scheduled_at]
        .iter()
        .filter(|e| matches!(e, Event::ActivityCompleted { .. }))
        .count();
    assert_eq!(completions_before_tokyo, 3);

    rt.shutdown().await;
}

#[tokio::test]
async fn wait_all_aggregates_member_failures() {
    let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    let activities = Arc::new(
        ActivityRegistry::builder()
            .register_result("Step", |input: String| async move {
                if input == "two" {
                    Err("boom-two".to_string())
                } else {
                    Ok(format!("ok-{input}"))
                }
            })
            .build(),
    );
    let orchestrations = OrchestrationRegistry::builder()
        .register(
            "PartialFailure",
            |ctx: OrchestrationContext, _input: String| async move {
                let handles = vec![
                    ctx.schedule_activity("Step", "one"),
                    ctx.schedule_activity("Step", "two"),
                    ctx.schedule_activity("Step", "three"),
                ];
                let results = ctx.wait_all(handles).await?;
                Ok(results.join(";"))
            },
        )
        .build();

    let rt = runtime::Runtime::start_with_store(store.clone(), activities, orchestrations).await;
    let client = Client::new(store.clone());
    client
        .start_orchestration("fanin-fail", "PartialFailure", "")
        .await
        .unwrap();

    let status = client
        .wait_for_orchestration("fanin-fail", Duration::from_secs(5))
        .await
        .unwrap();
    match status {
        OrchestrationStatus::Failed { error } => {
            assert!(error.contains("1 of 3"), "error was: {error}");
            assert!(error.contains("[1] activity 'Step': boom-two"), "error was: {error}");
            // Succeeded members are not smuggled out as a success.
            assert!(!error.contains("ok-one"), "error was: {error}");
        }
        other => panic!("expected Failed, got {other:?}"),
    }

    rt.shutdown().await;
}

#[tokio::test]
async fn wait_any_resolves_with_first_completion() {
    let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    let activities = Arc::new(
        ActivityRegistry::builder()
            .register("Slow", |_input: String| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                "slow".to_string()
            })
            .register("Fast", |_input: String| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                "fast".to_string()
            })
            .build(),
    );
    let orchestrations = OrchestrationRegistry::builder()
        .register(
            "Race",
            |ctx: OrchestrationContext, _input: String| async move {
                let slow = ctx.schedule_activity("Slow", "");
                let fast = ctx.schedule_activity("Fast", "");
                let (winner, output) = ctx.wait_any(vec![slow, fast]).await;
                match output {
                    TaskOutput::Activity(Ok(value)) => Ok(format!("winner={winner},value={value}")),
                    other => Err(format!("unexpected output: {other:?}")),
                }
            },
        )
        .build();

    let rt = runtime::Runtime::start_with_store(store.clone(), activities, orchestrations).await;
    let client = Client::new(store.clone());
    client.start_orchestration("race-1", "Race", "").await.unwrap();

    let status = client
        .wait_for_orchestration("race-1", Duration::from_secs(5))
        .await
        .unwrap();
    match status {
        OrchestrationStatus::Completed { output } => assert_eq!(output, "winner=1,value=fast"),
        other => panic!("expected Completed, got {other:?}"),
    }

    // The loser is not cancelled, but its late result lands on a terminal
    // instance and is discarded rather than recorded.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let history = store.read("race-1").await;
    let completions = history
        .iter()
        .filter(|e| matches!(e, Event::ActivityCompleted { .. }))
        .count();
    assert_eq!(completions, 1);

    rt.shutdown().await;
}

#[tokio::test]
async fn standard_combinators_drive_parallel_activities() {
    let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    let orchestrations = OrchestrationRegistry::builder()
        .register(
            "TripleGreet",
            |ctx: OrchestrationContext, _input: String| async move {
                let a = ctx.schedule_activity("Greet", "Gabbar").into_activity();
                let b = ctx.schedule_activity("Greet", "Samba").into_activity();
                let c = ctx.schedule_activity("Greet", "Basanti").into_activity();
                let (ra, rb, rc) = join3(a, b, c).await;
                Ok([ra?, rb?, rc?].join(";"))
            },
        )
        .build();

    let rt = runtime::Runtime::start_with_store(store.clone(), greet_registry(), orchestrations).await;
    let client = Client::new(store.clone());
    client
        .start_orchestration("combinators-1", "TripleGreet", "")
        .await
        .unwrap();

    let status = client
        .wait_for_orchestration("combinators-1", Duration::from_secs(5))
        .await
        .unwrap();
    match status {
        OrchestrationStatus::Completed { output } => {
            assert_eq!(output, "Hello Gabbar;Hello Samba;Hello Basanti");
        }
        other => panic!("expected Completed, got {other:?}"),
    }

    rt.shutdown().await;
}
