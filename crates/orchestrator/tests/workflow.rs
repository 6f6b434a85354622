mod common;

use std::sync::Arc;

use tokio::sync::Notify;

use querygraph_orchestrator::broadcast::EventType;
use querygraph_orchestrator::engine::state::{DecisionSource, NodeStatus};
use querygraph_orchestrator::engine::{CancelOutcome, ExecutionStatus, NodeName, QueryOptions};
use querygraph_orchestrator::services::Collaborators;

use common::*;

#[tokio::test]
async fn test_tool_query_runs_every_stage() {
    let engine = engine(tool_collaborators());
    let result = engine
        .submit(submission("How many orders per region?", "c1", QueryOptions::default()))
        .await;

    assert_eq!(result.status, ExecutionStatus::Completed);
    let state = &result.state;
    assert!(state.decision.as_ref().unwrap().needs_tool);
    let output = state.tool_output.as_ref().unwrap();
    assert_eq!(output.rows.len(), 2);
    assert!(output.rendered.starts_with("| region | orders |"));
    assert_eq!(state.augmentation.as_ref().unwrap().kind, "bar_chart");
    assert!(state.answer.as_ref().unwrap().starts_with("The answer is ready."));
    for node in ["retrieve", "route", "tool_execute", "augment", "synthesize"] {
        assert_eq!(state.node_status[node].status, NodeStatus::Completed, "{}", node);
    }

    let snapshot = engine.snapshot(&result.execution_id).await.unwrap();
    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert_eq!(snapshot.state, result.state);
}

#[tokio::test]
async fn test_same_inputs_produce_same_outputs() {
    let engine = engine(tool_collaborators());
    let first = engine
        .submit(submission("Total orders by region", "c1", QueryOptions::default()))
        .await;
    let second = engine
        .submit(submission("Total orders by region", "c2", QueryOptions::default()))
        .await;

    assert_ne!(first.execution_id, second.execution_id);
    assert_eq!(first.state.reranked, second.state.reranked);
    assert_eq!(first.state.decision, second.state.decision);
    assert_eq!(first.state.tool_output, second.state.tool_output);
    assert_eq!(first.state.augmentation, second.state.augmentation);
    assert_eq!(first.state.answer, second.state.answer);
}

#[tokio::test]
async fn test_pause_then_resume_matches_uninterrupted_run() {
    let engine = engine(tool_collaborators());
    let query = "How many orders per region?";
    let plain = engine.submit(submission(query, "c1", QueryOptions::default())).await;
    assert_eq!(plain.status, ExecutionStatus::Completed);

    for node in [NodeName::Route, NodeName::ToolExecute, NodeName::Augment, NodeName::Synthesize] {
        let options = QueryOptions {
            pause_before: vec![node],
            ..QueryOptions::default()
        };
        let paused = engine.submit(submission(query, "c1", options)).await;
        assert_eq!(paused.status, ExecutionStatus::Paused, "{}", node);

        let resumed = engine
            .resume(&paused.execution_id, None, None, None, "test")
            .await
            .unwrap();
        assert_eq!(resumed.status, ExecutionStatus::Completed, "{}", node);
        let state = &resumed.state;
        assert_eq!(state.reranked, plain.state.reranked, "{}", node);
        assert_eq!(state.decision, plain.state.decision, "{}", node);
        assert_eq!(state.tool_output, plain.state.tool_output, "{}", node);
        assert_eq!(state.augmentation, plain.state.augmentation, "{}", node);
        assert_eq!(state.answer, plain.state.answer, "{}", node);
        assert!(
            state.node_status.keys().eq(plain.state.node_status.keys()),
            "{}",
            node
        );
    }
}

#[tokio::test]
async fn test_tool_failure_ends_in_error() {
    let engine = engine(Collaborators {
        tool_backend: Arc::new(FailingTool),
        ..tool_collaborators()
    });
    let mut sub = engine.broadcaster().connect("c1").await;

    let result = engine
        .submit(submission("How many orders per region?", "c1", QueryOptions::default()))
        .await;
    assert_eq!(result.status, ExecutionStatus::Error);
    assert!(result.state.tool_output.is_none());
    assert!(result.state.answer.is_none());
    let diagnostic = &result.state.node_status["tool_execute"];
    assert_eq!(diagnostic.status, NodeStatus::Failed);
    assert!(diagnostic.error.as_deref().unwrap().contains("does not exist"));

    let snapshot = engine.snapshot(&result.execution_id).await.unwrap();
    assert_eq!(snapshot.status, ExecutionStatus::Error);

    let events = drain(&mut sub.receiver);
    assert_eq!(started_nodes(&events), vec!["retrieve", "route", "tool_execute"]);
    let tail: Vec<EventType> = events.iter().rev().take(2).map(|e| e.event_type).collect();
    assert_eq!(tail, vec![EventType::ExecutionError, EventType::NodeError]);
    assert_eq!(events.last().unwrap().node_id.as_deref(), Some("tool_execute"));
}

#[tokio::test]
async fn test_augment_failure_degrades_and_completes() {
    let engine = engine(Collaborators {
        augmenter: Arc::new(FailingAugmenter),
        ..tool_collaborators()
    });
    let mut sub = engine.broadcaster().connect("c1").await;

    let result = engine
        .submit(submission("How many orders per region?", "c1", QueryOptions::default()))
        .await;
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.state.node_status["augment"].status, NodeStatus::Degraded);
    assert!(result.state.augmentation.as_ref().unwrap().is_empty());
    assert!(result.state.extensions.contains_key("augmentation_error"));
    assert!(result.state.answer.is_some());

    let events = drain(&mut sub.receiver);
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::NodeError && e.node_id.as_deref() == Some("augment")));
    assert_eq!(events.last().unwrap().event_type, EventType::ExecutionCompleted);
}

#[tokio::test]
async fn test_synthesis_failure_still_completes_token_stream() {
    let engine = engine(Collaborators {
        synthesizer: Arc::new(FailingSynthesizer),
        ..tool_collaborators()
    });
    let mut sub = engine.broadcaster().connect("c1").await;

    let result = engine
        .submit(submission("How many orders per region?", "c1", QueryOptions::default()))
        .await;
    assert_eq!(result.status, ExecutionStatus::Error);
    assert_eq!(result.state.node_status["synthesize"].status, NodeStatus::Failed);

    let events = drain(&mut sub.receiver);
    let tokens: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == EventType::TokenStream)
        .collect();
    let texts: Vec<&str> = tokens.iter().filter_map(|e| e.token.as_deref()).collect();
    assert_eq!(texts, vec!["partial", ""]);
    assert_eq!(tokens.last().unwrap().stream_complete, Some(true));

    let tail: Vec<EventType> = events.iter().rev().take(3).map(|e| e.event_type).collect();
    assert_eq!(
        tail,
        vec![EventType::ExecutionError, EventType::NodeError, EventType::TokenStream]
    );
}

#[tokio::test]
async fn test_heuristic_overrides_primary_decision() {
    let engine = engine(collaborators(FixedDecider {
        needs_tool: true,
        confidence: 0.7,
    }));
    let result = engine
        .submit(submission("What is net revenue retention?", "c1", QueryOptions::default()))
        .await;

    assert_eq!(result.status, ExecutionStatus::Completed);
    let decision = result.state.decision.as_ref().unwrap();
    assert!(!decision.needs_tool);
    assert_eq!(decision.source, DecisionSource::HeuristicOverride);
    assert!(result.state.tool_output.is_none());
    assert!(!result.state.node_status.contains_key("tool_execute"));
}

#[tokio::test]
async fn test_tokens_arrive_in_order_then_complete() {
    let engine = engine(tool_collaborators());
    let mut sub = engine.broadcaster().connect("c1").await;

    let result = engine
        .submit(submission("How many orders per region?", "c1", QueryOptions::default()))
        .await;
    assert_eq!(result.status, ExecutionStatus::Completed);

    let events = drain(&mut sub.receiver);
    let tokens: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == EventType::TokenStream)
        .collect();
    let texts: Vec<&str> = tokens.iter().filter_map(|e| e.token.as_deref()).collect();
    assert_eq!(texts, vec!["The ", "answer ", "is ready.", ""]);
    assert_eq!(tokens.last().unwrap().stream_complete, Some(true));
    assert!(tokens[..3].iter().all(|e| e.stream_complete == Some(false)));

    assert_eq!(events.first().unwrap().event_type, EventType::ExecutionStarted);
    assert_eq!(events.last().unwrap().event_type, EventType::ExecutionCompleted);
    assert_eq!(
        started_nodes(&events),
        vec!["retrieve", "route", "tool_execute", "augment", "synthesize"]
    );
}

#[tokio::test]
async fn test_events_never_cross_clients() {
    let engine = engine(tool_collaborators());
    let mut a = engine.broadcaster().connect("a").await;
    let mut b = engine.broadcaster().connect("b").await;

    let (ea, ha) = engine
        .spawn(submission("How many orders per region?", "a", QueryOptions::default()))
        .await;
    let (eb, hb) = engine
        .spawn(submission("What is churn?", "b", QueryOptions::default()))
        .await;
    ha.await.unwrap();
    hb.await.unwrap();

    let a_events = drain(&mut a.receiver);
    let b_events = drain(&mut b.receiver);
    assert!(!a_events.is_empty());
    assert!(!b_events.is_empty());
    assert!(a_events.iter().all(|e| e.execution_id == ea));
    assert!(b_events.iter().all(|e| e.execution_id == eb));
}

#[tokio::test]
async fn test_cancel_during_retrieval_stops_before_route() {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let collaborators = Collaborators {
        retriever: Arc::new(GatedRetriever {
            started: started.clone(),
            release: release.clone(),
        }),
        ..tool_collaborators()
    };
    let engine = engine(collaborators);
    let mut sub = engine.broadcaster().connect("c1").await;

    let (execution_id, handle) = engine
        .spawn(submission("How many orders per region?", "c1", QueryOptions::default()))
        .await;
    started.notified().await;

    let outcome = engine.cancel(&execution_id, "test").await.unwrap();
    assert_eq!(outcome, CancelOutcome::Requested);
    release.notify_one();

    let result = handle.await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Cancelled);
    assert!(result.state.retrieved.is_some());
    assert!(result.state.decision.is_none());

    let events = drain(&mut sub.receiver);
    assert_eq!(started_nodes(&events), vec!["retrieve"]);
    assert_eq!(events.last().unwrap().event_type, EventType::HitlCancelled);
    assert_eq!(
        engine.registry().status(&execution_id).await,
        Some(ExecutionStatus::Cancelled)
    );

    // Nothing left to cancel.
    assert!(engine.cancel(&execution_id, "test").await.is_err());
}

#[tokio::test]
async fn test_unknown_execution_is_not_found() {
    use querygraph_orchestrator::error::AppError;
    use querygraph_orchestrator::hitl::SuspensionKind;
    use querygraph_orchestrator::registry::SuspendRequest;

    let engine = engine(tool_collaborators());
    assert!(matches!(
        engine.resume("missing", None, None, None, "test").await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        engine.cancel("missing", "test").await,
        Err(AppError::NotFound(_))
    ));
    let request = SuspendRequest {
        kind: SuspensionKind::Pause,
        reason: None,
        initiator: "test".to_string(),
        before: None,
    };
    assert!(matches!(
        engine.request_suspend("missing", request).await,
        Err(AppError::NotFound(_))
    ));
    assert!(engine.snapshot("missing").await.is_none());
}
