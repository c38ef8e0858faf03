#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use v2t_core::{BranchKind, BranchState, ErrorCategory, EventPayload, WorkspaceStage};
use v2t_runtime::testutil::{
    FakeDownloader, FakeTranscriber, ScriptedGenerator, adapters, chunks, wait_for_stage,
};
use v2t_runtime::{Engine, EngineError};
use v2t_settings::V2tSettings;

const SOURCE: &str = "have a look https://www.bilibili.com/video/BV1xx411c7mD !";

fn engine() -> Engine {
    Engine::new(
        V2tSettings::default(),
        adapters(Arc::new(ScriptedGenerator::new())),
    )
}

fn types(events: &[v2t_core::Event]) -> Vec<&'static str> {
    events.iter().map(|e| e.payload.type_name()).collect()
}

#[tokio::test]
async fn submit_completes_with_transcript() {
    let engine = engine();
    let id = engine.submit(SOURCE).unwrap();

    let ws = wait_for_stage(&engine, &id, WorkspaceStage::Completed).await.unwrap();
    assert_eq!(ws.stage, WorkspaceStage::Completed);
    assert_eq!(ws.source, "https://www.bilibili.com/video/BV1xx411c7mD");
    assert_eq!(ws.title.as_deref(), Some("video"));
    assert_eq!(ws.transcript.as_deref(), Some("hello world"));
    assert!(ws.media.is_some());
    assert!(ws.branches.is_empty());
}

#[tokio::test]
async fn stage_events_arrive_in_order_and_stream_closes() {
    let engine = engine();
    let id = engine.submit(SOURCE).unwrap();
    // Nothing has run yet on the current-thread runtime.
    let sub = engine.subscribe_workspace(&id).unwrap();
    let events = tokio::time::timeout(Duration::from_secs(5), sub.collect_all())
        .await
        .unwrap();

    let stages: Vec<_> = events
        .iter()
        .filter_map(v2t_runtime::testutil::stage_of)
        .collect();
    assert_eq!(
        stages,
        vec![
            WorkspaceStage::Pending,
            WorkspaceStage::Downloading,
            WorkspaceStage::Downloading,
            WorkspaceStage::Transcribing,
            WorkspaceStage::Ready,
            WorkspaceStage::Completed,
        ]
    );
    assert_eq!(
        events.iter().map(|e| e.seq).collect::<Vec<_>>(),
        vec![1, 2, 3, 4, 5, 6]
    );
}

#[tokio::test]
async fn workspace_without_branches_settles_and_later_subscribers_get_snapshot_only() {
    let engine = engine();
    let id = engine.submit(SOURCE).unwrap();
    let ws = wait_for_stage(&engine, &id, WorkspaceStage::Completed).await.unwrap();
    assert!(ws.branches.is_empty());

    let sub = engine.subscribe_workspace(&id).unwrap();
    let events = tokio::time::timeout(Duration::from_secs(1), sub.collect_all())
        .await
        .unwrap();
    assert_eq!(types(&events), vec!["snapshot"]);
    assert_eq!(
        v2t_runtime::testutil::stage_of(&events[0]),
        Some(WorkspaceStage::Completed)
    );
}

#[tokio::test]
async fn submit_rejects_empty_or_urlless_source() {
    let engine = engine();
    assert_matches!(engine.submit(""), Err(EngineError::Validation(_)));
    assert_matches!(engine.submit("   "), Err(EngineError::Validation(_)));
    assert_matches!(
        engine.submit("no link in here"),
        Err(EngineError::Validation(_))
    );
}

#[tokio::test]
async fn download_failure_publishes_status_then_error_and_closes() {
    let mut adapters = adapters(Arc::new(ScriptedGenerator::new()));
    adapters.downloader = Arc::new(FakeDownloader::failing("HTTP 404"));
    let engine = Engine::new(V2tSettings::default(), adapters);

    let id = engine.submit(SOURCE).unwrap();
    let sub = engine.subscribe_workspace(&id).unwrap();
    let events = tokio::time::timeout(Duration::from_secs(5), sub.collect_all())
        .await
        .unwrap();

    assert_eq!(types(&events), vec!["snapshot", "status", "status", "error"]);
    assert_eq!(
        events.iter().map(|e| e.seq).collect::<Vec<_>>(),
        vec![1, 2, 3, 4]
    );
    assert_eq!(
        v2t_runtime::testutil::stage_of(&events[2]),
        Some(WorkspaceStage::Failed)
    );
    assert_matches!(
        &events[3].payload,
        EventPayload::Error { branch_id: None, category: ErrorCategory::Adapter, reason }
            if reason.contains("HTTP 404")
    );

    let ws = engine.get(&id).unwrap();
    assert_eq!(ws.stage, WorkspaceStage::Failed);
    assert!(ws.error.unwrap().contains("HTTP 404"));
    assert!(ws.transcript.is_none());
}

#[tokio::test]
async fn transcription_failure_fails_workspace() {
    let mut adapters = adapters(Arc::new(ScriptedGenerator::new()));
    adapters.transcriber = Arc::new(FakeTranscriber::failing("model unavailable"));
    let engine = Engine::new(V2tSettings::default(), adapters);

    let id = engine.submit(SOURCE).unwrap();
    let ws = wait_for_stage(&engine, &id, WorkspaceStage::Failed).await.unwrap();
    assert_eq!(ws.stage, WorkspaceStage::Failed);
    assert_eq!(ws.title.as_deref(), Some("video"));
    assert!(ws.error.unwrap().contains("model unavailable"));
}

#[tokio::test]
async fn empty_transcript_fails_workspace() {
    let mut adapters = adapters(Arc::new(ScriptedGenerator::new()));
    adapters.transcriber = Arc::new(FakeTranscriber::ok("  \n"));
    let engine = Engine::new(V2tSettings::default(), adapters);

    let id = engine.submit(SOURCE).unwrap();
    let ws = wait_for_stage(&engine, &id, WorkspaceStage::Ready).await.unwrap();
    assert_eq!(ws.stage, WorkspaceStage::Failed);
}

#[tokio::test]
async fn media_over_duration_limit_is_rejected() {
    let mut settings = V2tSettings::default();
    settings.pipeline.max_media_duration_secs = 60;
    let mut adapters = adapters(Arc::new(ScriptedGenerator::new()));
    adapters.downloader = Arc::new(FakeDownloader::with_duration("long", 120));
    let engine = Engine::new(settings, adapters);

    let id = engine.submit(SOURCE).unwrap();
    let ws = wait_for_stage(&engine, &id, WorkspaceStage::Ready).await.unwrap();
    assert_eq!(ws.stage, WorkspaceStage::Failed);
    assert!(ws.error.unwrap().contains("limit is 60s"));
}

#[tokio::test]
async fn media_within_duration_limit_is_accepted() {
    let mut settings = V2tSettings::default();
    settings.pipeline.max_media_duration_secs = 60;
    let mut adapters = adapters(Arc::new(ScriptedGenerator::new()));
    adapters.downloader = Arc::new(FakeDownloader::with_duration("short", 60));
    let engine = Engine::new(settings, adapters);

    let id = engine.submit(SOURCE).unwrap();
    let ws = wait_for_stage(&engine, &id, WorkspaceStage::Completed).await.unwrap();
    assert_eq!(ws.stage, WorkspaceStage::Completed);
    assert_eq!(ws.duration_secs, Some(60));
}

#[tokio::test(start_paused = true)]
async fn download_timeout_fails_workspace() {
    let mut settings = V2tSettings::default();
    settings.pipeline.download_timeout_ms = 1_000;
    let mut adapters = adapters(Arc::new(ScriptedGenerator::new()));
    adapters.downloader = Arc::new(FakeDownloader::hanging());
    let engine = Engine::new(settings, adapters);

    let id = engine.submit(SOURCE).unwrap();
    let ws = wait_for_stage(&engine, &id, WorkspaceStage::Failed).await.unwrap();
    assert_eq!(ws.stage, WorkspaceStage::Failed);
    assert!(ws.error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn cancel_in_flight_workspace() {
    let mut adapters = adapters(Arc::new(ScriptedGenerator::new()));
    adapters.downloader = Arc::new(FakeDownloader::hanging());
    let engine = Engine::new(V2tSettings::default(), adapters);

    let id = engine.submit(SOURCE).unwrap();
    let sub = engine.subscribe_workspace(&id).unwrap();
    engine.cancel_workspace(&id).unwrap();

    let events = tokio::time::timeout(Duration::from_secs(5), sub.collect_all())
        .await
        .unwrap();
    assert_matches!(
        &events.last().unwrap().payload,
        EventPayload::Error { branch_id: None, category: ErrorCategory::Cancelled, .. }
    );
    assert_eq!(engine.get(&id).unwrap().stage, WorkspaceStage::Failed);

    assert_matches!(
        engine.cancel_workspace(&id),
        Err(EngineError::InvalidState(_))
    );
}

#[tokio::test]
async fn unknown_workspace_is_not_found() {
    let engine = engine();
    let id = v2t_core::WorkspaceId::new();
    assert_matches!(engine.get(&id), Err(EngineError::NotFound(_)));
    assert_matches!(engine.subscribe_workspace(&id), Err(EngineError::NotFound(_)));
    assert_matches!(engine.cancel_workspace(&id), Err(EngineError::NotFound(_)));
    assert_matches!(
        engine.start_branch(&id, BranchKind::Outline, None),
        Err(EngineError::NotFound(_))
    );
}

#[tokio::test]
async fn branches_rejected_before_ready() {
    let mut adapters = adapters(Arc::new(ScriptedGenerator::new()));
    adapters.downloader = Arc::new(FakeDownloader::hanging());
    let engine = Engine::new(V2tSettings::default(), adapters);

    let id = engine.submit(SOURCE).unwrap();
    assert_matches!(
        engine.start_branch(&id, BranchKind::Outline, None),
        Err(EngineError::InvalidState(_))
    );
}

#[tokio::test]
async fn auto_start_fans_out_and_completes_workspace() {
    let generator = Arc::new(ScriptedGenerator::new());
    let _ = generator
        .script(BranchKind::Outline, chunks(&["# ", "Outline\n", "- point"]))
        .script(BranchKind::Article, chunks(&["Once ", "upon"]));
    let mut settings = V2tSettings::default();
    settings.branches.auto_start = vec![BranchKind::Outline, BranchKind::Article];
    let engine = Engine::new(settings, adapters(Arc::clone(&generator)));

    let id = engine.submit(SOURCE).unwrap();
    let sub = engine.subscribe_workspace(&id).unwrap();
    let events = tokio::time::timeout(Duration::from_secs(5), sub.collect_all())
        .await
        .unwrap();

    let started = events
        .iter()
        .filter(|e| matches!(e.payload, EventPayload::BranchStarted { .. }))
        .count();
    let done = events
        .iter()
        .filter(|e| matches!(e.payload, EventPayload::Done { .. }))
        .count();
    assert_eq!(started, 2);
    assert_eq!(done, 2);
    assert_eq!(
        v2t_runtime::testutil::stage_of(events.last().unwrap()),
        Some(WorkspaceStage::Completed)
    );

    let ws = engine.get(&id).unwrap();
    assert_eq!(ws.stage, WorkspaceStage::Completed);
    assert_eq!(ws.branches.len(), 2);
    assert!(ws.branches.iter().all(|b| b.state == BranchState::Completed));
    let outline = ws
        .branches
        .iter()
        .find(|b| b.kind == BranchKind::Outline)
        .unwrap();
    assert_eq!(outline.content, "# Outline\n- point");
}

#[tokio::test]
async fn settled_workspaces_are_evicted_after_ttl() {
    let mut settings = V2tSettings::default();
    settings.store.workspace_ttl_secs = 0;
    let mut failing = adapters(Arc::new(ScriptedGenerator::new()));
    failing.downloader = Arc::new(FakeDownloader::failing("gone"));
    let engine = Engine::new(settings, failing);

    let id = engine.submit(SOURCE).unwrap();
    let _ = wait_for_stage(&engine, &id, WorkspaceStage::Failed).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(engine.evict_expired(), 1);
    assert_matches!(engine.get(&id), Err(EngineError::NotFound(_)));
    assert_matches!(engine.subscribe_workspace(&id), Err(EngineError::NotFound(_)));
}

#[tokio::test]
async fn in_flight_workspaces_are_not_evicted() {
    let mut settings = V2tSettings::default();
    settings.store.workspace_ttl_secs = 0;
    let mut adapters = adapters(Arc::new(ScriptedGenerator::new()));
    adapters.downloader = Arc::new(FakeDownloader::hanging());
    let engine = Engine::new(settings, adapters);

    let id = engine.submit(SOURCE).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(engine.evict_expired(), 0);
    assert!(engine.get(&id).is_ok());
}

#[tokio::test]
async fn shutdown_cancels_pipelines_and_closes_streams() {
    let mut adapters = adapters(Arc::new(ScriptedGenerator::new()));
    adapters.downloader = Arc::new(FakeDownloader::hanging());
    let engine = Engine::new(V2tSettings::default(), adapters);

    let id = engine.submit(SOURCE).unwrap();
    let sub = engine.subscribe_workspace(&id).unwrap();
    engine.shutdown().await;

    let events = tokio::time::timeout(Duration::from_secs(1), sub.collect_all())
        .await
        .unwrap();
    assert_matches!(
        &events.last().unwrap().payload,
        EventPayload::Error { category: ErrorCategory::Cancelled, .. }
    );
    assert_eq!(engine.get(&id).unwrap().stage, WorkspaceStage::Failed);
}
