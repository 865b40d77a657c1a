//! End-to-end integration tests for the Parley turn pipeline.
//!
//! These tests run whole turns through the orchestrator: context building
//! from a real store, streaming with tool rounds, incremental rendering into a
//! recording sink and persistence.

use std::sync::Arc;
use std::time::Duration;

use parley_agent::testing::{RecordingSink, ScriptStep, ScriptedProvider, SinkOp, StaticMedia, StubSearch};
use parley_agent::{
    ContextBudget, ContextBuilder, Orchestrator, OrchestratorSettings, RedoRequest, TurnFailure, TurnOutcome,
    TurnRequest,
};
use parley_config::AppConfig;
use parley_core::error::ProviderError;
use parley_core::message::{ContentBlock, ConversationId, MediaPart, NoticeKind, Role, Turn, TurnStatus};
use parley_core::provider::StreamEvent;
use parley_core::store::{CommitStatus, TurnStore};
use parley_store::{InMemoryTurnStore, SqliteTurnStore};

// ── Harness ─────────────────────────────────────────────────────────────

struct Pipeline {
    orchestrator: Arc<Orchestrator>,
    provider: Arc<ScriptedProvider>,
    store: Arc<dyn TurnStore>,
    sink: Arc<RecordingSink>,
}

fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        min_render_interval: Duration::ZERO,
        ..OrchestratorSettings::default()
    }
}

fn pipeline_with(provider: ScriptedProvider, store: Arc<dyn TurnStore>) -> Pipeline {
    let provider = Arc::new(provider);
    let sink = Arc::new(RecordingSink::new(3900));
    let tools = parley_tools::default_registry(Arc::new(StubSearch::weather()), &AppConfig::default().tools);
    let orchestrator = Orchestrator::new(provider.clone(), Arc::new(tools), store.clone(), sink.clone(), settings())
        .with_media(Arc::new(StaticMedia));
    Pipeline {
        orchestrator: Arc::new(orchestrator),
        provider,
        store,
        sink,
    }
}

async fn sqlite_pipeline(provider: ScriptedProvider) -> Pipeline {
    let store = SqliteTurnStore::new("sqlite::memory:").await.unwrap();
    pipeline_with(provider, Arc::new(store))
}

fn chat() -> ConversationId {
    ConversationId::from("tg:1001")
}

fn ask(text: &str) -> TurnRequest {
    TurnRequest::text(chat(), "1001", text)
}

fn assistant_kinds(turn: &Turn) -> Vec<&'static str> {
    turn.blocks
        .iter()
        .filter(|b| b.role != Role::User)
        .map(|b| b.content.kind())
        .collect()
}

// ── E2E: Weather scenario ───────────────────────────────────────────────

#[tokio::test]
async fn e2e_weather_question_uses_one_search() {
    let p = sqlite_pipeline(ScriptedProvider::new(vec![
        ScriptedProvider::tool_segment("call_1", "web_search", r#"{"query":"weather in Paris today"}"#),
        ScriptedProvider::text_segment(&["It's sunny ", "in Paris, 21°C."]),
    ]))
    .await;

    let outcome = p.orchestrator.process_turn(ask("What's the weather in Paris?")).await;
    let TurnOutcome::Completed(turn) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };

    assert_eq!(assistant_kinds(&turn), vec!["tool_call_request", "tool_call_result", "text"]);
    let ContentBlock::ToolCallResult { output, is_error, .. } = &turn.blocks[2].content else {
        panic!("block 2 should be the tool result");
    };
    assert!(!is_error);
    assert_eq!(output["results"].as_array().unwrap().len(), 3);
    assert_eq!(turn.rendered_text(), "It's sunny in Paris, 21°C.");

    // The status line was replaced by the answer in the same message.
    let ops = p.sink.ops();
    assert_eq!(ops.first(), Some(&SinkOp::Push("🔍 Searching the web...".into())));
    assert_eq!(ops.last(), Some(&SinkOp::Seal));
    assert_eq!(ops.iter().filter(|op| **op == SinkOp::Seal).count(), 1);

    let stored = p.store.get_turn(&turn.id).await.unwrap().unwrap();
    assert_eq!(stored, turn);
    assert_eq!(p.provider.calls(), 2);
}

// ── E2E: Backend failure ────────────────────────────────────────────────

#[tokio::test]
async fn e2e_connection_drop_keeps_partial_answer_and_conversation_usable() {
    let p = sqlite_pipeline(ScriptedProvider::new(vec![
        vec![
            ScriptStep::Event(StreamEvent::TextDelta("Hello, the capi".into())),
            ScriptStep::Close,
        ],
        ScriptedProvider::text_segment(&["The capital is Paris."]),
    ]))
    .await;

    let outcome = p.orchestrator.process_turn(ask("What is the capital of France?")).await;
    assert!(matches!(
        outcome,
        TurnOutcome::Failed(TurnFailure::Backend(ProviderError::StreamInterrupted(_)))
    ));

    let failed = p.store.recent_turns(&chat(), 1).await.unwrap().remove(0);
    assert_eq!(failed.status, TurnStatus::Failed);
    assert!(failed.rendered_text().starts_with("Hello, the capi\n\n⚠️"));
    assert!(failed.blocks.iter().any(|b| matches!(
        b.content,
        ContentBlock::Notice { kind: NoticeKind::Failure, .. }
    )));
    assert_eq!(p.sink.pushes().last(), Some(&failed.rendered_text()));

    let retry = p.orchestrator.process_turn(ask("Try again please")).await;
    assert!(matches!(retry, TurnOutcome::Completed(_)));

    // The partial text is history; the notice is not replayed to the model.
    let messages = &p.provider.requests()[1].messages;
    assert!(messages.iter().any(|m| m.role == Role::Assistant && m.content == "Hello, the capi"));
    assert!(!messages.iter().any(|m| m.content.contains("⚠️")));
}

#[tokio::test]
async fn e2e_rejected_stream_fails_before_any_text() {
    let p = sqlite_pipeline(ScriptedProvider::new(vec![vec![ScriptStep::Reject(
        ProviderError::AuthenticationFailed("bad key".into()),
    )]]))
    .await;

    let outcome = p.orchestrator.process_turn(ask("hi")).await;
    assert!(matches!(outcome, TurnOutcome::Failed(TurnFailure::Backend(_))));
    let pushes = p.sink.pushes();
    assert_eq!(pushes.len(), 1);
    assert!(pushes[0].starts_with("⚠️ The response was interrupted"));
}

// ── E2E: Tool round limit ───────────────────────────────────────────────

#[tokio::test]
async fn e2e_endless_tool_requests_stop_after_exactly_max_rounds() {
    let p = sqlite_pipeline(ScriptedProvider::repeating(ScriptedProvider::tool_segment(
        "call_loop",
        "web_search",
        r#"{"query":"more"}"#,
    )))
    .await;

    let outcome = p.orchestrator.process_turn(ask("search forever")).await;
    let TurnOutcome::Completed(turn) = outcome else {
        panic!("expected a truncated completion, got {outcome:?}");
    };

    assert_eq!(turn.count_blocks("tool_call_result"), 8);
    assert_eq!(turn.count_blocks("tool_call_request"), 9);
    assert_eq!(p.provider.calls(), 9);
    assert!(turn.blocks.last().is_some_and(|b| matches!(
        b.content,
        ContentBlock::Notice { kind: NoticeKind::Truncation, .. }
    )));
    assert!(turn.rendered_text().contains("Stopped after 8 tool rounds"));
}

// ── E2E: Persistence ────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_commit_twice_stores_one_turn() {
    let p = sqlite_pipeline(ScriptedProvider::new(vec![ScriptedProvider::text_segment(&["once"])])).await;

    let TurnOutcome::Completed(turn) = p.orchestrator.process_turn(ask("hello")).await else {
        panic!("turn failed");
    };
    assert_eq!(p.store.commit_turn(&turn).await.unwrap(), CommitStatus::AlreadyCommitted);
    assert_eq!(p.store.count_turns(&chat()).await.unwrap(), 1);
}

#[tokio::test]
async fn e2e_cancel_mid_stream_leaves_one_incomplete_turn() {
    let p = sqlite_pipeline(ScriptedProvider::new(vec![vec![
        ScriptStep::Event(StreamEvent::TextDelta("Let me think".into())),
        ScriptStep::Hang,
    ]]))
    .await;

    let orchestrator = p.orchestrator.clone();
    let task = tokio::spawn(async move { orchestrator.process_turn(ask("long question")).await });
    while p.sink.pushes().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(p.orchestrator.cancel_turn(&chat()));

    assert_eq!(task.await.unwrap(), TurnOutcome::Cancelled);
    assert_eq!(p.store.count_turns(&chat()).await.unwrap(), 1);
    let stored = p.store.recent_turns(&chat(), 10).await.unwrap();
    assert_eq!(stored[0].status, TurnStatus::Incomplete);
    assert!(stored[0].validate().is_ok());
    assert!(!p.orchestrator.is_active(&chat()));
}

#[tokio::test]
async fn e2e_edit_supersedes_previous_turn() {
    let p = sqlite_pipeline(ScriptedProvider::new(vec![
        ScriptedProvider::text_segment(&["Paris is sunny."]),
        ScriptedProvider::text_segment(&["Lyon is cloudy."]),
    ]))
    .await;

    let TurnOutcome::Completed(first) = p.orchestrator.process_turn(ask("Weather in Paris?")).await else {
        panic!("first turn failed");
    };
    let outcome = p
        .orchestrator
        .redo_turn(RedoRequest {
            conversation_id: chat(),
            user_id: "1001".into(),
            user_name: None,
            user_language: None,
            replacement: Some("Weather in Lyon?".into()),
            show_reasoning: None,
        })
        .await;
    let TurnOutcome::Completed(second) = outcome else {
        panic!("edit failed: {outcome:?}");
    };

    assert_eq!(second.supersedes, Some(first.id.clone()));
    let visible = p.store.recent_turns(&chat(), 10).await.unwrap();
    assert_eq!(visible.iter().map(|t| t.id.clone()).collect::<Vec<_>>(), vec![second.id]);
    assert_eq!(p.store.count_turns(&chat()).await.unwrap(), 2);
    assert_eq!(
        p.store.get_turn(&first.id).await.unwrap().unwrap().status,
        TurnStatus::Superseded
    );
}

// ── E2E: Context budget ─────────────────────────────────────────────────

#[tokio::test]
async fn e2e_context_window_stays_within_budget() {
    let store = InMemoryTurnStore::new();
    for i in 0..30 {
        let turn = Turn::builder(chat(), "1001")
            .push(Role::User, ContentBlock::text(format!("question {i} {}", "x".repeat(400))))
            .push(Role::Assistant, ContentBlock::text(format!("answer {i} {}", "y".repeat(400))))
            .build();
        store.commit_turn(&turn).await.unwrap();
    }
    let store: Arc<dyn TurnStore> = Arc::new(store);
    let budget = ContextBudget {
        max_tokens: 3000,
        completion_headroom: 1000,
        media_block_tokens: 85,
    };

    let builder = ContextBuilder::new(store.clone(), budget, 50);
    let window = builder
        .build(&chat(), "You are Parley.".into(), vec![ContentBlock::text("latest")], None)
        .await
        .unwrap();
    assert!(window.token_count <= window.budget);
    assert!(!window.turns.is_empty() && window.turns.len() < 30);
    // Newest history survives, oldest is dropped.
    assert!(window.turns.last().unwrap().rendered_text().starts_with("answer 29"));
    assert!(!window.turns.iter().any(|t| t.rendered_text().starts_with("answer 0 ")));

    let p = pipeline_with(ScriptedProvider::new(vec![ScriptedProvider::text_segment(&["ok"])]), store.clone());
    let orchestrator = Orchestrator::new(
        p.provider.clone(),
        Arc::new(parley_core::tool::ToolRegistry::new()),
        store.clone(),
        p.sink.clone(),
        settings(),
    )
    .with_context(ContextBuilder::new(store, budget, 50));
    assert!(matches!(orchestrator.process_turn(ask("latest")).await, TurnOutcome::Completed(_)));

    // System prompt, a bounded slice of history, then the new message.
    let messages = &p.provider.requests()[0].messages;
    assert_eq!(messages[0].role, Role::System);
    assert!(messages.len() >= 3 && messages.len() < 1 + 30 * 2 + 1);
    assert_eq!(messages[messages.len() - 2].role, Role::Assistant);
    assert!(messages[messages.len() - 2].content.starts_with("answer 29"));
    assert_eq!(messages.last().unwrap().content, "latest");
}

#[tokio::test]
async fn e2e_oversized_message_is_truncated_but_sent() {
    let store: Arc<dyn TurnStore> = Arc::new(InMemoryTurnStore::new());
    let budget = ContextBudget {
        max_tokens: 600,
        completion_headroom: 100,
        media_block_tokens: 85,
    };
    let builder = ContextBuilder::new(store, budget, 50);
    let window = builder
        .build(&chat(), "sys".into(), vec![ContentBlock::text("z".repeat(20_000))], None)
        .await
        .unwrap();
    assert!(window.truncated_incoming);
    assert_eq!(window.incoming.len(), 1);
    assert!(window.token_count <= window.budget);
}

// ── E2E: Concurrency ────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_concurrent_conversations_never_interleave() {
    let script = vec![
        ScriptStep::Event(StreamEvent::TextDelta("a".into())),
        ScriptStep::Delay(Duration::from_millis(10)),
        ScriptStep::Event(StreamEvent::TextDelta("b".into())),
        ScriptStep::Delay(Duration::from_millis(10)),
        ScriptStep::Event(StreamEvent::TextDelta("c".into())),
        ScriptStep::Event(StreamEvent::Done { usage: None }),
    ];
    let p = pipeline_with(ScriptedProvider::repeating(script), Arc::new(InMemoryTurnStore::new()));

    let conversations: Vec<ConversationId> = (0..4).map(|i| ConversationId::from(&format!("tg:{i}"))).collect();
    let tasks: Vec<_> = conversations
        .iter()
        .map(|conversation_id| {
            let orchestrator = p.orchestrator.clone();
            let request = TurnRequest::text(conversation_id.clone(), "1001", format!("hi from {conversation_id}"));
            tokio::spawn(async move { orchestrator.process_turn(request).await })
        })
        .collect();
    for task in tasks {
        assert!(matches!(task.await.unwrap(), TurnOutcome::Completed(_)));
    }

    for conversation_id in &conversations {
        let turns = p.store.recent_turns(conversation_id, 10).await.unwrap();
        assert_eq!(turns.len(), 1);
        let turn = &turns[0];
        assert!(turn.validate().is_ok());
        assert_eq!(turn.user_input(), vec![ContentBlock::text(format!("hi from {conversation_id}"))]);
        assert_eq!(turn.rendered_text(), "abc");

        let pushes: Vec<SinkOp> = p.sink.ops_for(conversation_id);
        assert_eq!(
            pushes,
            vec![
                SinkOp::Push("a".into()),
                SinkOp::Push("ab".into()),
                SinkOp::Push("abc".into()),
                SinkOp::Seal
            ]
        );
    }
}

// ── E2E: Multimodal input ───────────────────────────────────────────────

#[tokio::test]
async fn e2e_photo_is_resolved_into_the_prompt() {
    let p = sqlite_pipeline(ScriptedProvider::new(vec![ScriptedProvider::text_segment(&["A cat."])])).await;
    let mut request = ask("What is this?");
    request.input.insert(
        0,
        ContentBlock::Image {
            file_id: "photo-1".into(),
            mime_type: "image/png".into(),
        },
    );

    let TurnOutcome::Completed(turn) = p.orchestrator.process_turn(request).await else {
        panic!("turn failed");
    };
    assert_eq!(turn.user_input().len(), 2);

    let user = p.provider.requests()[0].messages.last().cloned().unwrap();
    assert_eq!(user.role, Role::User);
    assert_eq!(user.content, "What is this?");
    assert_eq!(
        user.media,
        vec![MediaPart::Image {
            url: "data:image/png;base64,AAAA".into()
        }]
    );
}

// ── E2E: Configuration ──────────────────────────────────────────────────

#[test]
fn e2e_config_defaults_drive_turn_limits() {
    let config = AppConfig::default();
    assert!(config.validate().is_ok());
    let settings = OrchestratorSettings::from_config(&config);
    assert_eq!(settings.max_tool_rounds, 8);
    assert_eq!(settings.turn_timeout, Duration::from_secs(300));
    assert_eq!(settings.tool_timeout, Duration::from_secs(30));
    assert_eq!(settings.model, "moonshotai/kimi-k2.5");
}
