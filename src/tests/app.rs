use std::sync::mpsc;

use serde_json::json;

use super::fakes::{FakeChat, FakeEmbedder};
use super::{Fixture, CATALOG};
use crate::app::{AppError, ItemOutcome, ProgressEvent};
use crate::rerank::{RerankError, MAX_MATCHES};

fn matched(result: &crate::rerank::RerankResult) -> Vec<&str> {
    result.matches.iter().map(|m| m.item_name.as_str()).collect()
}

#[test]
fn test_find_similar_papel_toalha() {
    let fixture = Fixture::new();
    let app = fixture.app();

    let result = app.find_similar("papel toalha").unwrap();

    assert_eq!(result.target_product, "papel toalha");
    let mut found = matched(&result);
    found.sort();
    assert_eq!(
        found,
        [
            "PAPEL TOALHA BOBINA 200M",
            "PAPEL TOALHA INTERFOLHADO 2 DOBRAS 1000 FOLHAS"
        ]
    );
    assert!(result.matches.iter().all(|m| (0.0..=1.0).contains(&m.similarity)));
    assert_eq!(fixture.chat.calls(), 1);
}

#[test]
fn test_unknown_product_gives_empty_matches() {
    let fixture = Fixture::new();
    let app = fixture.app();

    let result = app.find_similar("xyz").unwrap();

    assert_eq!(result.target_product, "xyz");
    assert!(result.matches.is_empty());
}

#[test]
fn test_target_is_trimmed() {
    let fixture = Fixture::new();
    let result = fixture.app().find_similar("  luva nitrilica \n").unwrap();

    assert_eq!(result.target_product, "luva nitrilica");
    assert_eq!(matched(&result), ["LUVA NITRILICA AZUL TAMANHO M"]);
}

#[test]
fn test_empty_target_is_rejected_before_any_work() {
    let fixture = Fixture::new();
    let app = fixture.app();

    let err = app.find_similar("   ").unwrap_err();

    assert!(matches!(err, AppError::EmptyTarget));
    assert_eq!(err.to_string(), "No target product provided.");
    assert_eq!(fixture.embedder.document_calls(), 0);
    assert_eq!(fixture.chat.calls(), 0);
}

#[test]
fn test_prompt_lists_candidates_and_target() {
    let fixture = Fixture::new();
    fixture.app().find_similar("saco de lixo").unwrap();

    let prompt = fixture.chat.last_prompt().unwrap();
    for name in CATALOG {
        assert!(prompt.contains(&format!("- {name}")), "{name} missing");
    }
    assert!(prompt.contains("saco de lixo"));
}

#[test]
fn test_candidates_shown_to_model_are_capped() {
    let mut fixture = Fixture::new();
    fixture.config.search.max_rerank_candidates = 2;

    fixture.app().find_similar("papel").unwrap();

    let prompt = fixture.chat.last_prompt().unwrap();
    let listed = prompt
        .lines()
        .filter(|line| line.starts_with("- "))
        .count();
    assert_eq!(listed, 2);
}

#[test]
fn test_null_answer_is_empty_result() {
    let fixture = Fixture::with(FakeEmbedder::new(), FakeChat::answering("null"));

    let result = fixture.app().find_similar("papel toalha").unwrap();
    assert!(result.matches.is_empty());
}

#[test]
fn test_fenced_answer_is_accepted() {
    let answer = "```json\n{\"targetProduct\": \"x\", \"matches\": [{\"itemName\": \"DETERGENTE NEUTRO 5L\", \"similarity\": 0.8}]}\n```";
    let fixture = Fixture::with(FakeEmbedder::new(), FakeChat::answering(answer));

    let result = fixture.app().find_similar("detergente").unwrap();

    assert_eq!(result.target_product, "detergente");
    assert_eq!(matched(&result), ["DETERGENTE NEUTRO 5L"]);
}

#[test]
fn test_non_json_answer_is_malformed_output() {
    let fixture = Fixture::with(FakeEmbedder::new(), FakeChat::answering("I think the first one"));

    let err = fixture.app().find_similar("papel toalha").unwrap_err();

    assert!(err.is_malformed_output(), "{err}");
    match err {
        AppError::Rerank(rerank) => assert_eq!(rerank.raw_output(), Some("I think the first one")),
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn test_too_many_matches_break_the_schema() {
    let matches: Vec<_> = CATALOG
        .iter()
        .take(MAX_MATCHES + 1)
        .map(|name| json!({"itemName": name, "similarity": 0.5}))
        .collect();
    let answer = json!({"targetProduct": "papel", "matches": matches}).to_string();
    let fixture = Fixture::with(FakeEmbedder::new(), FakeChat::answering(&answer));

    let err = fixture.app().find_similar("papel").unwrap_err();

    assert!(
        matches!(err, AppError::Rerank(RerankError::SchemaViolation { .. })),
        "{err}"
    );
}

#[test]
fn test_rate_limited_model_is_retried() {
    let fixture = Fixture::with(FakeEmbedder::new(), FakeChat::new().failing_first(2));

    let result = fixture.app().find_similar("papel toalha").unwrap();

    assert_eq!(result.matches.len(), 2);
    assert_eq!(fixture.chat.calls(), 3);
}

#[test]
fn test_model_quota_exhausted_surfaces_after_max_attempts() {
    let fixture = Fixture::with(FakeEmbedder::new(), FakeChat::new().failing_first(100));

    let err = fixture.app().find_similar("papel toalha").unwrap_err();

    assert!(err.is_retry_exhausted(), "{err}");
    assert_eq!(fixture.chat.calls(), 5);
}

#[test]
fn test_spent_deadline_stops_before_rerank() {
    let mut fixture = Fixture::new();
    fixture.config.search.query_timeout_secs = 0;

    let err = fixture.app().find_similar("papel toalha").unwrap_err();

    assert!(err.is_deadline(), "{err}");
    assert_eq!(fixture.chat.calls(), 0);
}

#[test]
fn test_index_is_built_once_across_queries() {
    let fixture = Fixture::new();
    let app = fixture.app();

    app.find_similar("papel toalha").unwrap();
    let calls = fixture.embedder.document_calls();
    app.find_similar("detergente").unwrap();

    assert_eq!(fixture.embedder.document_calls(), calls);
}

#[test]
fn test_empty_catalog_is_reported() {
    let fixture = Fixture::new();
    fixture.write_catalog(&[]);

    let err = fixture.app().find_similar("papel").unwrap_err();
    assert!(err.to_string().contains("has no products"), "{err}");
}

#[test]
fn test_bulk_keeps_order_and_per_item_failures() {
    let fixture = Fixture::new();
    let app = fixture.app();

    let targets = ["papel toalha", "", "detergente neutro"].map(String::from);
    let outcomes = app.find_similar_bulk(&targets);

    assert_eq!(outcomes.len(), 3);
    match &outcomes[0] {
        ItemOutcome::Found(result) => assert_eq!(result.target_product, "papel toalha"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(
        outcomes[1],
        ItemOutcome::Failed {
            error: "No target product provided.".to_string()
        }
    );
    match &outcomes[2] {
        ItemOutcome::Found(result) => assert_eq!(matched(result), ["DETERGENTE NEUTRO 5L"]),
        other => panic!("unexpected {other:?}"),
    }

    let value = serde_json::to_value(&outcomes).unwrap();
    assert_eq!(value[1], json!({"error": "No target product provided."}));
    assert_eq!(value[0]["targetProduct"], "papel toalha");
}

#[test]
fn test_progress_events_in_order() {
    let fixture = Fixture::new();
    let app = fixture.app();
    let (tx, rx) = mpsc::channel();

    app.find_similar_with_progress("papel toalha", Some(&tx))
        .unwrap();
    drop(tx);
    let events: Vec<ProgressEvent> = rx.iter().collect();

    assert!(matches!(events[0], ProgressEvent::Started { ref target } if target == "papel toalha"));
    assert!(matches!(events[1], ProgressEvent::IndexReady { chunks } if chunks > 0));
    assert!(matches!(events[2], ProgressEvent::Candidates { count } if count == CATALOG.len()));
    assert!(matches!(events[3], ProgressEvent::Reranking { .. }));
    assert!(matches!(events[4], ProgressEvent::Finished { .. }));
    assert_eq!(events.len(), 5);
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
}

#[test]
fn test_failed_query_ends_with_failed_event() {
    let fixture = Fixture::with(FakeEmbedder::new(), FakeChat::answering("???"));
    let app = fixture.app();
    let (tx, rx) = mpsc::channel();

    assert!(app.find_similar_with_progress("papel", Some(&tx)).is_err());
    drop(tx);
    let events: Vec<ProgressEvent> = rx.iter().collect();

    assert!(matches!(events.last(), Some(ProgressEvent::Failed { .. })));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
}

#[test]
fn test_search_returns_candidates_without_reranking() {
    let fixture = Fixture::new();
    let candidates = fixture.app().search("sabonete").unwrap();

    assert_eq!(candidates[0].product_name, "SABONETE LIQUIDO 5L");
    assert_eq!(fixture.chat.calls(), 0);
}

#[test]
fn test_reindex_rebuilds_from_catalog() {
    let fixture = Fixture::new();
    let app = fixture.app();
    let chunks = app.reindex().unwrap();
    let calls = fixture.embedder.document_calls();

    assert_eq!(app.reindex().unwrap(), chunks);
    assert_eq!(fixture.embedder.document_calls(), 2 * calls);
}

#[test]
fn test_invalidate_then_query_rebuilds() {
    let fixture = Fixture::new();
    let app = fixture.app();
    app.find_similar("papel").unwrap();

    app.invalidate_index().unwrap();
    assert!(!app.index().is_ready());

    app.find_similar("papel").unwrap();
    assert!(app.index().is_ready());
}

#[test]
fn test_small_catalog_scenario() {
    let fixture = Fixture::new();
    fixture.write_catalog(&["Papel Toalha 200m", "Papel Higienico 4x30m", "Detergente 5L"]);
    let app = fixture.app();

    let candidates = app.search("papel toalha").unwrap();
    assert_eq!(candidates[0].product_name, "Papel Toalha 200m");
    assert_eq!(candidates.last().unwrap().product_name, "Detergente 5L");

    let result = app.find_similar("papel toalha").unwrap();
    assert_eq!(result.target_product, "papel toalha");
    assert_eq!(matched(&result), ["Papel Toalha 200m"]);
}

#[test]
fn test_rebuild_from_same_catalog_gives_same_candidates() {
    let fixture = Fixture::new();
    let app = fixture.app();

    app.reindex().unwrap();
    let first = app.search("papel higienico").unwrap();
    app.reindex().unwrap();
    let second = app.search("papel higienico").unwrap();

    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(&second) {
        assert_eq!(a.product_name, b.product_name);
        assert!((a.distance - b.distance).abs() < 1e-6);
    }
}
