use std::sync::atomic::Ordering;

use crate::semantic::search::NEUTRAL_SCORE;
use crate::semantic::SearchStatus;
use crate::tests::fakes::{topic_drive, FakeDrive, HarnessBuilder, MemoryStore};

#[test]
fn test_empty_cache_is_not_an_error() {
    let h = HarnessBuilder::default().build();

    let response = h.manager.search("water", 5);

    assert_eq!(response.status, SearchStatus::CacheNotReady);
    assert!(response.hits.is_empty());
    assert!(response.content.is_empty());
    assert!(response.message.contains("warm"));
}

#[test]
fn test_ranked_results_best_first() {
    let h = HarnessBuilder::default().drive(topic_drive()).build();
    h.manager.refresh().unwrap();

    let response = h.manager.search("fire safety", 3);

    assert_eq!(response.status, SearchStatus::Ranked);
    assert_eq!(response.total_hits, 3);
    assert_eq!(response.hits[0].source_document, "Fire code.txt");

    let scores: Vec<f32> = response.hits.iter().map(|h| h.similarity.unwrap()).collect();
    assert!(scores.windows(2).all(|w| w[0] >= w[1]));
    assert!(response.hits.iter().all(|h| {
        let r = h.relevance.unwrap();
        (0.0..=100.0).contains(&r)
    }));
}

#[test]
fn test_top_k_limits_hits() {
    let h = HarnessBuilder::default().drive(topic_drive()).build();
    h.manager.refresh().unwrap();

    let response = h.manager.search("tax", 1);

    assert_eq!(response.total_hits, 1);
    assert_eq!(response.hits[0].source_document, "Tax guide.txt");
}

#[test]
fn test_citation_rendering() {
    let h = HarnessBuilder::default().drive(topic_drive()).build();
    h.manager.refresh().unwrap();

    let response = h.manager.search("water", 1);

    assert!(response.content.contains("📄 **Water rights.txt** (Relevance: "));
    assert!(response.content.contains("🔗 https://drive.example/w"));
    assert!(response.content.contains("📍 Section 1 of 1"));
    assert!(response.content.contains("water permits"));
}

#[test]
fn test_empty_query_lists_unranked() {
    let h = HarnessBuilder::default().drive(topic_drive()).build();
    h.manager.refresh().unwrap();
    let calls_before = h.embedder.calls.load(Ordering::SeqCst);

    let response = h.manager.search("   ", 2);

    assert_eq!(response.status, SearchStatus::Unranked);
    assert_eq!(response.total_hits, 2);
    assert!(response.hits.iter().all(|h| h.similarity.is_none()));
    assert!(response.hits.iter().all(|h| h.score == NEUTRAL_SCORE));
    assert_eq!(h.embedder.calls.load(Ordering::SeqCst), calls_before);
}

#[test]
fn test_lexical_fallback_without_embeddings() {
    let seeded = HarnessBuilder::default().drive(topic_drive()).build();
    seeded.manager.refresh().unwrap();

    let h = HarnessBuilder::default()
        .store(MemoryStore::with_records(seeded.store.records()))
        .without_embeddings()
        .build();
    h.manager.cold_start();

    let response = h.manager.search("FIRE EXITS", 5);

    assert_eq!(response.status, SearchStatus::Lexical);
    assert_eq!(response.total_hits, 1);
    assert_eq!(response.hits[0].source_document, "Fire code.txt");
    assert!(response.hits[0].relevance.is_none());
    assert_eq!(response.hits[0].score, NEUTRAL_SCORE);
    assert!(!response.content.contains("Relevance"));
}

#[test]
fn test_lexical_fallback_ignores_accents() {
    let drive = FakeDrive::new();
    drive.add("e", "Educación.txt", "Ley general de educación pública");
    drive.add("s", "Salud.txt", "Ley general de salud");
    let seeded = HarnessBuilder::default().drive(drive).build();
    seeded.manager.refresh().unwrap();

    let h = HarnessBuilder::default()
        .store(MemoryStore::with_records(seeded.store.records()))
        .without_embeddings()
        .build();
    h.manager.cold_start();

    let response = h.manager.search("educacion", 5);
    assert_eq!(response.status, SearchStatus::Lexical);
    assert_eq!(response.total_hits, 1);
    assert_eq!(response.hits[0].chunk_id, "e_0");

    // document order, not relevance
    let response = h.manager.search("ley general", 5);
    assert_eq!(
        response.hits.iter().map(|h| h.chunk_id.as_str()).collect::<Vec<_>>(),
        vec!["e_0", "s_0"]
    );
}

#[test]
fn test_transient_embedding_failure_degrades_to_lexical() {
    let h = HarnessBuilder::default().drive(topic_drive()).build();
    h.manager.refresh().unwrap();
    h.embedder.fail.store(true, Ordering::SeqCst);

    let response = h.manager.search("property tax", 5);

    assert_eq!(response.status, SearchStatus::Lexical);
    assert_eq!(response.total_hits, 1);
    assert_eq!(response.hits[0].source_document, "Tax guide.txt");
}

#[test]
fn test_no_match_has_message() {
    let h = HarnessBuilder::default().drive(topic_drive()).without_store().build();
    h.manager.refresh().unwrap();
    h.embedder.fail.store(true, Ordering::SeqCst);

    let response = h.manager.search("zoning", 5);

    assert_eq!(response.status, SearchStatus::Lexical);
    assert!(response.hits.is_empty());
    assert_eq!(response.message, "No relevant sections found");
}
