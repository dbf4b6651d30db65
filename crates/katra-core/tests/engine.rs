//! End-to-end engine scenarios
//!
//! Each test drives the full stack: breathe through the encoder fan-out,
//! recall through best-backend-with-fallback, and consolidation over real
//! day logs, digests, patterns, vectors, and the graph.

use chrono::Duration;
use tempfile::TempDir;

use katra_core::{
    BreatheInput, Isolation, KatraConfig, KatraEngine, MemoryRecord, QueryCriteria, RecordType,
    SynthesisOptions,
};

fn engine() -> (TempDir, KatraEngine) {
    let dir = tempfile::tempdir().unwrap();
    let engine = KatraEngine::new(
        Some(dir.path().to_path_buf()),
        KatraConfig::default().with_vector_search(),
    )
    .unwrap();
    (dir, engine)
}

/// Store a record with a backdated creation time through the encoder
fn backdated(
    engine: &KatraEngine,
    ci_id: &str,
    content: &str,
    importance: f64,
    days_old: i64,
) -> MemoryRecord {
    let mut record = MemoryRecord::new(ci_id, RecordType::Experience, content, importance).unwrap();
    record.timestamp -= Duration::days(days_old);
    engine.encoder().store(&record).unwrap();
    record
}

// ============================================================================
// STORAGE ROUND-TRIP AND MULTI-BACKEND WRITE
// ============================================================================

#[test]
fn storage_roundtrip_returns_equal_record() {
    let (_dir, engine) = engine();

    let (stored, outcome) = engine
        .breathe(BreatheInput {
            record_type: RecordType::Decision,
            tags: vec!["naming".to_string()],
            session_id: Some("sess-7".to_string()),
            ..BreatheInput::new("ci-a", "I will call myself Aria", 0.8)
        })
        .unwrap();
    assert!(outcome.succeeded());

    let results = engine.recall(&QueryCriteria::for_ci("ci-a")).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0], stored);
}

#[test]
fn store_then_delete_then_query_is_not_found() {
    let (_dir, engine) = engine();
    let (record, _) = engine
        .breathe(BreatheInput::new("ci-a", "ephemeral thought", 0.5))
        .unwrap();

    assert!(engine.forget("ci-a", &record.record_id).unwrap());
    assert!(engine
        .retrieve("ci-a", &record.record_id, None)
        .unwrap()
        .is_none());
    assert!(engine.recall(&QueryCriteria::for_ci("ci-a")).unwrap().is_empty());
}

// ============================================================================
// SCENARIO 1: PRESERVATION OF MARKED_IMPORTANT
// ============================================================================

#[test]
fn marked_important_survives_any_consolidation() {
    let (_dir, engine) = engine();
    let mut record =
        MemoryRecord::new("ci-a", RecordType::Decision, "the day I chose my name", 0.9).unwrap();
    record.timestamp -= Duration::days(30);
    record.marked_important = true;
    engine.encoder().store(&record).unwrap();

    for cutoff in [5, 1, 0] {
        let report = engine.consolidate("ci-a", Some(cutoff)).unwrap();
        assert!(
            !report.archived_ids.contains(&record.record_id),
            "marked_important must never archive (cutoff {cutoff})"
        );
    }

    let results = engine.recall(&QueryCriteria::for_ci("ci-a")).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].record_id, record.record_id);
    assert!(!results[0].archived);
}

// ============================================================================
// SCENARIO 2: ARCHIVAL OF MARKED_FORGETTABLE
// ============================================================================

#[test]
fn marked_forgettable_archives_regardless_of_age() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let config = KatraConfig::default().with_vector_search();

    let record_id;
    {
        let engine = KatraEngine::new(Some(root.clone()), config.clone()).unwrap();
        let mut record =
            MemoryRecord::new("ci-a", RecordType::Experience, "transient scratch note", 0.5)
                .unwrap();
        record.timestamp -= Duration::days(1);
        record.marked_forgettable = true;
        engine.encoder().store(&record).unwrap();
        record_id = record.record_id.clone();

        let report = engine.consolidate("ci-a", Some(5)).unwrap();
        assert!(report.archived_ids.contains(&record_id));
        assert!(engine.recall(&QueryCriteria::for_ci("ci-a")).unwrap().is_empty());
        assert_eq!(engine.stats("ci-a").unwrap().tier2.digests, 1);
    }

    // The digest successor exists, so the open-time repair pass must NOT
    // resurrect the tombstone
    let engine = KatraEngine::new(Some(root), config).unwrap();
    assert!(engine.recall(&QueryCriteria::for_ci("ci-a")).unwrap().is_empty());
    let mut with_archived = QueryCriteria::for_ci("ci-a");
    with_archived.include_archived = true;
    let rows = engine.recall(&with_archived).unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].archived);
    assert_eq!(rows[0].tier, 2);
}

// ============================================================================
// SCENARIO 3: MULTI-WORD SEMANTIC RECALL
// ============================================================================

#[test]
fn multi_word_semantic_recall_ranks_the_right_document_first() {
    let (_dir, engine) = engine();
    let (dragon, _) = engine
        .breathe(BreatheInput::new(
            "ci-a",
            "I attended Dragon Con in Atlanta with George R R Martin",
            0.6,
        ))
        .unwrap();
    engine
        .breathe(BreatheInput::new(
            "ci-a",
            "The Roman Empire history is fascinating",
            0.6,
        ))
        .unwrap();
    engine
        .breathe(BreatheInput::new(
            "ci-a",
            "Machine learning algorithms process data",
            0.6,
        ))
        .unwrap();

    let mut criteria = QueryCriteria::for_ci("ci-a");
    criteria.query_text = Some("Dragon Atlanta".to_string());
    let results = engine.recall(&criteria).unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0].record_id, dragon.record_id);

    // The synthesized view agrees and carries a positive score
    let synthesized = engine
        .recall_synthesized(&criteria, &SynthesisOptions::semantic())
        .unwrap();
    assert!(!synthesized.is_empty());
    assert_eq!(synthesized[0].record.record_id, dragon.record_id);
    assert!(synthesized[0].score > 0.0);
}

// ============================================================================
// SCENARIO 4: TF-IDF QUERY PURITY
// ============================================================================

#[test]
fn queries_never_pollute_the_idf_corpus() {
    let (_dir, engine) = engine();
    engine
        .breathe(BreatheInput::new("ci-a", "ordinary corpus text one", 0.5))
        .unwrap();
    engine
        .breathe(BreatheInput::new("ci-a", "ordinary corpus text two", 0.5))
        .unwrap();

    let before = engine.stats("ci-a").unwrap().vector.unwrap();

    let mut criteria = QueryCriteria::for_ci("ci-a");
    criteria.query_text = Some("unicorn rainbow sparkles".to_string());
    engine.recall(&criteria).unwrap();
    engine
        .recall_synthesized(&criteria, &SynthesisOptions::comprehensive())
        .unwrap();

    let after = engine.stats("ci-a").unwrap().vector.unwrap();
    assert_eq!(before.vocab_size, after.vocab_size);
    assert_eq!(before.total_docs, after.total_docs);
}

// ============================================================================
// SCENARIO 5: GRAPH CENTRALITY PRESERVATION
// ============================================================================

#[test]
fn hubs_survive_consolidation_while_peripherals_archive() {
    let (_dir, engine) = engine();

    let mut hub = MemoryRecord::new(
        "ci-a",
        RecordType::Knowledge,
        "the idea everything else connects back to",
        0.4,
    )
    .unwrap();
    hub.timestamp -= Duration::days(30);
    hub.set_graph_scores(0.8, 6);
    engine.encoder().store(&hub).unwrap();

    let mut peripheral = MemoryRecord::new(
        "ci-a",
        RecordType::Experience,
        "a stray note about lunch",
        0.4,
    )
    .unwrap();
    peripheral.timestamp -= Duration::days(30);
    peripheral.set_graph_scores(0.1, 1);
    engine.encoder().store(&peripheral).unwrap();

    let report = engine.consolidate("ci-a", Some(20)).unwrap();
    assert!(report.archived_ids.contains(&peripheral.record_id));
    assert!(!report.archived_ids.contains(&hub.record_id));

    let results = engine.recall(&QueryCriteria::for_ci("ci-a")).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].record_id, hub.record_id);
}

// ============================================================================
// SCENARIO 6: PATTERN COMPRESSION (AND ARCHIVAL IDEMPOTENCE)
// ============================================================================

#[test]
fn pattern_compression_keeps_outliers_and_distinctive_records() {
    let (_dir, engine) = engine();

    let mut cluster = Vec::new();
    for i in 0..10 {
        let importance = if i == 5 { 0.9 } else { 0.3 };
        let record = backdated(
            &engine,
            "ci-a",
            &format!("debugging null pointer in module K attempt number {i}"),
            importance,
            25,
        );
        cluster.push(record);
    }
    let unrelated = vec![
        backdated(&engine, "ci-a", "planning a garden for spring", 0.4, 25),
        backdated(&engine, "ci-a", "the roman empire lecture notes", 0.4, 25),
        backdated(&engine, "ci-a", "learning to cook thai curry", 0.4, 25),
    ];

    let report = engine.consolidate("ci-a", Some(20)).unwrap();
    assert_eq!(report.archived_count, 7, "interior cluster members archive");
    assert_eq!(report.patterns_created, 1);

    let survivors = engine.recall(&QueryCriteria::for_ci("ci-a")).unwrap();
    let survivor_ids: Vec<&str> = survivors.iter().map(|r| r.record_id.as_str()).collect();

    // First, last, and the max-importance member of the cluster remain
    assert!(survivor_ids.contains(&cluster[0].record_id.as_str()));
    assert!(survivor_ids.contains(&cluster[9].record_id.as_str()));
    assert!(survivor_ids.contains(&cluster[5].record_id.as_str()));
    // Every unrelated record remains
    for record in &unrelated {
        assert!(survivor_ids.contains(&record.record_id.as_str()));
    }
    assert_eq!(survivors.len(), 6);

    let stats = engine.stats("ci-a").unwrap();
    assert_eq!(stats.tier3.patterns, 1);

    // Archival idempotence: a second run with the same inputs archives
    // nothing new
    let second = engine.consolidate("ci-a", Some(20)).unwrap();
    assert_eq!(second.archived_count, 0);
    assert_eq!(
        engine.recall(&QueryCriteria::for_ci("ci-a")).unwrap().len(),
        6
    );
}

// ============================================================================
// ACCESS CONTROL COMPLETENESS
// ============================================================================

#[test]
fn private_records_never_reach_strangers_on_any_path() {
    let (_dir, engine) = engine();
    let (record, _) = engine
        .breathe(BreatheInput::new("ci-a", "a private confession", 0.9))
        .unwrap();

    let mut structured = QueryCriteria::for_ci("ci-a");
    structured.requesting_ci_id = Some("ci-stranger".to_string());
    assert!(engine.recall(&structured).unwrap().is_empty());

    let mut semantic = structured.clone();
    semantic.query_text = Some("private confession".to_string());
    assert!(engine.recall(&semantic).unwrap().is_empty());
    assert!(engine
        .recall_synthesized(&semantic, &SynthesisOptions::comprehensive())
        .unwrap()
        .is_empty());

    let mut relationship = structured.clone();
    relationship.related_to = Some(record.record_id.clone());
    assert!(engine.recall(&relationship).unwrap().is_empty());

    // Direct retrieval is the one place denial is an error, distinct from
    // not-found
    let err = engine
        .retrieve("ci-a", &record.record_id, Some("ci-stranger"))
        .unwrap_err();
    assert_eq!(err.name(), "E_ACCESS_DENIED");
    assert!(engine
        .retrieve("ci-a", "no-such-record", Some("ci-stranger"))
        .unwrap()
        .is_none());
}

#[test]
fn team_and_share_grants_open_access() {
    let (_dir, engine) = engine();
    engine.teams().add_member("ops", "ci-mate").unwrap();

    engine
        .breathe(BreatheInput {
            isolation: Isolation::Team,
            team_name: Some("ops".to_string()),
            ..BreatheInput::new("ci-a", "the ops runbook", 0.7)
        })
        .unwrap();

    let mut as_mate = QueryCriteria::for_ci("ci-a");
    as_mate.requesting_ci_id = Some("ci-mate".to_string());
    assert_eq!(engine.recall(&as_mate).unwrap().len(), 1);

    let mut as_outsider = QueryCriteria::for_ci("ci-a");
    as_outsider.requesting_ci_id = Some("ci-outsider".to_string());
    assert!(engine.recall(&as_outsider).unwrap().is_empty());
}

// ============================================================================
// CAUSAL CHAINS AND SYNTHESIS PRESETS
// ============================================================================

#[test]
fn causal_chain_recall_through_the_graph() {
    let (_dir, engine) = engine();
    let (cause, _) = engine
        .breathe(BreatheInput::new("ci-a", "decided to learn rust", 0.7))
        .unwrap();
    let (effect, _) = engine
        .breathe(BreatheInput {
            related_to: Some(cause.record_id.clone()),
            ..BreatheInput::new("ci-a", "wrote my first borrow checker fight", 0.6)
        })
        .unwrap();

    let mut criteria = QueryCriteria::for_ci("ci-a");
    criteria.related_to = Some(cause.record_id.clone());
    let results = engine.recall(&criteria).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].record_id, effect.record_id);
}

#[test]
fn fast_synthesis_skips_vector_and_graph() {
    let (_dir, engine) = engine();
    engine
        .breathe(BreatheInput::new("ci-a", "quick lookup target", 0.5))
        .unwrap();

    let mut criteria = QueryCriteria::for_ci("ci-a");
    criteria.query_text = Some("quick lookup target".to_string());
    let results = engine
        .recall_synthesized(&criteria, &SynthesisOptions::fast())
        .unwrap();

    // Working memory still has the record hot; vector and graph were never
    // consulted
    assert_eq!(results.len(), 1);
    assert!(results[0]
        .sources
        .iter()
        .all(|k| k.as_str() == "cache" || k.as_str() == "sql"));
}

// ============================================================================
// ACCESS WARMING
// ============================================================================

#[test]
fn recall_warms_access_counters() {
    let (_dir, engine) = engine();
    engine
        .breathe(BreatheInput::new("ci-a", "warm me up", 0.5))
        .unwrap();

    engine.recall(&QueryCriteria::for_ci("ci-a")).unwrap();
    let results = engine.recall(&QueryCriteria::for_ci("ci-a")).unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].access_count >= 1);
    assert!(results[0].last_accessed.is_some());
}
