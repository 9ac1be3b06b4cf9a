//! End-to-end tests through the programmatic API, against real on-disk
//! stores in a temp directory.

use anyhow::Result;
use async_trait::async_trait;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use code_harness::config::Config;
use code_harness::coordinator::IndexingCoordinator;
use code_harness::embedding::EmbeddingBackend;
use code_harness::error::FileErrorKind;
use code_harness::models::{EntityKind, NewNote};
use code_harness::progress::NoProgress;
use code_harness::registry::CoordinatorRegistry;
use code_harness::search::SearchRequest;

/// Three-axis topic vectors: parsing, networking, everything else.
struct TopicBackend;

#[async_trait]
impl EmbeddingBackend for TopicBackend {
    fn model_name(&self) -> &str {
        "topic-test"
    }
    fn dims(&self) -> usize {
        3
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let t = t.to_lowercase();
                if t.contains("parse") || t.contains("token") {
                    vec![1.0, 0.0, 0.0]
                } else if t.contains("socket") || t.contains("network") {
                    vec![0.0, 1.0, 0.0]
                } else {
                    vec![0.0, 0.0, 1.0]
                }
            })
            .collect())
    }
}

fn write_project(root: &Path) {
    fs::create_dir_all(root.join("src/net")).unwrap();
    fs::write(
        root.join("src/parser.py"),
        "class Tokenizer:\n    pass\n\nclass Parser(Tokenizer):\n    pass\n\ndef parse_config(text):\n    return Parser()\n",
    )
    .unwrap();
    fs::write(
        root.join("src/net/socket.py"),
        "class SocketServer:\n    pass\n\ndef open_network():\n    return SocketServer()\n",
    )
    .unwrap();
    fs::write(root.join("src/util.py"), "def helper():\n    return 1\n").unwrap();
}

async fn open(root: &Path, registry: &Arc<CoordinatorRegistry>) -> IndexingCoordinator {
    IndexingCoordinator::builder(root, Config::for_project(root))
        .backend(Arc::new(TopicBackend))
        .open(Arc::clone(registry))
        .await
        .unwrap()
}

#[tokio::test]
async fn index_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    write_project(tmp.path());
    let registry = Arc::new(CoordinatorRegistry::new());
    let coord = open(tmp.path(), &registry).await;

    let first = coord.index_directory(tmp.path(), &NoProgress).await.unwrap();
    assert!(first.success);
    assert_eq!(first.files_processed, 3);
    let stats_a = coord.get_stats().await.unwrap();

    let second = coord.index_directory(tmp.path(), &NoProgress).await.unwrap();
    assert!(second.success);
    let stats_b = coord.get_stats().await.unwrap();

    assert_eq!(stats_a.count(EntityKind::Component), stats_b.count(EntityKind::Component));
    assert_eq!(stats_a.relationships, stats_b.relationships);
    assert_eq!(stats_b.files, 3);
    assert!(coord
        .components()
        .get("src/parser.py#Parser")
        .await
        .unwrap()
        .is_some());

    coord.close().await.unwrap();
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn one_bad_file_does_not_stop_the_run() {
    let tmp = TempDir::new().unwrap();
    for i in 0..9 {
        fs::write(
            tmp.path().join(format!("m{}.rs", i)),
            format!("pub fn f{}() {{\n    let _ = {};\n}}\n", i, i),
        )
        .unwrap();
    }
    fs::write(tmp.path().join("broken.rs"), "fn broken() {\n    let x = 1;\n").unwrap();
    let registry = Arc::new(CoordinatorRegistry::new());
    let coord = open(tmp.path(), &registry).await;

    let summary = coord.index_directory(tmp.path(), &NoProgress).await.unwrap();
    assert_eq!(summary.files_processed, 10);
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].path, "broken.rs");
    assert_eq!(summary.errors[0].kind, FileErrorKind::ParseFailed);
    assert!(!summary.success);

    let stats = coord.get_stats().await.unwrap();
    assert_eq!(stats.files, 9);
    assert!(coord.components().by_file("broken.rs").await.unwrap().is_empty());
    coord.close().await.unwrap();
}

#[tokio::test]
async fn reconcile_picks_up_added_changed_and_deleted_files() {
    let tmp = TempDir::new().unwrap();
    write_project(tmp.path());
    let registry = Arc::new(CoordinatorRegistry::new());
    let coord = open(tmp.path(), &registry).await;
    coord.index_directory(tmp.path(), &NoProgress).await.unwrap();

    fs::write(tmp.path().join("src/util.py"), "def helper():\n    return 2\n\ndef extra():\n    pass\n").unwrap();
    fs::remove_file(tmp.path().join("src/net/socket.py")).unwrap();
    fs::write(tmp.path().join("src/new.py"), "class Fresh:\n    pass\n").unwrap();

    let report = coord
        .reconcile_filesystem_changes(tmp.path(), &NoProgress)
        .await
        .unwrap();
    assert_eq!(report.added, vec!["src/new.py".to_string()]);
    assert_eq!(report.updated, vec!["src/util.py".to_string()]);
    assert_eq!(report.removed, vec!["src/net/socket.py".to_string()]);
    assert_eq!(report.unchanged, 1);
    assert!(report.success());

    assert!(coord.components().get("src/util.py#extra").await.unwrap().is_some());
    assert!(coord
        .components()
        .get("src/net/socket.py#SocketServer")
        .await
        .unwrap()
        .is_none());

    // Nothing left to do.
    let again = coord
        .reconcile_filesystem_changes(tmp.path(), &NoProgress)
        .await
        .unwrap();
    assert!(again.added.is_empty() && again.updated.is_empty() && again.removed.is_empty());
    assert_eq!(again.unchanged, 3);
    coord.close().await.unwrap();
}

#[tokio::test]
async fn reconcile_of_a_subdirectory_leaves_the_rest_alone() {
    let tmp = TempDir::new().unwrap();
    write_project(tmp.path());
    let registry = Arc::new(CoordinatorRegistry::new());
    let coord = open(tmp.path(), &registry).await;
    coord.index_directory(tmp.path(), &NoProgress).await.unwrap();

    fs::remove_file(tmp.path().join("src/util.py")).unwrap();
    let report = coord
        .reconcile_filesystem_changes(&tmp.path().join("src/net"), &NoProgress)
        .await
        .unwrap();
    assert!(report.removed.is_empty());
    assert_eq!(report.unchanged, 1);
    assert!(coord.components().get("src/util.py#helper").await.unwrap().is_some());
    coord.close().await.unwrap();
}

#[tokio::test]
async fn semantic_search_ranks_by_topic_and_caps_per_type() {
    let tmp = TempDir::new().unwrap();
    write_project(tmp.path());
    let registry = Arc::new(CoordinatorRegistry::new());
    let coord = open(tmp.path(), &registry).await;
    coord.index_directory(tmp.path(), &NoProgress).await.unwrap();
    coord
        .notes()
        .create(NewNote {
            title: "Parser edge cases".into(),
            content: "Tokens split across lines".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    let report = coord.generate_all_embeddings(false).await.unwrap();
    assert_eq!(report.failed, 0);
    let embedded = coord.get_stats().await.unwrap();
    assert_eq!(
        embedded.embedded(EntityKind::Component),
        embedded.count(EntityKind::Component)
    );
    assert_eq!(embedded.embedded(EntityKind::Note), 1);

    // A second backfill finds everything fresh.
    let again = coord.generate_all_embeddings(false).await.unwrap();
    assert_eq!(again.skipped, again.considered);
    assert_eq!(again.processed, 0);

    let response = coord
        .search(&SearchRequest::new("parse tokens"))
        .await
        .unwrap();
    assert!(response.semantic);
    assert!(!response.hits.is_empty());
    assert!(response
        .hits
        .iter()
        .all(|h| !h.id.starts_with("src/net/socket.py")));

    let capped = coord
        .search(
            &SearchRequest::new("parse tokens")
                .with_types(vec![EntityKind::Component])
                .with_limit(2),
        )
        .await
        .unwrap();
    assert!(capped.hits.len() <= 2);
    assert!(capped.hits.iter().all(|h| h.kind == EntityKind::Component));
    for pair in capped.hits.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    coord.close().await.unwrap();
}

#[tokio::test]
async fn per_type_cap_applies_to_each_kind() {
    let tmp = TempDir::new().unwrap();
    write_project(tmp.path());
    let registry = Arc::new(CoordinatorRegistry::new());
    let coord = open(tmp.path(), &registry).await;
    coord.index_directory(tmp.path(), &NoProgress).await.unwrap();
    for title in ["Parser edge cases", "Token budget"] {
        coord
            .notes()
            .create(NewNote {
                title: title.into(),
                content: "How we parse tokens".into(),
                ..Default::default()
            })
            .await
            .unwrap();
    }
    coord.generate_all_embeddings(false).await.unwrap();

    let uncapped = coord.search(&SearchRequest::new("parse tokens")).await.unwrap();
    assert!(uncapped.hits.iter().filter(|h| h.kind == EntityKind::Component).count() > 1);
    assert_eq!(uncapped.hits.iter().filter(|h| h.kind == EntityKind::Note).count(), 2);

    let capped = coord
        .search(&SearchRequest::new("parse tokens").with_per_type_cap(1))
        .await
        .unwrap();
    let components = capped.hits.iter().filter(|h| h.kind == EntityKind::Component).count();
    let notes = capped.hits.iter().filter(|h| h.kind == EntityKind::Note).count();
    assert_eq!(components, 1);
    assert_eq!(notes, 1);
    assert_eq!(capped.hits.len(), 2);
    coord.close().await.unwrap();
}

/// Query text maps to `[1, 0]`; Alpha, Beta and Gamma sit at cosines
/// 0.995, 0.894 and 0.707 from it. Everything else is orthogonal.
struct GradedBackend;

fn unit_at(cos: f32) -> Vec<f32> {
    vec![cos, (1.0 - cos * cos).sqrt()]
}

#[async_trait]
impl EmbeddingBackend for GradedBackend {
    fn model_name(&self) -> &str {
        "graded-test"
    }
    fn dims(&self) -> usize {
        2
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let t = t.to_lowercase();
                if t.contains("geometry") {
                    vec![1.0, 0.0]
                } else if t.contains("alpha") {
                    unit_at(0.995)
                } else if t.contains("beta") {
                    unit_at(0.894)
                } else if t.contains("gamma") {
                    unit_at(0.707)
                } else {
                    vec![0.0, 1.0]
                }
            })
            .collect())
    }
}

#[tokio::test]
async fn graded_similarity_order_survives_reranking() {
    for top_k in [1, 2, 3, 50] {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("src")).unwrap();
        fs::write(tmp.path().join("src/a.py"), "class Alpha:\n    pass\n").unwrap();
        fs::write(tmp.path().join("src/b.py"), "class Beta:\n    pass\n").unwrap();
        fs::write(tmp.path().join("src/c.py"), "class Gamma:\n    pass\n").unwrap();

        let mut config = Config::for_project(tmp.path());
        config.retrieval.rerank = "hybrid".into();
        config.retrieval.rerank_top_k = top_k;
        let registry = Arc::new(CoordinatorRegistry::new());
        let coord = IndexingCoordinator::builder(tmp.path(), config)
            .backend(Arc::new(GradedBackend))
            .open(Arc::clone(&registry))
            .await
            .unwrap();
        coord.index_directory(tmp.path(), &NoProgress).await.unwrap();
        coord.generate_all_embeddings(false).await.unwrap();

        let response = coord
            .search(&SearchRequest::new("geometry").with_types(vec![EntityKind::Component]))
            .await
            .unwrap();
        let ids: Vec<&str> = response.hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["src/a.py#Alpha", "src/b.py#Beta", "src/c.py#Gamma"],
            "rerank_top_k = {}",
            top_k
        );
        for pair in response.hits.windows(2) {
            assert!(pair[0].score >= pair[1].score, "rerank_top_k = {}", top_k);
        }
        coord.close().await.unwrap();
    }
}

#[tokio::test]
async fn search_resolves_ids_directly() {
    let tmp = TempDir::new().unwrap();
    write_project(tmp.path());
    let registry = Arc::new(CoordinatorRegistry::new());
    let coord = open(tmp.path(), &registry).await;
    coord.index_directory(tmp.path(), &NoProgress).await.unwrap();

    let response = coord
        .search(&SearchRequest::new("src/parser.py#Tokenizer"))
        .await
        .unwrap();
    assert!(response.direct);
    assert_eq!(response.hits.len(), 1);
    assert_eq!(response.hits[0].id, "src/parser.py#Tokenizer");

    let err = coord.search(&SearchRequest::new("   ")).await.unwrap_err();
    assert!(err.to_string().contains("empty"));
    coord.close().await.unwrap();
}

#[tokio::test]
async fn clear_index_keeps_metadata() {
    let tmp = TempDir::new().unwrap();
    write_project(tmp.path());
    let registry = Arc::new(CoordinatorRegistry::new());
    let coord = open(tmp.path(), &registry).await;
    coord.index_directory(tmp.path(), &NoProgress).await.unwrap();
    coord
        .notes()
        .create(NewNote {
            title: "Keep me".into(),
            content: "Survives a clear".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    coord.clear_index().await.unwrap();
    let stats = coord.get_stats().await.unwrap();
    assert_eq!(stats.count(EntityKind::Component), 0);
    assert_eq!(stats.relationships, 0);
    assert_eq!(stats.files, 0);
    assert_eq!(stats.count(EntityKind::Note), 1);

    // The graph can be rebuilt afterwards.
    let summary = coord.index_directory(tmp.path(), &NoProgress).await.unwrap();
    assert!(summary.success);
    coord.close().await.unwrap();
}

#[tokio::test]
async fn patterns_run_over_the_indexed_graph() {
    let tmp = TempDir::new().unwrap();
    write_project(tmp.path());
    let registry = Arc::new(CoordinatorRegistry::new());
    let coord = open(tmp.path(), &registry).await;
    coord.index_directory(tmp.path(), &NoProgress).await.unwrap();

    let report = coord.analyze_patterns().await.unwrap();
    let stats = coord.get_stats().await.unwrap();
    assert_eq!(report.metrics.components as i64, stats.count(EntityKind::Component));
    assert!(report.metrics.relationships > 0);
    assert_eq!(report.metrics.cycles, 0);
    coord.close().await.unwrap();
}

#[tokio::test]
async fn close_aborts_a_listener_kept_alive_by_a_held_repository() {
    let tmp = TempDir::new().unwrap();
    let registry = Arc::new(CoordinatorRegistry::new());
    let coord = IndexingCoordinator::builder(tmp.path(), Config::for_project(tmp.path()))
        .backend(Arc::new(TopicBackend))
        .close_timeout(Duration::from_millis(200))
        .open(Arc::clone(&registry))
        .await
        .unwrap();

    // A clone outlives the coordinator and keeps an event sender open.
    let held = coord.notes().clone();
    held.create(NewNote {
        title: "Parser notes".into(),
        content: "Tokens".into(),
        ..Default::default()
    })
    .await
    .unwrap();
    // Let the listener pick up the event before it is aborted.
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_secs(5), coord.close())
        .await
        .expect("close should not wait on the held sender")
        .unwrap();
    drop(held);

    let reopened = open(tmp.path(), &registry).await;
    let stats = reopened.get_stats().await.unwrap();
    assert_eq!(stats.count(EntityKind::Note), 1);
    assert_eq!(stats.embedded(EntityKind::Note), 1);
    reopened.close().await.unwrap();
}

#[tokio::test]
async fn invalid_config_fails_initialization() {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::for_project(tmp.path());
    config.retrieval.hybrid_alpha = 1.5;
    let registry = Arc::new(CoordinatorRegistry::new());
    let result = IndexingCoordinator::initialize(tmp.path(), config, registry).await;
    assert!(result.is_err());
}
