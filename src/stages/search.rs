//! Search stage: probes the library for an existing copy, runs the
//! progressive remote search, persists candidates, and queues the best
//! match for download.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::SqliteConnection;
use tracing::{debug, info, instrument, warn};

use super::score::{match_score, FormatRanker, FORMAT_TIE_BREAK_WINDOW};
use super::{StageHandler, StageOutcome};
use crate::config::SearchConfig;
use crate::error::EngineError;
use crate::sources::{CandidateBook, LibraryIngest, LibraryQuery, SearchProvider, SearchQuery};
use crate::store::{Item, ItemStatus, NewSearchResult, SearchResult, Stage, Store};

/// How many of the top candidates are considered for the format
/// tie-break.
const TIE_BREAK_POOL: usize = 3;

/// Locates items in the remote repository and picks the best match.
pub struct SearchStage {
    provider: Arc<dyn SearchProvider>,
    library: Arc<dyn LibraryIngest>,
    min_match_score: f64,
    ranker: FormatRanker,
}

impl SearchStage {
    /// Creates the search stage.
    #[must_use]
    pub fn new(
        provider: Arc<dyn SearchProvider>,
        library: Arc<dyn LibraryIngest>,
        config: &SearchConfig,
    ) -> Self {
        Self {
            provider,
            library,
            min_match_score: config.min_match_score,
            ranker: FormatRanker::new(&config.format_priority),
        }
    }

    /// Progressive strategies, most precise first. Stops at the first
    /// strategy returning candidates.
    fn strategies(item: &Item) -> Vec<SearchQuery> {
        let title = Some(item.title.clone()).filter(|t| !t.trim().is_empty());
        let author = item.author.clone().filter(|a| !a.trim().is_empty());
        let isbn = item.isbn.clone().filter(|i| !i.trim().is_empty());
        let publisher = item.publisher.clone().filter(|p| !p.trim().is_empty());

        let mut strategies = Vec::new();
        if isbn.is_some() {
            strategies.push(SearchQuery {
                isbn: isbn.clone(),
                ..SearchQuery::default()
            });
        }
        if title.is_some() && author.is_some() && publisher.is_some() {
            strategies.push(SearchQuery {
                title: title.clone(),
                author: author.clone(),
                publisher,
                ..SearchQuery::default()
            });
        }
        if title.is_some() && author.is_some() {
            strategies.push(SearchQuery {
                title: title.clone(),
                author,
                ..SearchQuery::default()
            });
        }
        if title.is_some() {
            strategies.push(SearchQuery {
                title,
                ..SearchQuery::default()
            });
        }
        strategies
    }

    /// Runs strategies until one yields candidates.
    ///
    /// Not-found answers move on to the next strategy; network errors are
    /// remembered and re-raised only if no strategy succeeds.
    async fn run_search(&self, item: &Item) -> Result<Vec<CandidateBook>, EngineError> {
        let strategies = Self::strategies(item);
        if strategies.is_empty() {
            return Err(EngineError::data(
                "data_missing",
                format!("item {} has no searchable fields", item.id),
            ));
        }

        let mut last_network_error: Option<EngineError> = None;
        for (index, query) in strategies.iter().enumerate() {
            debug!(item_id = item.id, strategy = index + 1, "running search strategy");
            match self.provider.search(query).await {
                Ok(results) if !results.is_empty() => {
                    info!(
                        item_id = item.id,
                        strategy = index + 1,
                        count = results.len(),
                        "search strategy succeeded"
                    );
                    return Ok(results);
                }
                Ok(_) => {}
                Err(EngineError::NotFound(message)) => {
                    debug!(item_id = item.id, %message, "strategy found nothing");
                }
                Err(e @ EngineError::Network(_)) => {
                    warn!(item_id = item.id, error = %e, "strategy hit a network error");
                    last_network_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(network_error) = last_network_error {
            return Err(network_error);
        }
        Ok(Vec::new())
    }

    /// Persists candidates with their scores; duplicates refresh instead
    /// of inserting.
    async fn persist_candidates(
        &self,
        item: &Item,
        candidates: &[CandidateBook],
        conn: &mut SqliteConnection,
    ) -> Result<usize, EngineError> {
        let mut saved = 0;
        for candidate in candidates {
            if candidate.title.trim().is_empty() {
                warn!(item_id = item.id, "skipping candidate without a title");
                continue;
            }
            let score = match_score(item, candidate);
            let raw_json = serde_json::to_string(candidate).ok();
            let inserted = Store::upsert_search_result_in(
                conn,
                &NewSearchResult {
                    item_id: item.id,
                    external_id: candidate.external_id.as_deref(),
                    title: &candidate.title,
                    authors: candidate.authors.as_deref(),
                    publisher: candidate.publisher.as_deref(),
                    year: candidate.year.as_deref(),
                    language: candidate.language.as_deref(),
                    isbn: candidate.isbn.as_deref(),
                    extension: candidate.extension.as_deref(),
                    size_bytes: candidate.size_bytes,
                    url: candidate.url.as_deref(),
                    download_url: candidate.download_url.as_deref(),
                    match_score: score,
                    raw_json: raw_json.as_deref(),
                },
            )
            .await?;
            if inserted {
                saved += 1;
            }
        }
        Ok(saved)
    }

    /// Picks the winning candidate and inserts the download queue entry.
    ///
    /// Returns `false` when no stored candidate clears the threshold.
    async fn queue_best_match(
        &self,
        item: &Item,
        conn: &mut SqliteConnection,
    ) -> Result<bool, EngineError> {
        if Store::queue_entry_for_item_in(conn, item.id).await?.is_some() {
            debug!(item_id = item.id, "download queue entry already exists");
            return Ok(true);
        }

        let results = Store::search_results_for_item_in(conn, item.id).await?;
        let qualified: Vec<&SearchResult> = results
            .iter()
            .filter(|r| r.match_score >= self.min_match_score)
            .collect();
        let Some(top) = qualified.first().copied() else {
            return Ok(false);
        };

        // Among near-tied leaders, prefer the better file format
        let mut best: &SearchResult = top;
        for candidate in qualified.iter().take(TIE_BREAK_POOL).copied() {
            if (top.match_score - candidate.match_score) <= FORMAT_TIE_BREAK_WINDOW
                && self.ranker.rank(candidate.extension.as_deref())
                    > self.ranker.rank(best.extension.as_deref())
            {
                best = candidate;
            }
        }

        let download_url = best
            .download_url
            .as_deref()
            .or(best.url.as_deref())
            .unwrap_or_default();
        if download_url.is_empty() {
            warn!(item_id = item.id, result_id = best.id, "best match has no download url");
            return Ok(false);
        }

        #[allow(clippy::cast_possible_truncation)]
        let priority = (best.match_score * 100.0).round() as i64;
        Store::insert_queue_entry_in(conn, item.id, best.id, download_url, priority).await?;
        info!(
            item_id = item.id,
            result_id = best.id,
            score = best.match_score,
            extension = best.extension.as_deref().unwrap_or(""),
            "queued best match for download"
        );
        Ok(true)
    }
}

#[async_trait]
impl StageHandler for SearchStage {
    fn stage(&self) -> Stage {
        Stage::Search
    }

    #[instrument(skip(self, item, conn), fields(item_id = item.id, title = %item.title))]
    async fn process(
        &self,
        item: &mut Item,
        conn: &mut SqliteConnection,
    ) -> Result<StageOutcome, EngineError> {
        // The library may already hold this book
        let probe = self
            .library
            .find_best_match(&LibraryQuery {
                title: item.title.clone(),
                author: item.author.clone(),
                isbn: item.isbn.clone(),
            })
            .await?;
        if let Some(existing) = probe
            && existing.score >= self.min_match_score
        {
            info!(
                item_id = item.id,
                library_id = existing.library_id,
                score = existing.score,
                "already in library"
            );
            return Ok(StageOutcome::SkippedExists);
        }

        // Re-use previously persisted candidates before hitting the remote
        if Store::count_search_results_in(conn, item.id).await? > 0 {
            debug!(item_id = item.id, "re-selecting from stored candidates");
            return if self.queue_best_match(item, conn).await? {
                Ok(StageOutcome::Advanced)
            } else {
                Ok(StageOutcome::NoMatch)
            };
        }

        let candidates = self.run_search(item).await?;
        if candidates.is_empty() {
            info!(item_id = item.id, "no strategy returned candidates");
            return Ok(StageOutcome::NoMatch);
        }

        let saved = self.persist_candidates(item, &candidates, conn).await?;
        debug!(item_id = item.id, saved, "candidates persisted");

        if self.queue_best_match(item, conn).await? {
            Ok(StageOutcome::Advanced)
        } else {
            info!(
                item_id = item.id,
                min_match_score = self.min_match_score,
                "no candidate cleared the match threshold"
            );
            Ok(StageOutcome::NoMatch)
        }
    }

    fn next_state(&self, outcome: StageOutcome) -> ItemStatus {
        match outcome {
            StageOutcome::Advanced => ItemStatus::SearchComplete,
            StageOutcome::SkippedExists => ItemStatus::SkippedExists,
            StageOutcome::NoMatch => ItemStatus::SearchNoResults,
            // Quota is not this stage's concern
            StageOutcome::QuotaDeferred => ItemStatus::SearchComplete,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::sources::{LibraryMatch, UploadMetadata, UploadReceipt};
    use crate::store::NewItem;
    use std::sync::Mutex;

    struct FakeProvider {
        // One canned response per strategy call
        responses: Mutex<Vec<Result<Vec<CandidateBook>, EngineError>>>,
        queries: Mutex<Vec<SearchQuery>>,
    }

    impl FakeProvider {
        fn new(responses: Vec<Result<Vec<CandidateBook>, EngineError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                queries: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SearchProvider for FakeProvider {
        async fn search(&self, query: &SearchQuery) -> Result<Vec<CandidateBook>, EngineError> {
            self.queries.lock().unwrap().push(query.clone());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(Vec::new())
            } else {
                responses.remove(0)
            }
        }
    }

    struct FakeLibrary {
        best: Option<LibraryMatch>,
    }

    #[async_trait]
    impl LibraryIngest for FakeLibrary {
        async fn find_best_match(
            &self,
            _query: &LibraryQuery,
        ) -> Result<Option<LibraryMatch>, EngineError> {
            Ok(self.best.clone())
        }

        async fn upload(
            &self,
            _file: &std::path::Path,
            _metadata: &UploadMetadata,
        ) -> Result<UploadReceipt, EngineError> {
            unreachable!("search stage never uploads")
        }
    }

    fn candidate(id: &str, title: &str, extension: &str) -> CandidateBook {
        CandidateBook {
            external_id: Some(id.to_string()),
            title: title.to_string(),
            authors: Some("Frank Herbert".to_string()),
            extension: Some(extension.to_string()),
            download_url: Some(format!("https://repo.example/dl/{id}")),
            ..CandidateBook::default()
        }
    }

    async fn seeded(isbn: Option<&str>) -> (Store, i64) {
        let db = Database::in_memory().await.unwrap();
        let store = Store::new(db);
        let id = store
            .insert_item(&NewItem {
                title: "Dune".to_string(),
                author: Some("Frank Herbert".to_string()),
                external_id: Some("src-1".to_string()),
                source_url: None,
            })
            .await
            .unwrap();
        if let Some(isbn) = isbn {
            let mut tx = store.begin().await.unwrap();
            Store::apply_item_detail_in(
                &mut tx,
                id,
                &crate::store::ItemDetail {
                    isbn: Some(isbn.to_string()),
                    ..crate::store::ItemDetail::default()
                },
            )
            .await
            .unwrap();
            tx.commit().await.unwrap();
        }
        (store, id)
    }

    fn stage(provider: Arc<FakeProvider>, library: FakeLibrary) -> SearchStage {
        SearchStage::new(provider, Arc::new(library), &SearchConfig::default())
    }

    async fn run(stage: &SearchStage, store: &Store, id: i64) -> Result<StageOutcome, EngineError> {
        let mut tx = store.begin().await.unwrap();
        let mut item = Store::get_item_in(&mut tx, id).await.unwrap().unwrap();
        let outcome = stage.process(&mut item, &mut tx).await;
        tx.commit().await.unwrap();
        outcome
    }

    #[tokio::test]
    async fn test_library_hit_skips_item() {
        let (store, id) = seeded(None).await;
        let provider = FakeProvider::new(vec![]);
        let stage = stage(
            provider.clone(),
            FakeLibrary {
                best: Some(LibraryMatch {
                    library_id: 77,
                    title: "Dune".to_string(),
                    score: 0.95,
                }),
            },
        );

        let outcome = run(&stage, &store, id).await.unwrap();
        assert_eq!(outcome, StageOutcome::SkippedExists);
        assert!(provider.queries.lock().unwrap().is_empty(), "no remote search happened");
    }

    #[tokio::test]
    async fn test_low_confidence_library_hit_does_not_skip() {
        let (store, id) = seeded(None).await;
        let provider = FakeProvider::new(vec![Ok(vec![candidate("z9", "Dune", "epub")])]);
        let stage = stage(
            provider,
            FakeLibrary {
                best: Some(LibraryMatch {
                    library_id: 77,
                    title: "Dune 2".to_string(),
                    score: 0.3,
                }),
            },
        );

        let outcome = run(&stage, &store, id).await.unwrap();
        assert_eq!(outcome, StageOutcome::Advanced);
    }

    #[tokio::test]
    async fn test_progressive_strategies_stop_at_first_hit() {
        let (store, id) = seeded(Some("9780441013593")).await;
        // ISBN strategy misses, title+author hits
        let provider = FakeProvider::new(vec![
            Ok(vec![]),
            Ok(vec![candidate("z9", "Dune", "epub")]),
        ]);
        let stage = stage(provider.clone(), FakeLibrary { best: None });

        let outcome = run(&stage, &store, id).await.unwrap();
        assert_eq!(outcome, StageOutcome::Advanced);

        let queries = provider.queries.lock().unwrap();
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].isbn.as_deref(), Some("9780441013593"));
        assert!(queries[0].title.is_none(), "first strategy is isbn-exact");
        assert_eq!(queries[1].title.as_deref(), Some("Dune"));
    }

    #[tokio::test]
    async fn test_queue_entry_priority_from_score() {
        let (store, id) = seeded(None).await;
        let provider = FakeProvider::new(vec![Ok(vec![candidate("z9", "Dune", "epub")])]);
        let stage = stage(provider, FakeLibrary { best: None });

        run(&stage, &store, id).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let entry = Store::queue_entry_for_item_in(&mut tx, id)
            .await
            .unwrap()
            .unwrap();
        let results = Store::search_results_for_item_in(&mut tx, id).await.unwrap();
        #[allow(clippy::cast_possible_truncation)]
        let expected = (results[0].match_score * 100.0).round() as i64;
        assert_eq!(entry.priority, expected);
        assert!(entry.download_url.contains("/dl/z9"));
    }

    #[tokio::test]
    async fn test_format_tie_break_prefers_epub() {
        let (store, id) = seeded(None).await;
        // Identical metadata, different formats: scores tie, epub wins
        let provider = FakeProvider::new(vec![Ok(vec![
            candidate("p1", "Dune", "pdf"),
            candidate("e1", "Dune", "epub"),
        ])]);
        let stage = stage(provider, FakeLibrary { best: None });

        run(&stage, &store, id).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let entry = Store::queue_entry_for_item_in(&mut tx, id)
            .await
            .unwrap()
            .unwrap();
        let chosen = Store::search_result_by_id_in(&mut tx, entry.search_result_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chosen.extension.as_deref(), Some("epub"));
    }

    #[tokio::test]
    async fn test_below_threshold_is_no_match() {
        let (store, id) = seeded(None).await;
        let provider = FakeProvider::new(vec![Ok(vec![candidate(
            "w1",
            "A Wholly Unrelated Gardening Manual",
            "pdf",
        )])]);
        let stage = stage(provider, FakeLibrary { best: None });

        let outcome = run(&stage, &store, id).await.unwrap();
        assert_eq!(outcome, StageOutcome::NoMatch);
        assert_eq!(
            stage.next_state(StageOutcome::NoMatch),
            ItemStatus::SearchNoResults
        );
    }

    #[tokio::test]
    async fn test_provider_not_found_maps_to_no_match() {
        let (store, id) = seeded(None).await;
        let provider = FakeProvider::new(vec![Err(EngineError::not_found("nothing matched"))]);
        let stage = stage(provider, FakeLibrary { best: None });

        let outcome = run(&stage, &store, id).await.unwrap();
        assert_eq!(outcome, StageOutcome::NoMatch);
    }

    #[tokio::test]
    async fn test_all_strategies_network_error_reraises() {
        let (store, id) = seeded(None).await;
        let provider = FakeProvider::new(vec![
            Err(EngineError::network("timeout")),
            Err(EngineError::network("timeout")),
        ]);
        let stage = stage(provider, FakeLibrary { best: None });

        let error = run(&stage, &store, id).await.unwrap_err();
        assert!(matches!(error, EngineError::Network(_)));
    }

    #[tokio::test]
    async fn test_existing_results_skip_remote_search() {
        let (store, id) = seeded(None).await;
        let provider = FakeProvider::new(vec![Ok(vec![candidate("z9", "Dune", "epub")])]);
        let stage = stage(provider.clone(), FakeLibrary { best: None });

        // First pass persists candidates and queues the match
        run(&stage, &store, id).await.unwrap();
        // Second pass answers from the store
        let outcome = run(&stage, &store, id).await.unwrap();
        assert_eq!(outcome, StageOutcome::Advanced);
        assert_eq!(provider.queries.lock().unwrap().len(), 1);
    }
}
