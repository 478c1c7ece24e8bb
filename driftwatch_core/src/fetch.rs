use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::ScopeConfig;
use crate::{Error, Result};

/// Opaque pagination cursor handed back by a source. The engine never
/// interprets it; connectors round-trip whatever JSON they need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageCursor(pub serde_json::Value);

impl PageCursor {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// One page of raw external records.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Page {
    pub items: Vec<serde_json::Value>,
    /// `None` signals the last page.
    pub next_cursor: Option<PageCursor>,
}

/// A paginated external collection. Reads must be idempotent so a
/// failed unit can be retried whole.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn list_page(&self, scope: &ScopeConfig, cursor: Option<&PageCursor>) -> Result<Page>;
}

/// Liveness signal to the orchestration host; called once per fetched
/// page so long pulls are not terminated as stuck.
pub trait Heartbeat: Send + Sync {
    fn beat(&self);
}

/// Ceiling on pages per fetch; a source that keeps returning cursors
/// past this point is looping.
const MAX_PAGES: u32 = 100_000;

/// Retrieve the complete collection for `scope`, accumulating all
/// pages in order.
///
/// Zero-result collections return `Ok(vec![])`. On any page error the
/// accumulated items are discarded: the caller gets either the
/// complete collection or an error, never a partial result.
#[tracing::instrument(level = "debug", skip(source, heartbeat))]
pub async fn fetch_all(
    source: &dyn PageSource,
    scope: &ScopeConfig,
    heartbeat: Option<&dyn Heartbeat>,
) -> Result<Vec<serde_json::Value>> {
    let mut items = Vec::new();
    let mut cursor: Option<PageCursor> = None;
    let mut pages = 0u32;

    loop {
        let page = source.list_page(scope, cursor.as_ref()).await?;
        items.extend(page.items);
        if let Some(hb) = heartbeat {
            hb.beat();
        }

        pages += 1;
        match page.next_cursor {
            Some(next) => {
                // Only a source that still offers a cursor at the
                // ceiling counts as looping; finishing exactly on the
                // last allowed page is fine.
                if pages >= MAX_PAGES {
                    return Err(Error::BackendMessage(format!(
                        "pagination exceeded {MAX_PAGES} pages for scope '{}'",
                        scope.scope
                    )));
                }
                cursor = Some(next);
            }
            None => break,
        }
    }

    tracing::debug!(scope = %scope.scope, pages, items = items.len(), "fetch complete");
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted source: serves fixed pages keyed by a numeric cursor.
    struct ScriptedSource {
        pages: Vec<Vec<serde_json::Value>>,
        fail_on_page: Option<usize>,
    }

    #[async_trait]
    impl PageSource for ScriptedSource {
        async fn list_page(
            &self,
            _scope: &ScopeConfig,
            cursor: Option<&PageCursor>,
        ) -> Result<Page> {
            let idx = match cursor {
                None => 0,
                Some(c) => c.0.as_u64().unwrap() as usize,
            };
            if self.fail_on_page == Some(idx) {
                return Err(Error::BackendMessage("source unavailable".to_string()));
            }
            let items = self.pages.get(idx).cloned().unwrap_or_default();
            let next = if idx + 1 < self.pages.len() {
                Some(PageCursor::new(serde_json::json!(idx as u64 + 1)))
            } else {
                None
            };
            Ok(Page {
                items,
                next_cursor: next,
            })
        }
    }

    struct CountingHeartbeat(AtomicUsize);

    impl Heartbeat for CountingHeartbeat {
        fn beat(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn scope() -> ScopeConfig {
        ScopeConfig::new("proj-1", 2, serde_json::json!({})).unwrap()
    }

    #[tokio::test]
    async fn returns_union_of_all_pages_in_order() {
        let source = ScriptedSource {
            pages: vec![
                vec![serde_json::json!({"id": 1}), serde_json::json!({"id": 2})],
                vec![serde_json::json!({"id": 3}), serde_json::json!({"id": 4})],
                // Non-full final page.
                vec![serde_json::json!({"id": 5})],
            ],
            fail_on_page: None,
        };
        let items = fetch_all(&source, &scope(), None).await.unwrap();
        let ids: Vec<i64> = items.iter().map(|v| v["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn empty_collection_is_ok() {
        let source = ScriptedSource {
            pages: vec![vec![]],
            fail_on_page: None,
        };
        let items = fetch_all(&source, &scope(), None).await.unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn mid_fetch_error_returns_no_partial_result() {
        let source = ScriptedSource {
            pages: vec![
                vec![serde_json::json!({"id": 1})],
                vec![serde_json::json!({"id": 2})],
            ],
            fail_on_page: Some(1),
        };
        let err = fetch_all(&source, &scope(), None).await;
        assert!(err.is_err());
    }

    /// Offers another cursor forever.
    struct LoopingSource;

    #[async_trait]
    impl PageSource for LoopingSource {
        async fn list_page(
            &self,
            _scope: &ScopeConfig,
            cursor: Option<&PageCursor>,
        ) -> Result<Page> {
            let idx = cursor.and_then(|c| c.0.as_u64()).unwrap_or(0);
            Ok(Page {
                items: vec![],
                next_cursor: Some(PageCursor::new(serde_json::json!(idx + 1))),
            })
        }
    }

    #[tokio::test]
    async fn completing_on_the_last_allowed_page_is_ok() {
        let source = ScriptedSource {
            pages: vec![Vec::new(); MAX_PAGES as usize],
            fail_on_page: None,
        };
        assert!(fetch_all(&source, &scope(), None).await.is_ok());
    }

    #[tokio::test]
    async fn endless_cursor_chain_is_cut_off() {
        let err = fetch_all(&LoopingSource, &scope(), None).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn heartbeat_fires_once_per_page() {
        let source = ScriptedSource {
            pages: vec![
                vec![serde_json::json!({"id": 1})],
                vec![serde_json::json!({"id": 2})],
                vec![],
            ],
            fail_on_page: None,
        };
        let hb = CountingHeartbeat(AtomicUsize::new(0));
        fetch_all(&source, &scope(), Some(&hb)).await.unwrap();
        assert_eq!(hb.0.load(Ordering::SeqCst), 3);
    }
}
