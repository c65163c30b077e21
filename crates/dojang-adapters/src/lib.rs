//! Upstream ranking feed contracts + the paginating crawler.

use std::time::Duration;

use async_trait::async_trait;
use dojang_core::{deserialize_lenient_i64, PartitionKey, RankRecord, WeekSelector};
use dojang_storage::{FetchError, HttpFetcher};
use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "dojang-adapters";

pub const DEFAULT_FEED_BASE_URL: &str =
    "http://m.maplestory.nexon.com/MapleStory/Data/Json/Ranking";

/// Fixed pause before every page request. Not a backoff: it never grows.
pub const PAGE_DELAY: Duration = Duration::from_millis(200);

const FIRST_PAGE_INDEX: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedTarget {
    pub world: i32,
    pub type_id: i32,
    pub week: WeekSelector,
}

impl FeedTarget {
    pub fn partition(&self) -> PartitionKey {
        PartitionKey::new(self.world, self.type_id)
    }
}

/// One page of the upstream leaderboard. An empty `list` marks the end of data.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedPage {
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub list: Vec<RankRecord>,
    #[serde(rename = "nextidx", default, deserialize_with = "deserialize_lenient_i64")]
    pub next_index: i64,
}

pub fn decode_page(body: &[u8]) -> Result<FeedPage, serde_json::Error> {
    serde_json::from_slice(body)
}

/// Raw transport for a single feed page.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn get_page(&self, target: &FeedTarget, page_index: i64) -> Result<Vec<u8>, FetchError>;
}

/// Full-leaderboard fetch for one (world, type, week).
#[async_trait]
pub trait RankingFeed: Send + Sync {
    async fn fetch(&self, target: FeedTarget) -> Result<Vec<RankRecord>, FetchError>;
}

fn endpoint(week: WeekSelector) -> &'static str {
    match week {
        WeekSelector::ThisWeek => "DojangThisWeekListJson.aspx",
        WeekSelector::LastWeek => "DojangLastWeekListJson.aspx",
    }
}

#[derive(Debug, Clone)]
pub struct HttpPageSource {
    http: HttpFetcher,
    base_url: String,
}

impl HttpPageSource {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn page_url(&self, target: &FeedTarget, page_index: i64) -> Result<Url, FetchError> {
        let raw = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            endpoint(target.week)
        );
        let mut url = Url::parse(&raw).map_err(|err| FetchError::InvalidUrl {
            url: raw.clone(),
            reason: err.to_string(),
        })?;
        url.query_pairs_mut()
            .append_pair("rankidx", &page_index.to_string())
            .append_pair("cateType", &target.type_id.to_string())
            .append_pair("GameWorldID", &target.world.to_string());
        Ok(url)
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn get_page(&self, target: &FeedTarget, page_index: i64) -> Result<Vec<u8>, FetchError> {
        let url = self.page_url(target, page_index)?;
        Ok(self.http.fetch_bytes(url).await?.body)
    }
}

/// Walks the feed from page 1 until an empty page.
///
/// A transport error, including a non-2xx status, aborts the whole fetch and
/// drops every record gathered so far. A page that fails to decode counts as
/// empty, which ends the walk. A `nextidx` that does not move past the current
/// page index also ends the walk, keeping what was gathered.
pub struct RankingCrawler<S> {
    source: S,
    page_delay: Duration,
}

impl<S: PageSource> RankingCrawler<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            page_delay: PAGE_DELAY,
        }
    }
}

#[async_trait]
impl<S: PageSource> RankingFeed for RankingCrawler<S> {
    async fn fetch(&self, target: FeedTarget) -> Result<Vec<RankRecord>, FetchError> {
        let mut page_index = FIRST_PAGE_INDEX;
        let mut records = Vec::with_capacity(200);
        let mut pages = 0usize;

        loop {
            tokio::time::sleep(self.page_delay).await;
            let body = self.source.get_page(&target, page_index).await?;

            let page = match decode_page(&body) {
                Ok(page) => page,
                Err(err) => {
                    warn!(
                        world = target.world,
                        type_id = target.type_id,
                        page_index,
                        error = %err,
                        "undecodable feed page treated as empty"
                    );
                    FeedPage::default()
                }
            };

            if page.list.is_empty() {
                break;
            }
            pages += 1;
            debug!(page_index, items = page.list.len(), result = %page.result, "feed page");
            records.extend(page.list);

            if page.next_index <= page_index {
                warn!(
                    page_index,
                    next_index = page.next_index,
                    "feed cursor did not advance; stopping"
                );
                break;
            }
            page_index = page.next_index;
        }

        info!(
            world = target.world,
            type_id = target.type_id,
            week = ?target.week,
            pages,
            items = records.len(),
            "feed crawl finished"
        );
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    enum Reply {
        Body(String),
        Fail,
    }

    struct ScriptedSource {
        pages: HashMap<i64, Reply>,
        requested: Mutex<Vec<i64>>,
    }

    impl ScriptedSource {
        fn new(pages: Vec<(i64, Reply)>) -> Self {
            Self {
                pages: pages.into_iter().collect(),
                requested: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PageSource for ScriptedSource {
        async fn get_page(&self, _target: &FeedTarget, page_index: i64) -> Result<Vec<u8>, FetchError> {
            self.requested.lock().unwrap().push(page_index);
            match self.pages.get(&page_index) {
                Some(Reply::Body(body)) => Ok(body.clone().into_bytes()),
                Some(Reply::Fail) => Err(FetchError::HttpStatus {
                    status: 503,
                    url: format!("page-{page_index}"),
                }),
                None => Ok(br#"{"result":"ok","list":[],"nextidx":"0"}"#.to_vec()),
            }
        }
    }

    fn page_body(names: &[&str], next: i64) -> String {
        let items = names
            .iter()
            .map(|n| format!(r#"{{"nick":"{n}","floor":"10층","duration":"1분 00초","rank":"1"}}"#))
            .collect::<Vec<_>>()
            .join(",");
        format!(r#"{{"result":"ok","list":[{items}],"nextidx":"{next}"}}"#)
    }

    fn page(names: &[&str], next: i64) -> Reply {
        Reply::Body(page_body(names, next))
    }

    fn target() -> FeedTarget {
        FeedTarget {
            world: 1,
            type_id: 2,
            week: WeekSelector::ThisWeek,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn follows_cursor_until_empty_page() {
        let source = ScriptedSource::new(vec![(1, page(&["a", "b"], 21)), (21, page(&["c"], 41))]);
        let crawler = RankingCrawler::new(source);
        let started = tokio::time::Instant::now();

        let records = crawler.fetch(target()).await.unwrap();

        let names: Vec<_> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(*crawler.source.requested.lock().unwrap(), vec![1, 21, 41]);
        assert!(started.elapsed() >= PAGE_DELAY * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_discards_accumulated_items() {
        let source = ScriptedSource::new(vec![(1, page(&["a"], 2)), (2, Reply::Fail)]);
        let crawler = RankingCrawler::new(source);

        let err = crawler.fetch(target()).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_page_ends_crawl_without_error() {
        let source = ScriptedSource::new(vec![
            (1, page(&["a"], 2)),
            (2, Reply::Body("<html>maintenance</html>".into())),
            (3, page(&["never"], 4)),
        ]);
        let crawler = RankingCrawler::new(source);

        let records = crawler.fetch(target()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(*crawler.source.requested.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_cursor_ends_crawl_with_gathered_items() {
        let source = ScriptedSource::new(vec![(1, page(&["a"], 1))]);
        let crawler = RankingCrawler::new(source);

        let records = crawler.fetch(target()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(*crawler.source.requested.lock().unwrap(), vec![1]);
    }

    async fn serve_feed(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/Ranking")
    }

    fn http_crawler(base_url: String) -> RankingCrawler<HttpPageSource> {
        let http = HttpFetcher::new(Default::default()).unwrap();
        RankingCrawler::new(HttpPageSource::new(http, base_url))
    }

    fn feed_router(second_page: fn() -> axum::response::Response) -> axum::Router {
        use axum::extract::Query;
        use axum::response::IntoResponse;

        axum::Router::new().route(
            "/Ranking/DojangThisWeekListJson.aspx",
            axum::routing::get(move |Query(params): Query<HashMap<String, String>>| async move {
                match params.get("rankidx").map(String::as_str) {
                    Some("1") => (
                        [("content-type", "application/json")],
                        page_body(&["a", "b"], 2),
                    )
                        .into_response(),
                    Some("2") => second_page(),
                    _ => r#"{"result":"ok","list":[],"nextidx":"0"}"#.into_response(),
                }
            }),
        )
    }

    #[tokio::test]
    async fn http_error_status_aborts_crawl() {
        use axum::response::IntoResponse;

        let base_url = serve_feed(feed_router(|| {
            (axum::http::StatusCode::SERVICE_UNAVAILABLE, "busy").into_response()
        }))
        .await;

        let err = http_crawler(base_url).fetch(target()).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
    }

    #[tokio::test]
    async fn http_ok_with_garbage_body_is_an_empty_page() {
        use axum::response::IntoResponse;

        let base_url = serve_feed(feed_router(|| "<html>maintenance</html>".into_response())).await;

        let records = http_crawler(base_url).fetch(target()).await.unwrap();
        let names: Vec<_> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn page_url_carries_upstream_query_parameters() {
        let http = HttpFetcher::new(Default::default()).unwrap();
        let source = HttpPageSource::new(http, "http://feed.test/Ranking/");
        let url = source
            .page_url(
                &FeedTarget {
                    world: 12,
                    type_id: 2,
                    week: WeekSelector::LastWeek,
                },
                41,
            )
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://feed.test/Ranking/DojangLastWeekListJson.aspx?rankidx=41&cateType=2&GameWorldID=12"
        );
    }
}
