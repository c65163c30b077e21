//! Axum JSON query endpoint over the rank store.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::header,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use dojang_core::{PartitionKey, RankRecord};
use dojang_storage::{RankStore, StoreError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "dojang-web";

pub const DEFAULT_WEB_PORT: u16 = 4412;

#[derive(Clone)]
pub struct AppState {
    pub store: RankStore,
}

impl AppState {
    pub fn new(store: RankStore) -> Self {
        Self { store }
    }
}

/// Accepts both lower-case keys and the capitalized keys older clients send.
#[derive(Debug, Clone, Deserialize)]
pub struct RankQuery {
    #[serde(alias = "World")]
    pub world: i32,
    #[serde(rename = "type", alias = "Type")]
    pub type_id: i32,
    #[serde(alias = "Name")]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankResponse {
    pub ok: bool,
    pub recent: RankRecord,
    pub best: RankRecord,
    pub window_start: i64,
    pub window_end: i64,
}

/// Snapshot lookup of one player.
///
/// `ok` is set only when both the recent and best records exist. Window bounds
/// are reported whenever the partition exists, and are zero otherwise.
pub fn lookup_rank(store: &RankStore, query: &RankQuery) -> Result<RankResponse, StoreError> {
    let key = PartitionKey::new(query.world, query.type_id);
    let Some(view) = store.read_player(key, &query.name)? else {
        return Ok(RankResponse::default());
    };

    let window = view.window.unwrap_or_default();
    let mut response = RankResponse {
        window_start: window.start,
        window_end: window.end,
        ..Default::default()
    };
    if let (Some(recent), Some(best)) = (view.recent, view.best) {
        response.ok = true;
        response.recent = recent;
        response.best = best;
    }
    Ok(response)
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/getrank", post(get_rank_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "query server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env(store: RankStore) -> anyhow::Result<()> {
    let port: u16 = std::env::var("DOJANG_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_WEB_PORT);
    serve(AppState::new(store), port).await
}

async fn get_rank_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Json<RankQuery>, JsonRejection>,
) -> Response {
    let query = match query {
        Ok(Json(query)) => query,
        Err(rejection) => {
            warn!(error = %rejection, "malformed rank query");
            return no_cache(RankResponse::default());
        }
    };
    let store = state.store.clone();
    let lookup = query.clone();
    let response = match tokio::task::spawn_blocking(move || lookup_rank(&store, &lookup)).await {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            error!(world = query.world, type_id = query.type_id, error = %err, "rank lookup failed");
            RankResponse::default()
        }
        Err(err) => {
            error!(error = %err, "rank lookup task failed");
            RankResponse::default()
        }
    };
    no_cache(response)
}

fn no_cache(response: RankResponse) -> Response {
    ([(header::CACHE_CONTROL, "no-cache")], Json(response)).into_response()
}
