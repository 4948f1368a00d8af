//! # HTTP API
//!
//! Builds the axum router for the node's HTTP interface. Handlers read
//! through the shared [`ChainService`], so they see the same tree and store
//! the import loop writes to.
//!
//! ## Endpoints
//!
//! | Method | Path                     | Description                          |
//! |--------|--------------------------|--------------------------------------|
//! | GET    | `/health`                | Liveness check                       |
//! | GET    | `/status`                | Node and chain summary               |
//! | GET    | `/chain/best`            | Best tip                             |
//! | GET    | `/chain/leaves`          | All tips, best first                 |
//! | GET    | `/chain/finalized`       | Current root and finalization log    |
//! | GET    | `/blocks/:hash`          | Block by hash                        |
//! | GET    | `/blocks/number/:number` | Block at a height on the best chain  |
//! | GET    | `/tree`                  | Text dump of the block tree          |
//! | POST   | `/blocks`                | Submit a block for import            |
//! | POST   | `/finalize/:hash`        | Finalize a block and prune           |

use axum::{
    extract::{Path, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use arbor_protocol::blocktree::{BlockTreeError, FinalizedCheckpoint, NodeSummary};
use arbor_protocol::config::{PROTOCOL_VERSION, SLOT_DURATION_MS};
use arbor_protocol::network::{ChainService, ImportResult, ServiceError};
use arbor_protocol::storage::block::now_millis;
use arbor_protocol::storage::{Block, BlockHash};

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared state for all handlers. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub service: Arc<ChainService>,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/chain/best", get(best_handler))
        .route("/chain/leaves", get(leaves_handler))
        .route("/chain/finalized", get(finalized_handler))
        .route("/blocks", post(submit_block_handler))
        .route("/blocks/:hash", get(block_by_hash_handler))
        .route("/blocks/number/:number", get(block_by_number_handler))
        .route("/tree", get(tree_handler))
        .route("/finalize/:hash", post(finalize_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response Types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub protocol_version: u32,
    pub genesis_hash: BlockHash,
    pub best_number: u64,
    pub best_hash: BlockHash,
    pub finalized_number: u64,
    pub finalized_hash: BlockHash,
    pub tree_nodes: usize,
    pub leaves: usize,
    pub orphans: usize,
    pub peers: usize,
    /// ISO-8601 timestamp of the response.
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BlockResponse {
    pub hash: BlockHash,
    pub parent_hash: BlockHash,
    pub number: u64,
    pub state_root: String,
    pub extrinsics_root: String,
    pub extrinsic_count: usize,
    pub arrival_time: u64,
    /// Depth in the tree, if the block is still indexed.
    pub depth: Option<u64>,
    pub slot: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct FinalizedResponse {
    pub root: NodeSummary,
    pub checkpoints: Vec<FinalizedCheckpoint>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_parent: Option<BlockHash>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FinalizeResponse {
    pub hash: BlockHash,
    pub pruned: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}

fn service_error_response(e: ServiceError) -> Response {
    let status = match &e {
        ServiceError::InvalidBlock(_) => StatusCode::BAD_REQUEST,
        ServiceError::Tree(BlockTreeError::InvalidBlockNumber { .. }) => StatusCode::BAD_REQUEST,
        ServiceError::Tree(BlockTreeError::NotFound(_)) => StatusCode::NOT_FOUND,
        ServiceError::Stale { .. } | ServiceError::PrunedParent { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, e.to_string())
}

fn block_response(block: &Block, service: &ChainService) -> BlockResponse {
    let tree = service.tree();
    BlockResponse {
        hash: block.hash(),
        parent_hash: block.parent_hash(),
        number: block.number(),
        state_root: hex::encode(block.header.state_root),
        extrinsics_root: hex::encode(block.header.extrinsics_root),
        extrinsic_count: block.body.len(),
        arrival_time: block.arrival_time,
        depth: tree.get_node(&block.hash()).map(|n| n.depth()),
        slot: tree.compute_slot_for_block(block, SLOT_DURATION_MS).ok(),
    }
}

fn parse_hash(raw: &str) -> Result<BlockHash, Response> {
    raw.parse()
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, format!("invalid hash: {}", e)))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health`: 200 while the process is up.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let service = &state.service;
    let snapshot = service.tree().snapshot();
    let local = service.local_status();
    let peers = service.peers().count().await.unwrap_or(0);

    Json(StatusResponse {
        version: state.version.clone(),
        protocol_version: PROTOCOL_VERSION,
        genesis_hash: local.genesis_hash,
        best_number: snapshot.best.number,
        best_hash: snapshot.best.hash,
        finalized_number: snapshot.root.number,
        finalized_hash: snapshot.root.hash,
        tree_nodes: snapshot.node_count,
        leaves: snapshot.leaves.len(),
        orphans: service.orphan_count(),
        peers,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn best_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(NodeSummary::from(&state.service.tree().deepest_leaf()))
}

async fn leaves_handler(State(state): State<AppState>) -> impl IntoResponse {
    let leaves: Vec<NodeSummary> = state
        .service
        .tree()
        .leaves()
        .iter()
        .map(NodeSummary::from)
        .collect();
    Json(leaves)
}

async fn finalized_handler(State(state): State<AppState>) -> impl IntoResponse {
    let tree = state.service.tree();
    Json(FinalizedResponse {
        root: NodeSummary::from(&tree.root()),
        checkpoints: tree.finalized_blocks(),
    })
}

/// `GET /blocks/:hash`: any stored block, indexed or not.
async fn block_by_hash_handler(
    Path(hash): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let hash = match parse_hash(&hash) {
        Ok(h) => h,
        Err(resp) => return resp,
    };
    match state.service.db().get_block(&hash) {
        Ok(Some(block)) => Json(block_response(&block, &state.service)).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("block {} not found", hash)),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("database error: {}", e),
        ),
    }
}

/// `GET /blocks/number/:number`: resolved through the tree, best chain first.
async fn block_by_number_handler(
    Path(number): Path<u64>,
    State(state): State<AppState>,
) -> Response {
    let service = &state.service;
    match service
        .tree()
        .get_block_from_block_number(number, service.db())
    {
        Ok(block) => Json(block_response(&block, service)).into_response(),
        Err(BlockTreeError::NotFound(id)) => {
            error_response(StatusCode::NOT_FOUND, format!("{} not found", id))
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn tree_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.service.tree().render(),
    )
}

/// `POST /blocks`: import a JSON-encoded block as if it had just arrived.
async fn submit_block_handler(State(state): State<AppState>, Json(block): Json<Block>) -> Response {
    let block = block.with_arrival_time(now_millis());
    let hash = block.hash();
    match state.service.import_block(block) {
        Ok(ImportResult::Imported) => {
            tracing::info!(hash = %hash, "block submitted over http");
            (
                StatusCode::OK,
                Json(SubmitResponse {
                    result: "imported".into(),
                    missing_parent: None,
                }),
            )
                .into_response()
        }
        Ok(ImportResult::AlreadyKnown) => (
            StatusCode::OK,
            Json(SubmitResponse {
                result: "already_known".into(),
                missing_parent: None,
            }),
        )
            .into_response(),
        Ok(ImportResult::Orphaned { missing_parent }) => (
            StatusCode::ACCEPTED,
            Json(SubmitResponse {
                result: "orphaned".into(),
                missing_parent: Some(missing_parent),
            }),
        )
            .into_response(),
        Err(e) => service_error_response(e),
    }
}

async fn finalize_handler(Path(hash): Path<String>, State(state): State<AppState>) -> Response {
    let hash = match parse_hash(&hash) {
        Ok(h) => h,
        Err(resp) => return resp,
    };
    match state.service.finalize(&hash) {
        Ok(pruned) => Json(FinalizeResponse { hash, pruned }).into_response(),
        Err(e) => service_error_response(e),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
