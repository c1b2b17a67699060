//! HTTP API: the `/p2p/*` routes peers call and a small client surface.

use crate::error::NodeError;
use crate::node::{ChainValidation, Node, NodeStatus};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use powchain_chain::ChainError;
use powchain_core::{Address, Block, Transaction};
use powchain_network::{
    BlockAnnouncement, BlockDisposition, ChainSummary, Handshake, NetworkError, PeerInfo,
    PeerList, RangeQuery, TransactionAnnouncement, TransactionDisposition, Transport,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// Error body: `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(status = %self.status, error = %self.message, "request failed");
        }
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<ChainError> for ApiError {
    fn from(err: ChainError) -> Self {
        let status = match &err {
            ChainError::InvalidBlock(_)
            | ChainError::InvalidTransaction(_)
            | ChainError::InvalidLinkage(_)
            | ChainError::DuplicateTransaction(_)
            | ChainError::ExpiredTransaction { .. } => StatusCode::BAD_REQUEST,
            ChainError::OutOfRange { .. } | ChainError::TransactionNotFound => StatusCode::NOT_FOUND,
            ChainError::Capacity(_) => StatusCode::SERVICE_UNAVAILABLE,
            ChainError::GenesisMismatch { .. }
            | ChainError::CorruptChain { .. }
            | ChainError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<NetworkError> for ApiError {
    fn from(err: NetworkError) -> Self {
        if let NetworkError::Chain(chain) = err {
            return chain.into();
        }
        let status = match &err {
            NetworkError::Incompatible(_) => StatusCode::CONFLICT,
            NetworkError::Blacklisted(_) => StatusCode::FORBIDDEN,
            NetworkError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, err.to_string())
    }
}

impl From<NodeError> for ApiError {
    fn from(err: NodeError) -> Self {
        match err {
            NodeError::Chain(chain) => chain.into(),
            NodeError::Network(network) => network.into(),
            NodeError::BootstrapFailed(network) => network.into(),
            other => Self::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        }
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
struct ChainQuery {
    from: Option<u64>,
    to: Option<u64>,
}

#[derive(Debug, Serialize)]
struct DispositionResponse {
    disposition: &'static str,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    hash: String,
}

#[derive(Debug, Serialize)]
struct BalanceResponse {
    address: String,
    balance: u64,
}

/// Build the router for `node`.
pub fn router<T: Transport>(node: Arc<Node<T>>) -> Router {
    Router::new()
        // Peer protocol
        .route("/p2p/handshake", post(p2p_handshake::<T>))
        .route("/p2p/blocks", get(p2p_blocks::<T>))
        .route("/p2p/block", post(p2p_block::<T>))
        .route("/p2p/transaction", post(p2p_transaction::<T>))
        .route("/p2p/peers", get(p2p_peers::<T>))
        .route("/p2p/status", get(p2p_status::<T>))
        // Client
        .route("/status", get(status::<T>))
        .route("/chain", get(chain::<T>))
        .route("/peers", get(peers::<T>))
        .route("/transactions", post(submit_transaction::<T>))
        .route("/balance/:address", get(balance::<T>))
        .route("/validate", get(validate::<T>))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(node)
}

/// Serve the API on `listener` until `shutdown` resolves.
pub async fn serve<T: Transport>(
    node: Arc<Node<T>>,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "HTTP API listening");
    axum::serve(listener, router(node))
        .with_graceful_shutdown(shutdown)
        .await
}

// =============================================================================
// Peer protocol
// =============================================================================

async fn p2p_handshake<T: Transport>(
    State(node): State<Arc<Node<T>>>,
    Json(hello): Json<Handshake>,
) -> ApiResult<Json<Handshake>> {
    Ok(Json(node.protocol().on_handshake(hello)?))
}

async fn p2p_blocks<T: Transport>(
    State(node): State<Arc<Node<T>>>,
    Query(range): Query<RangeQuery>,
) -> ApiResult<Json<Vec<Block>>> {
    if range.from > range.to {
        return Err(ApiError::bad_request(format!(
            "from {} is after to {}",
            range.from, range.to
        )));
    }
    Ok(Json(node.protocol().serve_range(range.from, range.to)?))
}

async fn p2p_block<T: Transport>(
    State(node): State<Arc<Node<T>>>,
    Json(message): Json<BlockAnnouncement>,
) -> ApiResult<Json<DispositionResponse>> {
    let disposition = match node.protocol().on_block(message)? {
        BlockDisposition::Accepted(_) => "accepted",
        BlockDisposition::Orphan => "orphan",
        BlockDisposition::Known => "known",
    };
    Ok(Json(DispositionResponse { disposition }))
}

async fn p2p_transaction<T: Transport>(
    State(node): State<Arc<Node<T>>>,
    Json(message): Json<TransactionAnnouncement>,
) -> ApiResult<Json<DispositionResponse>> {
    let disposition = match node.protocol().on_transaction(message)? {
        TransactionDisposition::Accepted(_) => "accepted",
        TransactionDisposition::Known => "known",
    };
    Ok(Json(DispositionResponse { disposition }))
}

async fn p2p_peers<T: Transport>(State(node): State<Arc<Node<T>>>) -> Json<PeerList> {
    Json(node.protocol().peer_list())
}

async fn p2p_status<T: Transport>(State(node): State<Arc<Node<T>>>) -> Json<ChainSummary> {
    Json(node.protocol().summary())
}

// =============================================================================
// Client
// =============================================================================

async fn status<T: Transport>(State(node): State<Arc<Node<T>>>) -> Json<NodeStatus> {
    Json(node.status())
}

/// Defaults to the whole canonical chain.
async fn chain<T: Transport>(
    State(node): State<Arc<Node<T>>>,
    Query(query): Query<ChainQuery>,
) -> ApiResult<Json<Vec<Block>>> {
    let from = query.from.unwrap_or(0);
    let to = match query.to {
        Some(to) => to,
        None => node.status().height.saturating_sub(1),
    };
    if from > to {
        return Err(ApiError::bad_request(format!("from {from} is after to {to}")));
    }
    Ok(Json(node.get_chain(from, to)?))
}

async fn peers<T: Transport>(State(node): State<Arc<Node<T>>>) -> Json<Vec<PeerInfo>> {
    Json(node.peers())
}

async fn submit_transaction<T: Transport>(
    State(node): State<Arc<Node<T>>>,
    Json(tx): Json<Transaction>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let hash = node.submit_transaction(tx)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            hash: hash.to_string(),
        }),
    ))
}

async fn balance<T: Transport>(
    State(node): State<Arc<Node<T>>>,
    Path(address): Path<String>,
) -> ApiResult<Json<BalanceResponse>> {
    let parsed = Address::from_hex(&address)
        .map_err(|e| ApiError::bad_request(format!("invalid address {address}: {e}")))?;
    Ok(Json(BalanceResponse {
        address: parsed.to_hex(),
        balance: node.balance(&parsed),
    }))
}

/// Always 200; `valid` carries the verdict.
async fn validate<T: Transport>(State(node): State<Arc<Node<T>>>) -> Json<ChainValidation> {
    Json(node.validate())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GenesisAllocation, NodeConfig};
    use axum::body::Body;
    use axum::http::Request;
    use powchain_core::{Hash, Keypair};
    use powchain_network::{HttpTransport, NodeRole, PROTOCOL_VERSION};
    use powchain_storage::Storage;
    use serde_json::Value;
    use tower::ServiceExt;

    fn test_node(funded: Option<&Keypair>) -> Arc<Node> {
        let config = NodeConfig {
            role: NodeRole::Initial,
            initial_difficulty: 1,
            genesis_allocations: funded
                .map(|kp| {
                    vec![GenesisAllocation {
                        address: kp.address().to_hex(),
                        amount: 1_000,
                    }]
                })
                .unwrap_or_default(),
            ..NodeConfig::default()
        };
        let storage = Storage::open_temporary().unwrap();
        Arc::new(Node::with_storage(config, storage, HttpTransport::new().unwrap()).unwrap())
    }

    async fn call(node: &Arc<Node>, request: Request<Body>) -> (StatusCode, Value) {
        let response = router(Arc::clone(node)).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: &impl Serialize) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_status_reports_genesis() {
        let node = test_node(None);
        let (status, body) = call(&node, get_request("/status")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["height"], 1);
        assert_eq!(body["difficulty"], 1);
        assert_eq!(body["peer_count"], 0);
        assert_eq!(body["role"], "initial");
        assert_eq!(body["sync_state"], "unbootstrapped");
        assert_eq!(body["mining"], false);
        assert!(body["miner"].is_null());
    }

    #[tokio::test]
    async fn test_validate_route() {
        let alice = Keypair::generate();
        let node = test_node(Some(&alice));
        let (status, body) = call(&node, get_request("/validate")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["valid"], true);
        assert_eq!(body["height"], 1);
        assert_eq!(body["tip"], serde_json::to_value(node.status().tip).unwrap());
        assert!(body.get("error").is_none());
    }

    #[tokio::test]
    async fn test_handshake_rejects_foreign_genesis() {
        let node = test_node(None);
        let hello = Handshake {
            version: PROTOCOL_VERSION,
            genesis_hash: Hash::ZERO,
            height: 1,
            listen_addr: Some("127.0.0.1:9100".into()),
        };
        let (status, body) = call(&node, post_json("/p2p/handshake", &hello)).await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("genesis"));
        assert!(!node.protocol().has_peer("127.0.0.1:9100"));
    }

    #[tokio::test]
    async fn test_handshake_registers_peer() {
        let node = test_node(None);
        let hello = Handshake {
            version: PROTOCOL_VERSION,
            genesis_hash: node.status().tip,
            height: 1,
            listen_addr: Some("127.0.0.1:9100".into()),
        };
        let (status, body) = call(&node, post_json("/p2p/handshake", &hello)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["height"], 1);
        assert!(node.protocol().has_peer("127.0.0.1:9100"));

        let (_, peers) = call(&node, get_request("/p2p/peers")).await;
        assert_eq!(peers["peers"][0], "127.0.0.1:9100");
    }

    #[tokio::test]
    async fn test_block_range_routes() {
        let node = test_node(None);

        let (status, body) = call(&node, get_request("/p2p/blocks?from=0&to=10")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().map(Vec::len), Some(1));

        let (status, _) = call(&node, get_request("/p2p/blocks?from=3&to=5")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&node, get_request("/chain?from=2&to=1")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&node, get_request("/chain")).await;
        assert_eq!(status, StatusCode::OK);
        let blocks: Vec<Block> = serde_json::from_value(body).unwrap();
        assert_eq!(blocks[0].hash(), node.status().tip);
    }

    #[tokio::test]
    async fn test_submit_transaction_and_balance() {
        let alice = Keypair::generate();
        let node = test_node(Some(&alice));
        let tx = Transaction::transfer(alice.address(), Address::from_bytes([9; 20]), 10, 1, 0)
            .signed(&alice);

        let (status, body) = call(&node, post_json("/transactions", &tx)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["hash"], tx.hash().to_string());

        let (status, _) = call(&node, post_json("/transactions", &tx)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let overdraft = Transaction::transfer(alice.address(), Address::ZERO, 5_000, 0, 1)
            .signed(&alice);
        let (status, body) = call(&node, post_json("/transactions", &overdraft)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let uri = format!("/balance/{}", alice.address().to_hex());
        let (status, body) = call(&node, get_request(&uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["balance"], 1_000);

        let (status, _) = call(&node, get_request("/balance/not-an-address")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_pushed_block_dispositions() {
        let node = test_node(None);
        let genesis = node.get_chain(0, 0).unwrap().remove(0);
        let message = BlockAnnouncement {
            block: genesis,
            origin: None,
        };

        let (status, body) = call(&node, post_json("/p2p/block", &message)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["disposition"], "known");
    }

    #[test]
    fn test_error_status_mapping() {
        let incompatible = ApiError::from(NetworkError::Incompatible("genesis".into()));
        assert_eq!(incompatible.status(), StatusCode::CONFLICT);

        let blacklisted = ApiError::from(NetworkError::Blacklisted("a:1".into()));
        assert_eq!(blacklisted.status(), StatusCode::FORBIDDEN);

        let full = ApiError::from(NodeError::Chain(ChainError::Capacity(
            powchain_chain::CapacityError::PoolFull(1),
        )));
        assert_eq!(full.status(), StatusCode::SERVICE_UNAVAILABLE);

        let wrapped = ApiError::from(NetworkError::Chain(ChainError::TransactionNotFound));
        assert_eq!(wrapped.status(), StatusCode::NOT_FOUND);
    }
}
