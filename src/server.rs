use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinError;
use tracing::{error, info};
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Reply};

use crate::actions::ActionRequest;
use crate::error::{LedgerError, Result};
use crate::query::TableQuery;
use crate::storage::{Backend, Compact};
use crate::Ledger;

// Request bodies are small JSON documents
const MAX_BODY: u64 = 64 * 1024;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

fn status_of(e: &LedgerError) -> StatusCode {
    match e {
        LedgerError::NotFound { .. } => StatusCode::NOT_FOUND,
        LedgerError::Unauthorized(_) => StatusCode::FORBIDDEN,
        LedgerError::CapacityExceeded { .. } => StatusCode::CONFLICT,
        LedgerError::InvalidName(_)
        | LedgerError::UnknownIndex { .. }
        | LedgerError::UnknownAction(_)
        | LedgerError::InvalidArgument(_)
        | LedgerError::InvalidOperation(_)
        | LedgerError::Serialization(_) => StatusCode::BAD_REQUEST,
        LedgerError::Corruption(_) | LedgerError::Io(_) | LedgerError::Poisoned => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_reply(e: &LedgerError) -> Response {
    let body = ErrorBody {
        error: e.kind(),
        message: e.to_string(),
    };
    warp::reply::with_status(warp::reply::json(&body), status_of(e)).into_response()
}

fn respond<T: Serialize>(result: std::result::Result<Result<T>, JoinError>) -> Response {
    match result {
        Ok(Ok(body)) => warp::reply::json(&body).into_response(),
        Ok(Err(e)) => error_reply(&e),
        Err(e) => {
            error!(error = %e, "request task failed");
            let body = ErrorBody {
                error: "internal",
                message: e.to_string(),
            };
            warp::reply::with_status(warp::reply::json(&body), StatusCode::INTERNAL_SERVER_ERROR).into_response()
        }
    }
}

/// All HTTP routes over one ledger.
pub fn routes<B>(ledger: Arc<Ledger<B>>) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone
where
    B: Backend + Compact + Send + 'static,
{
    // POST /v1/chain/push_action
    let push_action = warp::path!("v1" / "chain" / "push_action")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY))
        .and(warp::body::json())
        .and(with_ledger(ledger.clone()))
        .and_then(|request: ActionRequest, ledger: Arc<Ledger<B>>| async move {
            let res = tokio::task::spawn_blocking(move || ledger.push_action(request)).await;
            Ok::<_, Infallible>(respond(res))
        });

    // POST /v1/chain/get_table_rows
    let get_table_rows = warp::path!("v1" / "chain" / "get_table_rows")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY))
        .and(warp::body::json())
        .and(with_ledger(ledger.clone()))
        .and_then(|query: TableQuery, ledger: Arc<Ledger<B>>| async move {
            let res = tokio::task::spawn_blocking(move || ledger.get_table_rows(&query)).await;
            Ok::<_, Infallible>(respond(res))
        });

    // POST /v1/admin/compact
    let compact = warp::path!("v1" / "admin" / "compact")
        .and(warp::post())
        .and(with_ledger(ledger))
        .and_then(|ledger: Arc<Ledger<B>>| async move {
            info!("manual compaction triggered");
            let res = tokio::task::spawn_blocking(move || ledger.compact()).await;
            Ok::<_, Infallible>(respond(res))
        });

    // GET /v1/health
    let health = warp::path!("v1" / "health")
        .and(warp::get())
        .map(|| warp::reply::json(&serde_json::json!({ "status": "ok" })));

    push_action.or(get_table_rows).or(compact).or(health)
}

fn with_ledger<B: Send + 'static>(
    ledger: Arc<Ledger<B>>,
) -> impl Filter<Extract = (Arc<Ledger<B>>,), Error = Infallible> + Clone {
    warp::any().map(move || ledger.clone())
}

/// Serves until `shutdown` resolves.
pub async fn run<B, F>(ledger: Arc<Ledger<B>>, addr: SocketAddr, shutdown: F) -> Result<()>
where
    B: Backend + Compact + Send + 'static,
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let (bound, server) = warp::serve(routes(ledger))
        .try_bind_with_graceful_shutdown(addr, shutdown)
        .map_err(|e| LedgerError::Io(io::Error::new(io::ErrorKind::AddrNotAvailable, e)))?;
    info!(addr = %bound, "http api listening");
    server.await;
    Ok(())
}
