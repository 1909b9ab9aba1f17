use crate::aggregator::{Aggregator, ProcessOutcome, ProgressUpdate, RejectReason, ResultPayload};
use bytes::Bytes;
use std::sync::Arc;
use warp::{Filter, Rejection, Reply};

/// The four request shapes fixed by the wire protocol: results and progress,
/// each either scoped to one node or global.
pub fn routes(
    aggregator: Arc<Aggregator>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    results_by_node(aggregator.clone())
        .or(results_global(aggregator.clone()))
        .or(progress_by_node(aggregator.clone()))
        .or(progress_global(aggregator))
}

fn with_aggregator(
    aggregator: Arc<Aggregator>,
) -> impl Filter<Extract = (Arc<Aggregator>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || aggregator.clone())
}

fn results_by_node(
    aggregator: Arc<Aggregator>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!("api" / "v1" / "results" / "by-node" / String / String)
        .and(warp::put())
        .and(warp::header::optional::<String>("content-type"))
        .and(warp::header::optional::<String>("content-disposition"))
        .and(warp::body::bytes())
        .and(with_aggregator(aggregator))
        .and_then(
            |node: String, plugin: String, content_type, disposition, body, aggregator| {
                put_result(plugin, node, content_type, disposition, body, aggregator)
            },
        )
}

fn results_global(
    aggregator: Arc<Aggregator>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!("api" / "v1" / "results" / "global" / String)
        .and(warp::put())
        .and(warp::header::optional::<String>("content-type"))
        .and(warp::header::optional::<String>("content-disposition"))
        .and(warp::body::bytes())
        .and(with_aggregator(aggregator))
        .and_then(|plugin: String, content_type, disposition, body, aggregator| {
            put_result(plugin, String::new(), content_type, disposition, body, aggregator)
        })
}

fn progress_by_node(
    aggregator: Arc<Aggregator>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!("api" / "v1" / "progress" / "by-node" / String / String)
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_aggregator(aggregator))
        .and_then(|node: String, plugin: String, body, aggregator| {
            post_progress(plugin, node, body, aggregator)
        })
}

fn progress_global(
    aggregator: Arc<Aggregator>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!("api" / "v1" / "progress" / "global" / String)
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_aggregator(aggregator))
        .and_then(|plugin: String, body, aggregator| {
            post_progress(plugin, String::new(), body, aggregator)
        })
}

async fn put_result(
    plugin: String,
    node: String,
    content_type: Option<String>,
    disposition: Option<String>,
    body: Bytes,
    aggregator: Arc<Aggregator>,
) -> Result<impl Reply, Rejection> {
    let mime_type = content_type.unwrap_or_else(|| "application/octet-stream".to_string());
    let filename = disposition.as_deref().and_then(parse_filename);

    let result = ResultPayload {
        plugin,
        node,
        mime_type,
        filename,
        body,
        error_message: None,
    };

    match aggregator.process_result(result).await {
        ProcessOutcome::Persisted => Ok(text_reply("", warp::http::StatusCode::OK)),
        ProcessOutcome::PersistFailed => Ok(text_reply(
            "internal error persisting result",
            warp::http::StatusCode::INTERNAL_SERVER_ERROR,
        )),
        ProcessOutcome::Rejected(RejectReason::Forbidden) => Ok(text_reply(
            "result not in the expected set",
            warp::http::StatusCode::FORBIDDEN,
        )),
        ProcessOutcome::Rejected(RejectReason::Duplicate) => Ok(text_reply(
            "result already received",
            warp::http::StatusCode::CONFLICT,
        )),
    }
}

async fn post_progress(
    plugin: String,
    node: String,
    body: Bytes,
    aggregator: Arc<Aggregator>,
) -> Result<impl Reply, Rejection> {
    let mut update: ProgressUpdate = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(e) => {
            return Ok(text_reply(
                &format!("malformed progress body: {e}"),
                warp::http::StatusCode::BAD_REQUEST,
            ))
        }
    };
    update.plugin = plugin;
    update.node = node;
    update.timestamp = chrono::Utc::now();

    match aggregator.process_progress_update(update).await {
        Ok(()) => Ok(text_reply("", warp::http::StatusCode::OK)),
        Err(RejectReason::Forbidden) => Ok(text_reply(
            "progress update not in the expected set",
            warp::http::StatusCode::FORBIDDEN,
        )),
        Err(RejectReason::Duplicate) => unreachable!("progress updates are never rejected as duplicate"),
    }
}

fn text_reply(body: &str, status: warp::http::StatusCode) -> impl Reply {
    warp::reply::with_status(body.to_string(), status)
}

/// Parses `Content-Disposition: attachment; filename=...`, defaulting to
/// `None` (callers fall back to `result`) on anything unparsable.
fn parse_filename(disposition: &str) -> Option<String> {
    disposition.split(';').find_map(|part| {
        let part = part.trim();
        let (key, value) = part.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("filename") {
            Some(value.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}
