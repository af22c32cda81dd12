//! Line-delimited JSON-RPC over stdin/stdout.
//!
//! Each request is one JSON object per line:
//! `{"id": 1, "method": "GetPR", "params": {"owner": "o", "repo": "r", "number": 7}}`.
//! `params` may also be a one-element array and method names may carry an
//! `RPCHandler.` prefix, which is what existing editor clients send. Every
//! response carries `id`, `result` and `error`, one of the latter two null.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::pr::{PrKey, ReviewEvent};
use crate::service::{PrView, ReviewService};

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct Response {
    id: Value,
    result: Value,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PrParams {
    #[serde(alias = "Owner")]
    owner: String,
    #[serde(alias = "Repo")]
    repo: String,
    #[serde(alias = "Number")]
    number: u64,
}

impl PrParams {
    fn key(&self) -> PrKey {
        PrKey::new(self.owner.clone(), self.repo.clone(), self.number)
    }
}

#[derive(Debug, Deserialize)]
struct GetPrParams {
    #[serde(flatten)]
    pr: PrParams,
    #[serde(default, alias = "SkipCache", alias = "sync", alias = "Sync")]
    skip_cache: bool,
}

#[derive(Debug, Deserialize)]
struct AddCommentParams {
    #[serde(flatten)]
    pr: PrParams,
    #[serde(alias = "Filename")]
    filename: String,
    #[serde(default, alias = "Position")]
    position: Option<i64>,
    #[serde(alias = "Body")]
    body: String,
    #[serde(default, alias = "ReplyTo", alias = "InReplyTo")]
    reply_to: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct CommentIdParams {
    #[serde(alias = "ID", alias = "Id")]
    id: i64,
    #[serde(default, alias = "Body")]
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BodyParams {
    #[serde(flatten)]
    pr: PrParams,
    #[serde(default, alias = "Body")]
    body: Option<String>,
    #[serde(default, alias = "Event")]
    event: Option<String>,
}

#[derive(Debug, Serialize)]
struct WithId {
    id: i64,
    #[serde(flatten)]
    view: PrView,
}

/// Serve requests from `reader` until EOF, writing one response line per
/// request. Requests are handled in arrival order.
pub async fn serve<R, W>(service: Arc<ReviewService>, reader: R, mut writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(&service, &line).await;
        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
        writer.flush().await?;
    }
    debug!("rpc input closed");
    Ok(())
}

async fn handle_line(service: &Arc<ReviewService>, line: &str) -> Response {
    let request: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "malformed request");
            return Response {
                id: Value::Null,
                result: Value::Null,
                error: Some(Error::Rpc(format!("malformed request: {e}")).to_string()),
            };
        }
    };

    let method = request
        .method
        .strip_prefix("RPCHandler.")
        .unwrap_or(&request.method)
        .to_string();
    let count = service.record_request();
    debug!(method = %method, request = count, "handling request");

    match dispatch(service, &method, request.params).await {
        Ok(result) => Response {
            id: request.id,
            result: with_go_fields(result),
            error: None,
        },
        Err(e) => {
            warn!(method = %method, error = %e, "request failed");
            Response {
                id: request.id,
                result: Value::Null,
                error: Some(e.to_string()),
            }
        }
    }
}

async fn dispatch(service: &Arc<ReviewService>, method: &str, params: Value) -> Result<Value> {
    match method {
        "Hello" => {
            let count = service.health();
            Ok(serde_json::json!({
                "count": count,
                "content": format!("hello {count}"),
            }))
        }
        "GetPR" => {
            let p: GetPrParams = parse_params(params)?;
            blocking(service, move |s| s.get_pr(&p.pr.key(), p.skip_cache)).await
        }
        "SyncPR" => {
            let p: PrParams = parse_params(params)?;
            blocking(service, move |s| s.sync_pr(&p.key())).await
        }
        "AddComment" => {
            let p: AddCommentParams = parse_params(params)?;
            blocking(service, move |s| {
                let (id, view) =
                    s.add_comment(&p.pr.key(), &p.filename, p.position, &p.body, p.reply_to)?;
                Ok(WithId { id, view })
            })
            .await
        }
        "EditComment" => {
            let p: CommentIdParams = parse_params(params)?;
            let body = p
                .body
                .ok_or_else(|| Error::InvalidRequest("missing body".to_string()))?;
            blocking(service, move |s| s.edit_comment(p.id, &body)).await
        }
        "DeleteComment" => {
            let p: CommentIdParams = parse_params(params)?;
            blocking(service, move |s| s.delete_comment(p.id)).await
        }
        "RemovePRComments" => {
            let p: PrParams = parse_params(params)?;
            blocking(service, move |s| s.remove_pr_comments(&p.key())).await
        }
        "SetFeedback" => {
            let p: BodyParams = parse_params(params)?;
            let body = p
                .body
                .ok_or_else(|| Error::InvalidRequest("missing body".to_string()))?;
            blocking(service, move |s| {
                let (id, view) = s.set_feedback(&p.pr.key(), &body)?;
                Ok(WithId { id, view })
            })
            .await
        }
        "SubmitReview" => {
            let p: BodyParams = parse_params(params)?;
            let event: ReviewEvent = p.event.as_deref().unwrap_or("COMMENT").parse()?;
            blocking(service, move |s| {
                s.submit_review(&p.pr.key(), event, p.body.as_deref())
            })
            .await
        }
        "GetPluginOutput" => {
            let p: PrParams = parse_params(params)?;
            blocking(service, move |s| s.get_plugin_output(&p.key())).await
        }
        "RunPlugins" => {
            let p: PrParams = parse_params(params)?;
            let output = Arc::clone(service).run_plugins(p.key()).await?;
            Ok(serde_json::to_value(output)?)
        }
        "ListPlugins" => Ok(serde_json::to_value(service.list_plugins())?),
        other => Err(Error::Rpc(format!("unknown method: {other}"))),
    }
}

/// Mirror the fields Go-era clients read (`Okay`, `Content`, `ID`, `Count`)
/// next to their snake_case names.
fn with_go_fields(mut result: Value) -> Value {
    if let Value::Object(map) = &mut result {
        if let Some(content) = map.get("content").filter(|c| c.is_string()).cloned() {
            map.insert("Content".to_string(), content);
            map.insert("Okay".to_string(), Value::Bool(true));
        }
        for (from, to) in [("id", "ID"), ("count", "Count")] {
            if let Some(v) = map.get(from).filter(|v| v.is_number()).cloned() {
                map.insert(to.to_string(), v);
            }
        }
    }
    result
}

/// Accept either a params object or a one-element array holding it.
fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T> {
    let value = match params {
        Value::Array(mut items) if items.len() == 1 => items.remove(0),
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    serde_json::from_value(value).map_err(|e| Error::InvalidRequest(format!("invalid params: {e}")))
}

/// Run a service call on the blocking pool; upstream HTTP and SQLite calls
/// are synchronous.
async fn blocking<T, F>(service: &Arc<ReviewService>, f: F) -> Result<Value>
where
    F: FnOnce(&ReviewService) -> Result<T> + Send + 'static,
    T: Serialize + Send + 'static,
{
    let svc = Arc::clone(service);
    let value = tokio::task::spawn_blocking(move || f(&svc))
        .await
        .map_err(|e| Error::Rpc(format!("request task failed: {e}")))??;
    Ok(serde_json::to_value(value)?)
}
