//! `api` crate — the MCP frontend.
//!
//! Exposes the engine as an MCP server:
//!   tools/list — every visible registry tool plus every workflow as
//!                `workflow:<name>` with its parameter schema
//!   tools/call — bare tools go to the invoker, `workflow:` names go to
//!                `Engine::execute`
//!
//! Transports: newline-delimited JSON-RPC on stdio (default), or HTTP
//! with a single POST /mcp endpoint.

pub mod rpc;

use std::sync::Arc;

use axum::{routing::post, Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use engine::Engine;
use tools::{ToolInvoker, ToolRegistry};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ToolRegistry>,
    pub invoker: Arc<ToolInvoker>,
    pub engine: Arc<Engine>,
    pub server_name: String,
    pub server_version: String,
}

/// Serve MCP over HTTP.  One JSON-RPC message per POST /mcp request.
pub async fn serve_http(bind: &str, state: AppState) -> Result<(), std::io::Error> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/mcp", post(handle_http))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("MCP frontend listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await
}

async fn handle_http(
    axum::extract::State(state): axum::extract::State<AppState>,
    Json(message): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    let response = rpc::handle_message(&state, message).await;
    Json(response.unwrap_or(serde_json::Value::Null))
}

/// Serve MCP over stdio: one JSON-RPC message per line on stdin, one
/// response per line on stdout.  Returns when stdin closes.
pub async fn serve_stdio(state: AppState) -> Result<(), std::io::Error> {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    tracing::info!("MCP frontend on stdio");
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let message: serde_json::Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable frame on stdin");
                continue;
            }
        };
        if let Some(response) = rpc::handle_message(&state, message).await {
            let mut out = response.to_string();
            out.push('\n');
            stdout.write_all(out.as_bytes()).await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}
