use std::sync::Arc;

use rmcp::{
    RoleServer,
    ServerHandler,
    ServiceExt,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{
        CallToolResult,
        Content,
        Implementation,
        ServerCapabilities,
        ServerInfo,
    },
    service::RequestContext,
    tool,
    tool_handler,
    tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    error,
    model::Cancellation,
    output,
    pipeline::Pipeline,
};

#[derive(Clone)]
pub struct DocragMcpServer {
    pipeline: Arc<Pipeline>,
    tool_router: ToolRouter<Self>,
}

impl DocragMcpServer {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            pipeline,
            tool_router: Self::tool_router(),
        }
    }

    /// Run a pipeline call off the async executor.
    async fn blocking<T, F>(&self, f: F) -> Result<error::Result<T>, rmcp::ErrorData>
    where
        T: Send + 'static,
        F: FnOnce(&Pipeline) -> error::Result<T> + Send + 'static,
    {
        let pipeline = Arc::clone(&self.pipeline);
        tokio::task::spawn_blocking(move || f(&pipeline))
            .await
            .map_err(|e| mcp_error("pipeline task failed", e))
    }

    async fn retrieve_call(
        &self,
        query: String,
        cancel: Cancellation,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let retrieval = match self
            .blocking(move |p| p.retrieve_passages_with(&query, &cancel))
            .await?
        {
            Ok(r) => r,
            Err(e) => return Ok(tool_failure(&e)),
        };

        let structured = serde_json::to_value(&retrieval)
            .map_err(|e| mcp_error("failed to serialize passages", e))?;
        let mut result = CallToolResult::success(vec![Content::text(output::retrieval_summary(&retrieval))]);
        result.structured_content = Some(structured);
        Ok(result)
    }

    async fn reindex_call(
        &self,
        clear_cache: bool,
        cancel: Cancellation,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let report = match self
            .blocking(move |p| p.reindex_with(clear_cache, &cancel))
            .await?
        {
            Ok(r) => r,
            Err(e) => return Ok(tool_failure(&e)),
        };

        let structured = serde_json::to_value(&report)
            .map_err(|e| mcp_error("failed to serialize reindex report", e))?;
        let mut result = CallToolResult::success(vec![Content::text(output::reindex_human(&report))]);
        result.structured_content = Some(structured);
        Ok(result)
    }
}

/// Cancels the pipeline call when the client cancels the request or the
/// tool future is dropped before the blocking work returns.
struct RequestCancellation {
    cancel: Cancellation,
    watcher: tokio::task::JoinHandle<()>,
}

impl RequestCancellation {
    fn watch(ctx: &RequestContext<RoleServer>) -> Self {
        let cancel = Cancellation::new();
        let signal = cancel.clone();
        let ct = ctx.ct.clone();
        let watcher = tokio::spawn(async move {
            ct.cancelled().await;
            tracing::debug!("request cancelled by client");
            signal.cancel();
        });
        Self { cancel, watcher }
    }
}

impl Drop for RequestCancellation {
    fn drop(&mut self) {
        self.watcher.abort();
        self.cancel.cancel();
    }
}

#[tool_router(router = tool_router)]
impl DocragMcpServer {
    /// Find the passages most relevant to a natural-language query.
    #[tool(
        name = "retrieve_passages",
        description = "Retrieve the most relevant passages from the indexed documents. Returns ranked passages with their source file, or an explanation when nothing relevant was found."
    )]
    pub async fn retrieve_passages(
        &self,
        params: Parameters<RetrieveParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let request = RequestCancellation::watch(&ctx);
        self.retrieve_call(params.0.query, request.cancel.clone())
            .await
    }

    /// Bring the indexes up to date with the document root.
    #[tool(
        name = "reindex",
        description = "Scan the document root and index new or changed files. Set clearCache to rebuild everything from scratch."
    )]
    pub async fn reindex(
        &self,
        params: Parameters<ReindexParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let request = RequestCancellation::watch(&ctx);
        let clear_cache = params.0.clear_cache.unwrap_or(false);
        self.reindex_call(clear_cache, request.cancel.clone()).await
    }

    #[tool(
        name = "status",
        description = "Report index sizes, cache statistics and the time of the last update."
    )]
    pub async fn status(&self) -> Result<CallToolResult, rmcp::ErrorData> {
        let status = match self.blocking(|p| p.status()).await? {
            Ok(s) => s,
            Err(e) => return Ok(tool_failure(&e)),
        };

        let structured = serde_json::to_value(&status)
            .map_err(|e| mcp_error("failed to serialize status", e))?;
        let mut result = CallToolResult::success(vec![Content::text(output::status_human(&status))]);
        result.structured_content = Some(structured);
        Ok(result)
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for DocragMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo::new(ServerCapabilities::builder().enable_tools().build())
            .with_server_info(
                Implementation::new("docrag", env!("CARGO_PKG_VERSION"))
                    .with_title("docrag MCP"),
            )
            .with_instructions(
                "Use retrieve_passages to ground answers in the indexed documents. Call reindex after documents change.",
            )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveParams {
    /// Natural-language question or keywords.
    pub query: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReindexParams {
    /// Empty every cache and index before scanning (default: false).
    pub clear_cache: Option<bool>,
}

/// Pipeline failures are reported to the agent as tool errors carrying the
/// user-facing message, not as protocol errors.
fn tool_failure(error: &error::Error) -> CallToolResult {
    tracing::warn!(error = %error, "tool call failed");
    let mut result = CallToolResult::error(vec![Content::text(error.user_message())]);
    result.structured_content = Some(json!({ "error": error.to_string() }));
    result
}

fn mcp_error(message: &str, error: impl std::fmt::Display) -> rmcp::ErrorData {
    rmcp::ErrorData::internal_error(
        message.to_string(),
        Some(json!({ "error": error.to_string() })),
    )
}

pub fn run_mcp(pipeline: Pipeline) -> error::Result<()> {
    let server = DocragMcpServer::new(Arc::new(pipeline));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| {
            error::Error::Config(format!("failed to start tokio runtime: {e}"))
        })?;

    runtime.block_on(async move {
        let transport = rmcp::transport::stdio();
        let running = server.serve(transport).await.map_err(|e| {
            error::Error::Config(format!(
                "MCP server initialization failed: {e}"
            ))
        })?;
        running.waiting().await.map_err(|e| {
            error::Error::Config(format!("MCP server error: {e}"))
        })?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data_dir::DataDir,
        model::{HashingEmbedder, OverlapScorer},
        settings::Settings,
    };

    fn text_of(result: &CallToolResult) -> String {
        result
            .content
            .first()
            .and_then(|c| c.as_text())
            .map(|t| t.text.clone())
            .unwrap_or_default()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tools_return_structured_results() {
        let data = tempfile::tempdir().unwrap();
        let docs = tempfile::tempdir().unwrap();
        std::fs::write(
            docs.path().join("rust.md"),
            "Rust is fast.\n\nOwnership keeps memory safe without a garbage collector.\n",
        )
        .unwrap();

        let pipeline = Pipeline::open(
            &DataDir::resolve(Some(data.path())).unwrap(),
            Settings::default(),
            docs.path().canonicalize().unwrap(),
            Arc::new(HashingEmbedder::new(64)),
            Arc::new(OverlapScorer),
        )
        .unwrap();
        let server = DocragMcpServer::new(Arc::new(pipeline));

        let reindexed = server
            .reindex_call(false, Cancellation::new())
            .await
            .unwrap();
        let report = reindexed.structured_content.expect("structured");
        assert_eq!(report.get("processed").and_then(|v| v.as_u64()), Some(1));

        let result = server
            .retrieve_call("How does Rust keep memory safe?".into(), Cancellation::new())
            .await
            .unwrap();
        assert_eq!(result.is_error, Some(false));
        let structured = result.structured_content.clone().expect("structured");
        let passages = structured
            .pointer("/outcome/passages")
            .and_then(|v| v.as_array())
            .expect("passages array");
        assert!(!passages.is_empty());
        assert!(
            passages[0]
                .get("source")
                .and_then(|v| v.as_str())
                .is_some_and(|s| s.ends_with("rust.md"))
        );
        assert!(text_of(&result).starts_with("Found"));

        let status = server.status().await.unwrap();
        let structured = status.structured_content.clone().expect("structured");
        assert_eq!(
            structured.get("documents_tracked").and_then(|v| v.as_u64()),
            Some(1)
        );
        assert!(text_of(&status).contains("Documents:"));

        let cancel = Cancellation::new();
        cancel.cancel();
        let cancelled = server
            .retrieve_call("What does ownership do?".into(), cancel)
            .await
            .unwrap();
        assert_eq!(cancelled.is_error, Some(true));
        assert!(text_of(&cancelled).contains("cancelled"));
    }

    #[test]
    fn failures_become_tool_errors() {
        let result = tool_failure(&error::Error::Cancelled);
        assert_eq!(result.is_error, Some(true));
        assert!(text_of(&result).contains("cancelled"));
    }
}
