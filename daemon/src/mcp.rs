//! MCP server implementation using rmcp.
//!
//! Exposes the orchestrator as three tools: `run_snippet`, `run_project`
//! and `history`.

use std::path::PathBuf;
use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::info;

use crate::backend::IsolationBackend;
use crate::orchestrator::{Orchestrator, RunResponse};
use crate::request::Language;

/// MCP server for sandboxed code execution.
pub struct SandboxServer<B> {
    orchestrator: Arc<Orchestrator<B>>,
    tool_router: ToolRouter<Self>,
}

impl<B> Clone for SandboxServer<B> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: Arc::clone(&self.orchestrator),
            tool_router: self.tool_router.clone(),
        }
    }
}

/// Parameters for the run_snippet tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RunSnippetParams {
    /// Source code of a single file.
    #[schemars(description = "Source code to execute (at most 5000 characters)")]
    pub code: String,

    /// Language of the snippet; defaults to python.
    #[schemars(description = "Language of the code: 'python' (default) or 'javascript'")]
    #[serde(default)]
    pub language: Option<String>,
}

/// Parameters for the run_project tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RunProjectParams {
    /// Host path of a tar archive holding the project.
    #[schemars(
        description = "Path to a tar archive whose root contains main.py or index.js"
    )]
    #[serde(default)]
    pub archive_path: Option<String>,
}

fn to_tool_result(response: &RunResponse) -> Result<CallToolResult, McpError> {
    let body = serde_json::to_string(response)
        .map_err(|e| McpError::internal_error(format!("Failed to encode response: {e}"), None))?;
    if response.outcome.is_success() {
        Ok(CallToolResult::success(vec![Content::text(body)]))
    } else {
        Ok(CallToolResult::error(vec![Content::text(body)]))
    }
}

#[tool_router]
impl<B: IsolationBackend + 'static> SandboxServer<B> {
    /// Create a new sandbox server.
    pub fn new(orchestrator: Orchestrator<B>) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            tool_router: Self::tool_router(),
        }
    }

    /// Run a single Python or JavaScript file in an isolated container.
    #[tool(
        description = "Run a Python or JavaScript snippet in an isolated container without network access"
    )]
    async fn run_snippet(
        &self,
        Parameters(params): Parameters<RunSnippetParams>,
    ) -> Result<CallToolResult, McpError> {
        let language = match params.language.as_deref() {
            None => Language::Python,
            Some(name) => name
                .parse::<Language>()
                .map_err(|message| McpError::invalid_params(message, None))?,
        };

        let response = self.orchestrator.run_snippet(params.code, language).await;
        to_tool_result(&response)
    }

    /// Run a multi-file project from a tar archive.
    #[tool(description = "Extract a tar archive and run its main.py or index.js in an isolated container")]
    async fn run_project(
        &self,
        Parameters(params): Parameters<RunProjectParams>,
    ) -> Result<CallToolResult, McpError> {
        let archive = params.archive_path.map(PathBuf::from);
        let response = self.orchestrator.run_project(archive).await;
        to_tool_result(&response)
    }

    /// Return the execution audit log.
    #[tool(description = "Show the log of past executions")]
    async fn history(&self) -> Result<CallToolResult, McpError> {
        let log = self.orchestrator.logger().read_history().await;
        Ok(CallToolResult::success(vec![Content::text(log)]))
    }
}

#[tool_handler]
impl<B: IsolationBackend + 'static> ServerHandler for SandboxServer<B> {
    fn get_info(&self) -> ServerInfo {
        let capacity = self.orchestrator.admission().capacity();

        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "sandbox-runner".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Execute untrusted code in resource-limited containers.\n\
                 No network access, read-only filesystem except /app.\n\
                 At most {capacity} executions run at once.\n\
                 \n\
                 Tools:\n\
                 - run_snippet: code + language ('python' or 'javascript')\n\
                 - run_project: archive_path of a tar containing main.py or index.js\n\
                 - history: past executions"
            )),
        }
    }
}

/// Serve the sandbox server over stdio.
pub async fn serve_stdio<B: IsolationBackend + 'static>(
    orchestrator: Orchestrator<B>,
) -> anyhow::Result<()> {
    let server = SandboxServer::new(orchestrator);
    let orchestrator = Arc::clone(&server.orchestrator);

    info!("Starting MCP server on stdio");

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

    let served = service
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {e}"));

    orchestrator.admission().close();
    info!(
        in_flight = orchestrator.admission().in_flight(),
        "MCP session ended, no longer admitting executions"
    );
    served?;

    Ok(())
}
