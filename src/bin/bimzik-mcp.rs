//! Standalone MCP server binary for BimZik.
//!
//! Communicates with AI clients (e.g. Claude Desktop) over stdio JSON-RPC.
//! Settings and the local store live in the same data directory the other
//! BimZik clients use.

use anyhow::{Context, Result};
use rmcp::{transport::stdio, ServiceExt};
use tracing::info;

use bimzik_lib::mcp::BimZikMcp;
use bimzik_lib::{init_tracing, load_settings, resolve_data_dir, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let data_dir = resolve_data_dir()?;
    let settings = load_settings(&data_dir);
    info!(api = %settings.api_base_url, data_dir = %data_dir.display(), "loaded settings");

    let state = AppState::open(&data_dir, settings)?;

    match state.db.lock().map(|db| db.get_active_jobs()) {
        Ok(Ok(jobs)) if !jobs.is_empty() => {
            info!(count = jobs.len(), "jobs still running from a previous session");
        }
        _ => {}
    }

    let server = BimZikMcp::new(state);

    info!("BimZik MCP server starting on stdio");

    let service = server
        .serve(stdio())
        .await
        .context("MCP server failed to start")?;

    service.waiting().await?;

    Ok(())
}
