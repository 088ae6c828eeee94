//! Power BI MCP Server entry point.
//!
//! Serves MCP over stdio by default, or over streamable HTTP when built with
//! the `http` feature and `MCP_TRANSPORT=http`.

use anyhow::Result;
use powerbi_mcp_server::shutdown::{
    install_signal_handlers, new_shutdown_controller, ShutdownConfig,
};
use powerbi_mcp_server::transport::{TransportConfig, TransportType};
use powerbi_mcp_server::{Config, PowerBiMcpServer};
use rmcp::ServiceExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // stdout is reserved for JSON-RPC
    init_logging();

    std::panic::set_hook(Box::new(|info| {
        eprintln!("[PANIC] {}", info);
    }));

    let version = env!("CARGO_PKG_VERSION");
    let transport = TransportConfig::from_env()?;
    eprintln!("Power BI MCP Server v{version} starting...");
    eprintln!("Transport: {}", transport.transport_type);

    let config = Config::from_env()?;
    let shutdown_controller = new_shutdown_controller(&ShutdownConfig::from_env());
    install_signal_handlers(shutdown_controller.clone()).await;

    let server = PowerBiMcpServer::new(config)?;
    eprintln!("Server initialized. Ready to accept requests...");

    match transport.transport_type {
        TransportType::Stdio => {
            let service = server.clone().serve(rmcp::transport::stdio()).await?;
            let mut shutdown_signal = shutdown_controller.signal();

            tokio::select! {
                quit_reason = service.waiting() => {
                    match quit_reason {
                        Ok(reason) => eprintln!("Service stopped: {reason:?}"),
                        Err(e) => eprintln!("Service error: {e}"),
                    }
                }
                _ = shutdown_signal.recv() => {
                    eprintln!("Shutdown signal received");
                }
            }
        }
        #[cfg(feature = "http")]
        TransportType::Http => {
            powerbi_mcp_server::transport::http_server::start_http_server_with_shutdown(
                server.clone(),
                transport.http,
                Some(shutdown_controller.clone()),
            )
            .await?;
        }
    }

    shutdown_controller.graceful_shutdown(&server).await;
    eprintln!("Server shutdown complete");

    Ok(())
}

/// Initialize tracing subscriber with stderr output.
fn init_logging() {
    let filter = std::env::var("RUST_LOG")
        .map(EnvFilter::new)
        .unwrap_or_else(|_| EnvFilter::new("warn,powerbi_mcp_server=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}
