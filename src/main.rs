use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

mod chart;
mod config;
mod llm;
mod util;
mod web;

use crate::chart::ChartApiClient;
use crate::config::{AppConfig, CliArgs};
use crate::llm::LlmManager;
use crate::util::logging::init_tracing;
use crate::web::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    init_tracing();

    // Parse command line arguments
    let args = CliArgs::parse();

    // Load configuration
    let config = match AppConfig::new(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    // Initialize LLM manager
    info!("Initializing LLM manager with backend: {}", config.llm.backend);
    let llm_manager = LlmManager::new(&config.llm)?;

    // Initialize the downstream chart API client
    info!("Initializing chart API client for {}", config.chart.api_url);
    let chart_client = ChartApiClient::new(&config.chart)?;

    // Create application state
    let app_state = Arc::new(AppState::new(config.clone(), llm_manager, chart_client));

    // Start the web server
    info!("Starting nl-chart server on {}:{}", config.web.host, config.web.port);
    match web::run_server(config.web, app_state).await {
        Ok(_) => info!("Server stopped gracefully"),
        Err(e) => {
            error!("Server error: {}", e);
            return Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::Other,
                e.to_string(),
            )) as Box<dyn std::error::Error>);
        }
    }

    Ok(())
}
