use crate::chart::ChartApiClient;
use crate::config::AppConfig;
use crate::llm::LlmManager;
use crate::web::templates::init_templates;
use minijinja::Environment;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared application state for the web server
pub struct AppState {
    pub config: AppConfig,
    pub template_env: Environment<'static>,
    pub llm_manager: Arc<LlmManager>,
    pub chart_client: ChartApiClient,
    // The uploaded database schema. Readers clone the Arc snapshot, so a
    // concurrent upload can never expose a half-written value.
    schema: RwLock<Option<Arc<Value>>>,
    pub startup_time: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(config: AppConfig, llm_manager: LlmManager, chart_client: ChartApiClient) -> Self {
        Self {
            config,
            template_env: init_templates(),
            llm_manager: Arc::new(llm_manager),
            chart_client,
            schema: RwLock::new(None),
            startup_time: chrono::Utc::now(),
        }
    }

    /// Replaces the stored schema in full. No merge.
    pub async fn set_schema(&self, schema: Value) {
        let mut slot = self.schema.write().await;
        *slot = Some(Arc::new(schema));
    }

    /// Immutable snapshot of the current schema, if one was uploaded.
    pub async fn current_schema(&self) -> Option<Arc<Value>> {
        self.schema.read().await.clone()
    }

    pub async fn schema_loaded(&self) -> bool {
        self.schema.read().await.is_some()
    }
}
