use axum::{
    extract::{FromRequest, Multipart, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Form, Json,
};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::chart::ApiCallResult;
use crate::llm::LlmError;
use crate::web::state::AppState;

// Error taxonomy: each variant carries its HTTP status, so call sites pick
// the mapping deliberately instead of funnelling through a blanket handler.

#[derive(Debug)]
pub enum ApiError {
    InvalidInput(String),
    MissingPrecondition(String),
    Llm(LlmError),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) | ApiError::MissingPrecondition(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Llm(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::InvalidInput(msg)
            | ApiError::MissingPrecondition(msg)
            | ApiError::Internal(msg) => msg.clone(),
            ApiError::Llm(e) => e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status().is_server_error() {
            error!("Request failed: {}", self.message());
        }
        (self.status(), Json(json!({ "error": self.message() }))).into_response()
    }
}

// Request and response types

#[derive(Debug, Deserialize)]
pub struct QueryForm {
    pub query: String,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub sql_query: String,
    pub api_result: ApiCallResult,
}

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: String,
    pub uptime_seconds: i64,
    pub schema_loaded: bool,
    pub model: String,
}

// API Implementations

/// POST / accepts two request shapes: a multipart body carrying a
/// `schema_file` part (or a `query` text field), or a urlencoded form
/// with a `query` field.
pub async fn post_index(
    State(state): State<Arc<AppState>>,
    req: Request,
) -> Result<Response, ApiError> {
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(req, &())
            .await
            .map_err(|e| ApiError::Internal(format!("Failed to read multipart body: {}", e)))?;
        handle_multipart(state, multipart).await
    } else {
        let Form(form) = Form::<QueryForm>::from_request(req, &())
            .await
            .map_err(|e| ApiError::InvalidInput(e.to_string()))?;
        let response = generate_from_query(state, form.query).await?;
        Ok(response.into_response())
    }
}

async fn handle_multipart(
    state: Arc<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut query_field: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to read multipart field: {}", e)))?
    {
        match field.name().unwrap_or("") {
            "schema_file" => {
                let file_name = field.file_name().unwrap_or("").to_string();
                if !file_name.ends_with(".json") {
                    return Err(ApiError::InvalidInput(
                        "Please upload a JSON file".to_string(),
                    ));
                }

                let data = field.bytes().await.map_err(|e| {
                    ApiError::Internal(format!("Failed to read schema file: {}", e))
                })?;
                let schema: Value = serde_json::from_slice(&data)
                    .map_err(|e| ApiError::Internal(e.to_string()))?;

                info!("Schema uploaded from '{}' ({} bytes)", file_name, data.len());
                state.set_schema(schema).await;

                return Ok(Json(UploadResponse {
                    status: "Schema uploaded successfully".to_string(),
                })
                .into_response());
            }
            "query" => {
                query_field = Some(field.text().await.map_err(|e| {
                    ApiError::Internal(format!("Failed to read query field: {}", e))
                })?);
            }
            _ => {}
        }
    }

    match query_field {
        Some(query) => {
            let response = generate_from_query(state, query).await?;
            Ok(response.into_response())
        }
        None => Err(ApiError::InvalidInput(
            "Expected a schema_file part or a query field".to_string(),
        )),
    }
}

async fn generate_from_query(
    state: Arc<AppState>,
    query: String,
) -> Result<Json<QueryResponse>, ApiError> {
    debug!("NL query: {}", query);

    let schema = state
        .current_schema()
        .await
        .ok_or_else(|| ApiError::MissingPrecondition("No schema uploaded".to_string()))?;

    // Stable indented rendering; this exact text is embedded in the prompt
    let schema_text = serde_json::to_string_pretty(schema.as_ref())
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let sql_query = state
        .llm_manager
        .generate_sql(&query, &schema_text)
        .await
        .map_err(ApiError::Llm)?;
    info!("Generated SQL: {}", sql_query);

    // Downstream failure is folded into the result, never surfaced as an
    // HTTP error; the caller still gets the generated SQL
    let api_result = state.chart_client.submit(&sql_query).await;

    Ok(Json(QueryResponse {
        sql_query,
        api_result,
    }))
}

// Schema
pub async fn get_schema(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    match state.current_schema().await {
        Some(schema) => Ok(Json(schema.as_ref().clone())),
        None => Err(ApiError::MissingPrecondition("No schema uploaded".to_string())),
    }
}

// System status
pub async fn system_status(State(state): State<Arc<AppState>>) -> Json<SystemStatus> {
    let now = chrono::Utc::now();
    let uptime = now.signed_duration_since(state.startup_time).num_seconds();

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        schema_loaded: state.schema_loaded().await,
        model: state.config.llm.model.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::ChartApiClient;
    use crate::config::AppConfig;
    use crate::llm::LlmManager;
    use crate::web::routes;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use axum::Router;
    use tower::util::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_state(llm_url: &str, chart_url: &str) -> Arc<AppState> {
        let mut config = AppConfig::default();
        config.llm.api_url = llm_url.to_string();
        config.chart.api_url = chart_url.to_string();
        config.chart.max_attempts = 2;
        config.chart.retry_delay_ms = 1;

        let llm_manager = LlmManager::new(&config.llm).unwrap();
        let chart_client = ChartApiClient::new(&config.chart).unwrap();
        Arc::new(AppState::new(config, llm_manager, chart_client))
    }

    fn test_app(state: Arc<AppState>) -> Router {
        routes::ui_routes()
            .merge(routes::api_routes())
            .with_state(state)
    }

    /// Helper to create a multipart body with a single file part
    fn multipart_file_body(field: &str, filename: &str, content: &[u8]) -> (String, Vec<u8>) {
        let boundary = "----TestBoundary1234567890";
        let mut body = Vec::new();

        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                field, filename
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

        (boundary.to_string(), body)
    }

    /// Helper to create a multipart body with a single text field
    fn multipart_text_body(field: &str, value: &str) -> (String, Vec<u8>) {
        let boundary = "----TestBoundary1234567890";
        let mut body = Vec::new();

        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", field).as_bytes(),
        );
        body.extend_from_slice(value.as_bytes());
        body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

        (boundary.to_string(), body)
    }

    fn multipart_request(boundary: &str, body: Vec<u8>) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri("/")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", boundary),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn form_query_request(query: &str) -> HttpRequest<Body> {
        let encoded: String = query.replace(' ', "+");
        HttpRequest::builder()
            .method("POST")
            .uri("/")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(format!("query={}", encoded)))
            .unwrap()
    }

    async fn response_json(response: Response) -> Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn completion_body(content: &str) -> Value {
        json!({
            "id": "chatcmpl-test",
            "object": "chat.completion",
            "model": "gpt-4.1-nano",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": content },
                "finish_reason": "stop"
            }]
        })
    }

    async fn mock_llm(server: &MockServer, sql: &str) {
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(sql)))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn upload_json_schema_succeeds() {
        let state = test_state("http://127.0.0.1:1/llm", "http://127.0.0.1:1/chart");
        let app = test_app(state.clone());

        let (boundary, body) =
            multipart_file_body("schema_file", "schema.json", br#"{"tables":["cars"]}"#);
        let response = app.oneshot(multipart_request(&boundary, body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["status"], "Schema uploaded successfully");

        assert_eq!(
            state.current_schema().await.unwrap().as_ref(),
            &json!({"tables": ["cars"]})
        );
    }

    #[tokio::test]
    async fn upload_replaces_schema_regardless_of_prior_state() {
        let state = test_state("http://127.0.0.1:1/llm", "http://127.0.0.1:1/chart");
        let app = test_app(state.clone());

        for content in [
            br#"{"tables":["cars"]}"#.as_slice(),
            br#"{"tables":["trips"]}"#.as_slice(),
        ] {
            let (boundary, body) = multipart_file_body("schema_file", "schema.json", content);
            let response = app
                .clone()
                .oneshot(multipart_request(&boundary, body))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        assert_eq!(
            state.current_schema().await.unwrap().as_ref(),
            &json!({"tables": ["trips"]})
        );
    }

    #[tokio::test]
    async fn non_json_filename_is_rejected_without_mutation() {
        let state = test_state("http://127.0.0.1:1/llm", "http://127.0.0.1:1/chart");
        let app = test_app(state.clone());

        let (boundary, body) =
            multipart_file_body("schema_file", "schema.txt", br#"{"tables":["cars"]}"#);
        let response = app.oneshot(multipart_request(&boundary, body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = response_json(response).await;
        assert_eq!(json["error"], "Please upload a JSON file");

        assert!(state.current_schema().await.is_none());
    }

    #[tokio::test]
    async fn invalid_json_content_is_an_internal_error() {
        let state = test_state("http://127.0.0.1:1/llm", "http://127.0.0.1:1/chart");
        let app = test_app(state.clone());

        let (boundary, body) = multipart_file_body("schema_file", "schema.json", b"not json at all");
        let response = app.oneshot(multipart_request(&boundary, body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = response_json(response).await;
        assert!(json["error"].is_string());
        assert!(state.current_schema().await.is_none());
    }

    #[tokio::test]
    async fn query_without_schema_is_rejected_idempotently() {
        let state = test_state("http://127.0.0.1:1/llm", "http://127.0.0.1:1/chart");
        let app = test_app(state.clone());

        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(form_query_request("how many cars"))
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let json = response_json(response).await;
            assert_eq!(json["error"], "No schema uploaded");
        }

        assert!(state.current_schema().await.is_none());
    }

    #[tokio::test]
    async fn post_with_neither_shape_is_invalid_input() {
        let state = test_state("http://127.0.0.1:1/llm", "http://127.0.0.1:1/chart");
        let app = test_app(state);

        let (boundary, body) = multipart_text_body("unrelated", "value");
        let response = app.oneshot(multipart_request(&boundary, body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn round_trip_returns_sql_and_api_success() {
        let llm = MockServer::start().await;
        let chart = MockServer::start().await;

        mock_llm(&llm, "SELECT COUNT(*) FROM cars;").await;
        Mock::given(method("POST"))
            .and(path("/api/chart"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "rows": [[12]] })))
            .mount(&chart)
            .await;

        let state = test_state(
            &format!("{}/v1/chat/completions", llm.uri()),
            &format!("{}/api/chart", chart.uri()),
        );
        let app = test_app(state);

        let (boundary, body) =
            multipart_file_body("schema_file", "schema.json", br#"{"tables":["cars"]}"#);
        let upload = app
            .clone()
            .oneshot(multipart_request(&boundary, body))
            .await
            .unwrap();
        assert_eq!(upload.status(), StatusCode::OK);

        let response = app.oneshot(form_query_request("how many cars")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = response_json(response).await;
        assert_eq!(json["sql_query"], "SELECT COUNT(*) FROM cars;");
        assert_eq!(json["api_result"]["status"], "success");
        assert_eq!(json["api_result"]["api_response"]["rows"][0][0], 12);
    }

    #[tokio::test]
    async fn query_field_inside_multipart_body_works() {
        let llm = MockServer::start().await;
        let chart = MockServer::start().await;

        mock_llm(&llm, "SELECT 1;").await;
        Mock::given(method("POST"))
            .and(path("/api/chart"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&chart)
            .await;

        let state = test_state(
            &format!("{}/v1/chat/completions", llm.uri()),
            &format!("{}/api/chart", chart.uri()),
        );
        state.set_schema(json!({"tables": ["cars"]})).await;
        let app = test_app(state);

        let (boundary, body) = multipart_text_body("query", "how many cars");
        let response = app.oneshot(multipart_request(&boundary, body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["sql_query"], "SELECT 1;");
    }

    #[tokio::test]
    async fn downstream_failure_still_returns_200_with_soft_error() {
        let llm = MockServer::start().await;
        let chart = MockServer::start().await;

        mock_llm(&llm, "SELECT COUNT(*) FROM cars;").await;
        Mock::given(method("POST"))
            .and(path("/api/chart"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&chart)
            .await;

        let state = test_state(
            &format!("{}/v1/chat/completions", llm.uri()),
            &format!("{}/api/chart", chart.uri()),
        );
        state.set_schema(json!({"tables": ["cars"]})).await;
        let app = test_app(state);

        let response = app.oneshot(form_query_request("how many cars")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = response_json(response).await;
        assert_eq!(json["sql_query"], "SELECT COUNT(*) FROM cars;");
        assert_eq!(json["api_result"]["status"], "error");
        assert!(json["api_result"]["error"]
            .as_str()
            .unwrap()
            .contains("API request failed after retries"));
    }

    #[tokio::test]
    async fn llm_failure_is_a_500() {
        let llm = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&llm)
            .await;

        let state = test_state(
            &format!("{}/v1/chat/completions", llm.uri()),
            "http://127.0.0.1:1/chart",
        );
        state.set_schema(json!({"tables": ["cars"]})).await;
        let app = test_app(state);

        let response = app.oneshot(form_query_request("how many cars")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let json = response_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("LLM"));
    }

    #[tokio::test]
    async fn schema_endpoint_reports_current_value() {
        let state = test_state("http://127.0.0.1:1/llm", "http://127.0.0.1:1/chart");
        let app = test_app(state.clone());

        let missing = app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/schema")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

        state.set_schema(json!({"tables": ["cars"]})).await;
        let present = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/schema")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(present.status(), StatusCode::OK);
        assert_eq!(response_json(present).await, json!({"tables": ["cars"]}));
    }

    #[tokio::test]
    async fn status_endpoint_reports_schema_presence() {
        let state = test_state("http://127.0.0.1:1/llm", "http://127.0.0.1:1/chart");
        let app = test_app(state.clone());

        let response = app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = response_json(response).await;
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(json["schema_loaded"], false);
        assert_eq!(json["model"], "gpt-4.1-nano");
    }
}
