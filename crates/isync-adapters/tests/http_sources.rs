use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{TimeZone, Utc};
use isync_adapters::{
    CsvReportAdapter, CsvReportConfig, GrafanaQueryAdapter, GrafanaQueryConfig, JiraAdapter,
    JiraConfig, PaginatedFetcher, ReportProvider, SourceAdapter,
};
use isync_core::ColumnSpec;
use isync_storage::{Credentials, HttpClientConfig, HttpFetcher, SourceError};
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

type RequestLog = Arc<Mutex<Vec<HashMap<String, String>>>>;

#[derive(Clone)]
struct JiraMock {
    total: u64,
    fail_at: Option<u64>,
    reject_auth: bool,
    omit_start_at: bool,
    requests: RequestLog,
}

async fn jira_search(
    State(state): State<JiraMock>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    state.requests.lock().expect("request log lock").push(params.clone());

    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Basic "));
    if state.reject_auth || !authorized {
        return (StatusCode::UNAUTHORIZED, "bad credentials").into_response();
    }

    let start: u64 = params.get("startAt").and_then(|v| v.parse().ok()).unwrap_or(0);
    let max: u64 = params.get("maxResults").and_then(|v| v.parse().ok()).unwrap_or(50);
    if state.fail_at == Some(start) {
        return (StatusCode::SERVICE_UNAVAILABLE, "maintenance").into_response();
    }

    let issues = (start..(start + max).min(state.total))
        .map(|n| {
            json!({
                "key": format!("PCRM-{n}"),
                "fields": {
                    "summary": format!("issue {n}"),
                    "project": {"key": "PCRM", "name": "Power CRM"},
                    "updated": "2024-05-02T10:11:12.000+0000"
                }
            })
        })
        .collect::<Vec<_>>();
    let mut body = json!({
        "startAt": start,
        "maxResults": max,
        "total": state.total,
        "issues": issues
    });
    if state.omit_start_at {
        if let Some(body) = body.as_object_mut() {
            body.remove("startAt");
        }
    }
    Json(body).into_response()
}

async fn report_download(Query(params): Query<HashMap<String, String>>) -> Response {
    if params.get("b").map(String::as_str) != Some("Base_INFGRF")
        || params.get("of").map(String::as_str) != Some("download")
    {
        return StatusCode::BAD_REQUEST.into_response();
    }
    match params.get("p").map(String::as_str) {
        Some("44") => {
            let body = format!(
                "Incidente;GRUPO;Reporte\nINC1;N2_DEVOPS_PCRM_TEF;{q}\nINC2;OTRO;{q}\n",
                q = params.get("q").cloned().unwrap_or_default()
            );
            body.into_response()
        }
        _ => "<!DOCTYPE html><html><body>Please sign in</body></html>".into_response(),
    }
}

async fn grafana_query(headers: HeaderMap, Json(body): Json<JsonValue>) -> Response {
    if headers.get("x-grafana-org-id").and_then(|v| v.to_str().ok()) != Some("3") {
        return StatusCode::FORBIDDEN.into_response();
    }
    let ok = body["queries"][0]["refId"] == "A"
        && body["queries"][0]["format"] == "table"
        && body["from"].is_string();
    if !ok {
        return StatusCode::BAD_REQUEST.into_response();
    }
    Json(json!({
        "results": {"A": {"tables": [{
            "columns": [{"text": "Incidente"}, {"text": "Fecha"}, {"text": "Estado"}],
            "rows": [["INC9", "2025-02-03T04:05:06Z", "Cerrado"]]
        }]}}
    }))
    .into_response()
}

async fn spawn_mock_server(router: Router) -> (String, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let address: SocketAddr = listener.local_addr().expect("mock listener local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("run mock server");
    });
    (format!("http://{address}"), shutdown_tx)
}

async fn spawn_jira(total: u64, fail_at: Option<u64>, reject_auth: bool) -> (String, RequestLog, oneshot::Sender<()>) {
    spawn_jira_mock(JiraMock {
        total,
        fail_at,
        reject_auth,
        omit_start_at: false,
        requests: RequestLog::default(),
    })
    .await
}

async fn spawn_jira_mock(state: JiraMock) -> (String, RequestLog, oneshot::Sender<()>) {
    let requests = state.requests.clone();
    let router = Router::new()
        .route("/rest/api/3/search", get(jira_search))
        .with_state(state);
    let (url, shutdown) = spawn_mock_server(router).await;
    (url, requests, shutdown)
}

fn fetcher() -> PaginatedFetcher {
    PaginatedFetcher::new(
        HttpFetcher::new(HttpClientConfig::default()).expect("http client"),
        100,
    )
}

fn jira_adapter(base_url: String) -> JiraAdapter {
    let config = JiraConfig {
        base_url,
        project_keys: vec!["PCRM".to_string()],
        filter_ids: Vec::new(),
        table: "jira_issues".to_string(),
        team_field: None,
        epic_link_field: None,
        sprint_field: "customfield_10020".to_string(),
    };
    let credentials = Credentials::Basic {
        username: "bot@example.com".to_string(),
        password: "token".to_string(),
    };
    JiraAdapter::new("jira", config, credentials).expect("jira adapter")
}

#[tokio::test]
async fn jira_pagination_requests_until_total_is_reached() {
    let (url, requests, shutdown) = spawn_jira(250, None, false).await;
    let adapter = jira_adapter(url);
    let query = adapter.plan_queries(Some("PCRM"), None, Utc::now()).remove(0);

    let outcome = fetcher().fetch_all(&adapter, &query).await;
    assert!(outcome.aborted.is_none());
    assert_eq!(outcome.records.len(), 250);
    assert_eq!(outcome.pages_requested, 3);

    let requests = requests.lock().expect("request log lock").clone();
    let starts = requests
        .iter()
        .map(|p| p.get("startAt").cloned().unwrap_or_default())
        .collect::<Vec<_>>();
    assert_eq!(starts, vec!["0", "100", "200"]);
    assert!(requests.iter().all(|p| p.get("maxResults").map(String::as_str) == Some("100")));
    assert_eq!(
        requests[0].get("jql").map(String::as_str),
        Some("project = \"PCRM\" ORDER BY updated ASC")
    );

    let record = adapter.normalize(&query, &outcome.records[249]).expect("normalize");
    assert_eq!(record.natural_key, "PCRM-249");
    let _ = shutdown.send(());
}

#[tokio::test]
async fn jira_pages_without_start_at_advance_by_requested_offset() {
    let (url, requests, shutdown) = spawn_jira_mock(JiraMock {
        total: 250,
        fail_at: None,
        reject_auth: false,
        omit_start_at: true,
        requests: RequestLog::default(),
    })
    .await;
    let adapter = jira_adapter(url);
    let query = adapter.plan_queries(Some("PCRM"), None, Utc::now()).remove(0);

    let outcome = fetcher().fetch_all(&adapter, &query).await;
    assert!(outcome.aborted.is_none());
    assert_eq!(outcome.records.len(), 250);
    assert_eq!(outcome.pages_requested, 3);
    let starts = requests
        .lock()
        .expect("request log lock")
        .iter()
        .map(|p| p.get("startAt").cloned().unwrap_or_default())
        .collect::<Vec<_>>();
    assert_eq!(starts, vec!["0", "100", "200"]);
    let _ = shutdown.send(());
}

#[tokio::test]
async fn jira_unavailable_second_page_keeps_first_page() {
    let (url, requests, shutdown) = spawn_jira(250, Some(100), false).await;
    let adapter = jira_adapter(url);
    let query = adapter.plan_queries(Some("PCRM"), None, Utc::now()).remove(0);

    let outcome = fetcher().fetch_all(&adapter, &query).await;
    assert_eq!(outcome.records.len(), 100);
    assert_eq!(outcome.pages_requested, 2);
    match outcome.aborted {
        Some(SourceError::Unavailable { status, .. }) => assert_eq!(status, Some(503)),
        other => panic!("expected unavailable, got {other:?}"),
    }
    assert_eq!(requests.lock().expect("request log lock").len(), 2);
    let _ = shutdown.send(());
}

#[tokio::test]
async fn jira_rejected_credentials_abort_as_auth_error() {
    let (url, _requests, shutdown) = spawn_jira(250, None, true).await;
    let adapter = jira_adapter(url);
    let query = adapter.plan_queries(Some("PCRM"), None, Utc::now()).remove(0);

    let outcome = fetcher().fetch_all(&adapter, &query).await;
    assert!(outcome.records.is_empty());
    assert!(outcome.aborted.as_ref().is_some_and(SourceError::is_auth));
    let _ = shutdown.send(());
}

fn report_adapter(download_url: String) -> CsvReportAdapter {
    let config = CsvReportConfig {
        download_url,
        report_base: "Base_INFGRF".to_string(),
        report_prefix: "AM/".to_string(),
        table: "report_rows".to_string(),
        group_column: "GRUPO".to_string(),
        identifier_columns: vec!["Incidente".to_string()],
        backfill_from: None,
        providers: vec![
            ReportProvider {
                name: "NTTDATA".to_string(),
                provider_id: "44".to_string(),
                group_filter: Some("N2_DEVOPS_PCRM_TEF".to_string()),
                reports: vec!["Ingresos_N1".to_string()],
            },
            ReportProvider {
                name: "CONNECTIS".to_string(),
                provider_id: "11".to_string(),
                group_filter: Some("N1_SD_MOVIL_POWER".to_string()),
                reports: vec!["PuntualidadYReaperturasConn".to_string()],
            },
        ],
    };
    CsvReportAdapter::new("reports", config, Credentials::Header("NTLM TlRMTVNTUAAD".to_string()))
        .expect("report adapter")
}

#[tokio::test]
async fn csv_reports_download_per_month_and_detect_login_pages() {
    let router = Router::new().route("/download", get(report_download));
    let (url, shutdown) = spawn_mock_server(router).await;
    let adapter = report_adapter(format!("{url}/download"));
    let now = Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap();

    let queries = adapter.plan_queries(Some("NTTDATA"), None, now);
    assert_eq!(queries.len(), 2);
    let outcome = fetcher().fetch_all(&adapter, &queries[0]).await;
    assert!(outcome.aborted.is_none());
    assert_eq!(outcome.pages_requested, 1);
    assert_eq!(outcome.records.len(), 2);

    let kept = outcome
        .records
        .iter()
        .filter_map(|raw| adapter.normalize(&queries[0], raw).ok())
        .collect::<Vec<_>>();
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].natural_key, "NTTDATA:2025-01:Ingresos_N1:INC1");

    let login = adapter.plan_queries(Some("CONNECTIS"), None, now);
    let outcome = fetcher().fetch_all(&adapter, &login[0]).await;
    assert!(outcome.records.is_empty());
    assert!(outcome.aborted.as_ref().is_some_and(SourceError::is_auth));
    let _ = shutdown.send(());
}

#[tokio::test]
async fn grafana_query_posts_time_range_and_decodes_table() {
    let router = Router::new().route("/api/ds/query", post(grafana_query));
    let (url, shutdown) = spawn_mock_server(router).await;
    let config = GrafanaQueryConfig {
        url: format!("{url}/api/ds/query"),
        datasource_id: 7,
        org_id: Some(3),
        raw_sql: "SELECT INCIDENT_NUMBER as \"Incidente\" FROM t".to_string(),
        table: "incidentes_masivos".to_string(),
        key_column: "incidente".to_string(),
        updated_at_column: "fecha".to_string(),
        columns: vec![
            ColumnSpec::text("incidente"),
            ColumnSpec::timestamp("fecha"),
            ColumnSpec::text("estado"),
        ],
        lookback_days: Some(90),
    };
    let adapter = GrafanaQueryAdapter::new("masivos", config, Credentials::Anonymous).expect("grafana adapter");
    let query = adapter.plan_queries(None, None, Utc::now()).remove(0);

    let outcome = fetcher().fetch_all(&adapter, &query).await;
    assert!(outcome.aborted.is_none());
    assert_eq!(outcome.records.len(), 1);
    let record = adapter.normalize(&query, &outcome.records[0]).expect("normalize");
    assert_eq!(record.natural_key, "INC9");
    assert_eq!(
        record.updated_at,
        Some(Utc.with_ymd_and_hms(2025, 2, 3, 4, 5, 6).unwrap())
    );
    let _ = shutdown.send(());
}
