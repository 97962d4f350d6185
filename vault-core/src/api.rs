//! HTTP routes
//!
//! Every response that carries balances or history also carries the
//! sequence counter in the `x-transaction-count` header.

use crate::{
    types::{NewEntry, Order, Snapshot},
    validation::{self, RegistrationBody, RenameBody},
    Error, Vault,
};
use actix_web::{
    error::ResponseError, http::StatusCode, web, HttpRequest, HttpResponse, HttpResponseBuilder,
};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Header carrying the sequence counter
pub const TRANSACTION_COUNT_HEADER: &str = "x-transaction-count";

/// Query of `GET /tickets`
#[derive(Debug, Deserialize)]
pub struct TicketsQuery {
    /// Long-poll until the counter exceeds this
    #[serde(rename = "last-transaction-count")]
    pub last_transaction_count: Option<u64>,
}

fn with_count(mut builder: HttpResponseBuilder, sequence: u64) -> HttpResponseBuilder {
    builder.insert_header((TRANSACTION_COUNT_HEADER, sequence.to_string()));
    builder
}

fn balances(builder: HttpResponseBuilder, snapshot: &Snapshot) -> HttpResponse {
    with_count(builder, snapshot.sequence).json(&snapshot.balances)
}

/// Health check endpoint
pub async fn health_check(vault: web::Data<Vault>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": vault.config().service_name,
        "version": vault.config().service_version,
        "sequence": vault.sequence(),
    }))
}

/// Prometheus scrape endpoint
pub async fn metrics(vault: web::Data<Vault>) -> Result<HttpResponse, Error> {
    let body = vault.metrics().render()?;

    Ok(HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(body))
}

/// Register a ticket holder
pub async fn register_holder(
    vault: web::Data<Vault>,
    who: web::Path<String>,
    body: web::Json<RegistrationBody>,
) -> Result<HttpResponse, Error> {
    let registration = validation::registration(&who, body.into_inner())?;
    let snapshot = vault.register(registration).await?;
    Ok(balances(HttpResponse::Created(), &snapshot))
}

/// Rename a ticket holder
pub async fn rename_holder(
    vault: web::Data<Vault>,
    who: web::Path<String>,
    body: web::Json<RenameBody>,
) -> Result<HttpResponse, Error> {
    let rename = validation::rename(&who, body.into_inner())?;
    let snapshot = vault.rename(rename).await?;
    Ok(balances(HttpResponse::Ok(), &snapshot))
}

/// Current balances, optionally long-polling for the next change
pub async fn query_tickets(
    vault: web::Data<Vault>,
    query: web::Query<TicketsQuery>,
) -> HttpResponse {
    let threshold = query.last_transaction_count;

    let snapshot = match (threshold, vault.config().long_poll.timeout_ms) {
        (Some(threshold), Some(timeout_ms)) => {
            let wait = vault.current_balances(Some(threshold));
            match tokio::time::timeout(Duration::from_millis(timeout_ms), wait).await {
                Ok(snapshot) => snapshot,
                Err(_) => {
                    tracing::debug!(threshold, timeout_ms, "Long-poll timed out");
                    vault.current_balances(None).await
                }
            }
        }
        (threshold, _) => vault.current_balances(threshold).await,
    };

    balances(HttpResponse::Ok(), &snapshot)
}

/// Post a batch of transactions
pub async fn post_transactions(
    vault: web::Data<Vault>,
    batch: web::Json<Vec<NewEntry>>,
) -> Result<HttpResponse, Error> {
    let batch = batch.into_inner();
    let issues = validation::transaction_issues(&batch);
    let snapshot = vault.post_transactions_with_issues(batch, issues).await?;
    Ok(balances(HttpResponse::Created(), &snapshot))
}

/// Ledger history, newest first.
///
/// Entries and header come from one ledger snapshot, so a rename is either
/// fully listed (marker and relabelled rows) or not at all.
pub async fn get_transactions(vault: web::Data<Vault>) -> Result<HttpResponse, Error> {
    let (count, entries) = vault.history_with_count(Order::Descending)?;
    Ok(with_count(HttpResponse::Ok(), count).json(entries))
}

/// Counter only
pub async fn head_transactions(vault: web::Data<Vault>) -> HttpResponse {
    with_count(HttpResponse::NoContent(), vault.sequence()).finish()
}

fn json_error_handler(err: actix_web::error::JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    Error::invalid("body", err.to_string()).into()
}

fn query_error_handler(err: actix_web::error::QueryPayloadError, _req: &HttpRequest) -> actix_web::Error {
    Error::invalid("query", err.to_string()).into()
}

/// Configure routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error_handler))
        .app_data(web::QueryConfig::default().error_handler(query_error_handler))
        .route("/health", web::get().to(health_check))
        .route("/metrics", web::get().to(metrics))
        .service(
            web::resource("/ticket_holders/{who}")
                .route(web::post().to(register_holder))
                .route(web::patch().to(rename_holder)),
        )
        .route("/tickets", web::get().to(query_tickets))
        .service(
            web::resource("/transactions")
                .route(web::head().to(head_transactions))
                .route(web::get().to(get_transactions))
                .route(web::post().to(post_transactions)),
        );
}

impl ResponseError for Error {
    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();

        match self {
            Error::Validation(issues) => HttpResponse::build(status_code).json(json!({
                "errors": issues,
            })),
            _ => HttpResponse::build(status_code).json(json!({
                "message": self.to_string(),
                "type": self.error_type(),
            })),
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::AlreadyRegistered(_) => StatusCode::CONFLICT,
            Error::UnknownHolder(_) => StatusCode::NOT_FOUND,
            Error::Concurrency(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Storage(_)
            | Error::Serialization(_)
            | Error::ConsistencyViolation(_)
            | Error::Config(_)
            | Error::Internal(_)
            | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl Error {
    fn error_type(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation_error",
            Error::AlreadyRegistered(_) => "already_registered",
            Error::UnknownHolder(_) => "unknown_holder",
            Error::Concurrency(_) => "service_unavailable",
            Error::ConsistencyViolation(_) => "consistency_violation",
            Error::Storage(_) | Error::Serialization(_) | Error::Io(_) => "storage_error",
            Error::Config(_) | Error::Internal(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HolderId, ValidationIssue};

    async fn body_of(err: Error) -> (StatusCode, serde_json::Value) {
        let resp = err.error_response();
        let status = resp.status();
        let bytes = actix_web::body::to_bytes(resp.into_body()).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[actix_web::test]
    async fn test_metrics_failure_is_internal() {
        let err: Error = prometheus::Error::Msg("duplicate metric".into()).into();
        let (status, body) = body_of(err).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["type"], "internal_error");
    }

    #[actix_web::test]
    async fn test_domain_errors_map_to_statuses() {
        let (status, body) = body_of(Error::AlreadyRegistered(HolderId::new("Elliot"))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["type"], "already_registered");

        let (status, _) = body_of(Error::UnknownHolder(HolderId::new("Tyrell"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = body_of(Error::Validation(vec![ValidationIssue::new(
            Some(0),
            "amount",
            "amount must not be zero",
        )]))
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errors"][0]["field"], "amount");

        let (status, body) = body_of(Error::Storage("disk".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["type"], "storage_error");
    }
}
