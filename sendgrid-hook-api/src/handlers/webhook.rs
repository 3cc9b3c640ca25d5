use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error};

use sendgrid_hook_common::error::IngestError;
use sendgrid_hook_common::ingest::Ingestor;
use sendgrid_hook_common::validation::ValidationErrors;

#[derive(Serialize, Debug, Default)]
pub struct WebhookPostResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    validation_errors: Option<ValidationErrors>,
}

/// Receive a batch of SendGrid events.
/// SendGrid retries deliveries that do not get a 2xx response, so we only return one once every
/// event in the batch is stored (or was already stored).
pub async fn post_webhook(
    State(ingestor): State<Ingestor>,
    Json(payload): Json<Value>,
) -> Result<Json<WebhookPostResponse>, (StatusCode, Json<WebhookPostResponse>)> {
    let report = ingestor.ingest(&payload).await.map_err(unprocessable)?;

    if report.failed() > 0 {
        return Err(internal_error(format!(
            "failed to store {} of {} events",
            report.failed(),
            report.outcomes.len()
        )));
    }

    debug!(
        inserted = report.inserted(),
        duplicates = report.duplicates(),
        "stored webhook batch"
    );

    Ok(Json(WebhookPostResponse::default()))
}

fn unprocessable(err: IngestError) -> (StatusCode, Json<WebhookPostResponse>) {
    let message = err.to_string();

    match err {
        IngestError::Validation(errors) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(WebhookPostResponse {
                error: Some(message),
                validation_errors: Some(errors),
            }),
        ),
    }
}

fn internal_error(msg: String) -> (StatusCode, Json<WebhookPostResponse>) {
    error!("internal error: {}", msg);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(WebhookPostResponse {
            error: Some(msg),
            validation_errors: None,
        }),
    )
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{self, Request, StatusCode},
        response::Response,
        Router,
    };
    use http_body_util::BodyExt; // for `collect`
    use serde_json::{json, Value};
    use sqlx::PgPool;
    use tower::ServiceExt; // for `call`, `oneshot`, and `ready`

    use sendgrid_hook_common::config::IngestConfig;
    use sendgrid_hook_common::ingest::Ingestor;
    use sendgrid_hook_common::store::EventStore;

    use crate::handlers::add_routes;

    const MAX_BODY_SIZE: usize = 1_000_000;

    fn app(db: PgPool, max_body_size: usize) -> (Router, EventStore) {
        let store = EventStore::new_from_pool(db);
        let ingestor = Ingestor::new(store.clone(), IngestConfig::default());

        (
            add_routes(Router::new(), ingestor, max_body_size, 10),
            store,
        )
    }

    async fn post(app: Router, body: impl Into<Body>) -> Response {
        app.oneshot(
            Request::builder()
                .method(http::Method::POST)
                .uri("/webhook")
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(body.into())
                .unwrap(),
        )
        .await
        .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn batch() -> Value {
        json!([{
            "email": "a@b.com",
            "timestamp": 1690000000,
            "event": "delivered",
            "sg_event_id": "evt-1",
            "category": "promo",
        }])
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn webhook_success(db: PgPool) {
        let (app, store) = app(db, MAX_BODY_SIZE);

        let response = post(app, batch().to_string()).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"{}");
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn webhook_redelivery_is_accepted(db: PgPool) {
        let (app, store) = app(db, MAX_BODY_SIZE);

        let first = post(app.clone(), batch().to_string()).await;
        let second = post(app, batch().to_string()).await;

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn webhook_payload_missing_fields(db: PgPool) {
        let (app, store) = app(db, MAX_BODY_SIZE);
        let mut payload = batch();
        payload[0].as_object_mut().unwrap().remove("email");
        payload[0]["timestamp"] = json!("later");

        let response = post(app, payload.to_string()).await;

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = json_body(response).await;
        assert_eq!(
            body["validation_errors"],
            json!({
                "0.email": ["The 0.email field is required."],
                "0.timestamp": ["The 0.timestamp must be an integer."],
            })
        );
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("malformed webhook payload"));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn webhook_payload_not_a_list(db: PgPool) {
        let (app, _) = app(db, MAX_BODY_SIZE);

        let response = post(app, batch()[0].to_string()).await;

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = json_body(response).await;
        assert!(body["validation_errors"]["payload"].is_array());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn webhook_payload_not_json(db: PgPool) {
        let (app, _) = app(db, MAX_BODY_SIZE);

        let response = post(app, "x".to_owned()).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn webhook_payload_body_too_large(db: PgPool) {
        let (app, _) = app(db, 64);

        let response = post(app, batch().to_string()).await;

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn webhook_store_failure(db: PgPool) {
        sqlx::query("DROP TABLE sendgrid_webhook_events")
            .execute(&db)
            .await
            .unwrap();
        let (app, _) = app(db, MAX_BODY_SIZE);

        let response = post(app, batch().to_string()).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["error"], json!("failed to store 1 of 1 events"));
    }
}
