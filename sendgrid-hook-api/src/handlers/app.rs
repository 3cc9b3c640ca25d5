use std::convert::Infallible;

use axum::{extract::DefaultBodyLimit, routing, Router};
use tower::limit::ConcurrencyLimitLayer;

use sendgrid_hook_common::ingest::Ingestor;

use super::webhook;

pub fn add_routes(
    router: Router,
    ingestor: Ingestor,
    max_body_size: usize,
    concurrency_limit: usize,
) -> Router {
    router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(index)) // No async loop for now, just check axum health
        .route(
            "/webhook",
            routing::post(webhook::post_webhook)
                .with_state(ingestor)
                .layer::<_, Infallible>(ConcurrencyLimitLayer::new(concurrency_limit))
                .layer(DefaultBodyLimit::max(max_body_size)),
        )
}

pub async fn index() -> &'static str {
    "sendgrid-hook api"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt; // for `collect`
    use sendgrid_hook_common::config::IngestConfig;
    use sendgrid_hook_common::store::EventStore;
    use sqlx::PgPool;
    use tower::ServiceExt; // for `call`, `oneshot`, and `ready`

    #[sqlx::test(migrations = "../migrations")]
    async fn index(db: PgPool) {
        let ingestor = Ingestor::new(EventStore::new_from_pool(db), IngestConfig::default());

        let app = add_routes(Router::new(), ingestor, 1_000_000, 10);

        for uri in ["/", "/_readiness", "/_liveness"] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::OK);

            let body = response.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(&body[..], b"sendgrid-hook api");
        }
    }
}
