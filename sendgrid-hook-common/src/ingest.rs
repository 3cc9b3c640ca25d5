//! # Ingest
//!
//! Validation and exactly-once persistence of SendGrid Event Webhook batches.
//!
//! SendGrid delivers events at least once, possibly in overlapping batches sent concurrently.
//! A batch is validated as a whole and then every event is stored in its own transaction:
//! the event's `sg_event_id` is looked up under a shared lock and the event is inserted only if it
//! was not seen before. Conflicting transactions are re-run according to a `RetryPolicy`, and a
//! failure to store one event does not prevent storing the rest of the batch.
use std::time::Instant;

use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{error, instrument, warn};

use crate::config::{IngestConfig, LogLevel};
use crate::error::{DatabaseError, IngestError};
use crate::event::EventType;
use crate::metrics::{
    EVENTS_DUPLICATE, EVENTS_FAILED, EVENTS_INSERTED, EVENTS_RECEIVED, INGEST_DURATION,
    MALFORMED_PAYLOADS, TRANSACTION_RETRIES,
};
use crate::normalize::normalize;
use crate::retry::RetryPolicy;
use crate::store::EventStore;
use crate::validation::{validate_batch, ValidatedEvent, ValidationErrors};

/// Emit a `tracing` event at a level only known at runtime.
macro_rules! log_at {
    ($level:expr, $($arg:tt)+) => {
        match $level {
            LogLevel::Emergency | LogLevel::Alert | LogLevel::Critical | LogLevel::Error => {
                tracing::error!($($arg)+)
            }
            LogLevel::Warning => tracing::warn!($($arg)+),
            LogLevel::Notice | LogLevel::Info => tracing::info!($($arg)+),
            LogLevel::Debug => tracing::debug!($($arg)+),
            LogLevel::Trace => tracing::trace!($($arg)+),
        }
    };
}

/// Terminal state of one event of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventStatus {
    /// The event was stored under the given id.
    Inserted { id: i64 },
    /// The event had already been stored by an earlier delivery.
    Duplicate,
    /// The event could not be stored.
    Failed { attempts: u32, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventOutcome {
    pub sg_event_id: String,
    pub status: EventStatus,
}

/// Outcome of every event of a batch, in the order they were received.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub outcomes: Vec<EventOutcome>,
}

impl IngestReport {
    pub fn inserted(&self) -> usize {
        self.count(|status| matches!(status, EventStatus::Inserted { .. }))
    }

    pub fn duplicates(&self) -> usize {
        self.count(|status| matches!(status, EventStatus::Duplicate))
    }

    pub fn failed(&self) -> usize {
        self.count(|status| matches!(status, EventStatus::Failed { .. }))
    }

    /// Status of the first event in the batch with the given `sg_event_id`.
    pub fn status_of(&self, sg_event_id: &str) -> Option<&EventStatus> {
        self.outcomes
            .iter()
            .find(|outcome| outcome.sg_event_id == sg_event_id)
            .map(|outcome| &outcome.status)
    }

    fn count(&self, predicate: impl Fn(&EventStatus) -> bool) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| predicate(&outcome.status))
            .count()
    }
}

/// Ingests batches of SendGrid events into an `EventStore`.
#[derive(Clone)]
pub struct Ingestor {
    store: EventStore,
    config: IngestConfig,
    retry_policy: RetryPolicy,
}

impl Ingestor {
    pub fn new(store: EventStore, config: IngestConfig) -> Self {
        let retry_policy = RetryPolicy::from(&config);

        Self {
            store,
            config,
            retry_policy,
        }
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    /// Validate a batch and store each of its events exactly once.
    ///
    /// Nothing is stored if any event in the batch is malformed. Otherwise events are processed in
    /// order, each in its own transaction, and the returned report says what happened to each one.
    #[instrument(skip_all, fields(batch_size))]
    pub async fn ingest(&self, payload: &Value) -> Result<IngestReport, IngestError> {
        let start_time = Instant::now();

        let events = match validate_batch(payload) {
            Ok(events) => events,
            Err(errors) => {
                counter!(MALFORMED_PAYLOADS).increment(1);
                self.log_malformed_payload(payload, &errors);
                return Err(IngestError::Validation(errors));
            }
        };

        tracing::Span::current().record("batch_size", events.len());
        counter!(EVENTS_RECEIVED).increment(events.len() as u64);

        let mut report = IngestReport {
            outcomes: Vec::with_capacity(events.len()),
        };
        for event in &events {
            let status = self.process_event(event).await;
            report.outcomes.push(EventOutcome {
                sg_event_id: event.sg_event_id.clone(),
                status,
            });
        }

        histogram!(INGEST_DURATION).record(start_time.elapsed().as_secs_f64());

        Ok(report)
    }

    /// Run the unit of work for one event, re-running it while it fails with a conflict and the
    /// `RetryPolicy` allows it.
    async fn process_event(&self, event: &ValidatedEvent) -> EventStatus {
        let mut attempt = 1;

        loop {
            match self.try_process_event(event).await {
                Ok(status) => return status,
                Err(error) if error.is_retryable() && self.retry_policy.should_retry(attempt) => {
                    warn!(
                        sg_event_id = %event.sg_event_id,
                        attempt,
                        "transaction conflict while storing event, retrying: {}",
                        error
                    );
                    counter!(TRANSACTION_RETRIES).increment(1);

                    let interval = self.retry_policy.retry_interval(attempt);
                    if !interval.is_zero() {
                        tokio::time::sleep(interval).await;
                    }
                    attempt += 1;
                }
                Err(error) => {
                    error!(
                        sg_event_id = %event.sg_event_id,
                        attempt,
                        "failed to store event: {}",
                        error
                    );
                    counter!(EVENTS_FAILED).increment(1);

                    return EventStatus::Failed {
                        attempts: attempt,
                        error: error.to_string(),
                    };
                }
            }
        }
    }

    async fn try_process_event(&self, event: &ValidatedEvent) -> Result<EventStatus, DatabaseError> {
        let mut txn = self.store.begin().await?;

        if txn.exists(&event.sg_event_id).await? {
            txn.commit().await?;

            counter!(EVENTS_DUPLICATE).increment(1);
            self.log_duplicate_event(event);

            return Ok(EventStatus::Duplicate);
        }

        let id = txn.insert(&normalize(event)).await?;
        txn.commit().await?;

        let event_type = event.event.parse().unwrap_or(EventType::Other);
        counter!(EVENTS_INSERTED, "event" => event_type.as_str()).increment(1);

        Ok(EventStatus::Inserted { id })
    }

    /// There is no way of telling whether a malformed payload was sent by SendGrid: it may mean
    /// SendGrid changed its payload, or that a third party is posting to the endpoint.
    fn log_malformed_payload(&self, payload: &Value, errors: &ValidationErrors) {
        if self.config.log_malformed_payload {
            log_at!(
                self.config.log_malformed_payload_level,
                payload = %payload,
                validation_errors = ?errors.messages(),
                "Malformed SendGrid webhook received"
            );
        }
    }

    fn log_duplicate_event(&self, event: &ValidatedEvent) {
        if self.config.log_duplicate_events {
            log_at!(
                self.config.log_duplicate_events_level,
                sg_event_id = %event.sg_event_id,
                payload = %event.raw,
                "Duplicate SendGrid webhook received"
            );
        }
    }
}
