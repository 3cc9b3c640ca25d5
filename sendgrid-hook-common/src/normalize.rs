use chrono::DateTime;

use crate::event::NewWebhookEvent;
use crate::validation::{Category, ValidatedEvent};

/// Map a validated event into the record inserted by the `EventStore`.
///
/// `category` is always stored as a list: a single string becomes a one element list and an empty
/// string or empty list is stored as null. `payload` keeps the whole object, including fields we
/// do not model.
pub fn normalize(event: &ValidatedEvent) -> NewWebhookEvent {
    let categories = match &event.category {
        Some(Category::Single(category)) if !category.is_empty() => Some(vec![category.clone()]),
        Some(Category::List(categories)) if !categories.is_empty() => Some(categories.clone()),
        _ => None,
    };

    NewWebhookEvent {
        timestamp: DateTime::from_timestamp(event.timestamp, 0),
        email: event.email.clone(),
        event: event.event.clone(),
        sg_event_id: event.sg_event_id.clone(),
        sg_message_id: event.sg_message_id.clone(),
        payload: sqlx::types::Json(event.raw.clone()),
        categories: categories.map(sqlx::types::Json),
    }
}
