//! # Validation
//!
//! Shape validation for a batch of SendGrid Event Webhook notifications.
//!
//! Every event in a batch is checked against the same schema and every failure is collected, so
//! the caller gets the full picture of what was wrong with a payload instead of only the first
//! problem. A batch is accepted only if all of its events are valid.
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Map, Value};

// RFC 5321 addresses with the UTF-8 extensions of RFC 6531: a dot-atom or quoted local part, and
// a (possibly internationalized) domain name or an address literal.
static EMAIL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        "^",
        // local part
        r#"(?:[\p{L}\p{N}\p{M}!#$%&'*+/=?^_`{|}~-]+(?:\.[\p{L}\p{N}\p{M}!#$%&'*+/=?^_`{|}~-]+)*"#,
        r#"|"(?:[^"\\\r\n]|\\[^\r\n])*")"#,
        "@",
        // domain
        r"(?:[\p{L}\p{N}\p{M}]+(?:-+[\p{L}\p{N}\p{M}]+)*(?:\.[\p{L}\p{N}\p{M}]+(?:-+[\p{L}\p{N}\p{M}]+)*)*",
        r"|\[(?:[0-9]{1,3}(?:\.[0-9]{1,3}){3}|IPv6:[0-9A-Fa-f:.]+)\])",
        "$",
    ))
    .expect("hard-coded regular expression to be valid")
});

const MAX_LOCAL_PART_LENGTH: usize = 64;
const MAX_ADDRESS_LENGTH: usize = 254;

/// The `category` field of an event as SendGrid sends it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Category {
    Single(String),
    List(Vec<String>),
}

/// An event that passed validation, with its modeled fields extracted.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedEvent {
    pub email: String,
    pub timestamp: i64,
    pub event: String,
    pub sg_event_id: String,
    pub sg_message_id: Option<String>,
    pub category: Option<Category>,
    /// The event object exactly as it was received.
    pub raw: Value,
}

/// Validation failures keyed by attribute path, e.g. `0.email` or `3.category.1`.
/// Attributes keep the order in which they were found: by event, then by field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    fields: Vec<(String, Vec<String>)>,
}

impl ValidationErrors {
    /// Failures of one attribute are always recorded back to back, so only the last entry can
    /// share its name.
    fn add(&mut self, attribute: String, message: String) {
        match self.fields.last_mut() {
            Some((name, messages)) if *name == attribute => messages.push(message),
            _ => self.fields.push((attribute, vec![message])),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Number of attributes with at least one failure.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn get(&self, attribute: &str) -> Option<&[String]> {
        self.fields
            .iter()
            .find(|(name, _)| name == attribute)
            .map(|(_, messages)| messages.as_slice())
    }

    /// All messages, flattened in attribute order.
    pub fn messages(&self) -> Vec<&str> {
        self.fields
            .iter()
            .flat_map(|(_, messages)| messages.iter().map(String::as_str))
            .collect()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages = self.messages();

        match messages.split_first() {
            None => write!(f, "no validation errors"),
            Some((first, [])) => write!(f, "{first}"),
            Some((first, rest)) => write!(f, "{first} (and {} more errors)", rest.len()),
        }
    }
}

impl std::error::Error for ValidationErrors {}

impl Serialize for ValidationErrors {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (attribute, messages) in &self.fields {
            map.serialize_entry(attribute, messages)?;
        }
        map.end()
    }
}

/// A rule an attribute failed.
enum Rule {
    Required,
    Email,
    Integer,
    String,
    StringOrList,
    Object,
    List,
}

impl Rule {
    fn message(&self, attribute: &str) -> String {
        match self {
            Rule::Required => format!("The {attribute} field is required."),
            Rule::Email => format!("The {attribute} must be a valid email address."),
            Rule::Integer => format!("The {attribute} must be an integer."),
            Rule::String => format!("The {attribute} must be a string."),
            Rule::StringOrList => format!("The {attribute} must be a string or a list."),
            Rule::Object => format!("The {attribute} must be an event object."),
            Rule::List => format!("The {attribute} must be a list of events."),
        }
    }
}

/// Validate a whole batch.
/// Returns the validated events in the order received, or every failure found in the batch.
pub fn validate_batch(payload: &Value) -> Result<Vec<ValidatedEvent>, ValidationErrors> {
    let mut errors = ValidationErrors::default();

    let Some(items) = payload.as_array() else {
        errors.add("payload".to_owned(), Rule::List.message("payload"));
        return Err(errors);
    };

    let mut events = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        match item {
            Value::Object(object) => {
                if let Some(event) = validate_event(index, object, &mut errors) {
                    events.push(event);
                }
            }
            _ => {
                let attribute = index.to_string();
                errors.add(attribute.clone(), Rule::Object.message(&attribute));
            }
        }
    }

    if errors.is_empty() {
        Ok(events)
    } else {
        Err(errors)
    }
}

fn validate_event(
    index: usize,
    object: &Map<String, Value>,
    errors: &mut ValidationErrors,
) -> Option<ValidatedEvent> {
    let email = record(errors, format!("{index}.email"), email(object.get("email")));
    let timestamp = record(
        errors,
        format!("{index}.timestamp"),
        integer(object.get("timestamp")),
    );
    let event = record(errors, format!("{index}.event"), event(object.get("event")));
    let sg_event_id = record(
        errors,
        format!("{index}.sg_event_id"),
        required_string(object.get("sg_event_id")),
    );
    let sg_message_id = record(
        errors,
        format!("{index}.sg_message_id"),
        optional_string(object.get("sg_message_id")),
    );
    let category = category(index, object.get("category"), errors);

    Some(ValidatedEvent {
        email: email?,
        timestamp: timestamp?,
        event: event?,
        sg_event_id: sg_event_id?,
        sg_message_id: sg_message_id?,
        category: category?,
        raw: Value::Object(object.clone()),
    })
}

fn record<T>(errors: &mut ValidationErrors, attribute: String, result: Result<T, Rule>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(rule) => {
            let message = rule.message(&attribute);
            errors.add(attribute, message);
            None
        }
    }
}

/// Null, blank strings and empty collections do not satisfy a required field.
fn required(value: Option<&Value>) -> Result<&Value, Rule> {
    match value {
        None | Some(Value::Null) => Err(Rule::Required),
        Some(Value::String(s)) if s.trim().is_empty() => Err(Rule::Required),
        Some(Value::Array(a)) if a.is_empty() => Err(Rule::Required),
        Some(Value::Object(o)) if o.is_empty() => Err(Rule::Required),
        Some(value) => Ok(value),
    }
}

fn email(value: Option<&Value>) -> Result<String, Rule> {
    match required(value)? {
        Value::String(s) if is_email(s) => Ok(s.to_owned()),
        _ => Err(Rule::Email),
    }
}

/// Lengths are limits on octets.
fn is_email(address: &str) -> bool {
    let Some((local_part, _)) = address.rsplit_once('@') else {
        return false;
    };

    local_part.len() <= MAX_LOCAL_PART_LENGTH
        && address.len() <= MAX_ADDRESS_LENGTH
        && EMAIL_REGEX.is_match(address)
}

/// Integers may arrive as JSON numbers, whole-valued ones included, or as strings of digits.
fn integer(value: Option<&Value>) -> Result<i64, Rule> {
    match required(value)? {
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => Ok(i),
            (None, Some(f)) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
                Ok(f as i64)
            }
            _ => Err(Rule::Integer),
        },
        Value::String(s) => s.trim().parse::<i64>().map_err(|_| Rule::Integer),
        _ => Err(Rule::Integer),
    }
}

fn event(value: Option<&Value>) -> Result<String, Rule> {
    match required(value)? {
        Value::String(s) => Ok(s.to_owned()),
        other => Ok(other.to_string()),
    }
}

fn required_string(value: Option<&Value>) -> Result<String, Rule> {
    match required(value)? {
        Value::String(s) => Ok(s.to_owned()),
        _ => Err(Rule::String),
    }
}

fn optional_string(value: Option<&Value>) -> Result<Option<String>, Rule> {
    match value {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.to_owned())),
        Some(_) => Err(Rule::String),
    }
}

fn category(
    index: usize,
    value: Option<&Value>,
    errors: &mut ValidationErrors,
) -> Option<Option<Category>> {
    let attribute = format!("{index}.category");

    match value {
        None | Some(Value::Null) => Some(None),
        Some(Value::String(s)) => Some(Some(Category::Single(s.to_owned()))),
        Some(Value::Array(items)) => {
            let mut categories = Vec::with_capacity(items.len());
            let mut valid = true;
            for (position, item) in items.iter().enumerate() {
                match item {
                    Value::String(s) => categories.push(s.to_owned()),
                    _ => {
                        valid = false;
                        let attribute = format!("{attribute}.{position}");
                        errors.add(attribute.clone(), Rule::String.message(&attribute));
                    }
                }
            }
            valid.then_some(Some(Category::List(categories)))
        }
        Some(_) => {
            errors.add(attribute.clone(), Rule::StringOrList.message(&attribute));
            None
        }
    }
}
