use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DispatchError;

/// Filter entry matching every event type.
pub const WILDCARD: &str = "*";

/// Minimum length of a non-empty signing secret, in bytes.
pub const MIN_SECRET_LEN: usize = 16;

/// Kind of domain event a subscription can listen for.
///
/// The taxonomy is closed; `Custom` only exists so that collaborators can
/// emit types this crate does not know about yet without a release.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum EventType {
    GistCreated,
    GistUpdated,
    GistDeleted,
    GistStarred,
    GistForked,
    CommentAdded,
    CommentDeleted,
    UserCreated,
    OrganizationCreated,
    TeamCreated,
    /// Synthetic event sent by "test delivery". Never emitted by `notify`.
    Test,
    Custom(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::GistCreated => "gist.created",
            EventType::GistUpdated => "gist.updated",
            EventType::GistDeleted => "gist.deleted",
            EventType::GistStarred => "gist.starred",
            EventType::GistForked => "gist.forked",
            EventType::CommentAdded => "comment.added",
            EventType::CommentDeleted => "comment.deleted",
            EventType::UserCreated => "user.created",
            EventType::OrganizationCreated => "organization.created",
            EventType::TeamCreated => "team.created",
            EventType::Test => "test",
            EventType::Custom(name) => name,
        }
    }

    /// Resolve a `Custom` carrying a known wire name to its variant.
    ///
    /// Filters and `notify` compare variants, so `Custom("gist.created")`
    /// must become `GistCreated` before either sees it.
    pub fn canonical(self) -> Self {
        match self {
            EventType::Custom(name) => match name.parse() {
                Ok(EventType::Custom(_)) | Err(_) => EventType::Custom(name),
                Ok(known) => known,
            },
            known => known,
        }
    }

    /// Whether collaborators may raise this type through the dispatcher.
    pub fn is_emittable(&self) -> bool {
        let name = self.as_str();
        !matches!(self, EventType::Test) && !name.is_empty() && name != WILDCARD
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let event_type = match s {
            "" | WILDCARD => return Err(DispatchError::InvalidEventType(s.to_string())),
            "gist.created" => EventType::GistCreated,
            "gist.updated" => EventType::GistUpdated,
            "gist.deleted" => EventType::GistDeleted,
            "gist.starred" => EventType::GistStarred,
            "gist.forked" => EventType::GistForked,
            "comment.added" => EventType::CommentAdded,
            "comment.deleted" => EventType::CommentDeleted,
            "user.created" => EventType::UserCreated,
            "organization.created" => EventType::OrganizationCreated,
            "team.created" => EventType::TeamCreated,
            "test" => EventType::Test,
            other => EventType::Custom(other.to_string()),
        };
        Ok(event_type)
    }
}

impl From<EventType> for String {
    fn from(event_type: EventType) -> Self {
        event_type.as_str().to_string()
    }
}

impl TryFrom<String> for EventType {
    type Error = DispatchError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Set of event types a subscription listens for.
///
/// Serialized as a JSON array of type names; `["*"]` is the wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "Vec<String>", try_from = "Vec<String>")]
pub enum EventFilter {
    All,
    Only(BTreeSet<EventType>),
}

impl EventFilter {
    pub fn only(types: impl IntoIterator<Item = EventType>) -> Self {
        EventFilter::Only(types.into_iter().map(EventType::canonical).collect())
    }

    /// Whether an event of this type should be delivered.
    ///
    /// The synthetic `test` type only ever reaches a subscription through
    /// an explicit test delivery, so the wildcard does not match it.
    pub fn matches(&self, event_type: &EventType) -> bool {
        match self {
            EventFilter::All => *event_type != EventType::Test,
            EventFilter::Only(types) => types.contains(event_type),
        }
    }

    /// Same filter with every entry in canonical form.
    pub fn canonical(self) -> Self {
        match self {
            EventFilter::All => EventFilter::All,
            EventFilter::Only(types) => EventFilter::only(types),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, EventFilter::Only(types) if types.is_empty())
    }
}

impl From<EventFilter> for Vec<String> {
    fn from(filter: EventFilter) -> Self {
        match filter {
            EventFilter::All => vec![WILDCARD.to_string()],
            EventFilter::Only(types) => types.into_iter().map(String::from).collect(),
        }
    }
}

impl TryFrom<Vec<String>> for EventFilter {
    type Error = DispatchError;

    fn try_from(values: Vec<String>) -> Result<Self, Self::Error> {
        if values.iter().any(|v| v == WILDCARD) {
            return Ok(EventFilter::All);
        }
        let types = values
            .iter()
            .map(|v| v.parse::<EventType>())
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(EventFilter::Only(types))
    }
}

/// Whether an actor is a person or the service itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    User,
    System,
}

/// Who triggered an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: u64,
    pub username: String,
    pub email: Option<String>,
    pub kind: ActorKind,
}

impl Actor {
    pub fn user(id: u64, username: impl Into<String>, email: Option<String>) -> Self {
        Self {
            id,
            username: username.into(),
            email,
            kind: ActorKind::User,
        }
    }

    /// Actor used when no user triggered the event.
    pub fn system() -> Self {
        Self {
            id: 0,
            username: "system".to_string(),
            email: None,
            kind: ActorKind::System,
        }
    }
}

/// Unique identifier for an event.
///
/// Opaque to receivers; distinct from the per-attempt delivery id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub String);

impl EventId {
    pub fn generate() -> Self {
        EventId(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A domain event, immutable once the dispatcher has stamped it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,

    #[serde(rename = "type")]
    pub event_type: EventType,

    /// Serialized as RFC 3339.
    pub timestamp: DateTime<Utc>,

    pub actor: Actor,

    pub data: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    /// Stamp a new event with a fresh id and the current time.
    pub fn new(
        event_type: EventType,
        actor: Actor,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: EventId::generate(),
            event_type,
            timestamp: Utc::now(),
            actor,
            data,
        }
    }
}

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn generate() -> Self {
        SubscriptionId(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Account that owns a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Owner {
    User(u64),
    Organization(u64),
}

/// Shared signing secret.
///
/// Write-only: it deserializes from input but has no `Serialize` impl and
/// its `Debug` output is redacted, so it cannot leak through read APIs or logs.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(secret: impl Into<String>) -> Self {
        Secret(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Empty (unsigned mode) or long enough to sign with.
    pub fn is_valid(&self) -> bool {
        self.is_empty() || self.len() >= MIN_SECRET_LEN
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("Secret(<none>)")
        } else {
            f.write_str("Secret([redacted])")
        }
    }
}

/// Body encoding used when posting to an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// `application/json`, the envelope as the raw body.
    #[default]
    Json,
    /// `application/x-www-form-urlencoded`, the envelope in a `payload` field.
    Form,
}

impl ContentType {
    pub fn mime(&self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Form => "application/x-www-form-urlencoded",
        }
    }
}

/// Persisted webhook configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub owner: Owner,
    pub url: String,

    #[serde(skip_serializing, default)]
    pub secret: Secret,

    pub events: EventFilter,
    pub active: bool,
    pub content_type: ContentType,

    /// Skip TLS certificate validation for this endpoint.
    pub insecure_tls: bool,

    pub last_delivered_at: Option<DateTime<Utc>>,
    pub last_status: Option<u16>,
    pub last_error: Option<String>,
    pub delivery_count: u64,
    pub failure_count: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Subscription {
    /// Active and not soft-deleted.
    pub fn is_deliverable(&self) -> bool {
        self.active && self.deleted_at.is_none()
    }

    /// Whether an event of this type should be delivered here right now.
    pub fn accepts(&self, event_type: &EventType) -> bool {
        self.is_deliverable() && self.events.matches(event_type)
    }

    /// Whether a signing secret is configured (hidden from serialized output).
    pub fn has_secret(&self) -> bool {
        !self.secret.is_empty()
    }
}

/// Input for creating a subscription.
#[derive(Debug, Clone, Deserialize)]
pub struct NewSubscription {
    pub owner: Owner,
    pub url: String,
    #[serde(default)]
    pub secret: Secret,
    pub events: EventFilter,
    #[serde(default)]
    pub content_type: ContentType,
    #[serde(default)]
    pub insecure_tls: bool,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl NewSubscription {
    /// Create a subscription request listening for every event type.
    ///
    /// Defaults: no secret (unsigned), JSON body, TLS validated, active.
    pub fn new(owner: Owner, url: impl Into<String>) -> Self {
        Self {
            owner,
            url: url.into(),
            secret: Secret::default(),
            events: EventFilter::All,
            content_type: ContentType::Json,
            insecure_tls: false,
            active: true,
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Secret::new(secret);
        self
    }

    pub fn with_events(mut self, events: EventFilter) -> Self {
        self.events = events;
        self
    }

    pub fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn with_insecure_tls(mut self, insecure: bool) -> Self {
        self.insecure_tls = insecure;
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }
}

/// Partial update of a subscription. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionPatch {
    pub url: Option<String>,
    pub secret: Option<Secret>,
    pub events: Option<EventFilter>,
    pub active: Option<bool>,
    pub content_type: Option<ContentType>,
    pub insecure_tls: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_parses_known_names() {
        assert_eq!("gist.created".parse::<EventType>().unwrap(), EventType::GistCreated);
        assert_eq!("comment.added".parse::<EventType>().unwrap(), EventType::CommentAdded);
        assert_eq!(
            "gist.renamed".parse::<EventType>().unwrap(),
            EventType::Custom("gist.renamed".to_string())
        );
    }

    #[test]
    fn custom_names_resolve_to_known_variants() {
        assert_eq!(EventType::Custom("gist.created".to_string()).canonical(), EventType::GistCreated);
        assert_eq!(EventType::Custom("test".to_string()).canonical(), EventType::Test);
        assert_eq!(
            EventType::Custom("gist.renamed".to_string()).canonical(),
            EventType::Custom("gist.renamed".to_string())
        );
        assert_eq!(EventType::Custom("*".to_string()).canonical(), EventType::Custom("*".to_string()));
        assert!(!EventType::Custom("test".to_string()).canonical().is_emittable());

        let filter = EventFilter::only([EventType::Custom("comment.added".to_string())]);
        assert!(filter.matches(&EventType::CommentAdded));
    }

    #[test]
    fn event_type_rejects_empty_and_wildcard() {
        assert!("".parse::<EventType>().is_err());
        assert!("*".parse::<EventType>().is_err());
    }

    #[test]
    fn wildcard_filter_matches_everything_but_test() {
        let filter = EventFilter::All;
        assert!(filter.matches(&EventType::GistCreated));
        assert!(filter.matches(&EventType::Custom("x.y".to_string())));
        assert!(!filter.matches(&EventType::Test));
    }

    #[test]
    fn filter_serializes_as_string_list() {
        let filter = EventFilter::only([EventType::GistStarred, EventType::CommentAdded]);
        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(json, serde_json::json!(["gist.starred", "comment.added"]));

        let all: EventFilter = serde_json::from_value(serde_json::json!(["gist.created", "*"])).unwrap();
        assert_eq!(all, EventFilter::All);
    }

    #[test]
    fn event_serializes_with_type_and_rfc3339_timestamp() {
        let mut data = serde_json::Map::new();
        data.insert("gist_id".to_string(), serde_json::json!(42));
        let event = Event::new(EventType::GistForked, Actor::system(), data);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "gist.forked");
        assert_eq!(json["actor"]["kind"], "system");
        let ts = json["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());
    }

    #[test]
    fn secret_never_serialized_or_debug_printed() {
        let now = Utc::now();
        let sub = Subscription {
            id: SubscriptionId::generate(),
            owner: Owner::User(7),
            url: "https://example.com/hook".to_string(),
            secret: Secret::new("super-secret-value-123"),
            events: EventFilter::All,
            active: true,
            content_type: ContentType::Json,
            insecure_tls: false,
            last_delivered_at: None,
            last_status: None,
            last_error: None,
            delivery_count: 0,
            failure_count: 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        let json = serde_json::to_string(&sub).unwrap();
        assert!(!json.contains("super-secret-value-123"));
        assert!(!format!("{:?}", sub).contains("super-secret-value-123"));
    }

    #[test]
    fn secret_length_rule() {
        assert!(Secret::default().is_valid());
        assert!(!Secret::new("short").is_valid());
        assert!(Secret::new("0123456789abcdef").is_valid());
    }
}
