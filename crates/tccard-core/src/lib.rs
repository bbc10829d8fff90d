//! Core domain model for tccard: identifiers, data sources, profile records and counters.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "tccard-core";

pub const DEFAULT_CARD_BASE_URL: &str = "https://card.tccards.tn";
pub const DEFAULT_PROFILE_PICTURE_URL: &str = "https://tccards.tn/Assets/default.png";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierKind {
    Id,
    Link,
}

impl IdentifierKind {
    /// Query parameter a data source expects for this kind of lookup.
    pub fn query_param(self) -> &'static str {
        match self {
            IdentifierKind::Id => "id",
            IdentifierKind::Link => "link",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("no profile link provided")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProfileIdentifier {
    pub kind: IdentifierKind,
    pub value: String,
}

impl ProfileIdentifier {
    pub fn id(value: impl Into<String>) -> Self {
        Self {
            kind: IdentifierKind::Id,
            value: value.into(),
        }
    }

    pub fn link(value: impl Into<String>) -> Self {
        Self {
            kind: IdentifierKind::Link,
            value: value.into(),
        }
    }

    /// Parse a routing token such as `#jane`, `@jane` or `id_42`.
    pub fn from_routing_token(token: &str) -> Result<Self, IdentifierError> {
        let token = token.trim();
        let token = token.strip_prefix('#').unwrap_or(token);
        let token = token.strip_prefix('@').unwrap_or(token).trim();
        if token.is_empty() {
            return Err(IdentifierError::Empty);
        }

        match token.strip_prefix("id_") {
            Some(rest) if rest.trim().is_empty() => Err(IdentifierError::Empty),
            Some(rest) => Ok(Self::id(rest.trim())),
            None => Ok(Self::link(token)),
        }
    }
}

impl fmt::Display for ProfileIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.kind.query_param(), self.value)
    }
}

/// One remote endpoint able to answer a profile lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSource {
    pub endpoint_template: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub name: Option<String>,
}

impl DataSource {
    pub const QUERY_PLACEHOLDER: &'static str = "{query}";

    pub fn new(endpoint_template: impl Into<String>, priority: i32) -> Self {
        Self {
            endpoint_template: endpoint_template.into(),
            priority,
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Label used in logs: the configured name, else the endpoint host.
    pub fn label(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        let template = self.endpoint_template.replace(Self::QUERY_PLACEHOLDER, "");
        Url::parse(&template)
            .ok()
            .and_then(|u| u.host_str().map(ToString::to_string))
            .unwrap_or_else(|| self.endpoint_template.clone())
    }

    pub fn request_url(&self, identifier: &ProfileIdentifier) -> String {
        let query = format!(
            "{}={}",
            identifier.kind.query_param(),
            urlencoding::encode(&identifier.value)
        );
        if self.endpoint_template.contains(Self::QUERY_PLACEHOLDER) {
            return self
                .endpoint_template
                .replace(Self::QUERY_PLACEHOLDER, &query);
        }
        let separator = if self.endpoint_template.contains('?') {
            '&'
        } else {
            '?'
        };
        format!("{}{separator}{query}", self.endpoint_template)
    }
}

/// Sort sources by ascending priority, keeping configuration order for ties.
pub fn order_sources(mut sources: Vec<DataSource>) -> Vec<DataSource> {
    sources.sort_by_key(|s| s.priority);
    sources
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing name")]
    MissingName,
    #[error("inactive")]
    Inactive { status: String },
    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl ValidationError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            ValidationError::MissingName => "missing_name",
            ValidationError::Inactive { .. } => "inactive",
            ValidationError::Malformed(_) => "malformed",
        }
    }
}

/// A data source payload after `.data` unwrapping.
#[derive(Debug, Clone, PartialEq)]
pub enum RawLookupResponse {
    ErrorEnvelope { message: Option<String> },
    Profile(Map<String, JsonValue>),
}

impl RawLookupResponse {
    pub fn from_json(value: JsonValue) -> Result<Self, ValidationError> {
        let mut outer = match value {
            JsonValue::Object(outer) => outer,
            other => {
                return Err(ValidationError::Malformed(format!(
                    "expected a JSON object, got {}",
                    json_type_name(&other)
                )))
            }
        };
        if let Some(envelope) = error_envelope(&outer) {
            return Ok(envelope);
        }

        let inner = match outer.remove("data") {
            Some(JsonValue::Object(inner)) => inner,
            Some(JsonValue::Null) | None => outer,
            Some(other) => {
                return Err(ValidationError::Malformed(format!(
                    "`data` is a {}, expected an object",
                    json_type_name(&other)
                )))
            }
        };
        if let Some(envelope) = error_envelope(&inner) {
            return Ok(envelope);
        }
        Ok(RawLookupResponse::Profile(inner))
    }
}

fn error_envelope(object: &Map<String, JsonValue>) -> Option<RawLookupResponse> {
    let status = object.get("status")?.as_str()?;
    if !status.eq_ignore_ascii_case("error") {
        return None;
    }
    Some(RawLookupResponse::ErrorEnvelope {
        message: object
            .get("message")
            .and_then(JsonValue::as_str)
            .map(ToString::to_string),
    })
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Validated profile. Only built through [`ProfileRecord::from_fields`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRecord {
    pub name: String,
    pub link: Option<String>,
    pub tagline: Option<String>,
    pub profile_picture_url: Option<String>,
    pub social_links_raw: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub selected_style_id: Option<String>,
    pub activity_status: Option<String>,
    pub contact_form_recipient: Option<String>,
}

const NAME_KEYS: &[&str] = &["Name", "name"];
const LINK_KEYS: &[&str] = &["Link", "link"];
const TAGLINE_KEYS: &[&str] = &["Tagline", "tagline", "bio"];
const PICTURE_KEYS: &[&str] = &[
    "Profile Picture URL",
    "profilePictureUrl",
    "profilePic",
    "profile_picture_url",
];
const SOCIAL_KEYS: &[&str] = &["Social Links", "socialLinks", "social_links"];
const EMAIL_KEYS: &[&str] = &["Email", "email"];
const PHONE_KEYS: &[&str] = &["Phone", "phone"];
const ADDRESS_KEYS: &[&str] = &["Address", "address"];
const STYLE_KEYS: &[&str] = &["Selected Style", "selectedStyle", "selected_style"];
const STATUS_KEYS: &[&str] = &["Status", "status", "activityStatus", "activity_status"];
/// Response-level `status` values that say nothing about the profile itself.
const ENVELOPE_STATUSES: &[&str] = &["success", "ok"];
const FORM_KEYS: &[&str] = &["Form Form", "Form", "contactForm", "form"];

impl ProfileRecord {
    /// Map spreadsheet column names onto the canonical schema and validate.
    pub fn from_fields(fields: &Map<String, JsonValue>) -> Result<Self, ValidationError> {
        let name = field_text(fields, NAME_KEYS).ok_or(ValidationError::MissingName)?;
        let activity_status = field_text(fields, STATUS_KEYS)
            .filter(|s| !ENVELOPE_STATUSES.iter().any(|e| s.eq_ignore_ascii_case(e)));
        if let Some(status) = &activity_status {
            if !status.eq_ignore_ascii_case("active") {
                return Err(ValidationError::Inactive {
                    status: status.clone(),
                });
            }
        }

        Ok(Self {
            name,
            link: field_text(fields, LINK_KEYS),
            tagline: field_text(fields, TAGLINE_KEYS),
            profile_picture_url: field_text(fields, PICTURE_KEYS),
            social_links_raw: field_text(fields, SOCIAL_KEYS),
            email: field_text(fields, EMAIL_KEYS),
            phone: field_text(fields, PHONE_KEYS),
            address: field_text(fields, ADDRESS_KEYS),
            selected_style_id: field_text(fields, STYLE_KEYS),
            activity_status,
            contact_form_recipient: field_text(fields, FORM_KEYS),
        })
    }

    /// Normalize and validate a raw lookup body in one step.
    ///
    /// Error envelopes come back as `Ok(None)` so callers can tell an authoritative
    /// "no match" apart from a payload that failed validation.
    pub fn from_lookup_json(value: JsonValue) -> Result<Option<Self>, ValidationError> {
        match RawLookupResponse::from_json(value)? {
            RawLookupResponse::ErrorEnvelope { .. } => Ok(None),
            RawLookupResponse::Profile(fields) => Self::from_fields(&fields).map(Some),
        }
    }

    pub fn picture_or_default(&self) -> &str {
        self.profile_picture_url
            .as_deref()
            .unwrap_or(DEFAULT_PROFILE_PICTURE_URL)
    }

    pub fn social_links(&self) -> Vec<SocialLink> {
        self.social_links_raw
            .as_deref()
            .map(parse_social_links)
            .unwrap_or_default()
    }

    pub fn contact_card(&self) -> ContactCard {
        ContactCard {
            name: self.name.clone(),
            email: self.email.clone(),
            phone: self.phone.clone(),
            address: self.address.clone(),
        }
    }
}

fn field_text(fields: &Map<String, JsonValue>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| fields.get(*key))
        .find_map(scalar_text)
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    let text = match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocialLink {
    pub href: String,
    pub display: String,
}

/// Parse the newline-separated social links column. Unparseable lines are dropped.
pub fn parse_social_links(raw: &str) -> Vec<SocialLink> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let lower = line.to_ascii_lowercase();
            let candidate = if lower.starts_with("http://") || lower.starts_with("https://") {
                line.to_string()
            } else {
                format!("https://{line}")
            };
            let url = Url::parse(&candidate).ok()?;
            let host = url.host_str()?;
            let display = host.strip_prefix("www.").unwrap_or(host).to_string();
            Some(SocialLink {
                href: url.to_string(),
                display,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactCard {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

impl ContactCard {
    pub fn has_details(&self) -> bool {
        self.email.is_some() || self.phone.is_some() || self.address.is_some()
    }

    /// Plain-text block handed to the clipboard collaborator.
    pub fn clipboard_text(&self) -> String {
        let mut lines = vec![self.name.clone()];
        if let Some(email) = &self.email {
            lines.push(format!("Email: {email}"));
        }
        if let Some(phone) = &self.phone {
            lines.push(format!("Phone: {phone}"));
        }
        if let Some(address) = &self.address {
            lines.push(format!("Address: {address}"));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharePlatform {
    Facebook,
    Whatsapp,
    Linkedin,
    Messenger,
    Snapchat,
}

impl SharePlatform {
    pub const ALL: [SharePlatform; 5] = [
        SharePlatform::Facebook,
        SharePlatform::Whatsapp,
        SharePlatform::Linkedin,
        SharePlatform::Messenger,
        SharePlatform::Snapchat,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SharePlatform::Facebook => "facebook",
            SharePlatform::Whatsapp => "whatsapp",
            SharePlatform::Linkedin => "linkedin",
            SharePlatform::Messenger => "messenger",
            SharePlatform::Snapchat => "snapchat",
        }
    }
}

impl FromStr for SharePlatform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SharePlatform::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown share platform `{s}`"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareLinks {
    pub profile_url: String,
}

impl ShareLinks {
    pub fn new(base_url: &str, link: &str) -> Self {
        Self {
            profile_url: format!("{}/@{}", base_url.trim_end_matches('/'), link),
        }
    }

    pub fn for_platform(&self, platform: SharePlatform) -> String {
        let url = urlencoding::encode(&self.profile_url);
        match platform {
            SharePlatform::Facebook => format!("https://www.facebook.com/sharer/sharer.php?u={url}"),
            SharePlatform::Whatsapp => {
                let text = format!("Check out my digital profile: {}", self.profile_url);
                format!("https://wa.me/?text={}", urlencoding::encode(&text))
            }
            SharePlatform::Linkedin => {
                format!("https://www.linkedin.com/shareArticle?mini=true&url={url}")
            }
            SharePlatform::Messenger => format!("fb-messenger://share/?link={url}"),
            SharePlatform::Snapchat => {
                format!("https://www.snapchat.com/scan?attachmentUrl={url}")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContactField {
    Name,
    Email,
    Message,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid contact message fields: {fields:?}")]
pub struct ContactValidationError {
    pub fields: Vec<ContactField>,
}

/// Message a visitor sends through the profile's contact form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactMessage {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    pub message: String,
}

impl ContactMessage {
    pub const NAME_LEN: (usize, usize) = (2, 50);
    pub const MESSAGE_LEN: (usize, usize) = (10, 500);

    pub fn validate(&self) -> Result<(), ContactValidationError> {
        let mut fields = Vec::new();
        let name_len = self.name.trim().chars().count();
        if name_len < Self::NAME_LEN.0 || name_len > Self::NAME_LEN.1 {
            fields.push(ContactField::Name);
        }
        if !looks_like_email(self.email.trim()) {
            fields.push(ContactField::Email);
        }
        let message_len = self.message.trim().chars().count();
        if message_len < Self::MESSAGE_LEN.0 || message_len > Self::MESSAGE_LEN.1 {
            fields.push(ContactField::Message);
        }
        if fields.is_empty() {
            Ok(())
        } else {
            Err(ContactValidationError { fields })
        }
    }
}

fn looks_like_email(value: &str) -> bool {
    if value.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    domain
        .char_indices()
        .any(|(i, c)| c == '.' && i > 0 && i + 1 < domain.len())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterAction {
    Visit,
    Share,
    Contact,
    Copy,
    Social,
    Init,
}

impl CounterAction {
    pub fn as_str(self) -> &'static str {
        match self {
            CounterAction::Visit => "visit",
            CounterAction::Share => "share",
            CounterAction::Contact => "contact",
            CounterAction::Copy => "copy",
            CounterAction::Social => "social",
            CounterAction::Init => "init",
        }
    }
}

impl fmt::Display for CounterAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CounterAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "visit" => Ok(CounterAction::Visit),
            "share" => Ok(CounterAction::Share),
            "contact" => Ok(CounterAction::Contact),
            "copy" => Ok(CounterAction::Copy),
            "social" => Ok(CounterAction::Social),
            "init" => Ok(CounterAction::Init),
            other => Err(format!("unknown counter action `{other}`")),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CounterError {
    #[error("action `{0}` requires a detail")]
    MissingDetail(CounterAction),
}

/// Per-profile counters, persisted after every mutation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CounterState {
    pub total_visits: u64,
    pub share_count: u64,
    pub contact_count: u64,
    pub copy_count: u64,
    pub social_counts: BTreeMap<String, u64>,
    pub last_updated_epoch_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_visit_epoch_ms: Option<i64>,
}

impl CounterState {
    /// Apply one action. Returns `false` when the action changes nothing
    /// (a visit inside the cool-down window).
    pub fn apply(
        &mut self,
        action: CounterAction,
        detail: Option<&str>,
        now_ms: i64,
        visit_cooldown_ms: i64,
    ) -> Result<bool, CounterError> {
        match action {
            CounterAction::Visit => {
                if let Some(last) = self.last_visit_epoch_ms {
                    if now_ms.saturating_sub(last) <= visit_cooldown_ms {
                        return Ok(false);
                    }
                }
                self.total_visits += 1;
                self.last_visit_epoch_ms = Some(now_ms);
            }
            CounterAction::Share => self.share_count += 1,
            CounterAction::Contact => self.contact_count += 1,
            CounterAction::Copy => self.copy_count += 1,
            CounterAction::Social => {
                let id = detail
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .ok_or(CounterError::MissingDetail(action))?;
                *self.social_counts.entry(id.to_string()).or_default() += 1;
            }
            CounterAction::Init => return Ok(true),
        }
        self.last_updated_epoch_ms = now_ms;
        Ok(true)
    }
}

/// Body POSTed to the analytics collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryPayload {
    pub action: CounterAction,
    pub detail: Option<String>,
    pub timestamp: i64,
    pub full_state: CounterState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryQueueEntry {
    pub action: CounterAction,
    pub detail: Option<String>,
    pub full_state_snapshot: CounterState,
    pub enqueued_at_epoch_ms: i64,
    /// When the event happened. Zero in entries written before this was tracked.
    #[serde(default)]
    pub event_timestamp_epoch_ms: i64,
}

impl RetryQueueEntry {
    pub fn from_payload(payload: &DeliveryPayload, enqueued_at_epoch_ms: i64) -> Self {
        Self {
            action: payload.action,
            detail: payload.detail.clone(),
            full_state_snapshot: payload.full_state.clone(),
            enqueued_at_epoch_ms,
            event_timestamp_epoch_ms: payload.timestamp,
        }
    }

    /// Rebuild the payload as first sent, event timestamp included.
    pub fn payload(&self) -> DeliveryPayload {
        let timestamp = if self.event_timestamp_epoch_ms != 0 {
            self.event_timestamp_epoch_ms
        } else {
            self.enqueued_at_epoch_ms
        };
        DeliveryPayload {
            action: self.action,
            detail: self.detail.clone(),
            timestamp,
            full_state: self.full_state_snapshot.clone(),
        }
    }
}

pub fn counter_state_key(link: &str) -> String {
    format!("counterState:{link}")
}

pub fn retry_queue_key(link: &str) -> String {
    format!("retryQueue:{link}")
}
