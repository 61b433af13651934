use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

pub const SEARCH_REQUIRED_MESSAGE: &str = "q is required";
pub const SUGGEST_REQUIRED_MESSAGE: &str = "host_element, adjacent_element, exposure are required";
pub const NO_MATCH_EXPLANATION: &str = "No matching detail found for given context";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PiaxisError {
    #[error("missing identity assertion")]
    MissingIdentity,
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("transaction failure: {0}")]
    Transaction(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct DetailId(pub i64);

impl Display for DetailId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Account role as stored in the user directory.
///
/// Stored values outside the known set are kept verbatim in
/// [`Role::Unrecognized`] and never grant visibility.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(from = "String", into = "String")]
pub enum Role {
    Admin,
    Architect,
    Intern,
    Unrecognized(String),
}

impl Role {
    #[must_use]
    pub fn known() -> [Self; 3] {
        [Self::Admin, Self::Architect, Self::Intern]
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Admin => "admin",
            Self::Architect => "architect",
            Self::Intern => "intern",
            Self::Unrecognized(raw) => raw,
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Self {
        Self::from(value.to_string())
    }

    #[must_use]
    pub fn is_recognized(&self) -> bool {
        !matches!(self, Self::Unrecognized(_))
    }

    /// Name of the storage-layer policy granting this role its rows.
    #[must_use]
    pub fn policy_name(&self) -> Option<&'static str> {
        match self {
            Self::Admin => Some("admin_access"),
            Self::Architect => Some("architect_access"),
            Self::Intern => Some("intern_access"),
            Self::Unrecognized(_) => None,
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Role {
    fn from(value: String) -> Self {
        match value.as_str() {
            "admin" => Self::Admin,
            "architect" => Self::Architect,
            "intern" => Self::Intern,
            _ => Self::Unrecognized(value),
        }
    }
}

impl From<Role> for String {
    fn from(value: Role) -> Self {
        match value {
            Role::Unrecognized(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(from = "String", into = "String")]
pub enum DetailSource {
    Standard,
    UserProject,
    Other(String),
}

impl DetailSource {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Standard => "standard",
            Self::UserProject => "user_project",
            Self::Other(raw) => raw,
        }
    }
}

impl Display for DetailSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for DetailSource {
    fn from(value: String) -> Self {
        match value.as_str() {
            "standard" => Self::Standard,
            "user_project" => Self::UserProject,
            _ => Self::Other(value),
        }
    }
}

impl From<DetailSource> for String {
    fn from(value: DetailSource) -> Self {
        match value {
            DetailSource::Other(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Detail {
    pub id: DetailId,
    pub title: String,
    pub category: String,
    pub tags: String,
    pub description: String,
    pub source: DetailSource,
    pub user_id: Option<UserId>,
}

impl Detail {
    /// Check catalog invariants before a detail is persisted.
    ///
    /// # Errors
    /// Returns [`PiaxisError::Validation`] when the title is blank or a
    /// `user_project` detail has no owner.
    pub fn validate(&self) -> Result<(), PiaxisError> {
        if self.title.trim().is_empty() {
            return Err(PiaxisError::Validation(format!("detail {} MUST have a title", self.id)));
        }
        if self.source == DetailSource::UserProject && self.user_id.is_none() {
            return Err(PiaxisError::Validation(format!(
                "user_project detail {} MUST carry an owning user_id",
                self.id
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn summary(&self) -> DetailSummary {
        DetailSummary {
            id: self.id,
            title: self.title.clone(),
            category: self.category.clone(),
            tags: self.tags.clone(),
            description: self.description.clone(),
        }
    }
}

/// Public projection of a detail served by the library endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DetailSummary {
    pub id: DetailId,
    pub title: String,
    pub category: String,
    pub tags: String,
    pub description: String,
}

impl DetailSummary {
    #[must_use]
    pub fn tag_list(&self) -> Vec<String> {
        split_tags(&self.tags)
    }
}

#[must_use]
pub fn split_tags(tags: &str) -> Vec<String> {
    tags.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Visibility predicate over the detail catalog for one requester.
///
/// This is the reference form of the access rules; the storage layer keeps
/// an equivalent set of declarative policies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "visibility", rename_all = "snake_case")]
pub enum AccessDecision {
    All,
    StandardAndOwned { owner: UserId },
    StandardOnly,
    Nothing,
}

impl AccessDecision {
    #[must_use]
    pub fn for_role(role: &Role, requester: UserId) -> Self {
        match role {
            Role::Admin => Self::All,
            Role::Architect => Self::StandardAndOwned { owner: requester },
            Role::Intern => Self::StandardOnly,
            Role::Unrecognized(_) => Self::Nothing,
        }
    }

    #[must_use]
    pub fn for_user(user: &User) -> Self {
        Self::for_role(&user.role, user.id)
    }

    /// Library visitors without an identity get the shared standard tier.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::StandardOnly
    }

    #[must_use]
    pub fn permits(&self, detail: &Detail) -> bool {
        match self {
            Self::All => true,
            Self::StandardAndOwned { owner } => match detail.source {
                DetailSource::Standard => true,
                DetailSource::UserProject => detail.user_id == Some(*owner),
                DetailSource::Other(_) => false,
            },
            Self::StandardOnly => detail.source == DetailSource::Standard,
            Self::Nothing => false,
        }
    }

    /// Filter `details` down to the visible rows, ordered by id.
    #[must_use]
    pub fn apply<'a, I>(&self, details: I) -> Vec<Detail>
    where
        I: IntoIterator<Item = &'a Detail>,
    {
        let mut visible = details
            .into_iter()
            .filter(|detail| self.permits(detail))
            .cloned()
            .collect::<Vec<_>>();
        visible.sort_by_key(|detail| detail.id);
        visible
    }
}

/// Lookup of users by their asserted email.
pub trait UserDirectory {
    /// Find the user whose email matches exactly.
    ///
    /// # Errors
    /// Returns [`PiaxisError::Storage`] when the directory cannot be read.
    fn find_user_by_email(&self, email: &str) -> Result<Option<User>, PiaxisError>;
}

/// Reject an absent or blank identity assertion.
///
/// # Errors
/// Returns [`PiaxisError::MissingIdentity`] when no usable email was supplied.
pub fn identity_assertion(raw: Option<&str>) -> Result<&str, PiaxisError> {
    match raw {
        Some(email) if !email.trim().is_empty() => Ok(email),
        _ => Err(PiaxisError::MissingIdentity),
    }
}

/// Resolve an asserted email to a provisioned user.
///
/// # Errors
/// Returns [`PiaxisError::MissingIdentity`] for a blank assertion,
/// [`PiaxisError::UnknownIdentity`] when no user matches, and propagates
/// directory failures.
pub fn resolve_identity<D>(directory: &D, assertion: Option<&str>) -> Result<User, PiaxisError>
where
    D: UserDirectory + ?Sized,
{
    let email = identity_assertion(assertion)?;
    directory
        .find_user_by_email(email)?
        .ok_or_else(|| PiaxisError::UnknownIdentity(email.to_string()))
}

/// Require a non-empty library search text.
///
/// # Errors
/// Returns [`PiaxisError::Validation`] when `q` is absent or empty.
pub fn require_search_text(q: Option<&str>) -> Result<&str, PiaxisError> {
    match q {
        Some(text) if !text.is_empty() => Ok(text),
        _ => Err(PiaxisError::Validation(SEARCH_REQUIRED_MESSAGE.to_string())),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SuggestionContext {
    pub host_element: String,
    pub adjacent_element: String,
    pub exposure: String,
}

impl SuggestionContext {
    /// Build a context from optional request fields.
    ///
    /// # Errors
    /// Returns [`PiaxisError::Validation`] when any field is absent or empty.
    pub fn new(
        host_element: Option<String>,
        adjacent_element: Option<String>,
        exposure: Option<String>,
    ) -> Result<Self, PiaxisError> {
        match (non_empty(host_element), non_empty(adjacent_element), non_empty(exposure)) {
            (Some(host_element), Some(adjacent_element), Some(exposure)) => {
                Ok(Self { host_element, adjacent_element, exposure })
            }
            _ => Err(PiaxisError::Validation(SUGGEST_REQUIRED_MESSAGE.to_string())),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.is_empty())
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UsageRule {
    pub id: i64,
    pub detail_id: DetailId,
    pub host_element: String,
    pub adjacent_element: String,
    pub exposure: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Suggestion {
    pub detail: Option<DetailSummary>,
    pub explanation: String,
}

impl Suggestion {
    /// Explanation echoes the stored rule values, not the caller's spelling.
    #[must_use]
    pub fn matched(detail: DetailSummary, rule: &UsageRule) -> Self {
        Self {
            detail: Some(detail),
            explanation: format!(
                "Matched based on host_element='{}', adjacent_element='{}', exposure='{}'.",
                rule.host_element, rule.adjacent_element, rule.exposure
            ),
        }
    }

    #[must_use]
    pub fn no_match() -> Self {
        Self { detail: None, explanation: NO_MATCH_EXPLANATION.to_string() }
    }
}
