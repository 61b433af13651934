use std::path::PathBuf;

use piaxis_core::{
    identity_assertion, require_search_text, Detail, DetailId, DetailSummary, PiaxisError,
    Suggestion, SuggestionContext, User,
};
use piaxis_store_sqlite::{
    AccessFixPlan, AccessFixReport, AccessStatus, SchemaStatus, SeedSummary, SqliteStore,
};
use serde::{Deserialize, Serialize};

pub const API_CONTRACT_VERSION: &str = "api.v1";
pub const UNAVAILABLE_TITLE: &str = "System Unavailable";
pub const UNAVAILABLE_MESSAGE: &str =
    "We are currently facing an issue establishing a connection to the archive. Please check back later.";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Suggestion form fields; all three are required but may arrive absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SuggestRequest {
    #[serde(default)]
    pub host_element: Option<String>,
    #[serde(default)]
    pub adjacent_element: Option<String>,
    #[serde(default)]
    pub exposure: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecureDetailsResponse {
    pub as_user: User,
    pub rows: Vec<Detail>,
}

/// One library card: the public detail fields with the tags split out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LibraryCard {
    pub id: DetailId,
    pub title: String,
    pub category: String,
    pub description: String,
    pub tags: Vec<String>,
}

impl From<DetailSummary> for LibraryCard {
    fn from(summary: DetailSummary) -> Self {
        let tags = summary.tag_list();
        Self {
            id: summary.id,
            title: summary.title,
            category: summary.category,
            description: summary.description,
            tags,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LibraryPage {
    Available { query: Option<String>, details: Vec<LibraryCard> },
    Unavailable { title: String, message: String },
}

#[derive(Debug, Clone)]
pub struct PiaxisApi {
    db_path: PathBuf,
}

impl PiaxisApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore, PiaxisError> {
        SqliteStore::open(&self.db_path).map_err(storage_error)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore, PiaxisError> {
        let mut store = self.open_store()?;
        store.migrate().map_err(storage_error)?;
        Ok(store)
    }

    /// Inspect schema status without applying migrations.
    ///
    /// # Errors
    /// Returns [`PiaxisError::Storage`] when the database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus, PiaxisError> {
        self.open_store()?.schema_status().map_err(storage_error)
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns [`PiaxisError::Storage`] when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult, PiaxisError> {
        let mut store = self.open_store()?;
        let before = store.schema_status().map_err(storage_error)?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate().map_err(storage_error)?;
        let after = store.schema_status().map_err(storage_error)?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Load the demo catalog.
    ///
    /// # Errors
    /// Returns [`PiaxisError::Storage`] when seeding fails.
    pub fn seed_demo(&self) -> Result<SeedSummary, PiaxisError> {
        self.open_migrated_store()?.seed_demo().map_err(storage_error)
    }

    /// # Errors
    /// Returns [`PiaxisError::Storage`] when the users table cannot be read.
    pub fn list_users(&self) -> Result<Vec<User>, PiaxisError> {
        self.open_migrated_store()?.list_users().map_err(storage_error)
    }

    /// Public library listing ordered by id.
    ///
    /// # Errors
    /// Returns [`PiaxisError::Storage`] when the catalog cannot be read.
    pub fn list_details(&self) -> Result<Vec<DetailSummary>, PiaxisError> {
        self.open_migrated_store()?.list_details().map_err(storage_error)
    }

    /// Case-insensitive library search.
    ///
    /// # Errors
    /// Returns [`PiaxisError::Validation`] when `q` is absent or empty, and
    /// [`PiaxisError::Storage`] when the catalog cannot be read.
    pub fn search_details(&self, q: Option<&str>) -> Result<Vec<DetailSummary>, PiaxisError> {
        let text = require_search_text(q)?;
        self.open_migrated_store()?.search_details(text).map_err(storage_error)
    }

    /// Match a construction context against the usage rules.
    ///
    /// # Errors
    /// Returns [`PiaxisError::Validation`] when any field is absent or empty,
    /// and [`PiaxisError::Storage`] when the rules cannot be read.
    pub fn suggest(&self, request: SuggestRequest) -> Result<Suggestion, PiaxisError> {
        let context =
            SuggestionContext::new(request.host_element, request.adjacent_element, request.exposure)?;
        self.open_migrated_store()?.suggest(&context).map_err(storage_error)
    }

    /// Details visible to the asserted identity.
    ///
    /// # Errors
    /// Returns [`PiaxisError::MissingIdentity`] for a blank assertion,
    /// [`PiaxisError::UnknownIdentity`] when no user matches, and
    /// [`PiaxisError::Storage`] when the catalog cannot be read.
    pub fn secure_details(
        &self,
        email: Option<&str>,
    ) -> Result<SecureDetailsResponse, PiaxisError> {
        let email = identity_assertion(email)?;
        let read = self.open_migrated_store()?.secure_read(Some(email)).map_err(storage_error)?;
        Ok(SecureDetailsResponse { as_user: read.user, rows: read.rows })
    }

    /// Run the administrative access fix as one transaction.
    ///
    /// # Errors
    /// Returns [`PiaxisError::Transaction`] when any step fails and the fix
    /// was rolled back.
    pub fn fix_access(&self, intern_email: Option<&str>) -> Result<AccessFixReport, PiaxisError> {
        let plan = match intern_email {
            Some(email) if !email.trim().is_empty() => {
                AccessFixPlan { intern_email: email.to_string() }
            }
            _ => AccessFixPlan::default(),
        };
        let mut store = self.open_migrated_store()?;
        let report = store.apply_access_fix(&plan).map_err(transaction_error)?;
        tracing::info!(
            intern_email = %report.intern_email,
            reassigned_users = report.reassigned_users,
            "access fix committed"
        );
        Ok(report)
    }

    /// # Errors
    /// Returns [`PiaxisError::Storage`] when catalog metadata cannot be read.
    pub fn access_status(&self) -> Result<AccessStatus, PiaxisError> {
        self.open_migrated_store()?.access_status().map_err(storage_error)
    }

    /// Library page state: the listing (or search results for a non-empty
    /// `q`), or the unavailable state when the catalog cannot be read.
    #[must_use]
    pub fn library(&self, q: Option<&str>) -> LibraryPage {
        let query = q.filter(|text| !text.is_empty()).map(ToString::to_string);
        let details = match query.as_deref() {
            Some(text) => self.search_details(Some(text)),
            None => self.list_details(),
        };

        match details {
            Ok(details) => LibraryPage::Available {
                query,
                details: details.into_iter().map(LibraryCard::from).collect(),
            },
            Err(err) => {
                tracing::warn!(error = %err, "library catalog unavailable");
                LibraryPage::Unavailable {
                    title: UNAVAILABLE_TITLE.to_string(),
                    message: UNAVAILABLE_MESSAGE.to_string(),
                }
            }
        }
    }
}

fn storage_error(err: anyhow::Error) -> PiaxisError {
    match err.downcast_ref::<PiaxisError>() {
        Some(typed) => typed.clone(),
        None => PiaxisError::Storage(format!("{err:#}")),
    }
}

fn transaction_error(err: anyhow::Error) -> PiaxisError {
    match err.downcast_ref::<PiaxisError>() {
        Some(typed) => typed.clone(),
        None => PiaxisError::Transaction(format!("{err:#}")),
    }
}
