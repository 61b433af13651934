use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use piaxis_core::{
    resolve_identity, AccessDecision, Detail, DetailId, DetailSource, DetailSummary, PiaxisError,
    Role, Suggestion, SuggestionContext, UsageRule, User, UserDirectory, UserId,
};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::Value;
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod seed;

pub use seed::SeedSummary;

const LATEST_SCHEMA_VERSION: i64 = 2;

pub const DETAILS_TABLE: &str = "details";
pub const SECURED_VIEW: &str = "details_secured";
pub const ROLE_CONSTRAINT: &str = "users_role_check";
pub const DEFAULT_INTERN_EMAIL: &str = "bob@example.com";

/// Anonymous library sessions carry no email and see the standard tier.
const PUBLIC_POLICY: &str = "public_access";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS users (
  id INTEGER PRIMARY KEY,
  email TEXT NOT NULL UNIQUE,
  role TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS details (
  id INTEGER PRIMARY KEY,
  title TEXT NOT NULL,
  category TEXT NOT NULL,
  tags TEXT NOT NULL DEFAULT '',
  description TEXT NOT NULL DEFAULT '',
  source TEXT NOT NULL DEFAULT 'standard',
  user_id INTEGER,
  CHECK (source <> 'user_project' OR user_id IS NOT NULL),
  FOREIGN KEY (user_id) REFERENCES users(id)
);

CREATE TABLE IF NOT EXISTS detail_usage_rules (
  id INTEGER PRIMARY KEY,
  detail_id INTEGER NOT NULL,
  host_element TEXT NOT NULL,
  adjacent_element TEXT NOT NULL,
  exposure TEXT NOT NULL,
  FOREIGN KEY (detail_id) REFERENCES details(id)
);

CREATE INDEX IF NOT EXISTS idx_details_source_owner ON details(source, user_id);
CREATE INDEX IF NOT EXISTS idx_usage_rules_detail ON detail_usage_rules(detail_id);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS row_security (
  table_name TEXT PRIMARY KEY,
  enabled INTEGER NOT NULL DEFAULT 0 CHECK (enabled IN (0, 1)),
  forced INTEGER NOT NULL DEFAULT 0 CHECK (forced IN (0, 1))
);

CREATE TABLE IF NOT EXISTS row_policies (
  table_name TEXT NOT NULL,
  policy_name TEXT NOT NULL,
  command TEXT NOT NULL CHECK (command IN ('select')),
  using_expr TEXT NOT NULL,
  created_at TEXT NOT NULL,
  PRIMARY KEY (table_name, policy_name)
);

CREATE TABLE IF NOT EXISTS schema_constraints (
  constraint_name TEXT PRIMARY KEY,
  table_name TEXT NOT NULL,
  definition_json TEXT NOT NULL
);

INSERT OR IGNORE INTO row_security(table_name, enabled, forced) VALUES ('details', 1, 0);
";

const ADMIN_POLICY_SQL: &str = "EXISTS (
    SELECT 1 FROM users u
    WHERE u.email = current_user_email()
      AND u.role = 'admin'
  )";

const ARCHITECT_POLICY_SQL: &str = "EXISTS (
    SELECT 1 FROM users u
    WHERE u.email = current_user_email()
      AND u.role = 'architect'
      AND (details.source = 'standard'
           OR (details.source = 'user_project' AND details.user_id = u.id))
  )";

const INTERN_POLICY_SQL: &str = "EXISTS (
    SELECT 1 FROM users u
    WHERE u.email = current_user_email()
      AND u.role = 'intern'
      AND details.source = 'standard'
  )";

const PUBLIC_POLICY_SQL: &str = "current_user_email() IS NULL AND details.source = 'standard'";

/// Declarative `USING` expression installed for `role`, if any.
#[must_use]
pub fn policy_expression(role: &Role) -> Option<&'static str> {
    match role {
        Role::Admin => Some(ADMIN_POLICY_SQL),
        Role::Architect => Some(ARCHITECT_POLICY_SQL),
        Role::Intern => Some(INTERN_POLICY_SQL),
        Role::Unrecognized(_) => None,
    }
}

type SessionIdentity = Arc<Mutex<Option<String>>>;

pub struct SqliteStore {
    conn: Connection,
    session: SessionIdentity,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// Whether the reading connection owns the catalog. Owners bypass row
/// security unless it is forced.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionPrivilege {
    CatalogOwner,
    Member,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RowSecurity {
    pub table_name: String,
    pub enabled: bool,
    pub forced: bool,
}

impl RowSecurity {
    #[must_use]
    pub fn applies_to(&self, privilege: SessionPrivilege) -> bool {
        self.enabled && (self.forced || privilege == SessionPrivilege::Member)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RowPolicy {
    pub table_name: String,
    pub policy_name: String,
    pub command: String,
    pub using_expr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessStatus {
    pub row_security: RowSecurity,
    pub policies: Vec<RowPolicy>,
    pub allowed_roles: Option<Vec<Role>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessFixPlan {
    pub intern_email: String,
}

impl Default for AccessFixPlan {
    fn default() -> Self {
        Self { intern_email: DEFAULT_INTERN_EMAIL.to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessFixReport {
    pub applied_at: String,
    pub steps: Vec<String>,
    pub row_security: RowSecurity,
    pub allowed_roles: Vec<Role>,
    pub intern_email: String,
    pub reassigned_users: usize,
    pub policies: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecureRead {
    pub user: User,
    pub decision: AccessDecision,
    pub rows: Vec<Detail>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Relation {
    Catalog,
    Secured,
}

impl Relation {
    fn as_str(self) -> &'static str {
        match self {
            Self::Catalog => DETAILS_TABLE,
            Self::Secured => SECURED_VIEW,
        }
    }
}

impl SqliteStore {
    /// Open the catalog database, configure pragmas, and register the
    /// session identity function used by row policies.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or configured.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA trusted_schema = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        let session: SessionIdentity = Arc::new(Mutex::new(None));
        register_session_function(&conn, Arc::clone(&session))?;
        register_casefold_function(&conn)?;

        Ok(Self { conn, session })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        if current_schema_version(&self.conn)? < 1 {
            self.apply_migration(1, apply_migration_1)?;
        }
        if current_schema_version(&self.conn)? < 2 {
            self.apply_migration(2, apply_migration_2)?;
        }

        let version = current_schema_version(&self.conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration(
        &mut self,
        version: i64,
        apply: fn(&Connection) -> Result<()>,
    ) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .with_context(|| format!("failed to start migration v{version} transaction"))?;

        // Another connection may have migrated while this one waited for the lock.
        if current_schema_version(&tx)? >= version {
            return Ok(());
        }

        apply(&tx)?;
        record_schema_version(&tx, version)?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        tracing::info!(version, "applied catalog migration");
        Ok(())
    }

    /// Insert one user; the active role constraint applies.
    ///
    /// # Errors
    /// Returns an error when the email is blank, already taken, or the role
    /// is rejected by the role constraint.
    pub fn insert_user(&mut self, email: &str, role: &Role) -> Result<User> {
        if email.trim().is_empty() {
            return Err(anyhow!("email MUST be provided for every user"));
        }
        self.conn
            .execute("INSERT INTO users(email, role) VALUES (?1, ?2)", params![email, role.as_str()])
            .with_context(|| format!("failed to insert user {email}"))?;

        Ok(User { id: UserId(self.conn.last_insert_rowid()), email: email.to_string(), role: role.clone() })
    }

    /// Look up a user by exact, case-sensitive email.
    ///
    /// # Errors
    /// Returns an error when the users table cannot be queried.
    pub fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        find_user(&self.conn, email)
    }

    /// List every user ordered by id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_users(&self) -> Result<Vec<User>> {
        let mut stmt = self.conn.prepare("SELECT id, email, role FROM users ORDER BY id ASC")?;
        let rows = stmt.query_map([], user_from_row)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    /// Persist one validated detail record.
    ///
    /// # Errors
    /// Returns an error when validation or the insert fails.
    pub fn insert_detail(&mut self, detail: &Detail) -> Result<()> {
        detail.validate().map_err(|err| anyhow!("detail validation failed: {err}"))?;
        self.conn
            .execute(
                "INSERT INTO details(id, title, category, tags, description, source, user_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    detail.id.0,
                    detail.title,
                    detail.category,
                    detail.tags,
                    detail.description,
                    detail.source.as_str(),
                    detail.user_id.map(|id| id.0),
                ],
            )
            .with_context(|| format!("failed to insert detail {}", detail.id))?;
        Ok(())
    }

    /// Persist one suggestion rule pointing at an existing detail.
    ///
    /// # Errors
    /// Returns an error when the referenced detail does not exist or the
    /// insert fails.
    pub fn insert_usage_rule(
        &mut self,
        detail_id: DetailId,
        context: &SuggestionContext,
    ) -> Result<UsageRule> {
        self.conn
            .execute(
                "INSERT INTO detail_usage_rules(detail_id, host_element, adjacent_element, exposure)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    detail_id.0,
                    context.host_element,
                    context.adjacent_element,
                    context.exposure
                ],
            )
            .with_context(|| format!("failed to insert usage rule for detail {detail_id}"))?;

        Ok(UsageRule {
            id: self.conn.last_insert_rowid(),
            detail_id,
            host_element: context.host_element.clone(),
            adjacent_element: context.adjacent_element.clone(),
            exposure: context.exposure.clone(),
        })
    }

    /// Public library listing, read as an anonymous session.
    ///
    /// # Errors
    /// Returns an error when the catalog cannot be read.
    pub fn list_details(&mut self) -> Result<Vec<DetailSummary>> {
        self.read_public(None)
    }

    /// Case-insensitive literal substring search over title, tags, and
    /// description, read as an anonymous session.
    ///
    /// # Errors
    /// Returns an error when the catalog cannot be read.
    pub fn search_details(&mut self, text: &str) -> Result<Vec<DetailSummary>> {
        self.read_public(Some(text))
    }

    fn read_public(&mut self, search: Option<&str>) -> Result<Vec<DetailSummary>> {
        let tx = self.conn.transaction().context("failed to start read transaction")?;
        let relation = secured_relation(&tx, SessionPrivilege::Member)?;
        let details = query_visible(&tx, relation, &AccessDecision::anonymous(), search)?;
        tx.commit().context("failed to finish read transaction")?;
        Ok(details.iter().map(Detail::summary).collect())
    }

    /// Find the first rule (lowest id) whose three context fields match
    /// case-insensitively and whose detail is publicly visible.
    ///
    /// # Errors
    /// Returns an error when the rules or catalog cannot be read.
    pub fn suggest(&mut self, context: &SuggestionContext) -> Result<Suggestion> {
        let tx = self.conn.transaction().context("failed to start read transaction")?;
        let relation = secured_relation(&tx, SessionPrivilege::Member)?;
        let filter = application_filter(&AccessDecision::anonymous(), "d", 4);

        let sql = format!(
            "SELECT d.id, d.title, d.category, d.tags, d.description,
                    r.id, r.host_element, r.adjacent_element, r.exposure
             FROM detail_usage_rules r
             JOIN {} d ON d.id = r.detail_id
             WHERE casefold(r.host_element) = casefold(?1)
               AND casefold(r.adjacent_element) = casefold(?2)
               AND casefold(r.exposure) = casefold(?3)
               AND {}
             ORDER BY r.id ASC
             LIMIT 1",
            relation.as_str(),
            filter.clause
        );

        let mut values = vec![
            Value::Text(context.host_element.clone()),
            Value::Text(context.adjacent_element.clone()),
            Value::Text(context.exposure.clone()),
        ];
        values.extend(filter.params);

        let matched = tx
            .query_row(&sql, params_from_iter(values.iter()), |row| {
                let summary = DetailSummary {
                    id: DetailId(row.get(0)?),
                    title: row.get(1)?,
                    category: row.get(2)?,
                    tags: row.get(3)?,
                    description: row.get(4)?,
                };
                let rule = UsageRule {
                    id: row.get(5)?,
                    detail_id: summary.id,
                    host_element: row.get(6)?,
                    adjacent_element: row.get(7)?,
                    exposure: row.get(8)?,
                };
                Ok((summary, rule))
            })
            .optional()
            .context("failed to query usage rules")?;
        tx.commit().context("failed to finish read transaction")?;

        Ok(match matched {
            Some((summary, rule)) => Suggestion::matched(summary, &rule),
            None => Suggestion::no_match(),
        })
    }

    /// Application-layer filter only: `decision` evaluated against the base
    /// catalog, bypassing row policies.
    ///
    /// # Errors
    /// Returns an error when the catalog cannot be read.
    pub fn filter_details(&mut self, decision: &AccessDecision) -> Result<Vec<Detail>> {
        let tx = self.conn.transaction().context("failed to start read transaction")?;
        let details = query_visible(&tx, Relation::Catalog, decision, None)?;
        tx.commit().context("failed to finish read transaction")?;
        Ok(details)
    }

    /// Declarative policies only: every detail the row policies let the
    /// session identified by `email` read, without any application filter.
    ///
    /// # Errors
    /// Returns an error when the session cannot be established or the
    /// catalog cannot be read.
    pub fn policy_details(
        &mut self,
        email: Option<&str>,
        privilege: SessionPrivilege,
    ) -> Result<Vec<Detail>> {
        let _scope = SessionScope::enter(&self.session, email)?;
        let tx = self.conn.transaction().context("failed to start read transaction")?;
        let relation = secured_relation(&tx, privilege)?;
        let details = query_visible(&tx, relation, &AccessDecision::All, None)?;
        tx.commit().context("failed to finish read transaction")?;
        Ok(details)
    }

    /// Resolve the asserted identity and read its visible details in one
    /// snapshot, applying the application filter on top of row policies.
    ///
    /// The read runs as the catalog owner, so row policies only take part
    /// once row security is forced.
    ///
    /// # Errors
    /// Returns [`PiaxisError::MissingIdentity`] or
    /// [`PiaxisError::UnknownIdentity`] (wrapped) for identity failures, and
    /// storage errors otherwise.
    pub fn secure_read(&mut self, assertion: Option<&str>) -> Result<SecureRead> {
        let tx = self.conn.transaction().context("failed to start secure read transaction")?;
        let user = resolve_identity(&ConnectionDirectory { conn: &tx }, assertion)?;
        let decision = AccessDecision::for_user(&user);

        let _scope = SessionScope::enter(&self.session, Some(user.email.as_str()))?;
        let relation = secured_relation(&tx, SessionPrivilege::CatalogOwner)?;
        let rows = query_visible(&tx, relation, &decision, None)?;
        tx.commit().context("failed to finish secure read transaction")?;

        tracing::debug!(
            email = %user.email,
            role = %user.role,
            relation = relation.as_str(),
            rows = rows.len(),
            "secure detail read"
        );
        Ok(SecureRead { user, decision, rows })
    }

    /// Current row-security settings, policies, and role constraint.
    ///
    /// # Errors
    /// Returns an error when catalog metadata cannot be read.
    pub fn access_status(&self) -> Result<AccessStatus> {
        Ok(AccessStatus {
            row_security: load_row_security(&self.conn, DETAILS_TABLE)?,
            policies: load_policies(&self.conn, DETAILS_TABLE)?,
            allowed_roles: load_role_constraint(&self.conn)?,
        })
    }

    /// Force row security, widen the role constraint to include `intern`,
    /// demote the planned user, and install the intern policy, all in one
    /// transaction. Safe to re-run.
    ///
    /// # Errors
    /// Returns an error naming the failed step; nothing is persisted then.
    pub fn apply_access_fix(&mut self, plan: &AccessFixPlan) -> Result<AccessFixReport> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start access fix transaction")?;
        let mut steps = Vec::new();

        set_row_security(&tx, DETAILS_TABLE, true, true)
            .context("access fix step 1 (force row security) failed")?;
        steps.push("forced row security on details".to_string());
        tracing::info!("access fix: forced row security on details");

        let allowed_roles = Role::known().to_vec();
        drop_role_constraint(&tx)
            .and_then(|()| add_role_constraint(&tx, &allowed_roles))
            .context("access fix step 2 (replace role constraint) failed")?;
        steps.push(format!("replaced {ROLE_CONSTRAINT} with admin, architect, intern"));
        tracing::info!("access fix: replaced {ROLE_CONSTRAINT}");

        let reassigned_users = tx
            .execute(
                "UPDATE users SET role = ?1 WHERE email = ?2",
                params![Role::Intern.as_str(), plan.intern_email],
            )
            .context("access fix step 3 (reassign intern) failed")?;
        steps.push(format!("reassigned {reassigned_users} user(s) to intern"));
        tracing::info!(email = %plan.intern_email, reassigned_users, "access fix: reassigned intern");

        install_role_policy(&tx, &Role::Intern)
            .context("access fix step 4 (install intern policy) failed")?;
        steps.push("installed intern_access policy".to_string());
        tracing::info!("access fix: installed intern_access policy");

        let row_security = load_row_security(&tx, DETAILS_TABLE)?;
        let policies = load_policies(&tx, DETAILS_TABLE)?
            .into_iter()
            .map(|policy| policy.policy_name)
            .collect::<Vec<_>>();
        tx.commit().context("failed to commit access fix")?;

        Ok(AccessFixReport {
            applied_at: now_rfc3339()?,
            steps,
            row_security,
            allowed_roles,
            intern_email: plan.intern_email.clone(),
            reassigned_users,
            policies,
        })
    }

    /// Load the demo accounts, details, and usage rules. Existing rows are
    /// left untouched.
    ///
    /// # Errors
    /// Returns an error when any insert fails; nothing is persisted then.
    pub fn seed_demo(&mut self) -> Result<SeedSummary> {
        let tx = self.conn.transaction().context("failed to start seed transaction")?;
        let summary = seed::apply(&tx)?;
        tx.commit().context("failed to commit seed transaction")?;
        tracing::info!(?summary, "seeded demo catalog");
        Ok(summary)
    }
}

struct SessionScope<'a> {
    identity: &'a Mutex<Option<String>>,
}

impl<'a> SessionScope<'a> {
    fn enter(identity: &'a Mutex<Option<String>>, email: Option<&str>) -> Result<Self> {
        let mut slot = identity.lock().map_err(|_| anyhow!("session identity lock poisoned"))?;
        *slot = email.map(ToString::to_string);
        Ok(Self { identity })
    }
}

impl Drop for SessionScope<'_> {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.identity.lock() {
            *slot = None;
        }
    }
}

fn register_session_function(conn: &Connection, session: SessionIdentity) -> Result<()> {
    conn.create_scalar_function("current_user_email", 0, FunctionFlags::SQLITE_UTF8, move |_| {
        let email = session.lock().map_err(|_| {
            rusqlite::Error::UserFunctionError("session identity lock poisoned".into())
        })?;
        Ok(email.clone())
    })
    .context("failed to register current_user_email()")
}

/// `casefold(text)`: Unicode lowercase, so matching ignores case beyond ASCII.
fn register_casefold_function(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        "casefold",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let text: Option<String> = ctx.get(0)?;
            Ok(text.map(|text| text.to_lowercase()))
        },
    )
    .context("failed to register casefold()")
}

struct ConnectionDirectory<'a> {
    conn: &'a Connection,
}

impl UserDirectory for ConnectionDirectory<'_> {
    fn find_user_by_email(&self, email: &str) -> Result<Option<User>, PiaxisError> {
        find_user(self.conn, email).map_err(|err| PiaxisError::Storage(format!("{err:#}")))
    }
}

struct FilterSql {
    clause: String,
    params: Vec<Value>,
}

/// Per-request `WHERE` clause equivalent to [`AccessDecision::permits`].
/// Placeholders are numbered from `first_param`.
fn application_filter(decision: &AccessDecision, alias: &str, first_param: usize) -> FilterSql {
    let n = first_param;
    match decision {
        AccessDecision::All => FilterSql { clause: "1 = 1".to_string(), params: Vec::new() },
        AccessDecision::StandardAndOwned { owner } => FilterSql {
            clause: format!(
                "({alias}.source = ?{n} OR ({alias}.source = ?{} AND {alias}.user_id = ?{}))",
                n + 1,
                n + 2
            ),
            params: vec![
                Value::Text(DetailSource::Standard.as_str().to_string()),
                Value::Text(DetailSource::UserProject.as_str().to_string()),
                Value::Integer(owner.0),
            ],
        },
        AccessDecision::StandardOnly => FilterSql {
            clause: format!("{alias}.source = ?{n}"),
            params: vec![Value::Text(DetailSource::Standard.as_str().to_string())],
        },
        AccessDecision::Nothing => FilterSql { clause: "1 = 0".to_string(), params: Vec::new() },
    }
}

fn secured_relation(conn: &Connection, privilege: SessionPrivilege) -> Result<Relation> {
    let security = load_row_security(conn, DETAILS_TABLE)?;
    Ok(if security.applies_to(privilege) { Relation::Secured } else { Relation::Catalog })
}

fn query_visible(
    conn: &Connection,
    relation: Relation,
    decision: &AccessDecision,
    search: Option<&str>,
) -> Result<Vec<Detail>> {
    let filter = application_filter(decision, "d", 1);
    let mut values = filter.params;
    let mut sql = format!(
        "SELECT d.id, d.title, d.category, d.tags, d.description, d.source, d.user_id
         FROM {} d
         WHERE {}",
        relation.as_str(),
        filter.clause
    );

    if let Some(text) = search {
        let n = values.len() + 1;
        sql.push_str(&format!(
            " AND (instr(casefold(d.title), casefold(?{n})) > 0
                   OR instr(casefold(d.tags), casefold(?{n})) > 0
                   OR instr(casefold(d.description), casefold(?{n})) > 0)"
        ));
        values.push(Value::Text(text.to_string()));
    }
    sql.push_str(" ORDER BY d.id ASC");

    let mut stmt = conn
        .prepare(&sql)
        .with_context(|| format!("failed to prepare detail query on {}", relation.as_str()))?;
    let rows = stmt.query_map(params_from_iter(values.iter()), detail_from_row)?;

    let mut details = Vec::new();
    for row in rows {
        details.push(row?);
    }
    Ok(details)
}

fn detail_from_row(row: &Row<'_>) -> rusqlite::Result<Detail> {
    Ok(Detail {
        id: DetailId(row.get(0)?),
        title: row.get(1)?,
        category: row.get(2)?,
        tags: row.get(3)?,
        description: row.get(4)?,
        source: DetailSource::from(row.get::<_, String>(5)?),
        user_id: row.get::<_, Option<i64>>(6)?.map(UserId),
    })
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User { id: UserId(row.get(0)?), email: row.get(1)?, role: Role::from(row.get::<_, String>(2)?) })
}

fn find_user(conn: &Connection, email: &str) -> Result<Option<User>> {
    conn.query_row("SELECT id, email, role FROM users WHERE email = ?1", params![email], user_from_row)
        .optional()
        .with_context(|| format!("failed to look up user {email}"))
}

fn apply_migration_1(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")
}

fn apply_migration_2(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_002_SQL).context("failed to apply migration v2")?;

    drop_role_constraint(conn)?;
    add_role_constraint(conn, &[Role::Admin, Role::Architect])?;

    drop_policy_if_exists(conn, DETAILS_TABLE, PUBLIC_POLICY)?;
    create_policy(conn, DETAILS_TABLE, PUBLIC_POLICY, PUBLIC_POLICY_SQL)?;
    install_role_policy(conn, &Role::Admin)?;
    install_role_policy(conn, &Role::Architect)
}

fn set_row_security(conn: &Connection, table_name: &str, enabled: bool, forced: bool) -> Result<()> {
    conn.execute(
        "INSERT INTO row_security(table_name, enabled, forced) VALUES (?1, ?2, ?3)
         ON CONFLICT(table_name) DO UPDATE SET enabled = excluded.enabled, forced = excluded.forced",
        params![table_name, enabled, forced],
    )
    .with_context(|| format!("failed to update row security for {table_name}"))?;
    Ok(())
}

fn load_row_security(conn: &Connection, table_name: &str) -> Result<RowSecurity> {
    let settings = conn
        .query_row(
            "SELECT enabled, forced FROM row_security WHERE table_name = ?1",
            params![table_name],
            |row| Ok((row.get::<_, bool>(0)?, row.get::<_, bool>(1)?)),
        )
        .optional()
        .with_context(|| format!("failed to read row security for {table_name}"))?;

    let (enabled, forced) = settings.unwrap_or((false, false));
    Ok(RowSecurity { table_name: table_name.to_string(), enabled, forced })
}

/// Drop-if-exists then create the policy for `role` and regenerate the
/// secured view.
fn install_role_policy(conn: &Connection, role: &Role) -> Result<()> {
    let (Some(name), Some(expr)) = (role.policy_name(), policy_expression(role)) else {
        return Err(anyhow!("no row policy is defined for role {role}"));
    };
    drop_policy_if_exists(conn, DETAILS_TABLE, name)?;
    create_policy(conn, DETAILS_TABLE, name, expr)
}

fn drop_policy_if_exists(conn: &Connection, table_name: &str, policy_name: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM row_policies WHERE table_name = ?1 AND policy_name = ?2",
        params![table_name, policy_name],
    )
    .with_context(|| format!("failed to drop policy {policy_name} on {table_name}"))?;
    rebuild_secured_view(conn)
}

fn create_policy(
    conn: &Connection,
    table_name: &str,
    policy_name: &str,
    using_expr: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO row_policies(table_name, policy_name, command, using_expr, created_at)
         VALUES (?1, ?2, 'select', ?3, ?4)",
        params![table_name, policy_name, using_expr, now_rfc3339()?],
    )
    .with_context(|| format!("policy {policy_name} on {table_name} could not be created"))?;
    rebuild_secured_view(conn)
}

fn load_policies(conn: &Connection, table_name: &str) -> Result<Vec<RowPolicy>> {
    let mut stmt = conn.prepare(
        "SELECT table_name, policy_name, command, using_expr
         FROM row_policies
         WHERE table_name = ?1
         ORDER BY policy_name ASC",
    )?;
    let rows = stmt.query_map(params![table_name], |row| {
        Ok(RowPolicy {
            table_name: row.get(0)?,
            policy_name: row.get(1)?,
            command: row.get(2)?,
            using_expr: row.get(3)?,
        })
    })?;

    let mut policies = Vec::new();
    for row in rows {
        policies.push(row?);
    }
    Ok(policies)
}

/// Permissive policies combine with OR; a table without policies exposes
/// no rows through the view.
fn rebuild_secured_view(conn: &Connection) -> Result<()> {
    let predicates = load_policies(conn, DETAILS_TABLE)?
        .into_iter()
        .map(|policy| format!("({})", policy.using_expr))
        .collect::<Vec<_>>();
    let predicate = if predicates.is_empty() { "0".to_string() } else { predicates.join("\n  OR ") };

    conn.execute_batch(&format!(
        "DROP VIEW IF EXISTS {SECURED_VIEW};
         CREATE VIEW {SECURED_VIEW} AS
         SELECT id, title, category, tags, description, source, user_id
         FROM {DETAILS_TABLE}
         WHERE {predicate};"
    ))
    .context("failed to rebuild secured details view")
}

fn drop_role_constraint(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!(
        "DROP TRIGGER IF EXISTS {ROLE_CONSTRAINT}_insert;
         DROP TRIGGER IF EXISTS {ROLE_CONSTRAINT}_update;"
    ))
    .with_context(|| format!("failed to drop {ROLE_CONSTRAINT} triggers"))?;
    conn.execute(
        "DELETE FROM schema_constraints WHERE constraint_name = ?1",
        params![ROLE_CONSTRAINT],
    )
    .with_context(|| format!("failed to drop {ROLE_CONSTRAINT}"))?;
    Ok(())
}

/// Add the role CHECK as a pair of triggers. Existing rows must already
/// satisfy it, and adding it twice is an error.
fn add_role_constraint(conn: &Connection, roles: &[Role]) -> Result<()> {
    if load_role_constraint(conn)?.is_some() {
        return Err(anyhow!("constraint {ROLE_CONSTRAINT} already exists"));
    }

    let allowed = roles.iter().map(|role| sql_literal(role.as_str())).collect::<Vec<_>>().join(", ");
    let violations: i64 = conn
        .query_row(&format!("SELECT COUNT(*) FROM users WHERE role NOT IN ({allowed})"), [], |row| {
            row.get(0)
        })
        .context("failed to validate existing user roles")?;
    if violations > 0 {
        return Err(anyhow!(
            "cannot add {ROLE_CONSTRAINT}: {violations} existing user(s) have a role outside ({allowed})"
        ));
    }

    conn.execute_batch(&format!(
        "CREATE TRIGGER {ROLE_CONSTRAINT}_insert BEFORE INSERT ON users
         WHEN NEW.role NOT IN ({allowed})
         BEGIN SELECT RAISE(ABORT, '{ROLE_CONSTRAINT} violated'); END;
         CREATE TRIGGER {ROLE_CONSTRAINT}_update BEFORE UPDATE OF role ON users
         WHEN NEW.role NOT IN ({allowed})
         BEGIN SELECT RAISE(ABORT, '{ROLE_CONSTRAINT} violated'); END;"
    ))
    .with_context(|| format!("failed to create {ROLE_CONSTRAINT} triggers"))?;

    let names = roles.iter().map(|role| role.as_str().to_string()).collect::<Vec<_>>();
    conn.execute(
        "INSERT INTO schema_constraints(constraint_name, table_name, definition_json)
         VALUES (?1, 'users', ?2)",
        params![
            ROLE_CONSTRAINT,
            serde_json::to_string(&names).context("failed to serialize role constraint")?
        ],
    )
    .with_context(|| format!("failed to record {ROLE_CONSTRAINT}"))?;
    Ok(())
}

fn load_role_constraint(conn: &Connection) -> Result<Option<Vec<Role>>> {
    let definition = conn
        .query_row(
            "SELECT definition_json FROM schema_constraints WHERE constraint_name = ?1",
            params![ROLE_CONSTRAINT],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .context("failed to read role constraint")?;

    match definition {
        Some(json) => {
            let names: Vec<String> =
                serde_json::from_str(&json).context("failed to deserialize role constraint")?;
            Ok(Some(names.into_iter().map(Role::from).collect()))
        }
        None => Ok(None),
    }
}

fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}


#[cfg(test)]
mod tests {
    use super::*;

    fn migrated_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn seeded_store() -> Result<SqliteStore> {
        let mut store = migrated_store()?;
        store.seed_demo()?;
        Ok(store)
    }

    fn detail_ids(details: &[Detail]) -> Vec<i64> {
        details.iter().map(|detail| detail.id.0).collect()
    }

    fn summary_ids(details: &[DetailSummary]) -> Vec<i64> {
        details.iter().map(|detail| detail.id.0).collect()
    }

    fn policy_names(store: &SqliteStore) -> Result<Vec<String>> {
        Ok(store.access_status()?.policies.into_iter().map(|policy| policy.policy_name).collect())
    }

    fn role_of(store: &SqliteStore, email: &str) -> Result<Option<Role>> {
        Ok(store.find_user_by_email(email)?.map(|user| user.role))
    }

    fn piaxis_error(err: &anyhow::Error) -> Option<&PiaxisError> {
        err.downcast_ref::<PiaxisError>()
    }

    fn insert_raw_user(store: &SqliteStore, id: i64, email: &str, role: &str) -> Result<()> {
        store.conn.execute(
            "INSERT INTO users(id, email, role) VALUES (?1, ?2, ?3)",
            params![id, email, role],
        )?;
        Ok(())
    }

    fn mk_detail(id: i64, source: DetailSource, owner: Option<i64>) -> Detail {
        Detail {
            id: DetailId(id),
            title: format!("Fixture detail {id}"),
            category: "Envelope".to_string(),
            tags: "fixture".to_string(),
            description: "fixture".to_string(),
            source,
            user_id: owner.map(UserId),
        }
    }

    // Test IDs: TSTORE-001
    #[test]
    fn migrate_reports_pending_versions_and_is_rerunnable() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1, 2]);

        store.migrate()?;
        store.migrate()?;

        let after = store.schema_status()?;
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());
        Ok(())
    }

    // Test IDs: TSTORE-002
    #[test]
    fn baseline_schema_enables_row_security_without_forcing() -> Result<()> {
        let store = migrated_store()?;
        let status = store.access_status()?;

        assert!(status.row_security.enabled);
        assert!(!status.row_security.forced);
        assert_eq!(status.allowed_roles, Some(vec![Role::Admin, Role::Architect]));
        assert_eq!(policy_names(&store)?, vec!["admin_access", "architect_access", "public_access"]);
        Ok(())
    }

    // Test IDs: TSTORE-003
    #[test]
    fn role_constraint_rejects_roles_outside_allowed_set() -> Result<()> {
        let mut store = migrated_store()?;
        assert!(store.insert_user("intern@example.com", &Role::Intern).is_err());
        assert!(store.insert_user("guest@example.com", &Role::parse("guest")).is_err());

        let architect = store.insert_user("arch@example.com", &Role::Architect)?;
        let update = store.conn.execute(
            "UPDATE users SET role = 'guest' WHERE id = ?1",
            params![architect.id.0],
        );
        assert!(update.is_err());
        assert_eq!(role_of(&store, "arch@example.com")?, Some(Role::Architect));
        Ok(())
    }

    // Test IDs: TSTORE-004
    #[test]
    fn storage_rejects_project_detail_without_owner() -> Result<()> {
        let store = migrated_store()?;
        let result = store.conn.execute(
            "INSERT INTO details(id, title, category, source) VALUES (1, 'Orphan', 'Roofing', 'user_project')",
            [],
        );
        assert!(result.is_err());
        Ok(())
    }

    // Test IDs: TSTORE-005
    #[test]
    fn seed_is_idempotent() -> Result<()> {
        let mut store = migrated_store()?;
        let first = store.seed_demo()?;
        assert_eq!(first.users_inserted, 4);
        assert_eq!(first.details_inserted, 7);
        assert_eq!(first.rules_inserted, 5);

        let second = store.seed_demo()?;
        assert_eq!(second, SeedSummary::default());
        assert_eq!(store.list_users()?.len(), 4);
        Ok(())
    }

    // Test IDs: TSTORE-006
    #[test]
    fn declarative_policies_agree_with_application_filter_for_every_user() -> Result<()> {
        let mut store = seeded_store()?;

        for stage in ["baseline", "after fix"] {
            for user in store.list_users()? {
                let decision = AccessDecision::for_user(&user);
                let declarative =
                    store.policy_details(Some(user.email.as_str()), SessionPrivilege::Member)?;
                let application = store.filter_details(&decision)?;
                assert_eq!(
                    detail_ids(&declarative),
                    detail_ids(&application),
                    "{stage}: {} ({})",
                    user.email,
                    user.role
                );
            }

            let anonymous = store.policy_details(None, SessionPrivilege::Member)?;
            let public = store.filter_details(&AccessDecision::anonymous())?;
            assert_eq!(detail_ids(&anonymous), detail_ids(&public), "{stage}: anonymous");

            store.apply_access_fix(&AccessFixPlan::default())?;
        }
        Ok(())
    }

    // Test IDs: TSTORE-007
    #[test]
    fn unrecognized_role_sees_nothing_through_either_path() -> Result<()> {
        let mut store = seeded_store()?;
        store.conn.execute_batch(&format!("DROP TRIGGER {ROLE_CONSTRAINT}_insert;"))?;
        insert_raw_user(&store, 50, "guest@example.com", "guest")?;

        let read = store.secure_read(Some("guest@example.com"))?;
        assert_eq!(read.user.role, Role::Unrecognized("guest".to_string()));
        assert_eq!(read.decision, AccessDecision::Nothing);
        assert!(read.rows.is_empty());

        let declarative = store.policy_details(Some("guest@example.com"), SessionPrivilege::Member)?;
        assert!(declarative.is_empty());
        Ok(())
    }

    // Test IDs: TSTORE-008
    #[test]
    fn secure_read_distinguishes_missing_and_unknown_identity() -> Result<()> {
        let mut store = seeded_store()?;

        let missing = match store.secure_read(None) {
            Ok(read) => panic!("expected missing identity, got {read:?}"),
            Err(err) => err,
        };
        assert_eq!(piaxis_error(&missing), Some(&PiaxisError::MissingIdentity));

        let unknown = match store.secure_read(Some("Alice@example.com")) {
            Ok(read) => panic!("lookup must be case-sensitive, got {read:?}"),
            Err(err) => err,
        };
        assert_eq!(
            piaxis_error(&unknown),
            Some(&PiaxisError::UnknownIdentity("Alice@example.com".to_string()))
        );
        Ok(())
    }

    // Test IDs: TSTORE-009
    #[test]
    fn secure_read_scopes_architect_projects_to_owner() -> Result<()> {
        let mut store = seeded_store()?;

        let alice = store.secure_read(Some("alice@example.com"))?;
        assert_eq!(detail_ids(&alice.rows), vec![1, 2, 3, 4, 5, 6]);

        let carol = store.secure_read(Some("carol@example.com"))?;
        assert_eq!(detail_ids(&carol.rows), vec![1, 2, 3, 4, 5, 7]);

        let admin = store.secure_read(Some("admin@example.com"))?;
        assert_eq!(detail_ids(&admin.rows), vec![1, 2, 3, 4, 5, 6, 7]);
        Ok(())
    }

    // Test IDs: TSTORE-010
    #[test]
    fn worked_example_holds_after_fix() -> Result<()> {
        let mut store = migrated_store()?;
        insert_raw_user(&store, 7, "seven@example.com", "architect")?;
        insert_raw_user(&store, 9, "nine@example.com", "architect")?;
        insert_raw_user(&store, 11, "eleven@example.com", "architect")?;
        store.insert_detail(&mk_detail(1, DetailSource::Standard, None))?;
        store.insert_detail(&mk_detail(2, DetailSource::UserProject, Some(7)))?;

        store.apply_access_fix(&AccessFixPlan { intern_email: "eleven@example.com".to_string() })?;

        assert_eq!(detail_ids(&store.secure_read(Some("seven@example.com"))?.rows), vec![1, 2]);
        assert_eq!(detail_ids(&store.secure_read(Some("nine@example.com"))?.rows), vec![1]);
        let intern = store.secure_read(Some("eleven@example.com"))?;
        assert_eq!(intern.user.role, Role::Intern);
        assert_eq!(detail_ids(&intern.rows), vec![1]);
        Ok(())
    }

    // Test IDs: TSTORE-011
    #[test]
    fn access_fix_forces_security_and_demotes_intern() -> Result<()> {
        let mut store = seeded_store()?;
        let report = store.apply_access_fix(&AccessFixPlan::default())?;

        assert_eq!(report.steps.len(), 4);
        assert_eq!(report.reassigned_users, 1);
        assert!(report.row_security.forced);
        assert_eq!(report.allowed_roles, Role::known().to_vec());
        assert!(report.policies.contains(&"intern_access".to_string()));
        assert_eq!(role_of(&store, "bob@example.com")?, Some(Role::Intern));

        let bob = store.secure_read(Some("bob@example.com"))?;
        assert_eq!(bob.decision, AccessDecision::StandardOnly);
        assert!(bob.rows.iter().all(|detail| detail.source == DetailSource::Standard));
        assert_eq!(detail_ids(&bob.rows), vec![1, 2, 3, 4, 5]);

        let owner_view =
            store.policy_details(Some("bob@example.com"), SessionPrivilege::CatalogOwner)?;
        assert_eq!(detail_ids(&owner_view), vec![1, 2, 3, 4, 5]);
        Ok(())
    }

    // Test IDs: TSTORE-012
    #[test]
    fn access_fix_is_idempotent() -> Result<()> {
        let mut store = seeded_store()?;
        let first = store.apply_access_fix(&AccessFixPlan::default())?;
        let status_after_first = store.access_status()?;
        let users_after_first = store.list_users()?;

        let second = store.apply_access_fix(&AccessFixPlan::default())?;

        assert_eq!(store.access_status()?.row_security, status_after_first.row_security);
        assert_eq!(store.access_status()?.allowed_roles, status_after_first.allowed_roles);
        assert_eq!(policy_names(&store)?, vec![
            "admin_access",
            "architect_access",
            "intern_access",
            "public_access"
        ]);
        assert_eq!(store.list_users()?, users_after_first);
        assert_eq!(first.steps, second.steps);
        assert_eq!(first.policies, second.policies);
        Ok(())
    }

    // Test IDs: TSTORE-013
    #[test]
    fn access_fix_rolls_back_every_step_on_failure() -> Result<()> {
        let mut store = seeded_store()?;
        store.conn.execute_batch(
            "CREATE TRIGGER fail_role_reassignment BEFORE UPDATE OF role ON users
             BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
        )?;
        let before = store.access_status()?;

        let err = match store.apply_access_fix(&AccessFixPlan::default()) {
            Ok(report) => panic!("fix should fail, got {report:?}"),
            Err(err) => err,
        };
        assert!(format!("{err:#}").contains("step 3"));

        let after = store.access_status()?;
        assert_eq!(after, before);
        assert!(!after.row_security.forced);
        assert_eq!(after.allowed_roles, Some(vec![Role::Admin, Role::Architect]));
        assert!(!policy_names(&store)?.contains(&"intern_access".to_string()));
        assert_eq!(role_of(&store, "bob@example.com")?, Some(Role::Architect));
        Ok(())
    }

    // Test IDs: TSTORE-014
    #[test]
    fn access_fix_without_matching_user_still_applies() -> Result<()> {
        let mut store = migrated_store()?;
        let report =
            store.apply_access_fix(&AccessFixPlan { intern_email: "nobody@example.com".into() })?;
        assert_eq!(report.reassigned_users, 0);
        assert!(store.access_status()?.row_security.forced);
        Ok(())
    }

    // Test IDs: TSTORE-015
    #[test]
    fn view_without_policies_exposes_no_rows() -> Result<()> {
        let mut store = seeded_store()?;
        for policy in store.access_status()?.policies {
            drop_policy_if_exists(&store.conn, DETAILS_TABLE, &policy.policy_name)?;
        }

        assert!(store.policy_details(Some("admin@example.com"), SessionPrivilege::Member)?.is_empty());
        assert_eq!(
            detail_ids(&store.policy_details(Some("admin@example.com"), SessionPrivilege::CatalogOwner)?),
            vec![1, 2, 3, 4, 5, 6, 7]
        );
        Ok(())
    }

    // Test IDs: TSTORE-016
    #[test]
    fn public_library_excludes_owned_projects() -> Result<()> {
        let mut store = seeded_store()?;
        assert_eq!(summary_ids(&store.list_details()?), vec![1, 2, 3, 4, 5]);

        store.apply_access_fix(&AccessFixPlan::default())?;
        assert_eq!(summary_ids(&store.list_details()?), vec![1, 2, 3, 4, 5]);
        Ok(())
    }

    // Test IDs: TSTORE-017
    #[test]
    fn search_is_case_insensitive_and_literal() -> Result<()> {
        let mut store = seeded_store()?;

        let upper = store.search_details("SLAB")?;
        let lower = store.search_details("slab")?;
        assert_eq!(upper, lower);
        assert_eq!(summary_ids(&lower), vec![1, 4, 5]);

        assert_eq!(summary_ids(&store.search_details("thermal break")?), vec![4]);
        assert!(store.search_details("%")?.is_empty());
        assert!(store.search_details("_")?.is_empty());
        assert!(store.search_details("pavilion")?.is_empty());
        Ok(())
    }

    // Test IDs: TSTORE-018
    #[test]
    fn suggestion_matches_case_insensitively_and_lowest_rule_wins() -> Result<()> {
        let mut store = seeded_store()?;
        let context = SuggestionContext::new(
            Some("wall".to_string()),
            Some("SLAB".to_string()),
            Some("exterior".to_string()),
        )?;

        store.insert_usage_rule(DetailId(4), &context)?;

        let suggestion = store.suggest(&context)?;
        assert_eq!(suggestion.detail.map(|detail| detail.id), Some(DetailId(1)));
        assert_eq!(
            suggestion.explanation,
            "Matched based on host_element='Wall', adjacent_element='Slab', exposure='Exterior'."
        );

        let miss = SuggestionContext::new(
            Some("Wall".to_string()),
            Some("Slab".to_string()),
            Some("Ext%".to_string()),
        )?;
        assert_eq!(store.suggest(&miss)?, Suggestion::no_match());
        Ok(())
    }

    // Test IDs: TSTORE-019
    #[test]
    fn suggestion_never_returns_owned_project_details() -> Result<()> {
        let mut store = seeded_store()?;
        let context = SuggestionContext::new(
            Some("Terrace".to_string()),
            Some("Roof".to_string()),
            Some("Exterior".to_string()),
        )?;
        store.insert_usage_rule(DetailId(6), &context)?;

        assert_eq!(store.suggest(&context)?.detail, None);
        Ok(())
    }

    // Test IDs: TSTORE-020
    #[test]
    fn search_folds_case_beyond_ascii() -> Result<()> {
        let mut store = seeded_store()?;
        let mut detail = mk_detail(8, DetailSource::Standard, None);
        detail.title = "Öffnung Élément Slab".to_string();
        store.insert_detail(&detail)?;

        let upper = store.search_details("ÖFFNUNG")?;
        let lower = store.search_details("öffnung")?;
        assert_eq!(upper, lower);
        assert_eq!(summary_ids(&lower), vec![8]);
        assert_eq!(summary_ids(&store.search_details("élément")?), vec![8]);
        assert_eq!(summary_ids(&store.search_details("ÉLÉMENT")?), vec![8]);
        Ok(())
    }

    // Test IDs: TSTORE-021
    #[test]
    fn suggestion_folds_case_beyond_ascii() -> Result<()> {
        let mut store = seeded_store()?;
        let stored = SuggestionContext::new(
            Some("Öffnung".to_string()),
            Some("Élément".to_string()),
            Some("Extérieur".to_string()),
        )?;
        store.insert_usage_rule(DetailId(2), &stored)?;

        let asked = SuggestionContext::new(
            Some("öffnung".to_string()),
            Some("ÉLÉMENT".to_string()),
            Some("EXTÉRIEUR".to_string()),
        )?;
        let suggestion = store.suggest(&asked)?;
        assert_eq!(suggestion.detail.map(|detail| detail.id), Some(DetailId(2)));
        assert_eq!(
            suggestion.explanation,
            "Matched based on host_element='Öffnung', adjacent_element='Élément', exposure='Extérieur'."
        );
        Ok(())
    }
}
