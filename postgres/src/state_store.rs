//! `StateStore` on `PostgreSQL`.

use lease_pool_core::environment::Clock;
use lease_pool_core::model::{
    Account, AccountStatus, Lease, LeaseStatus, LeaseStatusReason, Metadata,
};
use lease_pool_core::state_store::{RecordKind, StateStore, StoreError, StoreFuture, lease_key};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use std::sync::Arc;
use std::time::Duration;

macro_rules! account_columns {
    () => {
        "id, status, admin_role_arn, principal_role_arn, principal_policy_hash, \
         metadata, created_on, last_modified_on"
    };
}

macro_rules! lease_columns {
    () => {
        "account_id, principal_id, id, status, status_reason, budget_amount, \
         budget_currency, budget_notification_emails, created_on, last_modified_on, \
         status_modified_on, expires_on"
    };
}

/// Connection pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Upper bound on open connections.
    pub max_connections: u32,
    /// Connections kept open while idle.
    pub min_connections: u32,
    /// How long to wait for a free connection.
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 0,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// PostgreSQL-backed [`StateStore`].
///
/// Timestamps are epoch seconds taken from the injected [`Clock`], not from
/// the database server.
#[derive(Clone)]
pub struct PostgresStateStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PostgresStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStateStore")
            .field("pool_size", &self.pool.size())
            .finish_non_exhaustive()
    }
}

impl PostgresStateStore {
    /// Store on an existing pool.
    #[must_use]
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Connect a new pool sized by `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the connection fails.
    pub async fn connect(
        database_url: &str,
        settings: PoolSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(settings.acquire_timeout)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to connect: {e}")))?;
        tracing::info!(
            max_connections = settings.max_connections,
            min_connections = settings.min_connections,
            "Connected to PostgreSQL"
        );
        Ok(Self::new(pool, clock))
    }

    /// Create the `accounts` and `leases` tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn storage(operation: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |e| StoreError::Storage(format!("{operation} failed: {e}"))
}

fn condition_failed(err: StoreError) -> StoreError {
    if let StoreError::ConditionFailure { record, .. } = &err {
        let record = match record {
            RecordKind::Account => "account",
            RecordKind::Lease => "lease",
        };
        metrics::counter!("lease_pool.store.condition_failures", "record" => record).increment(1);
    }
    tracing::debug!(error = %err, "Conditional write rejected");
    err
}

fn insert_conflict(record: RecordKind, key: String) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |e| match &e {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            condition_failed(StoreError::ConditionFailure {
                record,
                key,
                expected: "no existing record".to_string(),
            })
        }
        _ => StoreError::Storage(format!("Insert failed: {e}")),
    }
}

fn parse_column<T>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(column).map_err(storage("Row decode"))?;
    raw.parse()
        .map_err(|e: T::Err| StoreError::Storage(format!("Column {column}: {e}")))
}

fn account_from_row(row: &PgRow) -> Result<Account, StoreError> {
    let Json(metadata): Json<Metadata> =
        row.try_get("metadata").map_err(storage("Account decode"))?;
    let get = |column: &str| -> Result<String, StoreError> {
        row.try_get(column).map_err(storage("Account decode"))
    };
    Ok(Account {
        id: get("id")?,
        status: parse_column(row, "status")?,
        admin_role_arn: get("admin_role_arn")?,
        principal_role_arn: get("principal_role_arn")?,
        principal_policy_hash: row
            .try_get("principal_policy_hash")
            .map_err(storage("Account decode"))?,
        metadata,
        created_on: row.try_get("created_on").map_err(storage("Account decode"))?,
        last_modified_on: row
            .try_get("last_modified_on")
            .map_err(storage("Account decode"))?,
    })
}

fn lease_from_row(row: &PgRow) -> Result<Lease, StoreError> {
    let text = |column: &str| -> Result<String, StoreError> {
        row.try_get(column).map_err(storage("Lease decode"))
    };
    let epoch = |column: &str| -> Result<i64, StoreError> {
        row.try_get(column).map_err(storage("Lease decode"))
    };
    Ok(Lease {
        account_id: text("account_id")?,
        principal_id: text("principal_id")?,
        id: text("id")?,
        status: parse_column(row, "status")?,
        status_reason: parse_column(row, "status_reason")?,
        budget_amount: row.try_get("budget_amount").map_err(storage("Lease decode"))?,
        budget_currency: text("budget_currency")?,
        budget_notification_emails: row
            .try_get("budget_notification_emails")
            .map_err(storage("Lease decode"))?,
        created_on: epoch("created_on")?,
        last_modified_on: epoch("last_modified_on")?,
        status_modified_on: epoch("status_modified_on")?,
        expires_on: epoch("expires_on")?,
    })
}

fn accounts_from_rows(rows: &[PgRow]) -> Result<Vec<Account>, StoreError> {
    rows.iter().map(account_from_row).collect()
}

fn leases_from_rows(rows: &[PgRow]) -> Result<Vec<Lease>, StoreError> {
    rows.iter().map(lease_from_row).collect()
}

impl StateStore for PostgresStateStore {
    fn transition_account_status<'a>(
        &'a self,
        account_id: &'a str,
        prev: AccountStatus,
        next: AccountStatus,
    ) -> StoreFuture<'a, Account> {
        Box::pin(async move {
            let row = sqlx::query(concat!(
                "UPDATE accounts SET status = $3, last_modified_on = $4 ",
                "WHERE id = $1 AND status = $2 RETURNING ",
                account_columns!()
            ))
            .bind(account_id)
            .bind(prev.as_str())
            .bind(next.as_str())
            .bind(self.clock.now_epoch())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage("Account transition"))?;

            match row {
                Some(row) => {
                    tracing::debug!(account_id, %prev, %next, "Account status changed");
                    account_from_row(&row)
                }
                None => Err(condition_failed(StoreError::account_condition(account_id, prev))),
            }
        })
    }

    fn transition_lease_status<'a>(
        &'a self,
        account_id: &'a str,
        principal_id: &'a str,
        prev: LeaseStatus,
        next: LeaseStatus,
        reason: LeaseStatusReason,
    ) -> StoreFuture<'a, Lease> {
        Box::pin(async move {
            let row = sqlx::query(concat!(
                "UPDATE leases SET status = $4, status_reason = $5, ",
                "status_modified_on = $6, last_modified_on = $6 ",
                "WHERE account_id = $1 AND principal_id = $2 AND status = $3 RETURNING ",
                lease_columns!()
            ))
            .bind(account_id)
            .bind(principal_id)
            .bind(prev.as_str())
            .bind(next.as_str())
            .bind(reason.as_str())
            .bind(self.clock.now_epoch())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage("Lease transition"))?;

            match row {
                Some(row) => {
                    tracing::debug!(account_id, principal_id, %prev, %next, %reason, "Lease status changed");
                    lease_from_row(&row)
                }
                None => Err(condition_failed(StoreError::lease_condition(
                    account_id,
                    principal_id,
                    prev,
                ))),
            }
        })
    }

    fn update_account_principal_policy_hash<'a>(
        &'a self,
        account_id: &'a str,
        prev: Option<&'a str>,
        next: &'a str,
    ) -> StoreFuture<'a, Account> {
        Box::pin(async move {
            let row = sqlx::query(concat!(
                "UPDATE accounts SET principal_policy_hash = $3, last_modified_on = $4 ",
                "WHERE id = $1 AND principal_policy_hash IS NOT DISTINCT FROM $2 RETURNING ",
                account_columns!()
            ))
            .bind(account_id)
            .bind(prev)
            .bind(next)
            .bind(self.clock.now_epoch())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage("Policy hash update"))?;

            match row {
                Some(row) => account_from_row(&row),
                None => Err(condition_failed(StoreError::ConditionFailure {
                    record: RecordKind::Account,
                    key: account_id.to_string(),
                    expected: format!("PrincipalPolicyHash = {}", prev.unwrap_or("<none>")),
                })),
            }
        })
    }

    fn put_account<'a>(&'a self, account: &'a Account) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            sqlx::query(concat!(
                "INSERT INTO accounts (",
                account_columns!(),
                ") VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
            ))
            .bind(&account.id)
            .bind(account.status.as_str())
            .bind(&account.admin_role_arn)
            .bind(&account.principal_role_arn)
            .bind(account.principal_policy_hash.as_deref())
            .bind(Json(&account.metadata))
            .bind(account.created_on)
            .bind(account.last_modified_on)
            .execute(&self.pool)
            .await
            .map_err(insert_conflict(RecordKind::Account, account.id.clone()))?;

            tracing::info!(account_id = %account.id, status = %account.status, "Account added");
            Ok(())
        })
    }

    fn put_lease<'a>(&'a self, lease: &'a Lease) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            sqlx::query(concat!(
                "INSERT INTO leases (",
                lease_columns!(),
                ") VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
            ))
            .bind(&lease.account_id)
            .bind(&lease.principal_id)
            .bind(&lease.id)
            .bind(lease.status.as_str())
            .bind(lease.status_reason.as_str())
            .bind(lease.budget_amount)
            .bind(&lease.budget_currency)
            .bind(&lease.budget_notification_emails)
            .bind(lease.created_on)
            .bind(lease.last_modified_on)
            .bind(lease.status_modified_on)
            .bind(lease.expires_on)
            .execute(&self.pool)
            .await
            .map_err(insert_conflict(
                RecordKind::Lease,
                lease_key(&lease.account_id, &lease.principal_id),
            ))?;
            Ok(())
        })
    }

    fn get_account<'a>(&'a self, account_id: &'a str) -> StoreFuture<'a, Account> {
        Box::pin(async move {
            let row = sqlx::query(concat!(
                "SELECT ",
                account_columns!(),
                " FROM accounts WHERE id = $1"
            ))
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage("Account read"))?
            .ok_or_else(|| StoreError::NotFound {
                record: RecordKind::Account,
                key: account_id.to_string(),
            })?;
            account_from_row(&row)
        })
    }

    fn get_lease<'a>(
        &'a self,
        account_id: &'a str,
        principal_id: &'a str,
    ) -> StoreFuture<'a, Lease> {
        Box::pin(async move {
            let row = sqlx::query(concat!(
                "SELECT ",
                lease_columns!(),
                " FROM leases WHERE account_id = $1 AND principal_id = $2"
            ))
            .bind(account_id)
            .bind(principal_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage("Lease read"))?
            .ok_or_else(|| StoreError::NotFound {
                record: RecordKind::Lease,
                key: lease_key(account_id, principal_id),
            })?;
            lease_from_row(&row)
        })
    }

    fn get_lease_by_id<'a>(&'a self, lease_id: &'a str) -> StoreFuture<'a, Lease> {
        Box::pin(async move {
            let sql = concat!("SELECT ", lease_columns!(), " FROM leases WHERE id = $1");
            let row = sqlx::query(sql)
                .bind(lease_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage("Lease read"))?
                .ok_or_else(|| StoreError::NotFound {
                    record: RecordKind::Lease,
                    key: lease_id.to_string(),
                })?;
            lease_from_row(&row)
        })
    }

    fn get_ready_account(&self) -> StoreFuture<'_, Option<Account>> {
        Box::pin(async move {
            let row = sqlx::query(concat!(
                "SELECT ",
                account_columns!(),
                " FROM accounts WHERE status = $1 LIMIT 1"
            ))
            .bind(AccountStatus::Ready.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage("Ready account read"))?;
            row.as_ref().map(account_from_row).transpose()
        })
    }

    fn find_accounts_by_status(&self, status: AccountStatus) -> StoreFuture<'_, Vec<Account>> {
        Box::pin(async move {
            let rows = sqlx::query(concat!(
                "SELECT ",
                account_columns!(),
                " FROM accounts WHERE status = $1 ORDER BY id"
            ))
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(storage("Account scan"))?;
            accounts_from_rows(&rows)
        })
    }

    fn find_leases_by_status(&self, status: LeaseStatus) -> StoreFuture<'_, Vec<Lease>> {
        Box::pin(async move {
            let rows = sqlx::query(concat!(
                "SELECT ",
                lease_columns!(),
                " FROM leases WHERE status = $1 ORDER BY account_id, principal_id"
            ))
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(storage("Lease scan"))?;
            leases_from_rows(&rows)
        })
    }

    fn find_leases_by_principal<'a>(
        &'a self,
        principal_id: &'a str,
    ) -> StoreFuture<'a, Vec<Lease>> {
        Box::pin(async move {
            let rows = sqlx::query(concat!(
                "SELECT ",
                lease_columns!(),
                " FROM leases WHERE principal_id = $1 ORDER BY account_id"
            ))
            .bind(principal_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage("Lease query"))?;
            leases_from_rows(&rows)
        })
    }

    fn find_leases_by_account<'a>(&'a self, account_id: &'a str) -> StoreFuture<'a, Vec<Lease>> {
        Box::pin(async move {
            let rows = sqlx::query(concat!(
                "SELECT ",
                lease_columns!(),
                " FROM leases WHERE account_id = $1 ORDER BY principal_id"
            ))
            .bind(account_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage("Lease query"))?;
            leases_from_rows(&rows)
        })
    }
}
