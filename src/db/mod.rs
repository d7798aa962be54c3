pub mod deposits;
pub mod instances;
pub mod models;
pub mod orders;
pub mod refunds;
pub mod tips;

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::amount::{Amount, AmountError};
use models::*;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Database error: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Order id already exists: {0}")]
    OrderIdExists(String),

    #[error("Contract not found: {0}")]
    ContractNotFound(String),

    #[error("Contract not paid: {0}")]
    ContractNotPaid(String),

    #[error("Refund total exceeds contract amount")]
    RefundExceedsContract,

    #[error("Tip reserve not found for instance: {0}")]
    ReserveNotFound(String),

    #[error("Tip reserve expired")]
    ReserveExpired,

    #[error("Insufficient tip reserve funds")]
    InsufficientTipFunds,

    #[error("Tip not found: {0}")]
    TipNotFound(Uuid),

    #[error("Tip exhausted or expired")]
    TipExhausted,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Stored record violates an invariant: {0}")]
    Corrupt(String),

    #[error("Too many concurrent transactions, try again")]
    Busy,
}

impl From<AmountError> for DbError {
    fn from(e: AmountError) -> Self {
        // Amounts inside the database were validated on the way in, so a
        // parse failure on the way out means the record is damaged.
        DbError::Corrupt(e.to_string())
    }
}

pub type DbResult<T> = Result<T, DbError>;

/// SQLSTATE 40001: the serializable transaction lost a conflict and is
/// safe to re-run.
pub(crate) fn is_serialization_failure(e: &DbError) -> bool {
    match e {
        DbError::SqlxError(sqlx::Error::Database(db)) => db.code().as_deref() == Some("40001"),
        _ => false,
    }
}

/// Run a serializable transaction, retrying serialization failures up to
/// 3 times before surfacing `Busy`.
pub(crate) async fn retry_serializable<T, F, Fut>(op: F) -> DbResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = DbResult<T>>,
{
    let mut attempts = 0u32;
    loop {
        match op().await {
            Err(e) if is_serialization_failure(&e) => {
                attempts += 1;
                if attempts >= 3 {
                    return Err(DbError::Busy);
                }
                tracing::debug!(attempts, "serialization conflict, retrying transaction");
            }
            other => return other,
        }
    }
}

/// Database connection manager for merchant state
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection from URL
    pub async fn new(database_url: &str) -> DbResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            // Test connections before use to detect stale connections
            .test_before_acquire(true)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations
    pub async fn migrate(&self) -> DbResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Health check - verify database is accessible
    pub async fn health_check(&self) -> DbResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Close all connections
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ===== Instance & account methods =====

    pub async fn count_instances(&self) -> DbResult<i64> {
        instances::InstanceRepository::new(self.pool.clone()).count().await
    }

    pub async fn get_instance(&self, instance_id: &str) -> DbResult<DbInstance> {
        instances::InstanceRepository::new(self.pool.clone()).get(instance_id).await
    }

    pub async fn create_instance(&self, instance: &DbInstance) -> DbResult<()> {
        instances::InstanceRepository::new(self.pool.clone()).create(instance).await
    }

    pub async fn instance_accounts(&self, instance_id: &str) -> DbResult<Vec<DbAccount>> {
        instances::InstanceRepository::new(self.pool.clone()).accounts(instance_id).await
    }

    pub async fn add_account(&self, account: &DbAccount) -> DbResult<()> {
        instances::InstanceRepository::new(self.pool.clone()).add_account(account).await
    }

    // ===== Order & contract methods =====

    pub async fn create_order(&self, order: &DbOrder) -> DbResult<()> {
        orders::OrderRepository::new(self.pool.clone()).create(order).await
    }

    pub async fn get_order(&self, instance_id: &str, order_id: &str) -> DbResult<Option<DbOrder>> {
        orders::OrderRepository::new(self.pool.clone()).get(instance_id, order_id).await
    }

    /// Purge unclaimed orders whose pay deadline has passed. Returns the
    /// number of rows removed.
    pub async fn purge_expired_orders(&self) -> DbResult<u64> {
        orders::OrderRepository::new(self.pool.clone()).purge_expired().await
    }

    pub async fn get_contract(
        &self,
        instance_id: &str,
        order_id: &str,
    ) -> DbResult<Option<DbContract>> {
        orders::OrderRepository::new(self.pool.clone())
            .get_contract(instance_id, order_id)
            .await
    }

    pub async fn get_contract_by_hash(&self, h_contract: &str) -> DbResult<Option<DbContract>> {
        orders::OrderRepository::new(self.pool.clone())
            .get_contract_by_hash(h_contract)
            .await
    }

    /// Atomically move an unclaimed order to the contract table.
    pub async fn claim_order(&self, candidate: &DbContract) -> DbResult<orders::ClaimOutcome> {
        orders::OrderRepository::new(self.pool.clone()).claim(candidate).await
    }

    // ===== Deposit, transfer & proof methods =====

    pub async fn insert_deposit(&self, deposit: &deposits::NewDeposit<'_>) -> DbResult<()> {
        deposits::DepositRepository::new(self.pool.clone()).insert(deposit).await
    }

    pub async fn deposits_for_contract(&self, h_contract: &str) -> DbResult<Vec<DbDeposit>> {
        deposits::DepositRepository::new(self.pool.clone())
            .for_contract(h_contract)
            .await
    }

    pub async fn mark_contract_paid(&self, h_contract: &str) -> DbResult<()> {
        deposits::DepositRepository::new(self.pool.clone())
            .mark_paid(h_contract)
            .await
    }

    pub async fn upsert_coin_transfer(&self, transfer: &DbTransfer) -> DbResult<()> {
        deposits::DepositRepository::new(self.pool.clone())
            .upsert_transfer(transfer)
            .await
    }

    pub async fn transfers_for_contract(&self, h_contract: &str) -> DbResult<Vec<DbTransfer>> {
        deposits::DepositRepository::new(self.pool.clone())
            .transfers_for_contract(h_contract)
            .await
    }

    pub async fn coins_for_transfer(
        &self,
        exchange_url: &str,
        wtid: &str,
    ) -> DbResult<Vec<DbTransfer>> {
        deposits::DepositRepository::new(self.pool.clone())
            .coins_for_transfer(exchange_url, wtid)
            .await
    }

    pub async fn insert_transfer_proof(
        &self,
        exchange_url: &str,
        wtid: &str,
        proof: &serde_json::Value,
    ) -> DbResult<()> {
        deposits::DepositRepository::new(self.pool.clone())
            .insert_proof(exchange_url, wtid, proof)
            .await
    }

    pub async fn get_transfer_proof(
        &self,
        exchange_url: &str,
        wtid: &str,
    ) -> DbResult<Option<DbTransferProof>> {
        deposits::DepositRepository::new(self.pool.clone())
            .get_proof(exchange_url, wtid)
            .await
    }

    pub async fn record_double_spend(
        &self,
        h_contract: &str,
        coin_pub: &str,
        exchange_url: &str,
        history: &serde_json::Value,
    ) -> DbResult<()> {
        deposits::DepositRepository::new(self.pool.clone())
            .record_double_spend(h_contract, coin_pub, exchange_url, history)
            .await
    }

    pub async fn store_wire_fee(&self, fee: &DbWireFee) -> DbResult<()> {
        deposits::DepositRepository::new(self.pool.clone()).store_wire_fee(fee).await
    }

    pub async fn wire_fee_for(
        &self,
        exchange_url: &str,
        wire_method: &str,
        at: chrono::DateTime<chrono::Utc>,
    ) -> DbResult<Option<DbWireFee>> {
        deposits::DepositRepository::new(self.pool.clone())
            .wire_fee_for(exchange_url, wire_method, at)
            .await
    }

    // ===== Refund methods =====

    pub async fn refunds_for_contract(&self, h_contract: &str) -> DbResult<Vec<DbRefund>> {
        refunds::RefundRepository::new(self.pool.clone())
            .for_contract(h_contract)
            .await
    }

    /// Monotone refund increase; returns the effective authorized total.
    pub async fn increase_refund(
        &self,
        h_contract: &str,
        requested_total: &Amount,
        reason: &str,
    ) -> DbResult<refunds::RefundIncreaseOutcome> {
        refunds::RefundRepository::new(self.pool.clone())
            .increase(h_contract, requested_total, reason)
            .await
    }

    // ===== Tip methods =====

    pub async fn get_tip_reserve(&self, instance_id: &str) -> DbResult<Option<DbTipReserve>> {
        tips::TipRepository::new(self.pool.clone()).get_reserve(instance_id).await
    }

    pub async fn ensure_tip_reserve(
        &self,
        instance_id: &str,
        reserve_pub: &str,
        currency: &str,
    ) -> DbResult<()> {
        tips::TipRepository::new(self.pool.clone())
            .ensure_reserve(instance_id, reserve_pub, currency)
            .await
    }

    pub async fn update_reserve_balance(
        &self,
        instance_id: &str,
        committed_balance: &Amount,
        expiration: Option<chrono::DateTime<chrono::Utc>>,
    ) -> DbResult<()> {
        tips::TipRepository::new(self.pool.clone())
            .update_reserve_balance(instance_id, committed_balance, expiration)
            .await
    }

    /// Atomically authorize a tip against the reserve balance.
    pub async fn authorize_tip(&self, tip: &DbTip) -> DbResult<()> {
        tips::TipRepository::new(self.pool.clone()).authorize(tip).await
    }

    pub async fn get_tip(&self, tip_id: Uuid) -> DbResult<Option<DbTip>> {
        tips::TipRepository::new(self.pool.clone()).get(tip_id).await
    }

    pub async fn list_tips(&self, instance_id: &str) -> DbResult<Vec<DbTip>> {
        tips::TipRepository::new(self.pool.clone()).list(instance_id).await
    }

    /// Atomically record a pickup batch under the picked-up ≤ authorized
    /// constraint.
    pub async fn record_tip_pickup(
        &self,
        tip_id: Uuid,
        amount: &Amount,
        num_planchets: i32,
    ) -> DbResult<()> {
        tips::TipRepository::new(self.pool.clone())
            .record_pickup(tip_id, amount, num_planchets)
            .await
    }
}
