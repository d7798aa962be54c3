use chrono::Utc;
use sqlx::{PgPool, Postgres, Transaction};

use super::models::{DbContract, DbOrder};
use super::{retry_serializable, DbError, DbResult};

/// Result of an atomic claim attempt.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// The order was unclaimed; the candidate contract is now persisted.
    Claimed(DbContract),
    /// A contract already exists for this (instance, order). The caller
    /// decides between idempotent success (same nonce) and a claim
    /// conflict (different nonce).
    Existing(DbContract),
    /// Neither an unclaimed order nor a contract exists.
    NoSuchOrder,
}

/// Repository for unclaimed orders and claimed contract terms.
pub struct OrderRepository {
    pool: PgPool,
}

const CONTRACT_COLUMNS: &str = r#"
    instance_id, order_id, h_contract, nonce, contract_terms, merchant_sig,
    amount, max_fee, max_wire_fee, wire_fee_amortization, h_wire,
    pay_deadline, refund_deadline, wire_transfer_deadline, paid, creation_time
"#;

impl OrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a new unclaimed order. Fails with `OrderIdExists` when the
    /// (instance, order id) pair is taken, either by an unclaimed order
    /// or by an already-claimed contract.
    pub async fn create(&self, order: &DbOrder) -> DbResult<()> {
        let claimed: Option<(String,)> = sqlx::query_as(
            "SELECT order_id FROM merchant_contract_terms WHERE instance_id = $1 AND order_id = $2",
        )
        .bind(&order.instance_id)
        .bind(&order.order_id)
        .fetch_optional(&self.pool)
        .await?;
        if claimed.is_some() {
            return Err(DbError::OrderIdExists(order.order_id.clone()));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO merchant_orders (
                instance_id, order_id, contract_terms, creation_time, pay_deadline
            )
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (instance_id, order_id) DO NOTHING
            "#,
        )
        .bind(&order.instance_id)
        .bind(&order.order_id)
        .bind(&order.contract_terms)
        .bind(order.creation_time)
        .bind(order.pay_deadline)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::OrderIdExists(order.order_id.clone()));
        }
        Ok(())
    }

    pub async fn get(&self, instance_id: &str, order_id: &str) -> DbResult<Option<DbOrder>> {
        let order = sqlx::query_as::<_, DbOrder>(
            r#"
            SELECT instance_id, order_id, contract_terms, creation_time, pay_deadline
            FROM merchant_orders
            WHERE instance_id = $1 AND order_id = $2
            "#,
        )
        .bind(instance_id)
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(order)
    }

    /// Delete unclaimed orders whose pay deadline has passed.
    pub async fn purge_expired(&self) -> DbResult<u64> {
        let result = sqlx::query(
            "DELETE FROM merchant_orders WHERE pay_deadline IS NOT NULL AND pay_deadline < $1",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_contract(
        &self,
        instance_id: &str,
        order_id: &str,
    ) -> DbResult<Option<DbContract>> {
        let contract = sqlx::query_as::<_, DbContract>(&format!(
            "SELECT {} FROM merchant_contract_terms WHERE instance_id = $1 AND order_id = $2",
            CONTRACT_COLUMNS
        ))
        .bind(instance_id)
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(contract)
    }

    pub async fn get_contract_by_hash(&self, h_contract: &str) -> DbResult<Option<DbContract>> {
        let contract = sqlx::query_as::<_, DbContract>(&format!(
            "SELECT {} FROM merchant_contract_terms WHERE h_contract = $1",
            CONTRACT_COLUMNS
        ))
        .bind(h_contract)
        .fetch_optional(&self.pool)
        .await?;
        Ok(contract)
    }

    /// Atomic claim: consume the unclaimed order and persist the signed
    /// contract, or report what already exists. Runs serializable so two
    /// racing claims resolve to exactly one winner; the loser re-runs
    /// and observes the winner's contract.
    pub async fn claim(&self, candidate: &DbContract) -> DbResult<ClaimOutcome> {
        retry_serializable(|| self.claim_once(candidate)).await
    }

    async fn claim_once(&self, candidate: &DbContract) -> DbResult<ClaimOutcome> {
        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        let existing = sqlx::query_as::<_, DbContract>(&format!(
            "SELECT {} FROM merchant_contract_terms WHERE instance_id = $1 AND order_id = $2",
            CONTRACT_COLUMNS
        ))
        .bind(&candidate.instance_id)
        .bind(&candidate.order_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(contract) = existing {
            tx.commit().await?;
            return Ok(ClaimOutcome::Existing(contract));
        }

        let unclaimed: Option<(String,)> = sqlx::query_as(
            "SELECT order_id FROM merchant_orders WHERE instance_id = $1 AND order_id = $2",
        )
        .bind(&candidate.instance_id)
        .bind(&candidate.order_id)
        .fetch_optional(&mut *tx)
        .await?;

        if unclaimed.is_none() {
            tx.commit().await?;
            return Ok(ClaimOutcome::NoSuchOrder);
        }

        sqlx::query(
            r#"
            INSERT INTO merchant_contract_terms (
                instance_id, order_id, h_contract, nonce, contract_terms,
                merchant_sig, amount, max_fee, max_wire_fee,
                wire_fee_amortization, h_wire, pay_deadline, refund_deadline,
                wire_transfer_deadline, paid, creation_time
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(&candidate.instance_id)
        .bind(&candidate.order_id)
        .bind(&candidate.h_contract)
        .bind(&candidate.nonce)
        .bind(&candidate.contract_terms)
        .bind(&candidate.merchant_sig)
        .bind(&candidate.amount)
        .bind(&candidate.max_fee)
        .bind(&candidate.max_wire_fee)
        .bind(candidate.wire_fee_amortization)
        .bind(&candidate.h_wire)
        .bind(candidate.pay_deadline)
        .bind(candidate.refund_deadline)
        .bind(candidate.wire_transfer_deadline)
        .bind(candidate.paid)
        .bind(candidate.creation_time)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM merchant_orders WHERE instance_id = $1 AND order_id = $2")
            .bind(&candidate.instance_id)
            .bind(&candidate.order_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(ClaimOutcome::Claimed(candidate.clone()))
    }
}
