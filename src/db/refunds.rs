use chrono::Utc;
use sqlx::{PgPool, Postgres, Transaction};

use super::models::DbRefund;
use super::{retry_serializable, DbError, DbResult};
use crate::amount::Amount;

/// Result of a refund increase.
#[derive(Debug)]
pub struct RefundIncreaseOutcome {
    /// Authorized total after the operation (max of old and requested).
    pub effective_total: Amount,
    /// True if a new authorization row was appended.
    pub increased: bool,
    /// rtransaction id of the appended row, if any.
    pub rtransaction_id: Option<i64>,
}

/// Repository for the monotone refund authorization ledger.
pub struct RefundRepository {
    pool: PgPool,
}

impl RefundRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Authorization rows in rtransaction order; their running sum is the
    /// authorized total at each point in time.
    pub async fn for_contract(&self, h_contract: &str) -> DbResult<Vec<DbRefund>> {
        let rows = sqlx::query_as::<_, DbRefund>(
            r#"
            SELECT h_contract, rtransaction_id, refund_amount, reason, creation_time
            FROM merchant_refunds
            WHERE h_contract = $1
            ORDER BY rtransaction_id ASC
            "#,
        )
        .bind(h_contract)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Monotone increase: `new_total = max(current_total, requested)`.
    /// Appends a delta row only when the total actually grows. Refunds on
    /// unpaid contracts are refused, and the total may never exceed the
    /// contract amount.
    pub async fn increase(
        &self,
        h_contract: &str,
        requested_total: &Amount,
        reason: &str,
    ) -> DbResult<RefundIncreaseOutcome> {
        retry_serializable(|| self.increase_once(h_contract, requested_total, reason)).await
    }

    async fn increase_once(
        &self,
        h_contract: &str,
        requested_total: &Amount,
        reason: &str,
    ) -> DbResult<RefundIncreaseOutcome> {
        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        let contract: Option<(String, bool)> = sqlx::query_as(
            "SELECT amount, paid FROM merchant_contract_terms WHERE h_contract = $1",
        )
        .bind(h_contract)
        .fetch_optional(&mut *tx)
        .await?;

        let (contract_amount, paid) = match contract {
            None => return Err(DbError::ContractNotFound(h_contract.to_string())),
            Some((amount, paid)) => (amount.parse::<Amount>()?, paid),
        };
        if !paid {
            return Err(DbError::ContractNotPaid(h_contract.to_string()));
        }

        let rows: Vec<(i64, String)> = sqlx::query_as(
            r#"
            SELECT rtransaction_id, refund_amount
            FROM merchant_refunds
            WHERE h_contract = $1
            ORDER BY rtransaction_id ASC
            "#,
        )
        .bind(h_contract)
        .fetch_all(&mut *tx)
        .await?;

        let mut current_total = Amount::zero(contract_amount.currency())?;
        let mut max_rtid = 0i64;
        for (rtid, delta) in &rows {
            current_total = current_total.checked_add(&delta.parse::<Amount>()?)?;
            max_rtid = max_rtid.max(*rtid);
        }

        // Monotone merge: a request below the current total is a no-op.
        if requested_total.cmp_checked(&current_total).map_err(|e| {
            DbError::InvalidInput(format!("refund currency mismatch: {}", e))
        })? != std::cmp::Ordering::Greater
        {
            tx.commit().await?;
            return Ok(RefundIncreaseOutcome {
                effective_total: current_total,
                increased: false,
                rtransaction_id: None,
            });
        }

        if requested_total.cmp_checked(&contract_amount)? == std::cmp::Ordering::Greater {
            return Err(DbError::RefundExceedsContract);
        }

        let delta = requested_total.checked_sub(&current_total)?;
        let rtransaction_id = max_rtid + 1;

        sqlx::query(
            r#"
            INSERT INTO merchant_refunds (
                h_contract, rtransaction_id, refund_amount, reason, creation_time
            )
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(h_contract)
        .bind(rtransaction_id)
        .bind(delta.to_string())
        .bind(reason)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(RefundIncreaseOutcome {
            effective_total: requested_total.clone(),
            increased: true,
            rtransaction_id: Some(rtransaction_id),
        })
    }
}
