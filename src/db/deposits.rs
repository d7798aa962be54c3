use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;

use super::models::{DbDeposit, DbTransfer, DbTransferProof, DbWireFee};
use super::DbResult;

/// Deposit data as produced by the payment coordinator, before the
/// database assigns a serial.
#[derive(Debug)]
pub struct NewDeposit<'a> {
    pub h_contract: &'a str,
    pub coin_pub: &'a str,
    pub exchange_url: &'a str,
    pub amount_with_fee: &'a str,
    pub deposit_fee: &'a str,
    pub refund_fee: &'a str,
    pub wire_fee: &'a str,
    pub exchange_pub: &'a str,
    pub exchange_sig: &'a str,
    pub proof: &'a Value,
    pub wire_transfer_deadline: Option<DateTime<Utc>>,
    pub refund_deadline: Option<DateTime<Utc>>,
}

/// Repository for deposits, coin→wire-transfer mappings and cached
/// transfer proofs.
pub struct DepositRepository {
    pool: PgPool,
}

impl DepositRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Persist a signed deposit confirmation. Deposits are idempotent
    /// facts: replaying the same (contract, coin) pair is a no-op.
    pub async fn insert(&self, d: &NewDeposit<'_>) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO merchant_deposits (
                h_contract, coin_pub, exchange_url, amount_with_fee,
                deposit_fee, refund_fee, wire_fee, exchange_pub, exchange_sig,
                proof, wire_transfer_deadline, refund_deadline
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (h_contract, coin_pub) DO NOTHING
            "#,
        )
        .bind(d.h_contract)
        .bind(d.coin_pub)
        .bind(d.exchange_url)
        .bind(d.amount_with_fee)
        .bind(d.deposit_fee)
        .bind(d.refund_fee)
        .bind(d.wire_fee)
        .bind(d.exchange_pub)
        .bind(d.exchange_sig)
        .bind(d.proof)
        .bind(d.wire_transfer_deadline)
        .bind(d.refund_deadline)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Deposits of a contract in persisted order. Refund share
    /// computation depends on this order being stable.
    pub async fn for_contract(&self, h_contract: &str) -> DbResult<Vec<DbDeposit>> {
        let deposits = sqlx::query_as::<_, DbDeposit>(
            r#"
            SELECT deposit_serial, h_contract, coin_pub, exchange_url,
                   amount_with_fee, deposit_fee, refund_fee, wire_fee,
                   exchange_pub, exchange_sig, proof,
                   wire_transfer_deadline, refund_deadline
            FROM merchant_deposits
            WHERE h_contract = $1
            ORDER BY deposit_serial ASC
            "#,
        )
        .bind(h_contract)
        .fetch_all(&self.pool)
        .await?;
        Ok(deposits)
    }

    pub async fn mark_paid(&self, h_contract: &str) -> DbResult<()> {
        sqlx::query("UPDATE merchant_contract_terms SET paid = TRUE WHERE h_contract = $1")
            .bind(h_contract)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn upsert_transfer(&self, t: &DbTransfer) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO merchant_transfers (exchange_url, wtid, h_contract, coin_pub)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (h_contract, coin_pub) DO UPDATE SET
                exchange_url = EXCLUDED.exchange_url,
                wtid = EXCLUDED.wtid
            "#,
        )
        .bind(&t.exchange_url)
        .bind(&t.wtid)
        .bind(&t.h_contract)
        .bind(&t.coin_pub)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn transfers_for_contract(&self, h_contract: &str) -> DbResult<Vec<DbTransfer>> {
        let transfers = sqlx::query_as::<_, DbTransfer>(
            r#"
            SELECT exchange_url, wtid, h_contract, coin_pub
            FROM merchant_transfers
            WHERE h_contract = $1
            ORDER BY wtid ASC, coin_pub ASC
            "#,
        )
        .bind(h_contract)
        .fetch_all(&self.pool)
        .await?;
        Ok(transfers)
    }

    pub async fn coins_for_transfer(
        &self,
        exchange_url: &str,
        wtid: &str,
    ) -> DbResult<Vec<DbTransfer>> {
        let transfers = sqlx::query_as::<_, DbTransfer>(
            r#"
            SELECT exchange_url, wtid, h_contract, coin_pub
            FROM merchant_transfers
            WHERE exchange_url = $1 AND wtid = $2
            ORDER BY h_contract ASC, coin_pub ASC
            "#,
        )
        .bind(exchange_url)
        .bind(wtid)
        .fetch_all(&self.pool)
        .await?;
        Ok(transfers)
    }

    /// Cache a verified transfer proof. Proofs are immutable; conflicting
    /// re-insertion keeps the first verified copy.
    pub async fn insert_proof(
        &self,
        exchange_url: &str,
        wtid: &str,
        proof: &Value,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO merchant_proofs (exchange_url, wtid, proof, verified_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (exchange_url, wtid) DO NOTHING
            "#,
        )
        .bind(exchange_url)
        .bind(wtid)
        .bind(proof)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_proof(
        &self,
        exchange_url: &str,
        wtid: &str,
    ) -> DbResult<Option<DbTransferProof>> {
        let proof = sqlx::query_as::<_, DbTransferProof>(
            r#"
            SELECT exchange_url, wtid, proof, verified_at
            FROM merchant_proofs
            WHERE exchange_url = $1 AND wtid = $2
            "#,
        )
        .bind(exchange_url)
        .bind(wtid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(proof)
    }

    /// Keep the exchange-signed coin history of a rejected deposit as
    /// evidence.
    pub async fn record_double_spend(
        &self,
        h_contract: &str,
        coin_pub: &str,
        exchange_url: &str,
        history: &Value,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO merchant_double_spends (
                h_contract, coin_pub, exchange_url, history, observed_at
            )
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (h_contract, coin_pub) DO NOTHING
            "#,
        )
        .bind(h_contract)
        .bind(coin_pub)
        .bind(exchange_url)
        .bind(history)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn store_wire_fee(&self, fee: &DbWireFee) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO exchange_wire_fees (
                exchange_url, wire_method, wire_fee, closing_fee, start_date, end_date
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (exchange_url, wire_method, start_date) DO NOTHING
            "#,
        )
        .bind(&fee.exchange_url)
        .bind(&fee.wire_method)
        .bind(&fee.wire_fee)
        .bind(&fee.closing_fee)
        .bind(fee.start_date)
        .bind(fee.end_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn wire_fee_for(
        &self,
        exchange_url: &str,
        wire_method: &str,
        at: DateTime<Utc>,
    ) -> DbResult<Option<DbWireFee>> {
        let fee = sqlx::query_as::<_, DbWireFee>(
            r#"
            SELECT exchange_url, wire_method, wire_fee, closing_fee, start_date, end_date
            FROM exchange_wire_fees
            WHERE exchange_url = $1 AND wire_method = $2
              AND start_date <= $3 AND end_date > $3
            "#,
        )
        .bind(exchange_url)
        .bind(wire_method)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(fee)
    }
}
