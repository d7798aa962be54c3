use sqlx::PgPool;

use super::models::{DbAccount, DbInstance};
use super::DbResult;
use crate::db::DbError;

/// Repository for merchant instances and their bank accounts.
pub struct InstanceRepository {
    pool: PgPool,
}

impl InstanceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn count(&self) -> DbResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM merchant_instances")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn get(&self, instance_id: &str) -> DbResult<DbInstance> {
        sqlx::query_as::<_, DbInstance>(
            r#"
            SELECT instance_id, name, pub_key, priv_key, address, jurisdiction,
                   default_max_wire_fee, default_max_deposit_fee,
                   default_wire_fee_amortization, default_wire_transfer_delay_secs,
                   default_pay_delay_secs, tip_reserve_priv, active
            FROM merchant_instances
            WHERE instance_id = $1 AND active = TRUE
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::InstanceNotFound(instance_id.to_string()))
    }

    pub async fn create(&self, instance: &DbInstance) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO merchant_instances (
                instance_id, name, pub_key, priv_key, address, jurisdiction,
                default_max_wire_fee, default_max_deposit_fee,
                default_wire_fee_amortization, default_wire_transfer_delay_secs,
                default_pay_delay_secs, tip_reserve_priv, active
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(&instance.instance_id)
        .bind(&instance.name)
        .bind(&instance.pub_key)
        .bind(&instance.priv_key)
        .bind(&instance.address)
        .bind(&instance.jurisdiction)
        .bind(&instance.default_max_wire_fee)
        .bind(&instance.default_max_deposit_fee)
        .bind(instance.default_wire_fee_amortization)
        .bind(instance.default_wire_transfer_delay_secs)
        .bind(instance.default_pay_delay_secs)
        .bind(&instance.tip_reserve_priv)
        .bind(instance.active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All accounts of an instance, active first (stable order for
    /// default account selection).
    pub async fn accounts(&self, instance_id: &str) -> DbResult<Vec<DbAccount>> {
        let accounts = sqlx::query_as::<_, DbAccount>(
            r#"
            SELECT instance_id, payto_uri, salt, h_wire, active
            FROM merchant_accounts
            WHERE instance_id = $1
            ORDER BY active DESC, h_wire ASC
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(accounts)
    }

    pub async fn add_account(&self, account: &DbAccount) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO merchant_accounts (instance_id, payto_uri, salt, h_wire, active)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (instance_id, h_wire) DO UPDATE SET active = EXCLUDED.active
            "#,
        )
        .bind(&account.instance_id)
        .bind(&account.payto_uri)
        .bind(&account.salt)
        .bind(&account.h_wire)
        .bind(account.active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
