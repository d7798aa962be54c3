use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::models::{DbTip, DbTipReserve};
use super::{retry_serializable, DbError, DbResult};
use crate::amount::Amount;

const RESERVE_COLUMNS: &str = r#"
    instance_id, reserve_pub, authorized_total, picked_up_total,
    committed_balance, expiration, last_probe
"#;

const TIP_COLUMNS: &str = r#"
    tip_id, instance_id, reserve_pub, amount, picked_up, justification,
    extra, expiration, creation_time
"#;

/// Repository for tip reserves, tips and pickup records.
pub struct TipRepository {
    pool: PgPool,
}

impl TipRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_reserve(&self, instance_id: &str) -> DbResult<Option<DbTipReserve>> {
        let reserve = sqlx::query_as::<_, DbTipReserve>(&format!(
            "SELECT {} FROM merchant_tip_reserves WHERE instance_id = $1",
            RESERVE_COLUMNS
        ))
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(reserve)
    }

    /// Create the reserve row with zeroed counters if it does not exist
    /// yet (first authorization after configuring a tipping key).
    pub async fn ensure_reserve(
        &self,
        instance_id: &str,
        reserve_pub: &str,
        currency: &str,
    ) -> DbResult<()> {
        let zero = Amount::zero(currency)?.to_string();
        sqlx::query(
            r#"
            INSERT INTO merchant_tip_reserves (
                instance_id, reserve_pub, authorized_total, picked_up_total,
                committed_balance, expiration, last_probe
            )
            VALUES ($1, $2, $3, $3, $3, NULL, NULL)
            ON CONFLICT (instance_id) DO NOTHING
            "#,
        )
        .bind(instance_id)
        .bind(reserve_pub)
        .bind(&zero)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fold a reserve status probe result into the local counters.
    pub async fn update_reserve_balance(
        &self,
        instance_id: &str,
        committed_balance: &Amount,
        expiration: Option<DateTime<Utc>>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE merchant_tip_reserves
            SET committed_balance = $2, expiration = $3, last_probe = $4
            WHERE instance_id = $1
            "#,
        )
        .bind(instance_id)
        .bind(committed_balance.to_string())
        .bind(expiration)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomic tip authorization: `authorized_total + amount` must stay
    /// within the committed balance observed at the exchange.
    pub async fn authorize(&self, tip: &DbTip) -> DbResult<()> {
        retry_serializable(|| self.authorize_once(tip)).await
    }

    async fn authorize_once(&self, tip: &DbTip) -> DbResult<()> {
        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        let reserve: Option<(String, String, Option<DateTime<Utc>>)> = sqlx::query_as(
            r#"
            SELECT authorized_total, committed_balance, expiration
            FROM merchant_tip_reserves
            WHERE instance_id = $1
            "#,
        )
        .bind(&tip.instance_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (authorized_total, committed_balance, expiration) = match reserve {
            None => return Err(DbError::ReserveNotFound(tip.instance_id.clone())),
            Some(r) => r,
        };

        if let Some(expiration) = expiration {
            if expiration < Utc::now() {
                return Err(DbError::ReserveExpired);
            }
        }

        let authorized_total = authorized_total.parse::<Amount>()?;
        let committed_balance = committed_balance.parse::<Amount>()?;
        let tip_amount = tip.amount.parse::<Amount>().map_err(|e| {
            DbError::InvalidInput(format!("tip amount: {}", e))
        })?;

        let new_total = authorized_total.checked_add(&tip_amount).map_err(|e| {
            DbError::InvalidInput(format!("tip amount: {}", e))
        })?;
        if new_total.cmp_checked(&committed_balance)? == std::cmp::Ordering::Greater {
            return Err(DbError::InsufficientTipFunds);
        }

        sqlx::query(&format!(
            r#"
            INSERT INTO merchant_tips ({})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
            TIP_COLUMNS
        ))
        .bind(tip.tip_id)
        .bind(&tip.instance_id)
        .bind(&tip.reserve_pub)
        .bind(&tip.amount)
        .bind(&tip.picked_up)
        .bind(&tip.justification)
        .bind(&tip.extra)
        .bind(tip.expiration)
        .bind(tip.creation_time)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE merchant_tip_reserves SET authorized_total = $2 WHERE instance_id = $1",
        )
        .bind(&tip.instance_id)
        .bind(new_total.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get(&self, tip_id: Uuid) -> DbResult<Option<DbTip>> {
        let tip = sqlx::query_as::<_, DbTip>(&format!(
            "SELECT {} FROM merchant_tips WHERE tip_id = $1",
            TIP_COLUMNS
        ))
        .bind(tip_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(tip)
    }

    pub async fn list(&self, instance_id: &str) -> DbResult<Vec<DbTip>> {
        let tips = sqlx::query_as::<_, DbTip>(&format!(
            "SELECT {} FROM merchant_tips WHERE instance_id = $1 ORDER BY creation_time DESC",
            TIP_COLUMNS
        ))
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(tips)
    }

    /// Atomic pickup accounting: `picked_up + amount` must stay within
    /// the tip's authorized amount, and the tip must not be expired.
    pub async fn record_pickup(
        &self,
        tip_id: Uuid,
        amount: &Amount,
        num_planchets: i32,
    ) -> DbResult<()> {
        retry_serializable(|| self.record_pickup_once(tip_id, amount, num_planchets)).await
    }

    async fn record_pickup_once(
        &self,
        tip_id: Uuid,
        amount: &Amount,
        num_planchets: i32,
    ) -> DbResult<()> {
        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        let tip: Option<(String, String, String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT instance_id, amount, picked_up, expiration
            FROM merchant_tips
            WHERE tip_id = $1
            "#,
        )
        .bind(tip_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (instance_id, authorized, picked_up, expiration) = match tip {
            None => return Err(DbError::TipNotFound(tip_id)),
            Some(t) => t,
        };

        if expiration < Utc::now() {
            return Err(DbError::TipExhausted);
        }

        let authorized = authorized.parse::<Amount>()?;
        let picked_up = picked_up.parse::<Amount>()?;
        let new_picked_up = picked_up.checked_add(amount).map_err(|e| {
            DbError::InvalidInput(format!("pickup amount: {}", e))
        })?;
        if new_picked_up.cmp_checked(&authorized)? == std::cmp::Ordering::Greater {
            return Err(DbError::TipExhausted);
        }

        sqlx::query("UPDATE merchant_tips SET picked_up = $2 WHERE tip_id = $1")
            .bind(tip_id)
            .bind(new_picked_up.to_string())
            .execute(&mut *tx)
            .await?;

        let reserve_picked_up: Option<(String,)> = sqlx::query_as(
            "SELECT picked_up_total FROM merchant_tip_reserves WHERE instance_id = $1",
        )
        .bind(&instance_id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some((total,)) = reserve_picked_up {
            let total = total.parse::<Amount>()?.checked_add(amount)?;
            sqlx::query(
                "UPDATE merchant_tip_reserves SET picked_up_total = $2 WHERE instance_id = $1",
            )
            .bind(&instance_id)
            .bind(total.to_string())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO merchant_tip_pickups (tip_id, amount, num_planchets, creation_time)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(tip_id)
        .bind(amount.to_string())
        .bind(num_planchets)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}
