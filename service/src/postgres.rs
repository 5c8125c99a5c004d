//! Postgres-backed repositories.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use swaprail_common::{
    Currency, NetworkPair, Swap, SwapId, SwapRailError, SwapRailResult, SwapStatus,
};

use crate::repository::{CurrencyFilters, CurrencyRepository, SwapRepository};

const SCHEMA: &str = include_str!("../migrations/0001_init.sql");

const CURRENCY_COLUMNS: &str =
    "symbol, name, image, available, popular, price, priced_at, address_validation";

const SWAP_COLUMNS: &str = "id, from_symbol, from_network, to_symbol, to_network, \
    payin_amount, payin_address, payout_amount, payout_address, refund_address, \
    exchange, exchange_id, status, reason, created_at, updated_at";

fn db_err(e: sqlx::Error) -> SwapRailError {
    SwapRailError::Database(e.to_string())
}

/// Statements of the bundled schema, comments stripped.
fn schema_statements() -> Vec<String> {
    SCHEMA
        .split(';')
        .map(|chunk| {
            chunk
                .lines()
                .filter(|line| !line.trim_start().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string()
        })
        .filter(|statement| !statement.is_empty())
        .collect()
}

/// Currency and swap repository on a Postgres pool.
#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    /// Connect a pool to `database_url`.
    pub async fn connect(database_url: &str) -> SwapRailResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(db_err)?;
        Ok(Self::new(pool))
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if they do not exist.
    pub async fn apply_schema(&self) -> SwapRailResult<()> {
        for statement in schema_statements() {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        info!("Database schema applied");
        Ok(())
    }

    /// Attach stored networks to currency rows.
    async fn with_networks(&self, rows: Vec<PgRow>) -> SwapRailResult<Vec<Currency>> {
        let mut currencies = BTreeMap::new();
        for row in rows {
            let currency = currency_from_row(&row)?;
            currencies.insert(currency.key(), currency);
        }
        if currencies.is_empty() {
            return Ok(Vec::new());
        }

        let symbols: Vec<String> = currencies.keys().cloned().collect();
        let networks = sqlx::query(
            "SELECT symbol, network FROM currencies_networks WHERE symbol = ANY($1) ORDER BY symbol, network",
        )
        .bind(&symbols)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        for row in networks {
            let symbol: String = row.try_get("symbol").map_err(db_err)?;
            let network: String = row.try_get("network").map_err(db_err)?;
            if let Some(currency) = currencies.get_mut(&symbol) {
                currency.networks.insert(NetworkPair::new(&symbol, network));
            }
        }

        Ok(currencies.into_values().collect())
    }
}

fn currency_from_row(row: &PgRow) -> SwapRailResult<Currency> {
    let symbol: String = row.try_get("symbol").map_err(db_err)?;
    let name: String = row.try_get("name").map_err(db_err)?;

    let mut currency = Currency::new(symbol, name);
    currency.image = row.try_get("image").map_err(db_err)?;
    currency.available = row.try_get("available").map_err(db_err)?;
    currency.popular = row.try_get("popular").map_err(db_err)?;
    currency.price = row.try_get::<Option<Decimal>, _>("price").map_err(db_err)?;
    currency.priced_at = row
        .try_get::<Option<DateTime<Utc>>, _>("priced_at")
        .map_err(db_err)?;
    currency.address_validation = row.try_get("address_validation").map_err(db_err)?;
    Ok(currency)
}

fn swap_from_row(row: &PgRow) -> SwapRailResult<Swap> {
    let status: String = row.try_get("status").map_err(db_err)?;
    let status = SwapStatus::parse(&status)
        .ok_or_else(|| SwapRailError::Database(format!("unknown swap status '{}'", status)))?;
    let from_symbol: String = row.try_get("from_symbol").map_err(db_err)?;
    let from_network: String = row.try_get("from_network").map_err(db_err)?;
    let to_symbol: String = row.try_get("to_symbol").map_err(db_err)?;
    let to_network: String = row.try_get("to_network").map_err(db_err)?;

    Ok(Swap {
        id: SwapId::from_uuid(row.try_get::<Uuid, _>("id").map_err(db_err)?),
        from: NetworkPair::new(from_symbol, from_network),
        to: NetworkPair::new(to_symbol, to_network),
        payin_amount: row.try_get("payin_amount").map_err(db_err)?,
        payin_address: row.try_get("payin_address").map_err(db_err)?,
        payout_amount: row.try_get("payout_amount").map_err(db_err)?,
        payout_address: row.try_get("payout_address").map_err(db_err)?,
        refund_address: row.try_get("refund_address").map_err(db_err)?,
        exchange: row.try_get("exchange").map_err(db_err)?,
        exchange_id: row.try_get("exchange_id").map_err(db_err)?,
        status,
        reason: row.try_get("reason").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

#[async_trait]
impl CurrencyRepository for PgRepository {
    #[instrument(skip(self))]
    async fn get_currencies(&self, filters: &CurrencyFilters) -> SwapRailResult<Vec<Currency>> {
        let mut query: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {} FROM currency WHERE TRUE", CURRENCY_COLUMNS));

        if let Some(symbols) = filters.symbol_keys() {
            query.push(" AND symbol = ANY(").push_bind(symbols).push(")");
        }
        if let Some(popular) = filters.popular {
            query.push(" AND popular = ").push_bind(popular);
        }
        if let Some(available) = filters.available {
            query.push(" AND available = ").push_bind(available);
        }
        query.push(" ORDER BY symbol");

        let rows = query.build().fetch_all(&self.pool).await.map_err(db_err)?;
        self.with_networks(rows).await
    }

    async fn get_currencies_by_pairs(&self, pairs: &[NetworkPair]) -> SwapRailResult<Vec<Currency>> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }

        let symbols: Vec<String> = pairs.iter().map(|p| p.symbol.clone()).collect();
        let networks: Vec<String> = pairs.iter().map(|p| p.network.clone()).collect();

        let rows = sqlx::query(&format!(
            "SELECT {} FROM currency WHERE symbol IN (\
                 SELECT n.symbol FROM currencies_networks n \
                 JOIN UNNEST($1::text[], $2::text[]) AS p(symbol, network) \
                 ON n.symbol = p.symbol AND n.network = p.network) \
             ORDER BY symbol",
            CURRENCY_COLUMNS
        ))
        .bind(&symbols)
        .bind(&networks)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        self.with_networks(rows).await
    }

    #[instrument(skip(self, currencies), fields(count = currencies.len()))]
    async fn insert_currencies(&self, currencies: &[Currency]) -> SwapRailResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        for currency in currencies {
            sqlx::query(
                "INSERT INTO currency (symbol, name, image, available, popular, address_validation) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (symbol) DO UPDATE SET \
                     name = EXCLUDED.name, \
                     image = EXCLUDED.image, \
                     available = EXCLUDED.available, \
                     popular = EXCLUDED.popular, \
                     address_validation = EXCLUDED.address_validation",
            )
            .bind(currency.key())
            .bind(&currency.name)
            .bind(currency.image.as_deref())
            .bind(currency.available)
            .bind(currency.popular)
            .bind(currency.address_validation.as_deref())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        let keys: Vec<String> = currencies.iter().map(Currency::key).collect();
        sqlx::query("UPDATE currency SET available = FALSE WHERE NOT (symbol = ANY($1))")
            .bind(&keys)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        // Full replace; the catalog loop is the only writer of this table.
        sqlx::query("DELETE FROM currencies_networks")
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let (symbols, networks): (Vec<String>, Vec<String>) = currencies
            .iter()
            .flat_map(|c| {
                let key = c.key();
                c.networks.iter().map(move |n| (key.clone(), n.network.clone()))
            })
            .unzip();

        if !symbols.is_empty() {
            sqlx::query(
                "INSERT INTO currencies_networks (symbol, network) \
                 SELECT * FROM UNNEST($1::text[], $2::text[]) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(&symbols)
            .bind(&networks)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;

        debug!(networks = symbols.len(), "Currency catalog replaced");
        Ok(())
    }

    #[instrument(skip(self, currencies), fields(count = currencies.len()))]
    async fn update_prices(&self, currencies: &[Currency]) -> SwapRailResult<()> {
        if currencies.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for currency in currencies {
            sqlx::query(
                "INSERT INTO currency (symbol, name, available, popular, price, priced_at) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (symbol) DO UPDATE SET \
                     price = EXCLUDED.price, \
                     priced_at = EXCLUDED.priced_at",
            )
            .bind(currency.key())
            .bind(&currency.name)
            .bind(currency.available)
            .bind(currency.popular)
            .bind(currency.price)
            .bind(currency.priced_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }
}

#[async_trait]
impl SwapRepository for PgRepository {
    async fn get_swap(&self, id: &SwapId) -> SwapRailResult<Swap> {
        let row = sqlx::query(&format!("SELECT {} FROM swap WHERE id = $1", SWAP_COLUMNS))
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| SwapRailError::NotFound(format!("swap {}", id)))?;

        swap_from_row(&row)
    }

    #[instrument(skip(self, swap), fields(swap_id = %swap.id))]
    async fn insert_swap(&self, swap: &Swap) -> SwapRailResult<()> {
        sqlx::query(&format!(
            "INSERT INTO swap ({}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
            SWAP_COLUMNS
        ))
        .bind(*swap.id.as_uuid())
        .bind(&swap.from.symbol)
        .bind(&swap.from.network)
        .bind(&swap.to.symbol)
        .bind(&swap.to.network)
        .bind(swap.payin_amount)
        .bind(&swap.payin_address)
        .bind(swap.payout_amount)
        .bind(&swap.payout_address)
        .bind(&swap.refund_address)
        .bind(&swap.exchange)
        .bind(&swap.exchange_id)
        .bind(swap.status.as_str())
        .bind(swap.reason.as_deref())
        .bind(swap.created_at)
        .bind(swap.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    #[instrument(skip(self, swap), fields(swap_id = %swap.id, status = swap.status.as_str()))]
    async fn update_swap(&self, swap: &Swap) -> SwapRailResult<bool> {
        let result = sqlx::query(
            "UPDATE swap SET payout_amount = $2, status = $3, reason = $4, updated_at = $5 \
             WHERE id = $1 AND status = $6",
        )
        .bind(*swap.id.as_uuid())
        .bind(swap.payout_amount)
        .bind(swap.status.as_str())
        .bind(swap.reason.as_deref())
        .bind(swap.updated_at)
        .bind(SwapStatus::Pending.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            // Settled by a concurrent delivery, or never stored.
            return self.get_swap(&swap.id).await.map(|_| false);
        }
        Ok(true)
    }
}
