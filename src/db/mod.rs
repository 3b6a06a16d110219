//! Paper terminal persistence.
//!
//! Stores the simulated terminal's book so a restarted process sees the same
//! positions and orders, with the same comment tags, as a real terminal would:
//! - Account balance, equity and the ticket counter
//! - Open positions
//! - Working pending orders
//!
//! The replication core never reads this store; it recovers its mapping from
//! the restored book like from any terminal.

use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::broker::{AccountInfo, BrokerOrder, BrokerPosition, PaperBook};
use crate::models::OrderType;

/// SQLite store for a [`PaperBook`].
pub struct TerminalStore {
    pool: SqlitePool,
}

/// Stored account row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredAccount {
    pub id: i64,
    pub balance: String,
    pub equity: String,
    pub trade_allowed: bool,
    pub next_ticket: i64,
    pub updated_at: String,
}

/// Stored position record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredPosition {
    pub ticket: i64,
    pub symbol: String,
    pub order_type: String,
    pub volume: String,
    pub open_price: String,
    pub stop_loss: Option<String>,
    pub take_profit: Option<String>,
    pub magic: i64,
    pub comment: String,
    pub open_time: String,
}

/// Stored pending order record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredOrder {
    pub ticket: i64,
    pub symbol: String,
    pub order_type: String,
    pub volume: String,
    pub price: String,
    pub stop_loss: Option<String>,
    pub take_profit: Option<String>,
    pub magic: i64,
    pub comment: String,
    pub expiry: Option<String>,
    pub placed_at: String,
}

impl TerminalStore {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::connect(database_url, 5).await
    }

    /// Private in-memory database; one connection so every query sees it.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.run_migrations().await?;

        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        // Account and ticket counter
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS account (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                balance TEXT NOT NULL,
                equity TEXT NOT NULL,
                trade_allowed INTEGER NOT NULL DEFAULT 1,
                next_ticket INTEGER NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Open positions
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                ticket INTEGER PRIMARY KEY,
                symbol TEXT NOT NULL,
                order_type TEXT NOT NULL,
                volume TEXT NOT NULL,
                open_price TEXT NOT NULL,
                stop_loss TEXT,
                take_profit TEXT,
                magic INTEGER NOT NULL DEFAULT 0,
                comment TEXT NOT NULL DEFAULT '',
                open_time TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Working pending orders
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_orders (
                ticket INTEGER PRIMARY KEY,
                symbol TEXT NOT NULL,
                order_type TEXT NOT NULL,
                volume TEXT NOT NULL,
                price TEXT NOT NULL,
                stop_loss TEXT,
                take_profit TEXT,
                magic INTEGER NOT NULL DEFAULT 0,
                comment TEXT NOT NULL DEFAULT '',
                expiry TEXT,
                placed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Load the saved book, or `None` if nothing was ever saved.
    pub async fn load_book(&self) -> Result<Option<PaperBook>> {
        let Some(account) =
            sqlx::query_as::<_, StoredAccount>("SELECT * FROM account WHERE id = 1")
                .fetch_optional(&self.pool)
                .await
                .context("Failed to load account")?
        else {
            return Ok(None);
        };

        let positions = sqlx::query_as::<_, StoredPosition>(
            "SELECT * FROM positions ORDER BY ticket",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load positions")?;

        let orders = sqlx::query_as::<_, StoredOrder>(
            "SELECT * FROM pending_orders ORDER BY ticket",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load pending orders")?;

        Ok(Some(PaperBook {
            next_ticket: to_ticket(account.next_ticket)?,
            account: AccountInfo {
                balance: decimal(&account.balance)?,
                equity: decimal(&account.equity)?,
                trade_allowed: account.trade_allowed,
            },
            positions: positions
                .into_iter()
                .map(StoredPosition::into_position)
                .collect::<Result<_>>()?,
            orders: orders
                .into_iter()
                .map(StoredOrder::into_order)
                .collect::<Result<_>>()?,
        }))
    }

    /// Replace the saved book.
    pub async fn save_book(&self, book: &PaperBook) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO account (id, balance, equity, trade_allowed, next_ticket)
            VALUES (1, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                balance = excluded.balance,
                equity = excluded.equity,
                trade_allowed = excluded.trade_allowed,
                next_ticket = excluded.next_ticket,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(book.account.balance.to_string())
        .bind(book.account.equity.to_string())
        .bind(book.account.trade_allowed)
        .bind(from_ticket(book.next_ticket)?)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM positions").execute(&mut *tx).await?;
        for p in &book.positions {
            sqlx::query(
                r#"
                INSERT INTO positions
                    (ticket, symbol, order_type, volume, open_price, stop_loss,
                     take_profit, magic, comment, open_time)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(from_ticket(p.ticket)?)
            .bind(&p.symbol)
            .bind(p.order_type.as_str())
            .bind(p.volume.to_string())
            .bind(p.open_price.to_string())
            .bind(p.stop_loss.map(|v| v.to_string()))
            .bind(p.take_profit.map(|v| v.to_string()))
            .bind(p.magic)
            .bind(&p.comment)
            .bind(p.open_time.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM pending_orders").execute(&mut *tx).await?;
        for o in &book.orders {
            sqlx::query(
                r#"
                INSERT INTO pending_orders
                    (ticket, symbol, order_type, volume, price, stop_loss,
                     take_profit, magic, comment, expiry, placed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(from_ticket(o.ticket)?)
            .bind(&o.symbol)
            .bind(o.order_type.as_str())
            .bind(o.volume.to_string())
            .bind(o.price.to_string())
            .bind(o.stop_loss.map(|v| v.to_string()))
            .bind(o.take_profit.map(|v| v.to_string()))
            .bind(o.magic)
            .bind(&o.comment)
            .bind(o.expiry.map(|e| e.to_rfc3339()))
            .bind(o.placed_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await.context("Failed to save book")?;
        Ok(())
    }
}

impl StoredPosition {
    fn into_position(self) -> Result<BrokerPosition> {
        Ok(BrokerPosition {
            ticket: to_ticket(self.ticket)?,
            order_type: order_type(&self.order_type)?,
            volume: decimal(&self.volume)?,
            open_price: decimal(&self.open_price)?,
            stop_loss: self.stop_loss.as_deref().map(decimal).transpose()?,
            take_profit: self.take_profit.as_deref().map(decimal).transpose()?,
            open_time: timestamp(&self.open_time)?,
            symbol: self.symbol,
            magic: self.magic,
            comment: self.comment,
        })
    }
}

impl StoredOrder {
    fn into_order(self) -> Result<BrokerOrder> {
        Ok(BrokerOrder {
            ticket: to_ticket(self.ticket)?,
            order_type: order_type(&self.order_type)?,
            volume: decimal(&self.volume)?,
            price: decimal(&self.price)?,
            stop_loss: self.stop_loss.as_deref().map(decimal).transpose()?,
            take_profit: self.take_profit.as_deref().map(decimal).transpose()?,
            expiry: self.expiry.as_deref().map(timestamp).transpose()?,
            placed_at: timestamp(&self.placed_at)?,
            symbol: self.symbol,
            magic: self.magic,
            comment: self.comment,
        })
    }
}

fn decimal(value: &str) -> Result<Decimal> {
    Decimal::from_str(value).with_context(|| format!("Invalid decimal in store: {}", value))
}

fn timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp in store: {}", value))
}

fn order_type(value: &str) -> Result<OrderType> {
    OrderType::from_str(value).map_err(|e| anyhow!(e))
}

fn to_ticket(value: i64) -> Result<u64> {
    u64::try_from(value).with_context(|| format!("Negative ticket in store: {}", value))
}

fn from_ticket(value: u64) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("Ticket out of range: {}", value))
}
