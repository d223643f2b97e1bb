use crate::{
    config::DatabaseConfig, model::*, AgentId, ListingId, MarketError, Result, TransactionId,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    Row, Sqlite, SqliteConnection, SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    role TEXT NOT NULL,
    public_key TEXT NOT NULL,
    wallet_address TEXT,
    policy TEXT NOT NULL,
    transaction_count INTEGER NOT NULL DEFAULT 0,
    volume TEXT NOT NULL DEFAULT '0',
    created_at DATETIME NOT NULL,
    updated_at DATETIME NOT NULL
);

CREATE TABLE IF NOT EXISTS listings (
    id TEXT PRIMARY KEY,
    seller_id TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    price TEXT NOT NULL,
    asset TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at DATETIME NOT NULL,
    updated_at DATETIME NOT NULL,
    FOREIGN KEY (seller_id) REFERENCES agents(id)
);

CREATE TABLE IF NOT EXISTS transactions (
    id TEXT PRIMARY KEY,
    buyer_id TEXT NOT NULL,
    seller_id TEXT NOT NULL,
    buyer_address TEXT NOT NULL,
    seller_address TEXT NOT NULL,
    listing_id TEXT NOT NULL,
    amount TEXT NOT NULL,
    asset TEXT NOT NULL,
    source_chain TEXT NOT NULL,
    destination_chain TEXT NOT NULL,
    status TEXT NOT NULL,
    settlement_ref TEXT NOT NULL UNIQUE,
    error TEXT,
    created_at DATETIME NOT NULL,
    updated_at DATETIME NOT NULL,
    FOREIGN KEY (buyer_id) REFERENCES agents(id),
    FOREIGN KEY (seller_id) REFERENCES agents(id),
    FOREIGN KEY (listing_id) REFERENCES listings(id)
);

CREATE TABLE IF NOT EXISTS proofs (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    method TEXT NOT NULL,
    signature TEXT NOT NULL,
    signer_id TEXT NOT NULL,
    policy_hash TEXT NOT NULL,
    issued_at INTEGER NOT NULL,
    transaction_id TEXT,
    created_at DATETIME NOT NULL,
    FOREIGN KEY (transaction_id) REFERENCES transactions(id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_transactions_one_pending
    ON transactions(buyer_id, listing_id) WHERE status = 'PENDING';
CREATE INDEX IF NOT EXISTS idx_transactions_status ON transactions(status);
CREATE INDEX IF NOT EXISTS idx_transactions_buyer ON transactions(buyer_id);
CREATE INDEX IF NOT EXISTS idx_listings_status ON listings(status);
CREATE INDEX IF NOT EXISTS idx_listings_seller ON listings(seller_id);
CREATE INDEX IF NOT EXISTS idx_proofs_transaction ON proofs(transaction_id);
"#;

const AGENT_COLUMNS: &str =
    "id, name, role, public_key, wallet_address, policy, transaction_count, volume, created_at, updated_at";
const LISTING_COLUMNS: &str =
    "id, seller_id, title, description, price, asset, status, created_at, updated_at";
const TRANSACTION_COLUMNS: &str = "id, buyer_id, seller_id, buyer_address, seller_address, listing_id, amount, asset, \
     source_chain, destination_chain, status, settlement_ref, error, created_at, updated_at";

/// Outcome of applying a terminal settlement status.
#[derive(Debug, Clone)]
pub enum SettlementApplied {
    Confirmed(Transaction),
    Failed(Transaction),
    AlreadyTerminal(Transaction),
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::connect(&DatabaseConfig {
            url: database_url.to_string(),
            ..DatabaseConfig::default()
        })
        .await
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(config.busy_timeout_seconds.unwrap_or(5)));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.unwrap_or(10))
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds.unwrap_or(30)))
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Starts a store transaction for the local phase of a purchase.
    pub async fn begin(&self) -> Result<StoreTx> {
        Ok(StoreTx {
            tx: self.pool.begin().await?,
        })
    }

    /// Fails with `InvalidParams` when the id is already registered.
    pub async fn create_agent(&self, agent: &Agent) -> Result<()> {
        let result = sqlx::query(&format!(
            "INSERT INTO agents ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            AGENT_COLUMNS
        ))
        .bind(agent.id.to_string())
        .bind(&agent.name)
        .bind(agent.role.as_str())
        .bind(&agent.public_key)
        .bind(&agent.wallet_address)
        .bind(serde_json::to_string(&agent.policy)?)
        .bind(agent.transaction_count)
        .bind(agent.volume.to_string())
        .bind(agent.created_at)
        .bind(agent.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => Err(MarketError::InvalidParams(
                format!("Agent {} is already registered", agent.id),
            )),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_agent(&self, agent_id: AgentId) -> Result<Option<Agent>> {
        let mut conn = self.pool.acquire().await?;
        fetch_agent(&mut conn, agent_id).await
    }

    pub async fn list_agents(&self) -> Result<Vec<Agent>> {
        let rows = sqlx::query(&format!("SELECT {} FROM agents ORDER BY created_at", AGENT_COLUMNS))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(agent_from_row).collect()
    }

    pub async fn update_policy(&self, agent_id: AgentId, policy: &Policy) -> Result<bool> {
        let result = sqlx::query("UPDATE agents SET policy = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(policy)?)
            .bind(Utc::now())
            .bind(agent_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn create_listing(&self, listing: &Listing) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO listings ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            LISTING_COLUMNS
        ))
        .bind(listing.id.to_string())
        .bind(listing.seller_id.to_string())
        .bind(&listing.title)
        .bind(&listing.description)
        .bind(listing.price.to_string())
        .bind(&listing.asset)
        .bind(listing.status.as_str())
        .bind(listing.created_at)
        .bind(listing.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_listing(&self, listing_id: ListingId) -> Result<Option<Listing>> {
        let mut conn = self.pool.acquire().await?;
        fetch_listing(&mut conn, listing_id).await
    }

    /// Case-insensitive substring match over title and description of
    /// available listings, newest first.
    pub async fn search_listings(
        &self,
        query: &str,
        max_price: Option<Decimal>,
        limit: usize,
    ) -> Result<Vec<Listing>> {
        let pattern = format!("%{}%", escape_like(query.trim()));
        let rows = sqlx::query(&format!(
            "SELECT {} FROM listings WHERE status = 'AVAILABLE' \
             AND (title LIKE ?1 ESCAPE '\\' OR description LIKE ?1 ESCAPE '\\') \
             ORDER BY created_at DESC",
            LISTING_COLUMNS
        ))
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;

        let mut listings = Vec::new();
        for row in &rows {
            let listing = listing_from_row(row)?;
            if max_price.map_or(true, |max| listing.price <= max) {
                listings.push(listing);
            }
            if listings.len() >= limit {
                break;
            }
        }
        Ok(listings)
    }

    pub async fn get_transaction(&self, transaction_id: TransactionId) -> Result<Option<Transaction>> {
        let mut conn = self.pool.acquire().await?;
        fetch_transaction(&mut conn, "id", &transaction_id.to_string()).await
    }

    pub async fn list_pending_transactions(&self, created_before: DateTime<Utc>) -> Result<Vec<Transaction>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM transactions WHERE status = 'PENDING' ORDER BY created_at",
            TRANSACTION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut pending = Vec::new();
        for row in &rows {
            let transaction = transaction_from_row(row)?;
            if transaction.created_at <= created_before {
                pending.push(transaction);
            }
        }
        Ok(pending)
    }

    pub async fn get_proofs_for_transaction(&self, transaction_id: TransactionId) -> Result<Vec<StoredProof>> {
        let rows = sqlx::query(
            r#"
            SELECT id, kind, agent_id, method, signature, signer_id, policy_hash, issued_at, transaction_id, created_at
            FROM proofs WHERE transaction_id = ? ORDER BY created_at
            "#,
        )
        .bind(transaction_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(proof_from_row).collect()
    }

    /// Records the provider's reference for a submitted transfer and
    /// reserves the listing. Returns `false` if the transaction is no
    /// longer pending.
    pub async fn record_submission(&self, transaction_id: TransactionId, settlement_ref: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE transactions SET settlement_ref = ?, updated_at = ? WHERE id = ? AND status = 'PENDING'",
        )
        .bind(settlement_ref)
        .bind(Utc::now())
        .bind(transaction_id.to_string())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            "UPDATE listings SET status = 'PENDING', updated_at = ? \
             WHERE id = (SELECT listing_id FROM transactions WHERE id = ?) AND status = 'AVAILABLE'",
        )
        .bind(Utc::now())
        .bind(transaction_id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Compensating write for a transfer that never settled. The listing
    /// is left alone because this transaction never reserved it.
    pub async fn mark_failed(&self, transaction_id: TransactionId, reason: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE transactions SET status = 'FAILED', error = ?, updated_at = ? WHERE id = ? AND status = 'PENDING'",
        )
        .bind(reason)
        .bind(Utc::now())
        .bind(transaction_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Applies a terminal settlement status keyed by provider reference.
    /// Returns `None` when no transaction carries the reference.
    pub async fn apply_settlement(
        &self,
        settlement_ref: &str,
        status: TransactionStatus,
        error: Option<&str>,
    ) -> Result<Option<SettlementApplied>> {
        if !status.is_terminal() {
            return Err(MarketError::Internal(format!(
                "Cannot apply non-terminal status {}",
                status
            )));
        }

        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let updated = sqlx::query(
            "UPDATE transactions SET status = ?, error = ?, updated_at = ? WHERE settlement_ref = ? AND status = 'PENDING'",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(now)
        .bind(settlement_ref)
        .execute(&mut *tx)
        .await?;

        let transaction = match fetch_transaction(&mut tx, "settlement_ref", settlement_ref).await? {
            Some(transaction) => transaction,
            None => return Ok(None),
        };

        if updated.rows_affected() == 0 {
            return Ok(Some(SettlementApplied::AlreadyTerminal(transaction)));
        }

        let applied = match status {
            TransactionStatus::Confirmed => {
                let sold = sqlx::query("UPDATE listings SET status = 'SOLD', updated_at = ? WHERE id = ? AND status != 'SOLD'")
                    .bind(now)
                    .bind(transaction.listing_id.to_string())
                    .execute(&mut *tx)
                    .await?;
                if sold.rows_affected() == 0 {
                    tracing::warn!(
                        transaction_id = %transaction.id,
                        listing_id = %transaction.listing_id,
                        "Settlement confirmed for a listing that was already sold"
                    );
                }

                for agent_id in [transaction.buyer_id, transaction.seller_id] {
                    record_volume(&mut tx, agent_id, transaction.amount, now).await?;
                }
                SettlementApplied::Confirmed(transaction)
            }
            _ => {
                sqlx::query("UPDATE listings SET status = 'AVAILABLE', updated_at = ? WHERE id = ? AND status = 'PENDING'")
                    .bind(now)
                    .bind(transaction.listing_id.to_string())
                    .execute(&mut *tx)
                    .await?;
                SettlementApplied::Failed(transaction)
            }
        };

        tx.commit().await?;
        Ok(Some(applied))
    }
}

/// One store transaction. Dropping it without `commit` rolls back.
pub struct StoreTx {
    tx: sqlx::Transaction<'static, Sqlite>,
}

impl StoreTx {
    /// Touches the listing row so the transaction holds the write lock
    /// before any of its reads.
    pub async fn lock_listing(&mut self, listing_id: ListingId) -> Result<()> {
        sqlx::query("UPDATE listings SET updated_at = updated_at WHERE id = ?")
            .bind(listing_id.to_string())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    pub async fn get_agent(&mut self, agent_id: AgentId) -> Result<Option<Agent>> {
        fetch_agent(&mut self.tx, agent_id).await
    }

    pub async fn get_listing(&mut self, listing_id: ListingId) -> Result<Option<Listing>> {
        fetch_listing(&mut self.tx, listing_id).await
    }

    pub async fn set_wallet_address(&mut self, agent_id: AgentId, address: &str) -> Result<()> {
        sqlx::query("UPDATE agents SET wallet_address = ?, updated_at = ? WHERE id = ?")
            .bind(address)
            .bind(Utc::now())
            .bind(agent_id.to_string())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    pub async fn find_pending_transaction(
        &mut self,
        buyer_id: AgentId,
        listing_id: ListingId,
    ) -> Result<Option<Transaction>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM transactions WHERE buyer_id = ? AND listing_id = ? AND status = 'PENDING'",
            TRANSACTION_COLUMNS
        ))
        .bind(buyer_id.to_string())
        .bind(listing_id.to_string())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(transaction_from_row).transpose()
    }

    /// Any buyer's in-flight transaction for the listing.
    pub async fn find_pending_for_listing(&mut self, listing_id: ListingId) -> Result<Option<Transaction>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM transactions WHERE listing_id = ? AND status = 'PENDING' LIMIT 1",
            TRANSACTION_COLUMNS
        ))
        .bind(listing_id.to_string())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(transaction_from_row).transpose()
    }

    /// Sum of the buyer's non-failed transaction amounts created at or
    /// after `since`.
    pub async fn spent_since(&mut self, buyer_id: AgentId, since: DateTime<Utc>) -> Result<Decimal> {
        let rows = sqlx::query(
            "SELECT amount, created_at FROM transactions WHERE buyer_id = ? AND status != 'FAILED'",
        )
        .bind(buyer_id.to_string())
        .fetch_all(&mut *self.tx)
        .await?;

        let mut total = Decimal::ZERO;
        for row in rows {
            let created_at: DateTime<Utc> = row.try_get("created_at")?;
            if created_at >= since {
                total += parse_decimal(&row.try_get::<String, _>("amount")?)?;
            }
        }
        Ok(total)
    }

    pub async fn insert_transaction(&mut self, transaction: &Transaction) -> Result<()> {
        let result = sqlx::query(&format!(
            "INSERT INTO transactions ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            TRANSACTION_COLUMNS
        ))
        .bind(transaction.id.to_string())
        .bind(transaction.buyer_id.to_string())
        .bind(transaction.seller_id.to_string())
        .bind(&transaction.buyer_address)
        .bind(&transaction.seller_address)
        .bind(transaction.listing_id.to_string())
        .bind(transaction.amount.to_string())
        .bind(&transaction.asset)
        .bind(&transaction.source_chain)
        .bind(&transaction.destination_chain)
        .bind(transaction.status.as_str())
        .bind(&transaction.settlement_ref)
        .bind(&transaction.error)
        .bind(transaction.created_at)
        .bind(transaction.updated_at)
        .execute(&mut *self.tx)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                Err(MarketError::DuplicatePurchase { transaction_id: None })
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn insert_proof(&mut self, proof: &StoredProof) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO proofs (id, kind, agent_id, method, signature, signer_id, policy_hash, issued_at, transaction_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(proof.id.to_string())
        .bind(proof.kind.as_str())
        .bind(proof.agent_id.to_string())
        .bind(&proof.method)
        .bind(&proof.proof.signature)
        .bind(&proof.proof.signer_id)
        .bind(&proof.proof.policy_hash)
        .bind(proof.proof.timestamp)
        .bind(proof.transaction_id.map(|id| id.to_string()))
        .bind(proof.created_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

async fn record_volume(conn: &mut SqliteConnection, agent_id: AgentId, amount: Decimal, now: DateTime<Utc>) -> Result<()> {
    let agent = fetch_agent(conn, agent_id)
        .await?
        .ok_or(MarketError::AgentNotFound(agent_id))?;

    sqlx::query("UPDATE agents SET transaction_count = transaction_count + 1, volume = ?, updated_at = ? WHERE id = ?")
        .bind((agent.volume + amount).to_string())
        .bind(now)
        .bind(agent_id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn fetch_agent(conn: &mut SqliteConnection, agent_id: AgentId) -> Result<Option<Agent>> {
    let row = sqlx::query(&format!("SELECT {} FROM agents WHERE id = ?", AGENT_COLUMNS))
        .bind(agent_id.to_string())
        .fetch_optional(&mut *conn)
        .await?;

    row.as_ref().map(agent_from_row).transpose()
}

async fn fetch_listing(conn: &mut SqliteConnection, listing_id: ListingId) -> Result<Option<Listing>> {
    let row = sqlx::query(&format!("SELECT {} FROM listings WHERE id = ?", LISTING_COLUMNS))
        .bind(listing_id.to_string())
        .fetch_optional(&mut *conn)
        .await?;

    row.as_ref().map(listing_from_row).transpose()
}

async fn fetch_transaction(conn: &mut SqliteConnection, column: &str, value: &str) -> Result<Option<Transaction>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM transactions WHERE {} = ?",
        TRANSACTION_COLUMNS, column
    ))
    .bind(value)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(transaction_from_row).transpose()
}

fn agent_from_row(row: &SqliteRow) -> Result<Agent> {
    Ok(Agent {
        id: parse_uuid(row, "id")?,
        name: row.try_get("name")?,
        role: row.try_get::<String, _>("role")?.parse()?,
        public_key: row.try_get("public_key")?,
        wallet_address: row.try_get("wallet_address")?,
        policy: serde_json::from_str(&row.try_get::<String, _>("policy")?)?,
        transaction_count: row.try_get("transaction_count")?,
        volume: parse_decimal(&row.try_get::<String, _>("volume")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn listing_from_row(row: &SqliteRow) -> Result<Listing> {
    Ok(Listing {
        id: parse_uuid(row, "id")?,
        seller_id: parse_uuid(row, "seller_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        price: parse_decimal(&row.try_get::<String, _>("price")?)?,
        asset: row.try_get("asset")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn transaction_from_row(row: &SqliteRow) -> Result<Transaction> {
    Ok(Transaction {
        id: parse_uuid(row, "id")?,
        buyer_id: parse_uuid(row, "buyer_id")?,
        seller_id: parse_uuid(row, "seller_id")?,
        buyer_address: row.try_get("buyer_address")?,
        seller_address: row.try_get("seller_address")?,
        listing_id: parse_uuid(row, "listing_id")?,
        amount: parse_decimal(&row.try_get::<String, _>("amount")?)?,
        asset: row.try_get("asset")?,
        source_chain: row.try_get("source_chain")?,
        destination_chain: row.try_get("destination_chain")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        settlement_ref: row.try_get("settlement_ref")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn proof_from_row(row: &SqliteRow) -> Result<StoredProof> {
    Ok(StoredProof {
        id: parse_uuid(row, "id")?,
        kind: row.try_get::<String, _>("kind")?.parse()?,
        agent_id: parse_uuid(row, "agent_id")?,
        method: row.try_get("method")?,
        proof: Proof {
            signature: row.try_get("signature")?,
            policy_hash: row.try_get("policy_hash")?,
            signer_id: row.try_get("signer_id")?,
            timestamp: row.try_get("issued_at")?,
        },
        transaction_id: row
            .try_get::<Option<String>, _>("transaction_id")?
            .map(|s| Uuid::parse_str(&s))
            .transpose()?,
        created_at: row.try_get("created_at")?,
    })
}

fn parse_uuid(row: &SqliteRow, column: &str) -> Result<Uuid> {
    Ok(Uuid::parse_str(&row.try_get::<String, _>(column)?)?)
}

fn parse_decimal(value: &str) -> Result<Decimal> {
    Ok(Decimal::from_str(value)?)
}

fn escape_like(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len());
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
