//! The double-entry ledger.
//!
//! Everything users own is a row in one SQLite database. A transaction debits `from_id` and
//! credits `to_id`; either side may be absent for funds entering or leaving the hub. Balances
//! are always derived by summation, never stored, so the books cannot drift.
//!
//! Admission control is insert-then-check: the debit row is inserted, the payer's balance is
//! re-read inside the same database transaction, and a negative result rolls the whole thing
//! back. SQLite's single-writer serialization is what makes two concurrent spends of the same
//! balance impossible.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension, ToSql, params};

use std::fmt;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{AccountId, Origin, PaymentHash, Preimage, StorageConfig};

/// The clearing account proxied transfers pass through. Its balance must be exactly zero after
/// every committed transaction.
pub const PROXY_ACCOUNT: AccountId = 0;

/// Balances above this get the usable-balance haircut.
const HAIRCUT_FLOOR_MSAT: i64 = 1_000_000_000;

/// Descriptions longer than this come back truncated from history listings.
const DESCRIPTION_LIMIT: u32 = 85;

const MIGRATION: &str = "
CREATE TABLE IF NOT EXISTS account (
	id INTEGER PRIMARY KEY,
	origin TEXT NOT NULL,
	origin_id TEXT NOT NULL,
	username TEXT,
	locale TEXT NOT NULL DEFAULT 'en',
	UNIQUE (origin, origin_id)
);

INSERT OR IGNORE INTO account (id, origin, origin_id, username) VALUES (0, 'system', 'proxy', 'proxy');

CREATE TABLE IF NOT EXISTS tx (
	time INTEGER NOT NULL,
	from_id INTEGER REFERENCES account (id),
	to_id INTEGER REFERENCES account (id),
	amount_msat INTEGER NOT NULL CHECK (amount_msat > 0),
	fees_msat INTEGER NOT NULL DEFAULT 0,
	description TEXT,
	payment_hash TEXT NOT NULL UNIQUE,
	preimage TEXT,
	pending INTEGER NOT NULL DEFAULT 0,
	tag TEXT,
	trigger_message INTEGER,
	proxied_with TEXT,
	CHECK (from_id IS NOT NULL OR to_id IS NOT NULL)
);

CREATE INDEX IF NOT EXISTS tx_from ON tx (from_id);
CREATE INDEX IF NOT EXISTS tx_to ON tx (to_id);

CREATE VIEW IF NOT EXISTS account_txn AS
	SELECT tx.rowid AS txid, time, from_id AS account_id, -amount_msat AS amount_msat,
		fees_msat, description, payment_hash, preimage, pending, tag, trigger_message
	FROM tx WHERE from_id IS NOT NULL
	UNION ALL
	SELECT tx.rowid AS txid, time, to_id AS account_id, amount_msat,
		0, description, payment_hash, preimage, pending, tag, trigger_message
	FROM tx WHERE to_id IS NOT NULL;
";

/// Errors which may occur while touching the ledger.
#[derive(Debug)]
pub enum LedgerError {
	/// The debited account cannot cover the transaction. Nothing was written.
	InsufficientBalance {
		/// How much was missing, in millisatoshi.
		missing_msat: u64,
	},
	/// A transaction with this payment hash already exists.
	PaymentInFlight,
	/// A proxied transfer would have left the clearing account with a nonzero balance.
	/// Nothing was written.
	ProxyImbalance {
		/// The balance the clearing account would have ended up with.
		balance_msat: i64,
	},
	/// The database itself failed.
	Database(rusqlite::Error),
}

impl fmt::Display for LedgerError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			LedgerError::InsufficientBalance { missing_msat } => {
				write!(f, "insufficient balance, {missing_msat} msat missing")
			},
			LedgerError::PaymentInFlight => {
				f.write_str("a payment with this hash is already on the books")
			},
			LedgerError::ProxyImbalance { balance_msat } => {
				write!(f, "proxy account would be left with {balance_msat} msat, rolled back")
			},
			LedgerError::Database(e) => write!(f, "database error: {e}"),
		}
	}
}

impl std::error::Error for LedgerError {}

impl From<rusqlite::Error> for LedgerError {
	fn from(e: rusqlite::Error) -> LedgerError {
		LedgerError::Database(e)
	}
}

impl ToSql for PaymentHash {
	fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
		Ok(ToSqlOutput::from(self.to_string()))
	}
}

impl FromSql for PaymentHash {
	fn column_result(value: ValueRef<'_>) -> FromSqlResult<PaymentHash> {
		value.as_str()?.parse().map_err(|_| FromSqlError::InvalidType)
	}
}

impl ToSql for Preimage {
	fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
		Ok(ToSqlOutput::from(self.to_string()))
	}
}

impl FromSql for Preimage {
	fn column_result(value: ValueRef<'_>) -> FromSqlResult<Preimage> {
		value.as_str()?.parse().map_err(|_| FromSqlError::InvalidType)
	}
}

impl ToSql for Origin {
	fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
		Ok(ToSqlOutput::from(self.as_str()))
	}
}

impl FromSql for Origin {
	fn column_result(value: ValueRef<'_>) -> FromSqlResult<Origin> {
		Origin::from_db(value.as_str()?).ok_or(FromSqlError::InvalidType)
	}
}

/// An account row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
	/// Ledger id.
	pub id: AccountId,
	/// The front end the owner lives on.
	pub origin: Origin,
	/// The owner's identifier within that front end.
	pub origin_id: String,
	/// Display name, refreshed on every `ensure_account`.
	pub username: Option<String>,
	/// BCP 47 language tag for notifications.
	pub locale: String,
}

/// A single ledger transaction to record.
#[derive(Debug, Clone)]
pub struct Transfer {
	/// Debited account, absent when funds enter the hub.
	pub from: Option<AccountId>,
	/// Credited account, absent when funds leave the hub.
	pub to: Option<AccountId>,
	/// Positive amount moved, in millisatoshi.
	pub amount_msat: u64,
	/// Fees reserved against the debited account on top of the amount. Replaced by the actual
	/// fee when the payment settles.
	pub fee_reserve_msat: u64,
	/// Human-readable description.
	pub description: Option<String>,
	/// Payment hash, unique across the ledger.
	pub payment_hash: PaymentHash,
	/// Grouping tag, e.g. an app name.
	pub tag: Option<String>,
	/// Whether the transaction is awaiting settlement.
	pub pending: bool,
	/// Front-end message that caused this transaction, if any.
	pub trigger_message: Option<i64>,
}

/// A transfer routed through the proxy clearing account as two linked legs.
#[derive(Debug, Clone)]
pub struct ProxyTransfer {
	/// Debited account.
	pub payer: AccountId,
	/// Credited account.
	pub payee: AccountId,
	/// Positive amount moved, in millisatoshi. Accumulates on repeated hashes.
	pub amount_msat: u64,
	/// Hash of the payer-to-proxy leg.
	pub source_hash: PaymentHash,
	/// Hash of the proxy-to-payee leg.
	pub target_hash: PaymentHash,
	/// Description shown to the payer.
	pub source_description: Option<String>,
	/// Description shown to the payee.
	pub target_description: Option<String>,
	/// Grouping tag applied to both legs.
	pub tag: Option<String>,
	/// Whether the payee leg awaits a later settlement step.
	pub pending: bool,
	/// Front-end message on the payer side, if any.
	pub source_trigger: Option<i64>,
	/// Front-end message on the payee side, if any.
	pub target_trigger: Option<i64>,
}

/// What a settle call resolved, for notification purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settled {
	/// The debited account, when the settled row had one.
	pub account: Option<AccountId>,
	/// Front-end message recorded on the row.
	pub trigger_message: Option<i64>,
}

/// Which side of an account's history to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
	/// Only credits.
	In,
	/// Only debits.
	Out,
	/// Everything.
	Both,
}

/// One row of an account's history, amounts signed from the account's point of view.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
	/// Unix seconds.
	pub time: i64,
	/// Signed amount: positive for credits, negative for debits.
	pub amount_msat: i64,
	/// Fees charged on top, nonzero only on debits.
	pub fees_msat: i64,
	/// Description, truncated server-side for display.
	pub description: Option<String>,
	/// Payment hash.
	pub payment_hash: PaymentHash,
	/// Preimage, once known.
	pub preimage: Option<Preimage>,
	/// Whether the row still awaits settlement.
	pub pending: bool,
	/// Grouping tag.
	pub tag: Option<String>,
}

pub(crate) struct Ledger {
	conn: Mutex<Connection>,
}

fn now_unix() -> i64 {
	match SystemTime::now().duration_since(UNIX_EPOCH) {
		Ok(d) => d.as_secs() as i64,
		Err(_) => 0,
	}
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
	matches!(e, rusqlite::Error::SqliteFailure(f, _)
		if f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE)
}

fn balance_in(conn: &Connection, account: AccountId) -> rusqlite::Result<i64> {
	conn.query_row(
		"SELECT coalesce(sum(amount_msat), 0) - coalesce(sum(fees_msat), 0)
		 FROM account_txn WHERE account_id = ?1",
		params![account],
		|row| row.get(0),
	)
}

impl Ledger {
	pub(crate) fn open(storage: &StorageConfig) -> Result<Ledger, LedgerError> {
		let conn = match storage {
			StorageConfig::LocalSqlite(path) => Connection::open(path)?,
			StorageConfig::InMemory => Connection::open_in_memory()?,
		};
		conn.execute_batch("PRAGMA foreign_keys = ON;")?;
		conn.execute_batch(MIGRATION)?;
		Ok(Ledger { conn: Mutex::new(conn) })
	}

	pub(crate) fn ensure_account(
		&self, origin: Origin, origin_id: &str, username: Option<&str>,
	) -> Result<Account, LedgerError> {
		let conn = self.conn.lock().unwrap();
		let account = conn.query_row(
			"INSERT INTO account (origin, origin_id, username) VALUES (?1, ?2, ?3)
			 ON CONFLICT (origin, origin_id) DO UPDATE SET
				username = coalesce(excluded.username, account.username)
			 RETURNING id, origin, origin_id, username, locale",
			params![origin, origin_id, username],
			row_to_account,
		)?;
		Ok(account)
	}

	pub(crate) fn get_account(&self, id: AccountId) -> Result<Option<Account>, LedgerError> {
		let conn = self.conn.lock().unwrap();
		let account = conn
			.query_row(
				"SELECT id, origin, origin_id, username, locale FROM account WHERE id = ?1",
				params![id],
				row_to_account,
			)
			.optional()?;
		Ok(account)
	}

	/// Records one transaction, refusing it if the debited account cannot cover it.
	pub(crate) fn record_transaction(&self, t: &Transfer) -> Result<(), LedgerError> {
		let mut conn = self.conn.lock().unwrap();
		let dbtx = conn.transaction()?;

		let inserted = dbtx.execute(
			"INSERT INTO tx (time, from_id, to_id, amount_msat, fees_msat, description,
				payment_hash, tag, pending, trigger_message)
			 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
			params![
				now_unix(),
				t.from,
				t.to,
				t.amount_msat as i64,
				t.fee_reserve_msat as i64,
				t.description,
				t.payment_hash,
				t.tag,
				t.pending,
				t.trigger_message,
			],
		);
		match inserted {
			Ok(_) => {},
			Err(e) if is_unique_violation(&e) => return Err(LedgerError::PaymentInFlight),
			Err(e) => return Err(e.into()),
		}

		if let Some(from) = t.from {
			let balance = balance_in(&dbtx, from)?;
			if balance < 0 {
				// Dropping the transaction rolls the insert back.
				return Err(LedgerError::InsufficientBalance { missing_msat: -balance as u64 });
			}
		}

		dbtx.commit()?;
		Ok(())
	}

	/// Marks a pending transaction as settled, recording the actual fee and the preimage.
	/// Already-settled or unknown hashes are a no-op returning `None`.
	pub(crate) fn settle_success(
		&self, hash: PaymentHash, fees_msat: u64, preimage: Preimage,
	) -> Result<Option<Settled>, LedgerError> {
		let conn = self.conn.lock().unwrap();
		let settled = conn
			.query_row(
				"UPDATE tx SET pending = 0, fees_msat = ?2, preimage = ?3
				 WHERE payment_hash = ?1 AND pending
				 RETURNING from_id, trigger_message",
				params![hash, fees_msat as i64, preimage],
				|row| Ok(Settled { account: row.get(0)?, trigger_message: row.get(1)? }),
			)
			.optional()?;
		Ok(settled)
	}

	/// Returns a failed outbound payment's funds by deleting its pending row. Only rows with
	/// no credited side qualify; settled rows and internal transfers are untouchable, so a
	/// stale failure callback after a success is a no-op returning `None`.
	pub(crate) fn settle_failure(
		&self, hash: PaymentHash,
	) -> Result<Option<Settled>, LedgerError> {
		let conn = self.conn.lock().unwrap();
		let settled = conn
			.query_row(
				"DELETE FROM tx
				 WHERE payment_hash = ?1 AND pending AND to_id IS NULL
				 RETURNING from_id, trigger_message",
				params![hash],
				|row| Ok(Settled { account: row.get(0)?, trigger_message: row.get(1)? }),
			)
			.optional()?;
		Ok(settled)
	}

	/// Credits an incoming payment. Upserts by payment hash so that a credit racing an
	/// internal pending row lands on the same row instead of conflicting.
	pub(crate) fn credit_incoming(
		&self, to: AccountId, amount_msat: u64, description: Option<&str>, hash: PaymentHash,
		preimage: Preimage, tag: Option<&str>,
	) -> Result<(), LedgerError> {
		let conn = self.conn.lock().unwrap();
		conn.execute(
			"INSERT INTO tx (time, to_id, amount_msat, description, payment_hash, preimage, tag)
			 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
			 ON CONFLICT (payment_hash) DO UPDATE SET to_id = excluded.to_id",
			params![now_unix(), to, amount_msat as i64, description, hash, preimage, tag],
		)?;
		Ok(())
	}

	/// Moves funds through the proxy clearing account as two legs in one transaction.
	/// Re-sending with the same hashes accumulates amounts on the existing legs.
	pub(crate) fn proxy_transfer(&self, p: &ProxyTransfer) -> Result<(), LedgerError> {
		let mut conn = self.conn.lock().unwrap();
		let dbtx = conn.transaction()?;
		let now = now_unix();

		dbtx.execute(
			"INSERT INTO tx (time, from_id, to_id, amount_msat, description, payment_hash,
				tag, pending, trigger_message)
			 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)
			 ON CONFLICT (payment_hash) DO UPDATE SET
				amount_msat = tx.amount_msat + excluded.amount_msat,
				description = excluded.description,
				tag = excluded.tag,
				trigger_message = excluded.trigger_message",
			params![
				now,
				p.payer,
				PROXY_ACCOUNT,
				p.amount_msat as i64,
				p.source_description,
				p.source_hash,
				p.tag,
				p.source_trigger,
			],
		)?;
		dbtx.execute(
			"INSERT INTO tx (time, from_id, to_id, amount_msat, description, payment_hash,
				tag, pending, trigger_message, proxied_with)
			 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
			 ON CONFLICT (payment_hash) DO UPDATE SET
				amount_msat = tx.amount_msat + excluded.amount_msat,
				description = excluded.description,
				tag = excluded.tag,
				trigger_message = excluded.trigger_message",
			params![
				now,
				PROXY_ACCOUNT,
				p.payee,
				p.amount_msat as i64,
				p.target_description,
				p.target_hash,
				p.tag,
				p.pending,
				p.target_trigger,
				p.source_hash,
			],
		)?;

		let payer_balance = balance_in(&dbtx, p.payer)?;
		if payer_balance < 0 {
			return Err(LedgerError::InsufficientBalance { missing_msat: -payer_balance as u64 });
		}
		let proxy_balance = balance_in(&dbtx, PROXY_ACCOUNT)?;
		if proxy_balance != 0 {
			return Err(LedgerError::ProxyImbalance { balance_msat: proxy_balance });
		}

		dbtx.commit()?;
		Ok(())
	}

	pub(crate) fn get_balance(&self, account: AccountId) -> Result<i64, LedgerError> {
		let conn = self.conn.lock().unwrap();
		Ok(balance_in(&conn, account)?)
	}

	pub(crate) fn usable_balance(&self, account: AccountId) -> Result<i64, LedgerError> {
		let balance = self.get_balance(account)?;
		if balance > HAIRCUT_FLOOR_MSAT { Ok(balance - balance / 100) } else { Ok(balance) }
	}

	pub(crate) fn tagged_balances(
		&self, account: AccountId,
	) -> Result<Vec<(String, i64)>, LedgerError> {
		let conn = self.conn.lock().unwrap();
		let mut stmt = conn.prepare(
			"SELECT tag, sum(amount_msat) - sum(fees_msat) FROM account_txn
			 WHERE account_id = ?1 AND tag IS NOT NULL GROUP BY tag ORDER BY tag",
		)?;
		let rows = stmt.query_map(params![account], |row| Ok((row.get(0)?, row.get(1)?)))?;
		Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
	}

	pub(crate) fn list_transactions(
		&self, account: AccountId, limit: u32, offset: u32, direction: Direction,
		tag: Option<&str>,
	) -> Result<Vec<LedgerEntry>, LedgerError> {
		let direction_clause = match direction {
			Direction::In => "AND amount_msat > 0",
			Direction::Out => "AND amount_msat < 0",
			Direction::Both => "",
		};
		let tag_clause = if tag.is_some() { "AND tag = ?4" } else { "" };
		let query = format!(
			"SELECT time, amount_msat, fees_msat,
				CASE WHEN length(coalesce(description, '')) <= {limit}
					THEN description
					ELSE substr(description, 1, {limit} - 1) || '…' END,
				payment_hash, preimage, pending, tag
			 FROM account_txn
			 WHERE account_id = ?1 {direction_clause} {tag_clause}
			 ORDER BY time DESC, txid DESC LIMIT ?2 OFFSET ?3",
			limit = DESCRIPTION_LIMIT,
		);

		let conn = self.conn.lock().unwrap();
		let mut stmt = conn.prepare(&query)?;
		let map = |row: &rusqlite::Row| {
			Ok(LedgerEntry {
				time: row.get(0)?,
				amount_msat: row.get(1)?,
				fees_msat: row.get(2)?,
				description: row.get(3)?,
				payment_hash: row.get(4)?,
				preimage: row.get(5)?,
				pending: row.get(6)?,
				tag: row.get(7)?,
			})
		};
		let rows = match tag {
			Some(tag) => stmt.query_map(params![account, limit, offset, tag], map)?,
			None => stmt.query_map(params![account, limit, offset], map)?,
		};
		Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
	}
}

fn row_to_account(row: &rusqlite::Row) -> rusqlite::Result<Account> {
	Ok(Account {
		id: row.get(0)?,
		origin: row.get(1)?,
		origin_id: row.get(2)?,
		username: row.get(3)?,
		locale: row.get(4)?,
	})
}
