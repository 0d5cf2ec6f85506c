//! The shadow channel directory.
//!
//! We have no real channel per user, so invoices advertise a routing hint through a channel
//! that does not exist. The hint's short channel id is an 8-byte random token packed into the
//! block/transaction/output coordinates; while the invoice is claimable the token maps to a
//! [`ShadowChannelData`] record in the ephemeral store telling the interceptor who to credit
//! and with which preimage to resolve the HTLC.

use serde::{Deserialize, Serialize};

use bitcoin::hex::DisplayHex;
use rand::RngCore;

use std::sync::Arc;
use std::time::Duration;

use crate::ephemeral::EphemeralStore;
use crate::{AccountId, Origin, Preimage};

/// Everything needed to settle an incoming HTLC that claims to come through a shadow channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShadowChannelData {
	/// The account credited when the invoice settles.
	pub user_id: AccountId,
	/// The owner's front end, carried through to the notification.
	pub origin: Origin,
	/// Front-end message to reply to, if any.
	#[serde(skip_serializing_if = "Option::is_none", default)]
	pub trigger_message: Option<i64>,
	/// Ledger tag for the credit.
	#[serde(skip_serializing_if = "Option::is_none", default)]
	pub tag: Option<String>,
	/// The invoiced amount. Settlement accepts anything in `[msat, 2 * msat]`.
	pub msat: u64,
	/// Invoice description.
	#[serde(skip_serializing_if = "Option::is_none", default)]
	pub description: Option<String>,
	/// Hash of an out-of-band description, when the invoice commits to one instead.
	#[serde(skip_serializing_if = "Option::is_none", default)]
	pub description_hash: Option<String>,
	/// The preimage the interceptor resolves the HTLC with.
	pub preimage: Preimage,
	/// Free-form payer comment, e.g. from an lnurl-pay flow.
	#[serde(skip_serializing_if = "Option::is_none", default)]
	pub comment: Option<String>,
}

/// The random token identifying a shadow channel record.
///
/// Packs reversibly into a short channel id: 24 bits of block height, 24 bits of transaction
/// index and 16 bits of output index make up the 64-bit scid, so any token survives the trip
/// through an invoice hint and back out of an onion payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowToken([u8; 8]);

impl ShadowToken {
	fn random() -> ShadowToken {
		let mut bytes = [0u8; 8];
		rand::thread_rng().fill_bytes(&mut bytes);
		ShadowToken(bytes)
	}

	/// The token packed as a short channel id.
	pub fn to_scid(&self) -> u64 {
		let b = &self.0;
		let block = u64::from(b[0]) << 16 | u64::from(b[1]) << 8 | u64::from(b[2]);
		let tx = u64::from(b[3]) << 16 | u64::from(b[4]) << 8 | u64::from(b[5]);
		let output = u64::from(b[6]) << 8 | u64::from(b[7]);
		block << 40 | tx << 16 | output
	}

	/// Recovers the token from a short channel id.
	pub fn from_scid(scid: u64) -> ShadowToken {
		let block = scid >> 40 & 0xff_ffff;
		let tx = scid >> 16 & 0xff_ffff;
		let output = scid & 0xffff;
		ShadowToken([
			(block >> 16) as u8,
			(block >> 8) as u8,
			block as u8,
			(tx >> 16) as u8,
			(tx >> 8) as u8,
			tx as u8,
			(output >> 8) as u8,
			output as u8,
		])
	}

	fn storage_key(&self) -> String {
		format!("shadow:{}", self.0.to_lower_hex_string())
	}
}

/// Formats a short channel id in the `block x tx x output` text form daemons use on the wire.
pub fn format_scid(scid: u64) -> String {
	format!("{}x{}x{}", scid >> 40 & 0xff_ffff, scid >> 16 & 0xff_ffff, scid & 0xffff)
}

/// Parses the `BxTxO` text form of a short channel id.
pub fn parse_scid(s: &str) -> Option<u64> {
	let mut parts = s.split('x');
	let block: u64 = parts.next()?.parse().ok()?;
	let tx: u64 = parts.next()?.parse().ok()?;
	let output: u64 = parts.next()?.parse().ok()?;
	if parts.next().is_some() || block > 0xff_ffff || tx > 0xff_ffff || output > 0xffff {
		return None;
	}
	Some(block << 40 | tx << 16 | output)
}

/// Directory of live shadow channel records, keyed by token.
pub struct ShadowDirectory {
	store: Arc<EphemeralStore>,
	ttl: Duration,
}

impl ShadowDirectory {
	/// A directory storing its records in `store` for `ttl` each.
	pub fn new(store: Arc<EphemeralStore>, ttl: Duration) -> ShadowDirectory {
		ShadowDirectory { store, ttl }
	}

	/// Registers a record under a fresh random token.
	pub fn create(&self, data: &ShadowChannelData) -> ShadowToken {
		let token = ShadowToken::random();
		let blob = serde_json::to_vec(data).expect("shadow data always serializes");
		self.store.set(&token.storage_key(), blob, self.ttl);
		token
	}

	/// The record for `token`, if it exists and has not expired.
	pub fn lookup(&self, token: &ShadowToken) -> Option<ShadowChannelData> {
		let blob = self.store.get(&token.storage_key())?;
		match serde_json::from_slice(&blob) {
			Ok(data) => Some(data),
			Err(e) => {
				log::error!("corrupt shadow record under {}: {e}", token.storage_key());
				None
			},
		}
	}

	/// Drops the record for `token`, making the invoice unclaimable.
	pub fn delete(&self, token: &ShadowToken) {
		self.store.delete(&token.storage_key());
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_data() -> ShadowChannelData {
		ShadowChannelData {
			user_id: 42,
			origin: Origin::Telegram,
			trigger_message: Some(1001),
			tag: None,
			msat: 150_000,
			description: Some("coffee".to_owned()),
			description_hash: None,
			preimage: Preimage([3u8; 32]),
			comment: None,
		}
	}

	#[test]
	fn token_survives_scid_packing() {
		for _ in 0..32 {
			let token = ShadowToken::random();
			assert_eq!(token, ShadowToken::from_scid(token.to_scid()));
		}
	}

	#[test]
	fn scid_field_boundaries() {
		let token = ShadowToken([0xff; 8]);
		let scid = token.to_scid();
		assert_eq!(scid, u64::MAX);
		assert_eq!(format_scid(scid), "16777215x16777215x65535");

		let token = ShadowToken([0, 0, 1, 0, 0, 2, 0, 3]);
		assert_eq!(format_scid(token.to_scid()), "1x2x3");
	}

	#[test]
	fn scid_text_form_round_trips() {
		assert_eq!(parse_scid("1x2x3"), Some(1u64 << 40 | 2 << 16 | 3));
		assert_eq!(parse_scid(&format_scid(987_654_321)), Some(987_654_321));
		assert_eq!(parse_scid("0x0x0"), Some(0));
		assert_eq!(parse_scid("1x2"), None);
		assert_eq!(parse_scid("1x2x3x4"), None);
		assert_eq!(parse_scid("axbxc"), None);
		assert_eq!(parse_scid("16777216x0x0"), None);
	}

	#[test]
	fn create_lookup_delete() {
		let dir = ShadowDirectory::new(Arc::new(EphemeralStore::new()), Duration::from_secs(60));
		let data = sample_data();
		let token = dir.create(&data);
		assert_eq!(dir.lookup(&token), Some(data));
		dir.delete(&token);
		assert_eq!(dir.lookup(&token), None);
	}

	#[test]
	fn unknown_token_is_none() {
		let dir = ShadowDirectory::new(Arc::new(EphemeralStore::new()), Duration::from_secs(60));
		assert_eq!(dir.lookup(&ShadowToken([9u8; 8])), None);
	}
}
