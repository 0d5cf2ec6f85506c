//! A builder for convenient construction of a [`Hub`].

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::daemon::DynLightningRpc;
use crate::logging::LoggerType;
use crate::notifier::DynNotifier;
use crate::{Hub, HubConfig, InitFailure, StorageConfig};

/// Errors which may occur when building a [`Hub`].
#[derive(Debug)]
pub enum BuildError {
	/// No [`LightningRpc`](crate::LightningRpc) was provided.
	MissingRpc,
	/// No [`Notifier`](crate::Notifier) was provided.
	MissingNotifier,
	/// Construction itself failed.
	Init(InitFailure),
}

impl fmt::Display for BuildError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			BuildError::MissingRpc => f.write_str("a LightningRpc implementation is required"),
			BuildError::MissingNotifier => f.write_str("a Notifier implementation is required"),
			BuildError::Init(e) => write!(f, "{e}"),
		}
	}
}

impl std::error::Error for BuildError {}

impl From<InitFailure> for BuildError {
	fn from(e: InitFailure) -> BuildError {
		BuildError::Init(e)
	}
}

/// A builder for a [`Hub`]. Call the setters you need, then [`HubBuilder::build`] from within
/// a tokio runtime.
pub struct HubBuilder {
	config: HubConfig,
	rpc: Option<Arc<DynLightningRpc>>,
	notifier: Option<Arc<DynNotifier>>,
}

impl Default for HubBuilder {
	fn default() -> HubBuilder {
		HubBuilder::new()
	}
}

impl HubBuilder {
	/// A builder with default configuration.
	pub fn new() -> HubBuilder {
		HubBuilder { config: HubConfig::default(), rpc: None, notifier: None }
	}

	/// Puts the ledger database at the given path.
	pub fn with_sqlite_path(mut self, path: PathBuf) -> HubBuilder {
		self.config.storage = StorageConfig::LocalSqlite(path);
		self
	}

	/// Keeps the ledger in memory. Intended for tests.
	pub fn with_in_memory_ledger(mut self) -> HubBuilder {
		self.config.storage = StorageConfig::InMemory;
		self
	}

	/// Sets the secret behind per-user invoice hint keys.
	pub fn with_key_secret(mut self, secret: String) -> HubBuilder {
		self.config.key_secret = secret;
		self
	}

	/// Sets the default invoice expiry.
	pub fn with_invoice_expiry(mut self, expiry: Duration) -> HubBuilder {
		self.config.invoice_expiry = expiry;
		self
	}

	/// Sets how long shadow channel records live.
	pub fn with_shadow_ttl(mut self, ttl: Duration) -> HubBuilder {
		self.config.shadow_ttl = ttl;
		self
	}

	/// Sets the ceiling on a single `pay` RPC.
	pub fn with_pay_timeout(mut self, timeout: Duration) -> HubBuilder {
		self.config.pay_timeout = timeout;
		self
	}

	/// Sets where log output goes.
	pub fn with_logger(mut self, logger: LoggerType) -> HubBuilder {
		self.config.logger = logger;
		self
	}

	/// Sets the Lightning daemon to settle against.
	pub fn with_lightning_rpc(mut self, rpc: Arc<DynLightningRpc>) -> HubBuilder {
		self.rpc = Some(rpc);
		self
	}

	/// Sets where settlement events are delivered.
	pub fn with_notifier(mut self, notifier: Arc<DynNotifier>) -> HubBuilder {
		self.notifier = Some(notifier);
		self
	}

	/// Builds the [`Hub`], spawning its settlement worker onto the current runtime.
	pub fn build(self) -> Result<Hub, BuildError> {
		let rpc = self.rpc.ok_or(BuildError::MissingRpc)?;
		let notifier = self.notifier.ok_or(BuildError::MissingNotifier)?;
		Ok(Hub::new(self.config, rpc, notifier)?)
	}
}
