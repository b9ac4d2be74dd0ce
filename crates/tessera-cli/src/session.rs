//! Connected session: governance client plus wallet, both verified live.

use anyhow::{Context, Result};
use tessera_core::wallet::{GrpcWallet, WalletBackend};
use tessera_core::{Config, GovernanceClient};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Everything a command needs to talk to the outside world.
pub struct Session {
    /// Merged configuration.
    pub config: Config,
    /// Governance server client.
    pub client: GovernanceClient,
    /// Wallet client.
    pub wallet: GrpcWallet,
    /// Server identity public key from first contact, hex.
    pub server_pub_key: String,
    /// Root cancellation token.
    pub cancel: CancellationToken,
}

impl Session {
    /// First contact: build the HTTP client, fetch the server's version and
    /// identity, connect the wallet, and verify the wallet answers.
    pub async fn connect(config: Config, cancel: CancellationToken) -> Result<Self> {
        let client =
            GovernanceClient::new(&config, cancel.clone()).context("build governance client")?;

        let version = client.version().await.context("fetch server version")?;
        debug!(version = version.version, route = %version.route, "server version");
        debug!(pub_key = %version.pub_key, "server identity");

        let wallet = GrpcWallet::connect(&config)
            .await
            .context("connect wallet")?;
        let height = wallet
            .current_block_height()
            .await
            .context("wallet liveness check")?;
        debug!(height, "wallet chain tip");

        Ok(Self {
            config,
            client,
            wallet,
            server_pub_key: version.pub_key,
            cancel,
        })
    }

    /// Wallet passphrase from config, or prompted from the terminal.
    /// Re-prompts until non-empty input.
    pub fn passphrase(&self) -> Result<Vec<u8>> {
        if let Some(passphrase) = &self.config.wallet_passphrase {
            return Ok(passphrase.clone().into_bytes());
        }

        loop {
            let pass = rpassword::prompt_password("Enter the private passphrase of your wallet: ")
                .context("read passphrase")?;
            let pass = pass.trim();
            if !pass.is_empty() {
                return Ok(pass.as_bytes().to_vec());
            }
        }
    }
}
