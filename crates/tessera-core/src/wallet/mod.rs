//! Ticket wallet integration.
//!
//! The wallet is the only party holding the ticket keys, so the vote flow
//! leans on it throughout: narrowing the server-declared eligible ticket set
//! down to tickets this wallet actually controls, checking the signatures of
//! votes the server claims were already cast, and batch-signing the vote
//! messages. Everything engine-side talks to the [`WalletBackend`] trait;
//! [`grpc::GrpcWallet`] is the production implementation.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::error;

use crate::api::CastVoteDetails;

pub mod grpc;

pub use grpc::GrpcWallet;

/// Generated wallet RPC bindings.
#[allow(missing_docs, clippy::all, clippy::pedantic)]
pub mod rpc {
    tonic::include_proto!("walletrpc");
}

/// Account number the wallet assigns to imported extended public keys.
/// Tickets tracked by such accounts cannot be signed and are dropped from
/// the eligible set.
pub const IMPORTED_ACCOUNT_NUMBER: u32 = (1 << 31) - 1;

/// Output index of the ticket's stake commitment, whose address carries the
/// vote signing key.
pub const COMMITMENT_OUTPUT_INDEX: u32 = 1;

/// Wallet errors.
#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    /// The gRPC channel could not be established.
    #[error("wallet transport: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// An RPC failed.
    #[error("wallet rpc: {0}")]
    Rpc(#[from] tonic::Status),

    /// TLS credential files could not be read.
    #[error("read wallet credentials {path}: {source}")]
    Credentials {
        /// Credential file that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The wallet host did not form a valid URI.
    #[error("invalid wallet host: {0}")]
    Host(String),

    /// A ticket hash was not valid hex.
    #[error("invalid ticket hash: {0}")]
    TicketHash(String),

    /// The wallet refused to sign one of the vote messages.
    #[error("signature failed for {address}: {reason}")]
    Sign {
        /// Commitment address that failed to sign.
        address: String,
        /// Wallet-reported reason.
        reason: String,
    },
}

/// A ticket the wallet holds the commitment key for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedTicket {
    /// Ticket hash, hex.
    pub ticket: String,
    /// Commitment address used to sign this ticket's vote.
    pub address: String,
}

/// A decoded transaction output.
#[derive(Debug, Clone)]
pub struct TxOutput {
    /// Output index within the transaction.
    pub index: u32,
    /// Decoded destination address.
    pub address: String,
}

/// Resolution of an address to its owning wallet account.
#[derive(Debug, Clone, Copy)]
pub struct AddressInfo {
    /// Whether the wallet considers the address valid.
    pub is_valid: bool,
    /// Owning account number.
    pub account_number: u32,
}

/// One message-signing request.
#[derive(Debug, Clone)]
pub struct SignRequest {
    /// Address whose key signs the message.
    pub address: String,
    /// Message to sign.
    pub message: String,
}

/// One signing reply. `error` is empty on success.
#[derive(Debug, Clone)]
pub struct SignReply {
    /// Signature bytes.
    pub signature: Vec<u8>,
    /// Wallet-reported failure, empty on success.
    pub error: String,
}

/// The wallet operations this client consumes.
#[async_trait]
pub trait WalletBackend: Send + Sync {
    /// Wallet's current chain tip. Doubles as the connection liveness check.
    async fn current_block_height(&self) -> Result<u32, WalletError>;

    /// Narrow `tickets` (hex hashes) to the tickets this wallet can sign
    /// for, with their commitment addresses.
    async fn committed_tickets(
        &self,
        tickets: &[String],
    ) -> Result<Vec<CommittedTicket>, WalletError>;

    /// Decoded outputs of a wallet-known transaction.
    async fn transaction_outputs(&self, ticket: &str) -> Result<Vec<TxOutput>, WalletError>;

    /// Resolve an address to its owning account.
    async fn validate_address(&self, address: &str) -> Result<AddressInfo, WalletError>;

    /// Batch-sign vote messages. The passphrase unlocks the wallet for the
    /// duration of the call.
    async fn sign_messages(
        &self,
        passphrase: &[u8],
        requests: &[SignRequest],
    ) -> Result<Vec<SignReply>, WalletError>;

    /// Check a message signature against the given address's key.
    async fn verify_message(
        &self,
        address: &str,
        message: &str,
        signature: &[u8],
    ) -> Result<bool, WalletError>;
}

/// The message a ticket signs to vote: `token || ticket || vote_bit`.
#[must_use]
pub fn vote_message(token: &str, ticket: &str, vote_bit: &str) -> String {
    format!("{token}{ticket}{vote_bit}")
}

/// Filter committed tickets down to the votable set.
///
/// Drops tickets tracked by imported-xpub accounts (their commitment
/// address resolves to [`IMPORTED_ACCOUNT_NUMBER`]) and tickets whose vote
/// the server already recorded with a signature that verifies against the
/// commitment address. A recorded vote whose signature does NOT verify is
/// resubmitted: it means bad data on the server, or a server lying to the
/// client. Per-ticket wallet failures are logged and drop only that ticket,
/// matching the inventory flow where one bad ticket must not sink the rest.
pub async fn eligible_tickets(
    wallet: &dyn WalletBackend,
    committed: Vec<CommittedTicket>,
    cast: &HashMap<String, CastVoteDetails>,
) -> Vec<CommittedTicket> {
    let mut eligible = Vec::with_capacity(committed.len());
    for ticket in committed {
        let outputs = match wallet.transaction_outputs(&ticket.ticket).await {
            Ok(outputs) => outputs,
            Err(err) => {
                error!(ticket = %ticket.ticket, %err, "fetch ticket transaction");
                continue;
            }
        };
        let Some(commitment) = outputs
            .iter()
            .find(|output| output.index == COMMITMENT_OUTPUT_INDEX)
        else {
            error!(ticket = %ticket.ticket, "ticket has no commitment output");
            continue;
        };
        let info = match wallet.validate_address(&commitment.address).await {
            Ok(info) => info,
            Err(err) => {
                error!(ticket = %ticket.ticket, %err, "validate commitment address");
                continue;
            }
        };
        if info.account_number >= IMPORTED_ACCOUNT_NUMBER {
            continue;
        }

        if let Some(recorded) = cast.get(&ticket.ticket) {
            match recorded_vote_verifies(wallet, &commitment.address, recorded).await {
                Ok(true) => continue,
                Ok(false) => {
                    error!(
                        ticket = %ticket.ticket,
                        "recorded vote signature is invalid, resubmitting"
                    );
                }
                Err(err) => {
                    error!(ticket = %ticket.ticket, %err, "verify recorded vote signature");
                    continue;
                }
            }
        }
        eligible.push(ticket);
    }
    eligible
}

/// Whether a server-recorded vote carries a signature that verifies against
/// the ticket's commitment address.
async fn recorded_vote_verifies(
    wallet: &dyn WalletBackend,
    address: &str,
    recorded: &CastVoteDetails,
) -> Result<bool, WalletError> {
    if recorded.signature.is_empty() {
        return Ok(false);
    }
    let Ok(signature) = hex::decode(&recorded.signature) else {
        return Ok(false);
    };
    let message = vote_message(&recorded.token, &recorded.ticket, &recorded.vote_bit);
    wallet.verify_message(address, &message, &signature).await
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    /// Signature the fake wallet accepts as verifying.
    const GOOD_SIGNATURE: &str = "0102";

    #[derive(Default)]
    struct FakeWallet {
        outputs: HashMap<String, Vec<TxOutput>>,
        accounts: HashMap<String, u32>,
        broken: HashSet<String>,
    }

    impl FakeWallet {
        fn with_ticket(mut self, ticket: &str, address: &str, account: u32) -> Self {
            self.outputs.insert(
                ticket.to_string(),
                vec![
                    TxOutput {
                        index: 0,
                        address: format!("{address}-payout"),
                    },
                    TxOutput {
                        index: 1,
                        address: address.to_string(),
                    },
                ],
            );
            self.accounts.insert(address.to_string(), account);
            self
        }
    }

    #[async_trait]
    impl WalletBackend for FakeWallet {
        async fn current_block_height(&self) -> Result<u32, WalletError> {
            Ok(0)
        }

        async fn committed_tickets(
            &self,
            _tickets: &[String],
        ) -> Result<Vec<CommittedTicket>, WalletError> {
            Ok(Vec::new())
        }

        async fn transaction_outputs(&self, ticket: &str) -> Result<Vec<TxOutput>, WalletError> {
            if self.broken.contains(ticket) {
                return Err(WalletError::TicketHash(ticket.to_string()));
            }
            Ok(self.outputs.get(ticket).cloned().unwrap_or_default())
        }

        async fn validate_address(&self, address: &str) -> Result<AddressInfo, WalletError> {
            Ok(AddressInfo {
                is_valid: true,
                account_number: self.accounts.get(address).copied().unwrap_or(0),
            })
        }

        async fn sign_messages(
            &self,
            _passphrase: &[u8],
            requests: &[SignRequest],
        ) -> Result<Vec<SignReply>, WalletError> {
            Ok(requests
                .iter()
                .map(|_| SignReply {
                    signature: vec![1, 2, 3],
                    error: String::new(),
                })
                .collect())
        }

        async fn verify_message(
            &self,
            _address: &str,
            _message: &str,
            signature: &[u8],
        ) -> Result<bool, WalletError> {
            Ok(hex::encode(signature) == GOOD_SIGNATURE)
        }
    }

    fn committed(ticket: &str, address: &str) -> CommittedTicket {
        CommittedTicket {
            ticket: ticket.to_string(),
            address: address.to_string(),
        }
    }

    fn recorded_vote(ticket: &str, signature: &str) -> (String, CastVoteDetails) {
        (
            ticket.to_string(),
            CastVoteDetails {
                token: "ab".repeat(16),
                ticket: ticket.to_string(),
                vote_bit: "1".to_string(),
                signature: signature.to_string(),
                receipt: String::new(),
            },
        )
    }

    #[tokio::test]
    async fn imported_xpub_tickets_are_dropped() {
        let wallet = FakeWallet::default()
            .with_ticket("aa01", "addr-live", 0)
            .with_ticket("aa02", "addr-xpub", IMPORTED_ACCOUNT_NUMBER);

        let eligible = eligible_tickets(
            &wallet,
            vec![
                committed("aa01", "addr-live"),
                committed("aa02", "addr-xpub"),
            ],
            &HashMap::new(),
        )
        .await;

        assert_eq!(eligible, vec![committed("aa01", "addr-live")]);
    }

    #[tokio::test]
    async fn validly_cast_tickets_are_dropped() {
        let wallet = FakeWallet::default()
            .with_ticket("aa01", "addr-1", 0)
            .with_ticket("aa02", "addr-2", 1);
        let cast: HashMap<_, _> = [recorded_vote("aa01", GOOD_SIGNATURE)].into();

        let eligible = eligible_tickets(
            &wallet,
            vec![committed("aa01", "addr-1"), committed("aa02", "addr-2")],
            &cast,
        )
        .await;

        assert_eq!(eligible, vec![committed("aa02", "addr-2")]);
    }

    #[tokio::test]
    async fn cast_ticket_with_invalid_signature_stays_eligible() {
        let wallet = FakeWallet::default()
            .with_ticket("aa01", "addr-1", 0)
            .with_ticket("aa02", "addr-2", 1);
        // The server's recorded vote for aa01 does not verify; the ticket
        // must be resubmitted. aa02's recorded vote is fine.
        let cast: HashMap<_, _> = [
            recorded_vote("aa01", "ffff"),
            recorded_vote("aa02", GOOD_SIGNATURE),
        ]
        .into();

        let eligible = eligible_tickets(
            &wallet,
            vec![committed("aa01", "addr-1"), committed("aa02", "addr-2")],
            &cast,
        )
        .await;

        assert_eq!(eligible, vec![committed("aa01", "addr-1")]);
    }

    #[tokio::test]
    async fn cast_ticket_with_unparseable_signature_stays_eligible() {
        let wallet = FakeWallet::default().with_ticket("aa01", "addr-1", 0);
        let empty: HashMap<_, _> = [recorded_vote("aa01", "")].into();
        let garbage: HashMap<_, _> = [recorded_vote("aa01", "not hex")].into();

        for cast in [empty, garbage] {
            let eligible =
                eligible_tickets(&wallet, vec![committed("aa01", "addr-1")], &cast).await;
            assert_eq!(eligible, vec![committed("aa01", "addr-1")]);
        }
    }

    #[tokio::test]
    async fn wallet_failure_drops_only_that_ticket() {
        let mut wallet = FakeWallet::default().with_ticket("aa02", "addr-2", 0);
        wallet.broken.insert("aa01".to_string());

        let eligible = eligible_tickets(
            &wallet,
            vec![committed("aa01", "addr-1"), committed("aa02", "addr-2")],
            &HashMap::new(),
        )
        .await;

        assert_eq!(eligible, vec![committed("aa02", "addr-2")]);
    }

    #[test]
    fn vote_message_concatenates_in_order() {
        assert_eq!(vote_message("tok", "tix", "1"), "toktix1");
    }
}
