//! gRPC wallet client over a mutually authenticated TLS channel.

use std::path::Path;

use async_trait::async_trait;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};

use super::rpc::wallet_service_client::WalletServiceClient;
use super::{
    rpc, AddressInfo, CommittedTicket, SignReply, SignRequest, TxOutput, WalletBackend, WalletError,
};
use crate::config::Config;

/// Production [`WalletBackend`] speaking the wallet's gRPC protocol.
///
/// The channel authenticates both ways: the wallet's certificate is the root
/// of trust and the client presents its own keypair.
#[derive(Debug, Clone)]
pub struct GrpcWallet {
    client: WalletServiceClient<Channel>,
}

impl GrpcWallet {
    /// Connect to the wallet configured in `config`.
    ///
    /// # Errors
    ///
    /// [`WalletError::Credentials`] when a TLS file cannot be read,
    /// [`WalletError::Host`] on a malformed host, and
    /// [`WalletError::Transport`] when the channel cannot be established.
    pub async fn connect(config: &Config) -> Result<Self, WalletError> {
        let ca = read_credential(&config.wallet_cert)?;
        let cert = read_credential(&config.client_cert)?;
        let key = read_credential(&config.client_key)?;

        let tls = ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(ca))
            .identity(Identity::from_pem(cert, key));

        let channel = Channel::from_shared(format!("https://{}", config.wallet_host))
            .map_err(|err| WalletError::Host(err.to_string()))?
            .tls_config(tls)?
            .connect()
            .await?;

        Ok(Self {
            client: WalletServiceClient::new(channel),
        })
    }

    fn decode_ticket(ticket: &str) -> Result<Vec<u8>, WalletError> {
        hex::decode(ticket).map_err(|_| WalletError::TicketHash(ticket.to_string()))
    }
}

fn read_credential(path: &Path) -> Result<Vec<u8>, WalletError> {
    std::fs::read(path).map_err(|source| WalletError::Credentials {
        path: path.to_path_buf(),
        source,
    })
}

#[async_trait]
impl WalletBackend for GrpcWallet {
    async fn current_block_height(&self) -> Result<u32, WalletError> {
        let reply = self
            .client
            .clone()
            .accounts(rpc::AccountsRequest {})
            .await?;
        Ok(reply.into_inner().current_block_height)
    }

    async fn committed_tickets(
        &self,
        tickets: &[String],
    ) -> Result<Vec<CommittedTicket>, WalletError> {
        let tickets = tickets
            .iter()
            .map(|ticket| Self::decode_ticket(ticket))
            .collect::<Result<Vec<_>, _>>()?;

        let reply = self
            .client
            .clone()
            .committed_tickets(rpc::CommittedTicketsRequest { tickets })
            .await?;

        Ok(reply
            .into_inner()
            .ticket_addresses
            .into_iter()
            .map(|entry| CommittedTicket {
                ticket: hex::encode(&entry.ticket),
                address: entry.address,
            })
            .collect())
    }

    async fn transaction_outputs(&self, ticket: &str) -> Result<Vec<TxOutput>, WalletError> {
        let reply = self
            .client
            .clone()
            .get_transaction(rpc::GetTransactionRequest {
                transaction_hash: Self::decode_ticket(ticket)?,
            })
            .await?;

        Ok(reply
            .into_inner()
            .outputs
            .into_iter()
            .map(|output| TxOutput {
                index: output.index,
                address: output.address,
            })
            .collect())
    }

    async fn validate_address(&self, address: &str) -> Result<AddressInfo, WalletError> {
        let reply = self
            .client
            .clone()
            .validate_address(rpc::ValidateAddressRequest {
                address: address.to_string(),
            })
            .await?;
        let reply = reply.into_inner();
        Ok(AddressInfo {
            is_valid: reply.is_valid,
            account_number: reply.account_number,
        })
    }

    async fn sign_messages(
        &self,
        passphrase: &[u8],
        requests: &[SignRequest],
    ) -> Result<Vec<SignReply>, WalletError> {
        let messages = requests
            .iter()
            .map(|request| rpc::sign_messages_request::Message {
                address: request.address.clone(),
                message: request.message.clone(),
            })
            .collect();

        let reply = self
            .client
            .clone()
            .sign_messages(rpc::SignMessagesRequest {
                passphrase: passphrase.to_vec(),
                messages,
            })
            .await?;

        Ok(reply
            .into_inner()
            .replies
            .into_iter()
            .map(|entry| SignReply {
                signature: entry.signature,
                error: entry.error,
            })
            .collect())
    }

    async fn verify_message(
        &self,
        address: &str,
        message: &str,
        signature: &[u8],
    ) -> Result<bool, WalletError> {
        let reply = self
            .client
            .clone()
            .verify_message(rpc::VerifyMessageRequest {
                address: address.to_string(),
                message: message.to_string(),
                signature: signature.to_vec(),
            })
            .await?;
        Ok(reply.into_inner().is_valid)
    }
}
