//! HTTP client for the governance server.
//!
//! All requests are JSON over HTTPS. Outcomes are split into three classes:
//! transport-level failures and unexpected statuses become [`RetryError`]s
//! that the engine queues for re-attempt, structured HTTP 400 bodies are
//! terminal, and HTTP 200 replies are returned to the caller even when the
//! receipt inside carries an application error code.

use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::api::{
    self, CastBallot, CastBallotReply, CastVoteReply, DetailsReply, Inventory, InventoryReply,
    ResultsReply, SummariesReply, UserErrorReply, VersionReply, VoteStatus, VoteSummary,
};
use crate::config::Config;

/// Responses are streamed into a buffer capped at this many bytes; anything
/// past the cap is discarded.
const MAX_RESPONSE_BYTES: usize = 4 * 1024 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// A transport-class failure that is safe to re-attempt.
///
/// The record is serialized into the failed journal as-is, so it doubles as
/// the on-disk shape of a failed attempt.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("retry error: {code} ({at}) {error}")]
pub struct RetryError {
    /// Where the failure was observed.
    pub at: String,
    /// HTTP status code, zero when the request never completed.
    pub code: u16,
    /// Response body, if one was read.
    #[serde(default)]
    pub body: String,
    /// Underlying error text.
    #[serde(default)]
    pub error: String,
    /// Whether this record closes the ticket for the run: a retry-budget
    /// eviction or an application-terminal receipt, as opposed to one failed
    /// attempt among several.
    #[serde(default)]
    pub terminal: bool,
}

impl RetryError {
    /// Failure before any HTTP status was received.
    #[must_use]
    pub fn transport(at: &str, error: impl ToString) -> Self {
        Self {
            at: at.to_string(),
            code: 0,
            body: String::new(),
            error: error.to_string(),
            terminal: false,
        }
    }

    /// Unexpected HTTP status.
    #[must_use]
    pub fn status(code: u16, body: &[u8]) -> Self {
        Self {
            at: "response status".to_string(),
            code,
            body: String::from_utf8_lossy(body).into_owned(),
            error: format!("unexpected status {code}"),
            terminal: false,
        }
    }

    /// Terminal record written when a vote's retry budget runs out.
    #[must_use]
    pub fn exhausted(attempts: u32) -> Self {
        Self {
            at: "retry queue".to_string(),
            code: 0,
            body: String::new(),
            error: format!("abandoned after {attempts} attempts"),
            terminal: true,
        }
    }

    /// Terminal record written when a receipt reports the voting window has
    /// closed.
    #[must_use]
    pub fn from_reply(reply: &CastVoteReply) -> Self {
        Self {
            at: "cast vote receipt".to_string(),
            code: 0,
            body: String::new(),
            error: format!("{}: {}", reply.error_code, reply.error_context),
            terminal: true,
        }
    }
}

/// Errors returned by [`GovernanceClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport-class failure; the engine queues the vote for retry.
    #[error(transparent)]
    Retry(#[from] RetryError),

    /// The server rejected the request as malformed. Retrying would fail the
    /// same way every time.
    #[error("server rejected request ({code}): {context}")]
    User {
        /// Server-declared error code.
        code: u32,
        /// Server-declared error context.
        context: String,
    },

    /// A reply body did not decode as the expected shape.
    #[error("decode {what}: {source}")]
    Decode {
        /// Which reply failed to decode.
        what: &'static str,
        /// Decoder error.
        #[source]
        source: serde_json::Error,
    },

    /// The HTTP client could not be constructed.
    #[error("build http client: {0}")]
    Build(#[source] reqwest::Error),

    /// A ballot handed to the single-vote submitter did not contain exactly
    /// one vote.
    #[error("ballot must contain exactly one vote, got {0}")]
    BallotShape(usize),

    /// The server answered a single-vote ballot with the wrong number of
    /// receipts.
    #[error("ballot reply carried {0} receipts, expected 1")]
    ReceiptShape(usize),

    /// A proposal the caller asked about does not exist on the server.
    #[error("proposal does not exist: {0}")]
    UnknownProposal(String),
}

/// Seam between the engine and the ballot route.
///
/// Production uses [`GovernanceClient`]; tests inject scripted submitters to
/// exercise the engine's failure handling.
#[async_trait]
pub trait BallotSubmitter: Send + Sync {
    /// Submit a single-vote ballot and return its receipt.
    async fn cast_ballot(&self, ballot: &CastBallot) -> Result<CastVoteReply, ClientError>;
}

/// JSON/HTTPS client for the governance server. Cheap to clone; clones
/// share the connection pool and cookie jar.
#[derive(Clone)]
pub struct GovernanceClient {
    http: reqwest::Client,
    base_url: String,
    cancel: CancellationToken,
}

impl GovernanceClient {
    /// Build a client from config.
    ///
    /// A cookie jar tracks session cookies across requests. When an outbound
    /// proxy is configured the connection pool keeps no idle connections, so
    /// every submission opens a fresh TCP connection instead of pinning all
    /// votes to one long-lived source port.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Build`] if the proxy URL is invalid or the TLS
    /// backend fails to initialize.
    pub fn new(config: &Config, cancel: CancellationToken) -> Result<Self, ClientError> {
        let mut builder = reqwest::Client::builder()
            .cookie_store(true)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .user_agent(format!("tessera/{}", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(config.skip_verify);

        if let Some(proxy) = &config.proxy {
            builder = builder
                .proxy(reqwest::Proxy::all(proxy).map_err(ClientError::Build)?)
                .pool_max_idle_per_host(0);
        }

        Ok(Self {
            http: builder.build().map_err(ClientError::Build)?,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            cancel,
        })
    }

    fn url(&self, api: &str, route: &str) -> String {
        format!("{}{api}{route}", self.base_url)
    }

    /// Run one request and classify the outcome.
    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<Vec<u8>, ClientError> {
        let response = tokio::select! {
            () = self.cancel.cancelled() => {
                return Err(RetryError::transport("request", "canceled").into());
            }
            result = request.send() => {
                result.map_err(|err| RetryError::transport("request", err))?
            }
        };

        let status = response.status();
        let body = read_bounded(response).await?;
        trace!(status = status.as_u16(), bytes = body.len(), "response");

        match status.as_u16() {
            200 => Ok(body),
            400 => {
                // Structured user errors are caused by this client and will
                // fail the same way on every retry. An unstructured 400 body
                // falls through to the caller's decoder.
                if let Ok(reply) = serde_json::from_slice::<UserErrorReply>(&body) {
                    if reply.error_code != 0 {
                        return Err(ClientError::User {
                            code: reply.error_code,
                            context: reply.error_context,
                        });
                    }
                }
                Ok(body)
            }
            code => Err(RetryError::status(code, &body).into()),
        }
    }

    async fn post<B: Serialize + Sync>(
        &self,
        api: &str,
        route: &str,
        body: &B,
    ) -> Result<Vec<u8>, ClientError> {
        let url = self.url(api, route);
        debug!(%url, "POST");
        self.execute(self.http.post(url).json(body)).await
    }

    async fn get(&self, api: &str, route: &str) -> Result<Vec<u8>, ClientError> {
        let url = self.url(api, route);
        debug!(%url, "GET");
        self.execute(self.http.get(url)).await
    }

    /// Fetch the server version and identity public key.
    ///
    /// # Errors
    ///
    /// Transport failures surface as [`ClientError::Retry`]; a malformed
    /// reply as [`ClientError::Decode`].
    pub async fn version(&self) -> Result<VersionReply, ClientError> {
        let body = self.get(api::WWW_API_ROUTE, api::ROUTE_VERSION).await?;
        decode("version reply", &body)
    }

    /// Fetch one inventory page.
    ///
    /// # Errors
    ///
    /// See [`GovernanceClient::version`].
    pub async fn inventory_page(&self, page: u32) -> Result<InventoryReply, ClientError> {
        let body = self
            .post(
                api::API_ROUTE,
                api::ROUTE_INVENTORY,
                &Inventory {
                    page,
                    status: VoteStatus::Started,
                },
            )
            .await?;
        decode("inventory reply", &body)
    }

    /// Fetch every proposal token currently under active vote, following the
    /// server's pagination until a short page.
    ///
    /// # Errors
    ///
    /// See [`GovernanceClient::version`].
    pub async fn active_votes(&self) -> Result<Vec<String>, ClientError> {
        let started = VoteStatus::Started.to_string();
        let mut tokens = Vec::new();
        let mut page = 1;
        loop {
            let reply = self.inventory_page(page).await?;
            let page_tokens = reply.vetted.get(&started).cloned().unwrap_or_default();
            let page_len = u32::try_from(page_tokens.len()).unwrap_or(u32::MAX);
            tokens.extend(page_tokens);
            if page_len < api::INVENTORY_PAGE_SIZE {
                break;
            }
            page += 1;
        }
        Ok(tokens)
    }

    /// Fetch vote details for a proposal.
    ///
    /// # Errors
    ///
    /// See [`GovernanceClient::version`].
    pub async fn details(&self, token: &str) -> Result<DetailsReply, ClientError> {
        let body = self
            .post(
                api::API_ROUTE,
                api::ROUTE_DETAILS,
                &api::Details {
                    token: token.to_string(),
                },
            )
            .await?;
        decode("details reply", &body)
    }

    /// Fetch all votes already cast on a proposal.
    ///
    /// # Errors
    ///
    /// See [`GovernanceClient::version`].
    pub async fn results(&self, token: &str) -> Result<ResultsReply, ClientError> {
        let body = self
            .post(
                api::API_ROUTE,
                api::ROUTE_RESULTS,
                &api::Results {
                    token: token.to_string(),
                },
            )
            .await?;
        decode("results reply", &body)
    }

    /// Fetch the vote summary for a single proposal.
    ///
    /// # Errors
    ///
    /// [`ClientError::UnknownProposal`] when the server has no summary for
    /// the token; otherwise see [`GovernanceClient::version`].
    pub async fn summary(&self, token: &str) -> Result<VoteSummary, ClientError> {
        let body = self
            .post(
                api::API_ROUTE,
                api::ROUTE_SUMMARIES,
                &api::Summaries {
                    tokens: vec![token.to_string()],
                },
            )
            .await?;
        let mut reply: SummariesReply = decode("summaries reply", &body)?;
        reply
            .summaries
            .remove(token)
            .ok_or_else(|| ClientError::UnknownProposal(token.to_string()))
    }

    /// Submit a whole ballot in one request. Used by the non-trickled bulk
    /// path; the engine goes through [`BallotSubmitter`] instead.
    ///
    /// # Errors
    ///
    /// See [`GovernanceClient::version`].
    pub async fn cast_ballot_bulk(
        &self,
        ballot: &CastBallot,
    ) -> Result<CastBallotReply, ClientError> {
        let body = self
            .post(api::API_ROUTE, api::ROUTE_CAST_BALLOT, ballot)
            .await?;
        decode("ballot reply", &body)
    }
}

#[async_trait]
impl BallotSubmitter for GovernanceClient {
    async fn cast_ballot(&self, ballot: &CastBallot) -> Result<CastVoteReply, ClientError> {
        if ballot.votes.len() != 1 {
            return Err(ClientError::BallotShape(ballot.votes.len()));
        }

        let reply = self.cast_ballot_bulk(ballot).await?;
        let mut receipts = reply.receipts;
        if receipts.len() != 1 {
            return Err(ClientError::ReceiptShape(receipts.len()));
        }
        Ok(receipts.remove(0))
    }
}

fn decode<T: DeserializeOwned>(what: &'static str, body: &[u8]) -> Result<T, ClientError> {
    serde_json::from_slice(body).map_err(|source| ClientError::Decode { what, source })
}

/// Stream a response body into a buffer capped at [`MAX_RESPONSE_BYTES`].
async fn read_bounded(mut response: reqwest::Response) -> Result<Vec<u8>, ClientError> {
    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|err| RetryError::transport("response body", err))?
    {
        let room = MAX_RESPONSE_BYTES - body.len();
        body.extend_from_slice(&chunk[..chunk.len().min(room)]);
        if body.len() == MAX_RESPONSE_BYTES {
            break;
        }
    }
    Ok(body)
}

/// Render a receipt line for operator output.
#[must_use]
pub fn receipt_line(reply: &CastVoteReply) -> String {
    let mut line = String::new();
    let _ = write!(line, "{} {}", reply.ticket, u32::from(reply.error_code));
    if !reply.error_context.is_empty() {
        let _ = write!(line, " ({})", reply.error_context);
    }
    line
}
