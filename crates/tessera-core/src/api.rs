//! Wire types for the governance server's JSON API.
//!
//! The server speaks JSON over HTTPS. Only the fields this client consumes
//! are modeled; unknown fields are ignored on decode.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Route prefix of the versioned www API.
pub const WWW_API_ROUTE: &str = "/v1";
/// Version route, served under [`WWW_API_ROUTE`].
pub const ROUTE_VERSION: &str = "/version";

/// Route prefix of the ticket vote API.
pub const API_ROUTE: &str = "/ticketvote/v1";
/// Inventory route, served under [`API_ROUTE`].
pub const ROUTE_INVENTORY: &str = "/inventory";
/// Vote details route.
pub const ROUTE_DETAILS: &str = "/details";
/// Cast vote results route.
pub const ROUTE_RESULTS: &str = "/results";
/// Vote summaries route.
pub const ROUTE_SUMMARIES: &str = "/summaries";
/// Ballot submission route.
pub const ROUTE_CAST_BALLOT: &str = "/castballot";

/// Page size the server declares for the paginated inventory route.
pub const INVENTORY_PAGE_SIZE: u32 = 20;

/// Status of a proposal vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum VoteStatus {
    /// Status is not known.
    Invalid,
    /// Voting has not been authorized yet.
    Unauthorized,
    /// Voting has been authorized but not started.
    Authorized,
    /// Voting is in progress.
    Started,
    /// Voting ended; the outcome has not been decided yet.
    Finished,
    /// Voting ended; the proposal was approved.
    Approved,
    /// Voting ended; the proposal was rejected.
    Rejected,
    /// The proposal is not eligible for voting.
    Ineligible,
    /// A status code this client does not know about.
    Other(u32),
}

impl From<u32> for VoteStatus {
    fn from(code: u32) -> Self {
        match code {
            0 => Self::Invalid,
            1 => Self::Unauthorized,
            2 => Self::Authorized,
            3 => Self::Started,
            4 => Self::Finished,
            5 => Self::Approved,
            6 => Self::Rejected,
            7 => Self::Ineligible,
            other => Self::Other(other),
        }
    }
}

impl From<VoteStatus> for u32 {
    fn from(status: VoteStatus) -> Self {
        match status {
            VoteStatus::Invalid => 0,
            VoteStatus::Unauthorized => 1,
            VoteStatus::Authorized => 2,
            VoteStatus::Started => 3,
            VoteStatus::Finished => 4,
            VoteStatus::Approved => 5,
            VoteStatus::Rejected => 6,
            VoteStatus::Ineligible => 7,
            VoteStatus::Other(other) => other,
        }
    }
}

impl fmt::Display for VoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Invalid => "invalid",
            Self::Unauthorized => "unauthorized",
            Self::Authorized => "authorized",
            Self::Started => "started",
            Self::Finished => "finished",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Ineligible => "ineligible",
            Self::Other(code) => return write!(f, "unknown({code})"),
        };
        f.write_str(label)
    }
}

/// Application-level error code carried on a cast vote receipt.
///
/// A receipt with [`VoteError::Ok`] is a plain success. Every other code is
/// reported back to the operator; [`VoteError::StatusInvalid`] additionally
/// ends the engine run, since it means the voting window has closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum VoteError {
    /// No error; the vote was recorded.
    #[default]
    Ok,
    /// Server-side internal error.
    Internal,
    /// The proposal token was malformed.
    TokenInvalid,
    /// No record found for the token.
    RecordNotFound,
    /// The ballot voted on multiple records.
    MultipleRecordVotes,
    /// The vote is not active; the voting window has closed.
    StatusInvalid,
    /// The vote bit is not one of the declared options.
    BitInvalid,
    /// The vote signature did not verify.
    SignatureInvalid,
    /// The ticket is not in the eligible set.
    TicketNotEligible,
    /// The ticket has already voted.
    TicketAlreadyVoted,
    /// An error code this client does not know about.
    Other(u32),
}

impl From<u32> for VoteError {
    fn from(code: u32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::Internal,
            2 => Self::TokenInvalid,
            3 => Self::RecordNotFound,
            4 => Self::MultipleRecordVotes,
            5 => Self::StatusInvalid,
            6 => Self::BitInvalid,
            7 => Self::SignatureInvalid,
            8 => Self::TicketNotEligible,
            9 => Self::TicketAlreadyVoted,
            other => Self::Other(other),
        }
    }
}

impl From<VoteError> for u32 {
    fn from(code: VoteError) -> Self {
        match code {
            VoteError::Ok => 0,
            VoteError::Internal => 1,
            VoteError::TokenInvalid => 2,
            VoteError::RecordNotFound => 3,
            VoteError::MultipleRecordVotes => 4,
            VoteError::StatusInvalid => 5,
            VoteError::BitInvalid => 6,
            VoteError::SignatureInvalid => 7,
            VoteError::TicketNotEligible => 8,
            VoteError::TicketAlreadyVoted => 9,
            VoteError::Other(other) => other,
        }
    }
}

impl fmt::Display for VoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Ok => "ok",
            Self::Internal => "internal error",
            Self::TokenInvalid => "token invalid",
            Self::RecordNotFound => "record not found",
            Self::MultipleRecordVotes => "multiple record votes",
            Self::StatusInvalid => "vote status invalid",
            Self::BitInvalid => "vote bit invalid",
            Self::SignatureInvalid => "signature invalid",
            Self::TicketNotEligible => "ticket not eligible",
            Self::TicketAlreadyVoted => "ticket already voted",
            Self::Other(code) => return write!(f, "unknown({code})"),
        };
        f.write_str(label)
    }
}

/// A single signed vote for one ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastVote {
    /// Proposal token, hex.
    pub token: String,
    /// Ticket hash, hex.
    pub ticket: String,
    /// Chosen option bit, hex-encoded unsigned integer.
    #[serde(rename = "votebit")]
    pub vote_bit: String,
    /// Signature over `token || ticket || votebit`, hex.
    pub signature: String,
}

impl CastVote {
    /// A vote is valid iff all fields are non-empty and the vote bit matches
    /// one of the proposal's declared options.
    #[must_use]
    pub fn is_valid(&self, options: &[VoteOption]) -> bool {
        if self.token.is_empty()
            || self.ticket.is_empty()
            || self.vote_bit.is_empty()
            || self.signature.is_empty()
        {
            return false;
        }
        let Ok(bit) = u64::from_str_radix(&self.vote_bit, 16) else {
            return false;
        };
        options.iter().any(|option| option.bit == bit)
    }
}

/// Ballot of votes submitted in one request. The trickle engine always
/// submits single-vote ballots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CastBallot {
    /// Votes in the ballot.
    pub votes: Vec<CastVote>,
}

/// Per-vote receipt returned by the ballot route.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CastVoteReply {
    /// Ticket hash, hex.
    pub ticket: String,
    /// Application-level outcome code.
    #[serde(rename = "errorcode", default)]
    pub error_code: VoteError,
    /// Human-readable error context, empty on success.
    #[serde(rename = "errorcontext", default)]
    pub error_context: String,
    /// Server signature of the cast vote, hex.
    #[serde(default)]
    pub receipt: String,
}

/// Reply to a ballot submission, one receipt per submitted vote.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CastBallotReply {
    /// Receipts in submission order.
    pub receipts: Vec<CastVoteReply>,
}

/// Structured body of an HTTP 400 reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserErrorReply {
    /// Error code; zero means the body was not a structured user error.
    #[serde(rename = "errorcode", default)]
    pub error_code: u32,
    /// Human-readable error context.
    #[serde(rename = "errorcontext", default)]
    pub error_context: String,
}

/// Reply to the version route.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionReply {
    /// API version.
    pub version: u32,
    /// Route prefix the server serves this API under.
    #[serde(default)]
    pub route: String,
    /// Server identity public key, hex.
    #[serde(rename = "pubkey")]
    pub pub_key: String,
}

/// Inventory request. The route is paginated.
#[derive(Debug, Clone, Serialize)]
pub struct Inventory {
    /// Page number, starting at 1.
    pub page: u32,
    /// Restrict the inventory to one vote status.
    pub status: VoteStatus,
}

/// Reply to the inventory route.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InventoryReply {
    /// Proposal tokens grouped by vote status label.
    #[serde(default)]
    pub vetted: HashMap<String, Vec<String>>,
    /// Chain tip at reply time.
    #[serde(rename = "bestblock", default)]
    pub best_block: u32,
}

/// A declared vote option.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteOption {
    /// Option identifier, e.g. `yes`.
    pub id: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Bit used in the cast vote for this option.
    pub bit: u64,
}

/// Vote parameters of a proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteParams {
    /// Proposal token, hex.
    pub token: String,
    /// Mask of all valid vote bits.
    #[serde(default)]
    pub mask: u64,
    /// Declared options.
    pub options: Vec<VoteOption>,
}

/// Vote details of a proposal.
#[derive(Debug, Clone, Deserialize)]
pub struct VoteDetails {
    /// Vote parameters.
    pub params: VoteParams,
    /// Tickets eligible to vote, hex hashes.
    #[serde(rename = "eligibletickets", default)]
    pub eligible_tickets: Vec<String>,
    /// Block height the voting window opened at.
    #[serde(rename = "startblockheight", default)]
    pub start_block_height: u32,
    /// Block height the voting window closes at.
    #[serde(rename = "endblockheight", default)]
    pub end_block_height: u32,
}

/// Details request.
#[derive(Debug, Clone, Serialize)]
pub struct Details {
    /// Proposal token, hex.
    pub token: String,
}

/// Reply to the details route.
#[derive(Debug, Clone, Deserialize)]
pub struct DetailsReply {
    /// Vote details.
    pub vote: VoteDetails,
}

/// A vote the server has already recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CastVoteDetails {
    /// Proposal token, hex.
    pub token: String,
    /// Ticket hash, hex.
    pub ticket: String,
    /// Vote bit, hex.
    #[serde(rename = "votebit")]
    pub vote_bit: String,
    /// Client signature, hex.
    #[serde(default)]
    pub signature: String,
    /// Server receipt, hex.
    #[serde(default)]
    pub receipt: String,
}

/// Results request.
#[derive(Debug, Clone, Serialize)]
pub struct Results {
    /// Proposal token, hex.
    pub token: String,
}

/// Reply to the results route: all votes cast so far.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultsReply {
    /// Recorded votes.
    #[serde(default)]
    pub votes: Vec<CastVoteDetails>,
}

/// Summaries request.
#[derive(Debug, Clone, Serialize)]
pub struct Summaries {
    /// Proposal tokens to summarize.
    pub tokens: Vec<String>,
}

/// Per-proposal vote summary.
#[derive(Debug, Clone, Deserialize)]
pub struct VoteSummary {
    /// Current vote status.
    pub status: VoteStatus,
    /// Chain tip at reply time.
    #[serde(rename = "bestblock", default)]
    pub best_block: u32,
    /// Block height the voting window closes at.
    #[serde(rename = "endblockheight", default)]
    pub end_block_height: u32,
}

/// Reply to the summaries route.
#[derive(Debug, Clone, Deserialize)]
pub struct SummariesReply {
    /// Summaries keyed by proposal token.
    #[serde(default)]
    pub summaries: HashMap<String, VoteSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_error_round_trips_unknown_codes() {
        assert_eq!(VoteError::from(5), VoteError::StatusInvalid);
        assert_eq!(u32::from(VoteError::StatusInvalid), 5);
        assert_eq!(VoteError::from(42), VoteError::Other(42));
        assert_eq!(u32::from(VoteError::Other(42)), 42);
    }

    #[test]
    fn cast_vote_reply_decodes_wire_names() {
        let reply: CastVoteReply = serde_json::from_str(
            r#"{"ticket":"ab","errorcode":5,"errorcontext":"vote has ended","receipt":""}"#,
        )
        .expect("decode reply");
        assert_eq!(reply.error_code, VoteError::StatusInvalid);
        assert_eq!(reply.error_context, "vote has ended");
    }

    #[test]
    fn cast_vote_validity_requires_declared_bit() {
        let options = vec![
            VoteOption {
                id: "yes".to_string(),
                description: String::new(),
                bit: 1,
            },
            VoteOption {
                id: "no".to_string(),
                description: String::new(),
                bit: 2,
            },
        ];
        let mut vote = CastVote {
            token: "aa".to_string(),
            ticket: "bb".to_string(),
            vote_bit: "1".to_string(),
            signature: "cc".to_string(),
        };
        assert!(vote.is_valid(&options));

        vote.vote_bit = "4".to_string();
        assert!(!vote.is_valid(&options));

        vote.vote_bit = "1".to_string();
        vote.signature = String::new();
        assert!(!vote.is_valid(&options));
    }
}
