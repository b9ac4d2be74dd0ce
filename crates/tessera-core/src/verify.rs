//! Post-hoc reconciliation of vote journals against authoritative results.
//!
//! The journals say what this client believes happened; the server's results
//! are ground truth. Reconciliation walks every ticket the work journal
//! names and classifies it from both views. A corrupt journal file is
//! reported and skipped; the remaining files still produce a report.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use crate::journal::{
    self, FailedTuple, SuccessTuple, WorkTuple, FAILED_PREFIX, RESULTS_CACHE, SUCCESS_PREFIX,
    WORK_PREFIX,
};

/// Verification errors. Per-file decode problems are tolerated and end up in
/// the report instead.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// The vote directory could not be read.
    #[error("read vote directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a ticket counts as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FailReason {
    /// Every attempt errored.
    Error,
    /// The ticket never got an attempt.
    NotAttempted,
}

impl FailReason {
    fn label(self) -> &'static str {
        match self {
            Self::Error => "Error",
            Self::NotAttempted => "Not attempted",
        }
    }
}

/// Reconciliation of one proposal's journals against the server.
#[derive(Debug, Default)]
pub struct VerifyReport {
    /// Proposal token.
    pub token: String,
    /// Tickets the work journal names.
    pub total: usize,
    /// Tickets with a recorded or server-confirmed success.
    pub successful: usize,
    /// Tickets that failed for good.
    pub failed: usize,
    /// Tickets that never got an attempt.
    pub not_attempted: usize,
    /// Tickets the journals call failed but the server shows as cast.
    pub completed_not_recorded: usize,
    /// Worked tickets missing from the server's eligible set.
    pub ineligible: usize,
    /// Failed tickets with their reason.
    pub failed_tickets: Vec<(String, FailReason)>,
    /// Tickets recorded as both succeeded and terminally failed.
    pub impossible: Vec<String>,
    /// Tickets with neither a success nor a failure anywhere.
    pub not_seen: Vec<String>,
    /// Tickets with more than one success entry.
    pub multiple_success: Vec<String>,
    /// Per-file decode failures, tolerated.
    pub decode_errors: Vec<String>,
    /// Directory entries that are not journals.
    pub unknown_files: Vec<String>,
}

impl VerifyReport {
    /// Print the reconciliation the way the operator expects to read it.
    pub fn print(&self) {
        println!("== Checking vote {}", self.token);
        for err in &self.decode_errors {
            println!("  {err}");
        }
        for name in &self.unknown_files {
            println!("  unknown journal: {name}");
        }
        for ticket in &self.multiple_success {
            println!("  multiple success entries: {ticket}");
        }
        for (ticket, reason) in &self.failed_tickets {
            println!("  FAILED: {ticket} - {}", reason.label());
        }
        if self.not_attempted != 0 {
            println!("  votes that were not attempted: {}", self.not_attempted);
        }
        if self.failed != 0 {
            println!("  votes that failed: {}", self.failed);
        }
        if self.completed_not_recorded != 0 {
            println!(
                "  votes that completed but were not recorded: {}",
                self.completed_not_recorded
            );
        }
        for ticket in &self.impossible {
            println!("  vote succeeded and failed, impossible condition: {ticket}");
        }
        for ticket in &self.not_seen {
            println!("  vote not seen: {ticket}");
        }
        if self.ineligible != 0 {
            println!("  ineligible tickets: {}", self.ineligible);
        }
        println!("  Total votes       : {}", self.total);
        println!("  Successful votes  : {}", self.successful);
        println!("  Unsuccessful votes: {}", self.failed);
        if self.failed == 0 {
            println!("== NO failed votes on proposal {}", self.token);
        } else {
            println!("== Failed votes on proposal {}", self.token);
        }
    }
}

/// Reconcile one proposal directory. `eligible` is the server-declared
/// eligible ticket set and `cast` the tickets the server's results show as
/// voted.
///
/// # Errors
///
/// [`VerifyError::Io`] when the directory itself cannot be listed; corrupt
/// journal files are reported inside the returned report instead.
pub fn reconcile(
    dir: &Path,
    token: &str,
    eligible: &HashSet<String>,
    cast: &HashSet<String>,
) -> Result<VerifyReport, VerifyError> {
    let mut report = VerifyReport {
        token: token.to_string(),
        ..VerifyReport::default()
    };

    let mut work: BTreeMap<String, Vec<WorkTuple>> = BTreeMap::new();
    let mut success: HashMap<String, Vec<SuccessTuple>> = HashMap::new();
    let mut failed: HashMap<String, Vec<FailedTuple>> = HashMap::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();

        let result = if name.starts_with(&format!("{WORK_PREFIX}.")) {
            journal::decode_work(&path, &mut work)
        } else if name.starts_with(&format!("{SUCCESS_PREFIX}.")) {
            journal::decode_success(&path, &mut success)
        } else if name.starts_with(&format!("{FAILED_PREFIX}.")) {
            journal::decode_failed(&path, &mut failed)
        } else if name == RESULTS_CACHE {
            continue;
        } else {
            report.unknown_files.push(name);
            continue;
        };
        if let Err(err) = result {
            report.decode_errors.push(format!("{name}: {err}"));
        }
    }

    // Tickets with a terminal record in the failed journal, independent of
    // whether a success was also journaled. A ticket in both sets means the
    // journals contradict each other.
    let terminal_failed: HashSet<String> = failed
        .iter()
        .filter(|(_, tuples)| tuples.iter().any(|tuple| tuple.error.terminal))
        .map(|(ticket, _)| ticket.clone())
        .collect();

    // Rebuild per-ticket statistics from the work journal. Tickets without a
    // success entry anywhere are the failure candidates, keyed to how many
    // attempts the failed journal recorded for them.
    let mut tickets: HashSet<String> = HashSet::new();
    let mut failed_votes: HashMap<String, usize> = HashMap::new();
    for tuples in work.values() {
        for tuple in tuples {
            for interval in &tuple.votes {
                let ticket = &interval.vote.ticket;
                if !tickets.insert(ticket.clone()) {
                    continue;
                }
                if let Some(entries) = success.get(ticket) {
                    if entries.len() != 1 {
                        report.multiple_success.push(ticket.clone());
                    }
                } else {
                    let retries = failed.get(ticket).map_or(0, Vec::len);
                    failed_votes.insert(ticket.clone(), retries);
                }
            }
        }
    }

    for (ticket, retries) in &failed_votes {
        let mut reason = FailReason::Error;
        if *retries == 0 {
            if cast.contains(ticket) {
                // The server recorded the vote even though this client never
                // journaled a success. Counts as a success, once.
                report.completed_not_recorded += 1;
                continue;
            }
            reason = FailReason::NotAttempted;
            report.not_attempted += 1;
        }
        report.failed_tickets.push((ticket.clone(), reason));
        report.failed += 1;
    }

    // Cross-check every worked ticket against the server's view.
    for ticket in &tickets {
        if !eligible.contains(ticket) {
            report.ineligible += 1;
        }

        let succeeded = success.contains_key(ticket);
        let failed_for_good = failed_votes.contains_key(ticket) || terminal_failed.contains(ticket);
        match (succeeded, failed_for_good) {
            (true, true) => report.impossible.push(ticket.clone()),
            (false, false) => report.not_seen.push(ticket.clone()),
            // Terminal failures already counted above; plain successes need
            // no comment.
            _ => {}
        }
    }

    report.total = tickets.len();
    report.successful = success.len() + report.completed_not_recorded;
    report.failed_tickets.sort();
    report.impossible.sort();
    report.not_seen.sort();
    Ok(report)
}

/// List the vote-dir subdirectories that look like proposal tokens (their
/// names are valid hex).
///
/// # Errors
///
/// [`VerifyError::Io`] when the vote directory cannot be read.
pub fn list_vote_dirs(vote_dir: &Path) -> Result<Vec<String>, VerifyError> {
    let mut tokens = Vec::new();
    for entry in std::fs::read_dir(vote_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if hex::decode(&name).is_ok() {
            tokens.push(name);
        }
    }
    tokens.sort();
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use super::*;
    use crate::api::{CastBallot, CastVote, CastVoteReply};
    use crate::client::RetryError;
    use crate::journal::Journal;
    use crate::schedule::VoteInterval;

    fn temp_root(tag: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time went backwards")
            .as_nanos();
        let root =
            std::env::temp_dir().join(format!("tessera-{tag}-{}-{nonce}", std::process::id()));
        fs::create_dir_all(&root).expect("create temp root");
        root
    }

    fn vote(n: usize) -> CastVote {
        CastVote {
            token: "ab".repeat(16),
            ticket: format!("{n:064x}"),
            vote_bit: "1".to_string(),
            signature: "cd".repeat(32),
        }
    }

    fn interval(n: usize) -> VoteInterval {
        VoteInterval {
            vote: vote(n),
            at: Duration::from_secs(n as u64),
        }
    }

    fn reply_for(n: usize) -> CastVoteReply {
        CastVoteReply {
            ticket: vote(n).ticket,
            ..CastVoteReply::default()
        }
    }

    #[test]
    fn clean_run_reconciles_as_all_successful() {
        let root = temp_root("verify-clean");
        let token = "ab".repeat(16);
        let journal = Journal::with_stamp(&root, 100);
        journal
            .append_work(&token, &[interval(0), interval(1), interval(2)])
            .expect("work");
        for n in 0..3 {
            journal.append_success(&token, &reply_for(n)).expect("ok");
        }

        let eligible: HashSet<_> = (0..3).map(|n| vote(n).ticket).collect();
        let cast = eligible.clone();
        let report =
            reconcile(&journal.proposal_dir(&token), &token, &eligible, &cast).expect("report");

        assert_eq!(report.total, 3);
        assert_eq!(report.successful, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(report.completed_not_recorded, 0);
        assert!(report.decode_errors.is_empty());

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn server_recorded_vote_resolves_terminal_failure_to_success() {
        let root = temp_root("verify-cnr");
        let token = "cd".repeat(16);
        let journal = Journal::with_stamp(&root, 100);
        journal.append_work(&token, &[interval(0)]).expect("work");
        // No failed-journal entries for the ticket: the client never saw an
        // attempt land, but the server has the vote.
        let cast: HashSet<_> = [vote(0).ticket].into();
        let eligible = cast.clone();

        let report =
            reconcile(&journal.proposal_dir(&token), &token, &eligible, &cast).expect("report");

        assert_eq!(report.completed_not_recorded, 1);
        assert_eq!(report.successful, 1);
        assert_eq!(report.failed, 0);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn exhausted_ticket_missing_from_server_is_a_failed_vote() {
        let root = temp_root("verify-failed");
        let token = "ef".repeat(16);
        let journal = Journal::with_stamp(&root, 100);
        journal.append_work(&token, &[interval(0)]).expect("work");
        let ballot = CastBallot {
            votes: vec![vote(0)],
        };
        journal
            .append_failed(&token, &ballot, &RetryError::status(502, b""))
            .expect("failed");
        journal
            .append_failed(&token, &ballot, &RetryError::exhausted(5))
            .expect("failed");

        let eligible: HashSet<_> = [vote(0).ticket].into();
        let report = reconcile(
            &journal.proposal_dir(&token),
            &token,
            &eligible,
            &HashSet::new(),
        )
        .expect("report");

        assert_eq!(report.failed, 1);
        assert_eq!(report.successful, 0);
        assert_eq!(
            report.failed_tickets,
            vec![(vote(0).ticket, FailReason::Error)]
        );

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn success_alongside_a_terminal_failure_is_reported_as_impossible() {
        let root = temp_root("verify-impossible");
        let token = "1b".repeat(16);
        let journal = Journal::with_stamp(&root, 100);
        journal.append_work(&token, &[interval(0)]).expect("work");
        // Contradictory journals: a success entry and a terminal eviction
        // for the same ticket.
        journal.append_success(&token, &reply_for(0)).expect("ok");
        let ballot = CastBallot {
            votes: vec![vote(0)],
        };
        journal
            .append_failed(&token, &ballot, &RetryError::exhausted(5))
            .expect("failed");

        let eligible: HashSet<_> = [vote(0).ticket].into();
        let report = reconcile(
            &journal.proposal_dir(&token),
            &token,
            &eligible,
            &HashSet::new(),
        )
        .expect("report");

        assert_eq!(report.impossible, vec![vote(0).ticket]);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn plain_attempt_failures_before_a_success_are_not_impossible() {
        let root = temp_root("verify-flap");
        let token = "2c".repeat(16);
        let journal = Journal::with_stamp(&root, 100);
        journal.append_work(&token, &[interval(0)]).expect("work");
        // One retryable attempt failure followed by a success is the normal
        // transient-flap shape, not a contradiction.
        let ballot = CastBallot {
            votes: vec![vote(0)],
        };
        journal
            .append_failed(&token, &ballot, &RetryError::status(502, b""))
            .expect("failed");
        journal.append_success(&token, &reply_for(0)).expect("ok");

        let eligible: HashSet<_> = [vote(0).ticket].into();
        let cast = eligible.clone();
        let report =
            reconcile(&journal.proposal_dir(&token), &token, &eligible, &cast).expect("report");

        assert!(report.impossible.is_empty());
        assert_eq!(report.successful, 1);
        assert_eq!(report.failed, 0);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn corrupt_journal_still_yields_a_report() {
        let root = temp_root("verify-corrupt");
        let token = "0a".repeat(16);
        let journal = Journal::with_stamp(&root, 100);
        journal.append_work(&token, &[interval(0)]).expect("work");
        journal.append_success(&token, &reply_for(0)).expect("ok");
        // A failed journal chopped inside its first tuple.
        fs::write(
            journal.proposal_dir(&token).join("failed.100"),
            "{\n  \"time\": \"Jan  2 15:04:05.000000000\"\n}\n",
        )
        .expect("write corrupt");

        let eligible: HashSet<_> = [vote(0).ticket].into();
        let report = reconcile(
            &journal.proposal_dir(&token),
            &token,
            &eligible,
            &HashSet::new(),
        )
        .expect("report");

        assert_eq!(report.decode_errors.len(), 1);
        assert!(report.decode_errors[0].contains("cast votes"));
        assert_eq!(report.successful, 1);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn vote_dir_listing_keeps_hex_names_only() {
        let root = temp_root("verify-list");
        fs::create_dir_all(root.join("ab12cd")).expect("dir");
        fs::create_dir_all(root.join("not-hex")).expect("dir");
        fs::write(root.join("deadbeef"), b"file, not dir").expect("file");

        let tokens = list_vote_dirs(&root).expect("list");
        assert_eq!(tokens, vec!["ab12cd".to_string()]);

        let _ = fs::remove_dir_all(&root);
    }
}
