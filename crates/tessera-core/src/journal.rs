//! Append-only per-proposal vote journals.
//!
//! Each engine run appends to three files under `<vote_dir>/<token>/`, keyed
//! by the run's start timestamp: `work.<ts>` (the schedule), `success.<ts>`
//! (receipts), and `failed.<ts>` (attempt failures). A file is a bare
//! concatenation of JSON values: every append writes a `{"time": ...}`
//! marker followed by the tuple's payload records. Files are only ever
//! appended to, never rewritten, so a crash can at worst leave one partial
//! value at the end of a file.
//!
//! Readers run a small state machine over a streaming decoder. Clean EOF is
//! only acceptable between tuples; everything else is reported as corruption
//! of that file alone.

use std::collections::{BTreeMap, HashMap};
use std::fs::{DirBuilder, File, OpenOptions};
use std::io::{BufReader, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::api::{CastBallot, CastVoteReply};
use crate::client::RetryError;
use crate::schedule::VoteInterval;

/// File name prefix of the work journal.
pub const WORK_PREFIX: &str = "work";
/// File name prefix of the success journal.
pub const SUCCESS_PREFIX: &str = "success";
/// File name prefix of the failed journal.
pub const FAILED_PREFIX: &str = "failed";
/// Name of the cached authoritative results file.
pub const RESULTS_CACHE: &str = ".voteresults";

/// Journal errors.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// Underlying file I/O failed.
    #[error("journal io: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded.
    #[error("encode journal record: {0}")]
    Encode(#[source] serde_json::Error),

    /// A record could not be decoded.
    #[error("decode {what} ({offset}): {source}")]
    Decode {
        /// Which record kind failed.
        what: &'static str,
        /// Byte offset of the failure.
        offset: usize,
        /// Decoder error.
        #[source]
        source: serde_json::Error,
    },

    /// The stream ended in the middle of a tuple.
    #[error("decode {what} ({offset}): unexpected end of stream")]
    Truncated {
        /// Which record kind was being read.
        what: &'static str,
        /// Byte offset of the end of the stream.
        offset: usize,
    },

    /// A journaled ballot did not contain exactly one vote.
    #[error("journaled ballot carries {0} votes, expected 1")]
    BallotShape(usize),

    /// A journaled record carried no ticket.
    #[error("journal record missing ticket")]
    MissingTicket,
}

/// Wall-clock marker opening every journal tuple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonTime {
    /// Stamp with nanosecond precision, e.g. `Jan  2 15:04:05.000000000`.
    pub time: String,
}

impl JsonTime {
    fn now() -> Self {
        Self {
            time: Local::now().format("%b %e %H:%M:%S%.9f").to_string(),
        }
    }
}

/// One decoded work tuple: the schedule (or schedule fragment) written at one
/// instant.
#[derive(Debug, Clone)]
pub struct WorkTuple {
    /// Tuple marker.
    pub time: JsonTime,
    /// Scheduled intervals.
    pub votes: Vec<VoteInterval>,
}

/// One decoded success tuple.
#[derive(Debug, Clone)]
pub struct SuccessTuple {
    /// Tuple marker.
    pub time: JsonTime,
    /// The receipt.
    pub result: CastVoteReply,
}

/// One decoded failed tuple.
#[derive(Debug, Clone)]
pub struct FailedTuple {
    /// Tuple marker.
    pub time: JsonTime,
    /// The single-vote ballot that failed.
    pub ballot: CastBallot,
    /// The failure record.
    pub error: RetryError,
}

/// Writer for one run's journals. The run stamp keys every file this writer
/// touches, so concurrent or repeated runs never share a file.
#[derive(Debug, Clone)]
pub struct Journal {
    root: PathBuf,
    run_stamp: i64,
}

impl Journal {
    /// Journal writer rooted at `root`, stamped with the current time.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            run_stamp: chrono::Utc::now().timestamp(),
        }
    }

    /// Journal writer with a fixed run stamp.
    #[must_use]
    pub fn with_stamp(root: impl Into<PathBuf>, run_stamp: i64) -> Self {
        Self {
            root: root.into(),
            run_stamp,
        }
    }

    /// The run stamp keying this writer's files.
    #[must_use]
    pub const fn run_stamp(&self) -> i64 {
        self.run_stamp
    }

    /// Directory holding one proposal's journals.
    #[must_use]
    pub fn proposal_dir(&self, token: &str) -> PathBuf {
        self.root.join(token)
    }

    /// Append the schedule to the work journal.
    ///
    /// # Errors
    ///
    /// Any write failure aborts the run; see [`JournalError`].
    pub fn append_work(&self, token: &str, schedule: &[VoteInterval]) -> Result<(), JournalError> {
        let votes = serde_json::to_value(schedule).map_err(JournalError::Encode)?;
        self.append(token, WORK_PREFIX, &[votes])
    }

    /// Append a receipt to the success journal.
    ///
    /// # Errors
    ///
    /// Any write failure aborts the run; see [`JournalError`].
    pub fn append_success(&self, token: &str, reply: &CastVoteReply) -> Result<(), JournalError> {
        let result = serde_json::to_value(reply).map_err(JournalError::Encode)?;
        self.append(token, SUCCESS_PREFIX, &[result])
    }

    /// Append a failed attempt to the failed journal.
    ///
    /// # Errors
    ///
    /// Any write failure aborts the run; see [`JournalError`].
    pub fn append_failed(
        &self,
        token: &str,
        ballot: &CastBallot,
        error: &RetryError,
    ) -> Result<(), JournalError> {
        let ballot = serde_json::to_value(ballot).map_err(JournalError::Encode)?;
        let error = serde_json::to_value(error).map_err(JournalError::Encode)?;
        self.append(token, FAILED_PREFIX, &[ballot, error])
    }

    fn append(
        &self,
        token: &str,
        prefix: &str,
        records: &[serde_json::Value],
    ) -> Result<(), JournalError> {
        let dir = self.proposal_dir(token);
        DirBuilder::new().recursive(true).mode(0o700).create(&dir)?;

        let path = dir.join(format!("{prefix}.{}", self.run_stamp));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(path)?;

        let marker = serde_json::to_value(JsonTime::now()).map_err(JournalError::Encode)?;
        write_record(&mut file, &marker)?;
        for record in records {
            write_record(&mut file, record)?;
        }
        file.flush()?;
        Ok(())
    }
}

fn write_record(file: &mut File, record: &serde_json::Value) -> Result<(), JournalError> {
    serde_json::to_writer_pretty(&mut *file, record).map_err(JournalError::Encode)?;
    file.write_all(b"\n")?;
    Ok(())
}

struct Stream {
    inner: serde_json::StreamDeserializer<
        'static,
        serde_json::de::IoRead<BufReader<File>>,
        serde_json::Value,
    >,
}

impl Stream {
    fn open(path: &Path) -> Result<Self, JournalError> {
        let file = File::open(path)?;
        Ok(Self {
            inner: serde_json::Deserializer::from_reader(BufReader::new(file))
                .into_iter::<serde_json::Value>(),
        })
    }

    fn offset(&self) -> usize {
        self.inner.byte_offset()
    }

    /// Pull the next record, or `None` at a clean end of stream.
    fn next(&mut self, what: &'static str) -> Result<Option<serde_json::Value>, JournalError> {
        match self.inner.next() {
            None => Ok(None),
            Some(Ok(value)) => Ok(Some(value)),
            Some(Err(source)) => Err(JournalError::Decode {
                what,
                offset: self.offset(),
                source,
            }),
        }
    }

    /// Pull the next record of a tuple already in progress; a clean end of
    /// stream here means the writer crashed mid-tuple.
    fn next_of<T: DeserializeOwned>(&mut self, what: &'static str) -> Result<T, JournalError> {
        let Some(value) = self.next(what)? else {
            return Err(JournalError::Truncated {
                what,
                offset: self.offset(),
            });
        };
        serde_json::from_value(value).map_err(|source| JournalError::Decode {
            what,
            offset: self.offset(),
            source,
        })
    }
}

/// Decode a work journal into `out`, keyed by each tuple's time string.
/// Tuples sharing a stamp coalesce into one list.
///
/// Tuples already decoded stay in `out` even when the file turns out to be
/// corrupt past them.
///
/// # Errors
///
/// [`JournalError`] describing the first corrupt record.
pub fn decode_work(
    path: &Path,
    out: &mut BTreeMap<String, Vec<WorkTuple>>,
) -> Result<(), JournalError> {
    let mut stream = Stream::open(path)?;
    loop {
        let Some(marker) = stream.next("time")? else {
            return Ok(());
        };
        let time: JsonTime =
            serde_json::from_value(marker).map_err(|source| JournalError::Decode {
                what: "time",
                offset: stream.offset(),
                source,
            })?;
        let votes: Vec<VoteInterval> = stream.next_of("votes")?;
        out.entry(time.time.clone())
            .or_default()
            .push(WorkTuple { time, votes });
    }
}

/// Decode a success journal into `out`, keyed by ticket.
///
/// # Errors
///
/// See [`decode_work`].
pub fn decode_success(
    path: &Path,
    out: &mut HashMap<String, Vec<SuccessTuple>>,
) -> Result<(), JournalError> {
    let mut stream = Stream::open(path)?;
    loop {
        let Some(marker) = stream.next("time")? else {
            return Ok(());
        };
        let time: JsonTime =
            serde_json::from_value(marker).map_err(|source| JournalError::Decode {
                what: "time",
                offset: stream.offset(),
                source,
            })?;
        let result: CastVoteReply = stream.next_of("cast votes")?;
        if result.ticket.is_empty() {
            return Err(JournalError::MissingTicket);
        }
        out.entry(result.ticket.clone())
            .or_default()
            .push(SuccessTuple { time, result });
    }
}

/// Decode a failed journal into `out`, keyed by ticket.
///
/// # Errors
///
/// See [`decode_work`].
pub fn decode_failed(
    path: &Path,
    out: &mut HashMap<String, Vec<FailedTuple>>,
) -> Result<(), JournalError> {
    let mut stream = Stream::open(path)?;
    loop {
        let Some(marker) = stream.next("time")? else {
            return Ok(());
        };
        let time: JsonTime =
            serde_json::from_value(marker).map_err(|source| JournalError::Decode {
                what: "time",
                offset: stream.offset(),
                source,
            })?;
        let ballot: CastBallot = stream.next_of("cast votes")?;
        if ballot.votes.len() != 1 {
            return Err(JournalError::BallotShape(ballot.votes.len()));
        }
        let ticket = ballot.votes[0].ticket.clone();
        if ticket.is_empty() {
            return Err(JournalError::MissingTicket);
        }
        let error: RetryError = stream.next_of("retry error")?;
        out.entry(ticket).or_default().push(FailedTuple {
            time,
            ballot,
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use super::*;
    use crate::api::CastVote;

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

    fn sample_vote(n: usize) -> CastVote {
        CastVote {
            token: "ab".repeat(16),
            ticket: format!("{n:064x}"),
            vote_bit: "1".to_string(),
            signature: "cd".repeat(32),
        }
    }

    #[test]
    fn work_journal_round_trips() {
        let root = temp_root("journal-work");
        let journal = Journal::with_stamp(&root, 1_700_000_000);
        let token = "ab".repeat(16);
        let schedule = vec![
            VoteInterval {
                vote: sample_vote(0),
                at: Duration::ZERO,
            },
            VoteInterval {
                vote: sample_vote(1),
                at: Duration::from_secs(90),
            },
        ];

        journal.append_work(&token, &schedule).expect("append work");

        let path = journal.proposal_dir(&token).join("work.1700000000");
        let mut decoded = BTreeMap::new();
        decode_work(&path, &mut decoded).expect("decode work");

        let tuples: Vec<_> = decoded.values().flatten().collect();
        assert_eq!(tuples.len(), 1);
        assert_eq!(tuples[0].votes.len(), 2);
        assert_eq!(tuples[0].votes[1].at, Duration::from_secs(90));

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn complete_tuples_survive_a_torn_tail() {
        let root = temp_root("journal-torn");
        let journal = Journal::with_stamp(&root, 42);
        let token = "cd".repeat(16);

        let reply = CastVoteReply {
            ticket: sample_vote(0).ticket,
            ..CastVoteReply::default()
        };
        journal.append_success(&token, &reply).expect("append");
        journal.append_success(&token, &reply).expect("append");

        // Crash mid-tuple: chop the file inside the second tuple.
        let path = journal.proposal_dir(&token).join("success.42");
        let bytes = fs::read(&path).expect("read journal");
        fs::write(&path, &bytes[..bytes.len() - 40]).expect("truncate journal");

        let mut decoded = HashMap::new();
        let err = decode_success(&path, &mut decoded).expect_err("corrupt tail");
        assert!(matches!(
            err,
            JournalError::Decode { .. } | JournalError::Truncated { .. }
        ));
        // The first complete tuple is still usable.
        assert_eq!(decoded.get(&reply.ticket).map(Vec::len), Some(1));

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn eof_between_tuples_is_clean() {
        let root = temp_root("journal-clean");
        let journal = Journal::with_stamp(&root, 7);
        let token = "ef".repeat(16);

        let vote = sample_vote(3);
        let ballot = CastBallot {
            votes: vec![vote.clone()],
        };
        let error = RetryError::status(502, b"bad gateway");
        journal
            .append_failed(&token, &ballot, &error)
            .expect("append failed");

        let path = journal.proposal_dir(&token).join("failed.7");
        let mut decoded = HashMap::new();
        decode_failed(&path, &mut decoded).expect("decode");
        assert_eq!(decoded.get(&vote.ticket).map(Vec::len), Some(1));
        assert_eq!(decoded[&vote.ticket][0].error.code, 502);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn truncation_inside_a_tuple_names_the_missing_record() {
        let root = temp_root("journal-state1");
        fs::create_dir_all(root.join("aa")).expect("proposal dir");
        let path = root.join("aa").join("failed.1");
        // A marker with nothing after it: the writer died in state 1.
        fs::write(&path, "{\n  \"time\": \"Jan  2 15:04:05.000000000\"\n}\n").expect("write");

        let mut decoded = HashMap::new();
        let err = decode_failed(&path, &mut decoded).expect_err("truncated");
        assert!(err.to_string().contains("cast votes"));
        assert!(err.to_string().contains("unexpected end of stream"));

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn journal_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let root = temp_root("journal-mode");
        let journal = Journal::with_stamp(&root, 9);
        let token = "0a".repeat(16);
        journal
            .append_success(
                &token,
                &CastVoteReply {
                    ticket: "ff".repeat(32),
                    ..CastVoteReply::default()
                },
            )
            .expect("append");

        let dir_mode = fs::metadata(journal.proposal_dir(&token))
            .expect("dir metadata")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);

        let file_mode = fs::metadata(journal.proposal_dir(&token).join("success.9"))
            .expect("file metadata")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(file_mode, 0o600);

        let _ = fs::remove_dir_all(&root);
    }
}
