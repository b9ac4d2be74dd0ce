//! The vote command: filter eligibility, sign, and trickle (or bulk-cast)
//! one vote per eligible ticket.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tessera_core::api::{CastBallot, CastVote, CastVoteDetails, CastVoteReply, VoteStatus};
use tessera_core::engine::{EngineConfig, Trickler};
use tessera_core::schedule::{self, vote_duration};
use tessera_core::wallet::{self, SignRequest, WalletBackend, WalletError};
use tessera_core::Journal;
use tokio::signal::unix::{signal, SignalKind};

use crate::session::Session;

pub async fn run(session: &Session, token: &str, vote_id: &str) -> Result<()> {
    // The vote must still be open before any work is worth doing.
    let summary = session
        .client
        .summary(token)
        .await
        .context("fetch vote summary")?;
    if summary.status != VoteStatus::Started {
        bail!("proposal vote is not active: {}", summary.status);
    }
    let best_block = summary.best_block;

    let details = session
        .client
        .details(token)
        .await
        .context("fetch vote details")?;
    let Some(option) = details
        .vote
        .params
        .options
        .iter()
        .find(|option| option.id == vote_id)
    else {
        bail!("vote id not found: {vote_id}");
    };
    let vote_bit = format!("{:x}", option.bit);

    let committed = session
        .wallet
        .committed_tickets(&details.vote.eligible_tickets)
        .await
        .context("ticket pool verification")?;
    if committed.is_empty() {
        bail!("no eligible tickets found");
    }

    // Tickets that already voted with a valid signature are filtered against
    // the server's results; an invalidly-signed recorded vote gets resubmitted.
    let results = session
        .client
        .results(token)
        .await
        .context("fetch cast votes")?;
    let cast: HashMap<String, CastVoteDetails> = results
        .votes
        .into_iter()
        .map(|vote| (vote.ticket.clone(), vote))
        .collect();
    let eligible = wallet::eligible_tickets(&session.wallet, committed, &cast).await;
    if eligible.is_empty() {
        bail!("no eligible tickets found");
    }

    let passphrase = session.passphrase()?;
    let requests: Vec<SignRequest> = eligible
        .iter()
        .map(|ticket| SignRequest {
            address: ticket.address.clone(),
            message: wallet::vote_message(token, &ticket.ticket, &vote_bit),
        })
        .collect();
    let replies = session
        .wallet
        .sign_messages(&passphrase, &requests)
        .await
        .context("sign votes")?;

    // One bad signature fails the whole run before anything is submitted.
    for (ticket, reply) in eligible.iter().zip(&replies) {
        if !reply.error.is_empty() {
            return Err(WalletError::Sign {
                address: ticket.address.clone(),
                reason: reply.error.clone(),
            }
            .into());
        }
    }

    let votes: Vec<CastVote> = eligible
        .iter()
        .zip(&replies)
        .map(|(ticket, reply)| CastVote {
            token: token.to_string(),
            ticket: ticket.ticket.clone(),
            vote_bit: vote_bit.clone(),
            signature: hex::encode(&reply.signature),
        })
        .collect();

    if session.config.trickle {
        trickle(
            session,
            token,
            votes,
            details.vote.end_block_height,
            best_block,
        )
        .await
    } else {
        bulk(session, votes).await
    }
}

async fn trickle(
    session: &Session,
    token: &str,
    votes: Vec<CastVote>,
    end_height: u32,
    best_block: u32,
) -> Result<()> {
    let duration = match session.config.vote_duration {
        Some(duration) => duration,
        None => vote_duration(
            session.config.block_time,
            end_height,
            best_block,
            session.config.blocks_per_hour(),
        )?,
    };

    let mut rng = schedule::seeded_rng(schedule::generate_seed());
    let plan = schedule::trickle_schedule(votes, duration, &mut rng)?;

    let engine = Trickler::new(
        EngineConfig {
            token: token.to_string(),
            retry_interval: session.config.retry_interval,
            max_attempts: session.config.max_retries,
        },
        Arc::new(session.client.clone()),
        Journal::new(&session.config.vote_dir),
        session.cancel.clone(),
    );
    spawn_stats_handler(engine.clone());

    let outcome = engine.run(plan).await?;
    print_summary(&outcome.results, outcome.not_cast);
    Ok(())
}

async fn bulk(session: &Session, votes: Vec<CastVote>) -> Result<()> {
    let ballot = CastBallot { votes };
    let reply = session
        .client
        .cast_ballot_bulk(&ballot)
        .await
        .context("cast ballot")?;
    print_summary(&reply.receipts, 0);
    Ok(())
}

/// Dump engine progress on SIGUSR1.
fn spawn_stats_handler(engine: Trickler) {
    tokio::spawn(async move {
        let Ok(mut usr1) = signal(SignalKind::user_defined1()) else {
            return;
        };
        while usr1.recv().await.is_some() {
            engine.dump_complete();
            engine.dump_togo();
        }
    });
}

fn print_summary(results: &[CastVoteReply], not_cast: u64) {
    let failed: Vec<&CastVoteReply> = results
        .iter()
        .filter(|reply| !reply.error_context.is_empty())
        .collect();

    println!("Votes succeeded: {}", results.len() - failed.len());
    println!("Votes failed   : {}", failed.len());
    if not_cast > 0 {
        println!("Votes not cast : {not_cast}");
    }
    for reply in failed {
        println!("Failed vote    : {} {}", reply.ticket, reply.error_context);
    }
}
