//! The verify command: reconcile local vote journals against the server's
//! authoritative results.

use std::fs::File;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tessera_core::api::{ResultsReply, VoteStatus};
use tessera_core::journal::RESULTS_CACHE;
use tessera_core::verify::{list_vote_dirs, reconcile};
use tracing::debug;

use crate::session::Session;

pub async fn run(session: &Session, tokens: &[String]) -> Result<()> {
    if tokens.is_empty() {
        let dirs = list_vote_dirs(&session.config.vote_dir).context("list vote directory")?;
        println!("Votes:");
        for token in dirs {
            println!("  {token}");
        }
        return Ok(());
    }

    let targets = if tokens.len() == 1 && tokens[0] == "ALL" {
        list_vote_dirs(&session.config.vote_dir).context("list vote directory")?
    } else {
        let mut targets = Vec::with_capacity(tokens.len());
        for token in tokens {
            if hex::decode(token).is_err() {
                println!("invalid vote: {token}");
                continue;
            }
            targets.push(token.clone());
        }
        targets
    };

    // A broken proposal is reported and skipped; the rest still verify.
    for token in targets {
        if let Err(err) = verify_one(session, &token).await {
            println!("verify vote {token}: {err}");
        }
    }

    Ok(())
}

async fn verify_one(session: &Session, token: &str) -> Result<()> {
    let summary = session
        .client
        .summary(token)
        .await
        .context("could not obtain proposal status")?;
    match summary.status {
        VoteStatus::Finished | VoteStatus::Approved | VoteStatus::Rejected => {}
        other => bail!("proposal vote not finished: {other}"),
    }

    let dir = session.config.vote_dir.join(token);
    let results = cached_results(session, token, &dir).await?;

    let details = session
        .client
        .details(token)
        .await
        .context("fetch vote details")?;
    let eligible = details.vote.eligible_tickets.iter().cloned().collect();
    let cast = results
        .votes
        .iter()
        .map(|vote| vote.ticket.clone())
        .collect();

    let report = reconcile(&dir, token, &eligible, &cast)?;
    report.print();
    Ok(())
}

/// Authoritative results, fetched once and cached beside the journals. The
/// vote is over, so the reply can never change.
async fn cached_results(session: &Session, token: &str, dir: &Path) -> Result<ResultsReply> {
    let cache = dir.join(RESULTS_CACHE);
    if !cache.exists() {
        let results = session
            .client
            .results(token)
            .await
            .context("failed to obtain vote results")?;
        debug!(
            votes = results.votes.len(),
            server = %session.server_pub_key,
            "caching authoritative results"
        );
        let file = File::create(&cache).context("create results cache")?;
        if let Err(err) = serde_json::to_writer(file, &results) {
            let _ = std::fs::remove_file(&cache);
            return Err(err).context("encode results cache");
        }
        return Ok(results);
    }

    let file = File::open(&cache).context("open results cache")?;
    serde_json::from_reader(file).context("decode results cache")
}
