//! The tally command: count recorded votes per option.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};

use crate::session::Session;

pub async fn run(session: &Session, token: &str) -> Result<()> {
    let results = session
        .client
        .results(token)
        .await
        .context("fetch cast votes")?;

    let mut count: HashMap<u64, u64> = HashMap::new();
    let mut total = 0u64;
    for vote in &results.votes {
        let bits = u64::from_str_radix(&vote.vote_bit, 16)
            .with_context(|| format!("malformed vote bit for ticket {}", vote.ticket))?;
        *count.entry(bits).or_default() += 1;
        total += 1;
    }

    if total == 0 {
        bail!("no votes recorded");
    }

    let details = session
        .client
        .details(token)
        .await
        .context("fetch vote details")?;

    for option in &details.vote.params.options {
        let votes = count.get(&option.bit).copied().unwrap_or(0);
        println!("Vote Option:");
        println!("  Id                   : {}", option.id);
        println!("  Description          : {}", option.description);
        println!("  Bit                  : {}", option.bit);
        println!("  Votes received       : {votes}");
        #[allow(clippy::cast_precision_loss)]
        let percentage = votes as f64 / total as f64 * 100.0;
        println!("  Percentage           : {percentage}%");
    }

    Ok(())
}
