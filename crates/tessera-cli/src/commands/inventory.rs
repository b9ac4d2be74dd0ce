//! The inventory command: list proposals under active vote and what this
//! wallet could contribute to each.

use std::collections::HashMap;

use anyhow::Result;
use tessera_core::api::CastVoteDetails;
use tessera_core::wallet::{self, WalletBackend};

use crate::session::Session;

pub async fn run(session: &Session) -> Result<()> {
    let tokens = session.client.active_votes().await?;
    if tokens.is_empty() {
        println!("No active votes found.");
        return Ok(());
    }

    // One broken proposal should not hide the rest of the inventory.
    for token in tokens {
        let details = match session.client.details(&token).await {
            Ok(details) => details,
            Err(err) => {
                println!("Failed to obtain vote details for {token}: {err}");
                continue;
            }
        };

        let committed = match session
            .wallet
            .committed_tickets(&details.vote.eligible_tickets)
            .await
        {
            Ok(committed) => committed,
            Err(err) => {
                println!("Ticket pool verification: {token} {err}");
                continue;
            }
        };
        if committed.is_empty() {
            println!("No eligible tickets: {token}");
        }

        let results = match session.client.results(&token).await {
            Ok(results) => results,
            Err(err) => {
                println!("Failed to obtain vote results for {token}: {err}");
                continue;
            }
        };
        let cast: HashMap<String, CastVoteDetails> = results
            .votes
            .into_iter()
            .map(|vote| (vote.ticket.clone(), vote))
            .collect();
        let total = committed.len();
        let eligible = wallet::eligible_tickets(&session.wallet, committed, &cast).await;

        println!("Vote: {token}");
        println!("  Start block     : {}", details.vote.start_block_height);
        println!("  End block       : {}", details.vote.end_block_height);
        println!("  Mask            : {}", details.vote.params.mask);
        println!("  Eligible tickets: {total}");
        println!("  Eligible votes  : {}", eligible.len());
        for option in &details.vote.params.options {
            println!("  Vote Option:");
            println!("    Id                   : {}", option.id);
            println!("    Description          : {}", option.description);
            println!("    Bit                  : {}", option.bit);
            println!(
                "    To choose this option: tessera vote {token} {}",
                option.id
            );
        }
    }

    Ok(())
}
