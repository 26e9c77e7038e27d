use std::io::Write;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};

use hearth_config::AppConfig;
use hearth_llm::Rejection;
use hearth_runtime::{DiscardReason, TrafficController, TurnOutcome};

const EXIT_COMMANDS: [&str; 3] = ["quit", "exit", "cls"];

pub(crate) async fn run_chat_session(config: &AppConfig, stream: bool) -> Result<()> {
    let mut controller = TrafficController::from_config(config).await?;
    let agent = config.agent.name.clone();

    println!("{agent} is here. Type 'exit' to leave.");
    let result = chat_loop(&mut controller, &agent, stream).await;
    if let Err(err) = &result {
        error!(error = %err, "chat session aborted");
    }

    controller.shutdown();
    result
}

/// Read and answer lines until the user leaves.  I/O errors end the loop
/// and are returned so the caller can still shut the session down.
async fn chat_loop(controller: &mut TrafficController, agent: &str, stream: bool) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        prompt()?;
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("session interrupted");
                println!("\nsession interrupted");
                return Ok(());
            }
        };
        let Some(line) = line else {
            println!("session closed");
            return Ok(());
        };

        let input = line.trim();
        if EXIT_COMMANDS.contains(&input.to_lowercase().as_str()) {
            info!("session ended by user");
            println!("See you next time...");
            return Ok(());
        }
        if input.is_empty() {
            println!("   >> empty input ignored");
            continue;
        }

        // An interrupt mid-turn drops the held input; nothing was committed.
        let turn = async {
            if stream {
                respond_streaming(controller, agent, input).await
            } else {
                controller.handle_input(input, None).await
            }
        };
        let outcome = tokio::select! {
            outcome = turn => outcome,
            _ = tokio::signal::ctrl_c() => {
                info!("session interrupted during generation");
                println!("\nsession interrupted");
                return Ok(());
            }
        };
        report(agent, &outcome, stream);
    }
}

fn prompt() -> Result<()> {
    print!("\nYOU : ");
    std::io::stdout().flush()?;
    Ok(())
}

async fn respond_streaming(controller: &mut TrafficController, agent: &str, input: &str) -> TurnOutcome {
    let (tx, mut rx) = mpsc::channel::<String>(64);
    print!("\n{agent} : ");
    let printer = tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            print!("{chunk}");
            let _ = std::io::stdout().flush();
        }
        println!();
    });
    let outcome = controller.handle_input(input, Some(tx)).await;
    if let Err(err) = printer.await {
        error!(error = %err, "stream printer failed");
    }
    outcome
}

fn report(agent: &str, outcome: &TurnOutcome, streamed: bool) {
    match outcome {
        TurnOutcome::Committed {
            response,
            compression,
        } => {
            if !streamed {
                println!("\n{agent} : {response}");
            }
            if let Some(compression) = compression {
                match &compression.summary {
                    Some(summary) => println!("   >> memory saved: {summary}"),
                    None => println!("   >> memory compression failed; conversation continues"),
                }
            }
        }
        TurnOutcome::Discarded { reason } => {
            let why = match reason {
                DiscardReason::EmptyInput => "empty input".to_string(),
                DiscardReason::Rejected(Rejection::Fallback) => "no response from the model".to_string(),
                DiscardReason::Rejected(rejection) => rejection.to_string(),
            };
            if streamed && matches!(reason, DiscardReason::Rejected(_)) {
                println!("   >> the reply shown above was withdrawn.");
            }
            println!("   >> response discarded ({why}). Nothing saved to history.");
            println!("   >> You can try again without polluting the conversation.");
        }
    }
}
