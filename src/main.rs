use chatpipe::config::Args;
use chatpipe::db::SqliteStore;
use chatpipe::persistence::{AllowAllEntitlements, ChatStore, HttpRetriever, MemoryStore};
use chatpipe::session::{ChatSession, SendRequest, SessionEvent};
use chatpipe::str_utils::snippet;
use chatpipe::token_counting::HeuristicTokenizer;
use chatpipe::*;

use clap::Parser;
use colored::*;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let _log_guard = chatpipe::logging::init_tracing(args.log_dir.as_deref().map(std::path::Path::new));
    chatpipe::logging::setup_panic_hook();

    if let Err(e) = run(args).await {
        tracing::error!("{}", e);
        eprintln!("{} {}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = args.pipeline_config();
    let client = config.http_client()?;

    let store: Arc<dyn ChatStore> = match &args.database {
        Some(path) => Arc::new(SqliteStore::open(path, &args.image_dir).await?),
        None => Arc::new(MemoryStore::new()),
    };

    let session = Arc::new(
        ChatSession::new(
            &config,
            client.clone(),
            store,
            Arc::new(AllowAllEntitlements),
            Arc::new(HeuristicTokenizer),
        )
        .with_retriever(Arc::new(HttpRetriever::new(client, &config.api_base_url))),
    );

    let printer = tokio::spawn(print_events(session.subscribe()));

    let stopper = {
        let session = session.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if !session.stop().await {
                    std::process::exit(130);
                }
            }
        })
    };

    let model = args.llm_model()?;
    let profile = Profile {
        user_id: UserId(args.user.clone()),
        profile_context: String::new(),
        plan: String::new(),
    };
    let new_request = |content: &str| {
        SendRequest::new(content, args.chat_settings(), model.clone(), profile.clone())
    };

    match &args.message {
        Some(message) => {
            session.send_message(new_request(message), false).await?;
        }
        None => {
            eprintln!(
                "{}",
                "Type a message. /regen regenerates, /edit <seq> <text> edits, /quit exits."
                    .dimmed()
            );
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await? {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let result = if line == "/quit" {
                    break;
                } else if line == "/regen" {
                    session.regenerate(new_request("")).await
                } else if let Some(rest) = line.strip_prefix("/edit ") {
                    match rest.split_once(' ') {
                        Some((seq, text)) => match seq.parse::<i64>() {
                            Ok(seq) => session.send_edit(new_request(text), seq).await,
                            Err(_) => {
                                eprintln!("{}", "usage: /edit <seq> <text>".yellow());
                                continue;
                            }
                        },
                        None => {
                            eprintln!("{}", "usage: /edit <seq> <text>".yellow());
                            continue;
                        }
                    }
                } else {
                    session.send_message(new_request(line), false).await
                };
                // Failures were already reported through the event stream.
                if let Err(e) = result {
                    tracing::debug!("Send ended with error: {}", e);
                }
            }
        }
    }

    stopper.abort();
    let _ = stopper.await;
    drop(session);
    if let Err(e) = printer.await {
        tracing::debug!("Event printer stopped: {}", e);
    }
    Ok(())
}

/// Streams the assistant text to stdout and reports notices on stderr.
async fn print_events(mut rx: broadcast::Receiver<SessionEvent>) {
    let mut printed = 0usize;
    let mut generating = false;
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!("Event printer lagged by {} events", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match event {
            SessionEvent::GeneratingChanged(true) => {
                generating = true;
                printed = 0;
            }
            SessionEvent::GeneratingChanged(false) => {
                if generating && printed > 0 {
                    println!();
                }
                generating = false;
            }
            SessionEvent::MessagesReplaced(messages) if generating => {
                let Some(last) = messages.last() else {
                    continue;
                };
                if last.message.role != Role::Assistant {
                    continue;
                }
                let text = last.message.display_text();
                if text.len() > printed && text.is_char_boundary(printed) {
                    print!("{}", &text[printed..]);
                    let _ = std::io::stdout().flush();
                    printed = text.len();
                }
            }
            SessionEvent::ToolInUse(tool) if tool != chatpipe::constants::TOOL_IN_USE_NONE => {
                eprintln!("{}", format!("[using {}]", tool).dimmed());
            }
            SessionEvent::ChatCreated(chat) => {
                eprintln!("{}", format!("[chat {}: {}]", chat.id.short(), snippet(&chat.name, 40)).dimmed());
            }
            SessionEvent::TokenCount(n) => {
                tracing::debug!("Response used {} tokens", n);
            }
            SessionEvent::Notice(notice) => {
                let line = match notice.severity {
                    Severity::Error => notice.message.red(),
                    Severity::Warning => notice.message.yellow(),
                };
                eprintln!("{}", line);
            }
            SessionEvent::UpgradePromptRequested => {
                eprintln!("{}", "Upgrade your plan to continue.".bold());
            }
            SessionEvent::InputRestored(input) => {
                eprintln!("{}", format!("[not sent: {}]", snippet(&input, 60)).dimmed());
            }
            _ => {}
        }
    }
}
