//! mailboxd - command-line front end for the mailbox crate
//!
//! One-shot commands against a user's Gmail account. Results are printed as
//! JSON on stdout; logs go to stderr (`RUST_LOG` controls the level).

use anyhow::{Context, Result, bail};
use log::{error, info, warn};
use mailbox::{
    CancelToken, GmailCredentials, MailboxService, MailboxSettings, MessageId, ThreadId, UserId,
};
use serde_json::json;

const USAGE: &str = "\
usage: mailboxd <command> <user> [args]

commands:
  login <user> [code]          print the consent URL, or exchange a code
  token <user>                 print a valid access token
  sync <user>                  run a sync and print its report
  list <user> [limit]          print stored emails, newest first
  search <user> <query...>     sync, then fuzzy search the fresh cache
  ask <user> <query...>        semantic search over stored emails
  thread <user> <thread-id>    fetch a thread live
  attachment <user> <message-id> <attachment-id> <out-file>
  summarize <user> <thread-id> summarize a thread
  revoke <user>                revoke and forget the user's tokens";

#[tokio::main]
async fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    // Bootstrap config directory
    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {}", e);
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(e) = run(&args).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: &[String]) -> Result<()> {
    let (Some(command), Some(user)) = (args.first(), args.get(1)) else {
        eprintln!("{}", USAGE);
        bail!("missing command or user");
    };
    let user = UserId::new(user.as_str());
    let rest = &args[2..];

    let service = open_service()?;

    match command.as_str() {
        "login" => match rest.first() {
            Some(code) => {
                let credential = service.login(&user, code).await?;
                print_json(&json!({
                    "user": credential.user_id,
                    "expires_at": credential.expires_at,
                    "has_refresh_token": credential.refresh_token.is_some(),
                }))
            }
            None => {
                println!("{}", service.authorize_url(Some(user.as_str())));
                Ok(())
            }
        },
        "token" => {
            println!("{}", service.get_valid_token(&user).await?);
            Ok(())
        }
        "sync" => {
            let report = service.sync_now(&user, &CancelToken::new()).await;
            print_json(&report)
        }
        "list" => {
            let limit = match rest.first() {
                Some(n) => n.parse().with_context(|| format!("Invalid limit: {}", n))?,
                None => 20,
            };
            print_json(&service.stored_emails(&user, limit, 0).await?)
        }
        "search" => {
            // The search cache lives in this process, so fill it first
            let (report, hits) = service
                .sync_and_search(&user, &query(rest)?, &CancelToken::new())
                .await;
            if report.cached_threads.is_none() {
                bail!(
                    "sync for {} left the cache empty ({:?}): {}",
                    user,
                    report.outcome,
                    report.error.as_deref().unwrap_or("see log")
                );
            }
            print_json(&hits)
        }
        "ask" => print_json(&service.semantic_search(&user, &query(rest)?).await),
        "thread" => {
            let thread_id = ThreadId::new(arg(rest, 0, "thread-id")?);
            print_json(&service.get_thread_detail(&user, &thread_id).await?)
        }
        "attachment" => {
            let message_id = MessageId::new(arg(rest, 0, "message-id")?);
            let attachment_id = arg(rest, 1, "attachment-id")?;
            let out = arg(rest, 2, "out-file")?;
            let bytes = service.get_attachment(&user, &message_id, attachment_id).await?;
            std::fs::write(out, &bytes).with_context(|| format!("Failed to write {}", out))?;
            info!("Wrote {} bytes to {}", bytes.len(), out);
            Ok(())
        }
        "summarize" => {
            let thread_id = ThreadId::new(arg(rest, 0, "thread-id")?);
            print_json(&service.summarize_thread(&user, &thread_id).await?)
        }
        "revoke" => {
            service.revoke(&user).await?;
            info!("Revoked tokens for {}", user);
            Ok(())
        }
        other => {
            eprintln!("{}", USAGE);
            bail!("unknown command: {}", other)
        }
    }
}

fn open_service() -> Result<MailboxService> {
    let credentials = match GmailCredentials::load() {
        Ok(credentials) => credentials,
        Err(e) => {
            if let Some(path) = GmailCredentials::default_credentials_path() {
                warn!(
                    "To configure Gmail access, either:\n\
                     1. Place your Google OAuth credentials at: {}\n\
                     2. Or set environment variables: GMAIL_CLIENT_ID and GMAIL_CLIENT_SECRET",
                    path.display()
                );
            }
            return Err(e.context("Gmail credentials not found"));
        }
    };
    let settings = MailboxSettings::load()?;
    MailboxService::open(credentials, settings)
}

fn arg<'a>(rest: &'a [String], index: usize, name: &str) -> Result<&'a str> {
    rest.get(index)
        .map(String::as_str)
        .with_context(|| format!("missing argument <{}>", name))
}

fn query(rest: &[String]) -> Result<String> {
    let query = rest.join(" ");
    if query.trim().is_empty() {
        bail!("missing query");
    }
    Ok(query)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
