use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use clicky_short::{
    api::{ClickRecord, LinkDetails, parse_timestamp},
    click_ledger::{ClickQuery, click_ledger_capsule},
    config::{self, Settings},
    link_repo::LinkUpdate,
    registry::{NewLink, url_registry_capsule},
};
use serde::Serialize;

/// Administrative control surface for clicky-short, operating directly on its database
#[derive(Parser)]
#[command(name = "link-admin")]
#[command(version)]
#[command(about = "Manage short links and inspect recorded clicks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Shorten a URL
    Create {
        /// Redirect target (http:// or https://)
        url: String,

        /// Custom short code instead of a generated one
        #[arg(long)]
        code: Option<String>,

        /// Expire the link after this many days
        #[arg(long, allow_negative_numbers = true)]
        expires_in_days: Option<i64>,

        #[arg(long, default_value = "")]
        notes: String,

        /// Comma-separated tags
        #[arg(long, default_value = "")]
        tags: String,
    },

    /// Show a live link with its click count
    Show { code: String },

    /// List links, newest first
    List {
        /// Include soft-deleted links
        #[arg(long)]
        all: bool,

        /// Only active links whose code, URL, notes or tags contain this text
        #[arg(long, conflicts_with = "all")]
        search: Option<String>,
    },

    /// Change a link's target or metadata
    Update {
        code: String,

        #[arg(long)]
        url: Option<String>,

        #[arg(long)]
        notes: Option<String>,

        #[arg(long)]
        tags: Option<String>,

        /// New expiration time (RFC 3339)
        #[arg(long)]
        expires_at: Option<String>,
    },

    /// Soft-delete a link, or remove it and its clicks with --hard
    Delete {
        code: String,

        /// Irreversibly remove the link and every click recorded for it
        #[arg(long)]
        hard: bool,
    },

    /// List recorded clicks, newest first
    Clicks {
        /// Only clicks for this short code
        #[arg(long)]
        code: Option<String>,

        /// Earliest click time (RFC 3339, inclusive)
        #[arg(long)]
        since: Option<String>,

        /// Latest click time (RFC 3339, inclusive)
        #[arg(long)]
        until: Option<String>,

        #[arg(long)]
        limit: Option<u64>,
    },

    /// Print aggregate click statistics
    Stats,

    /// Soft-delete every link whose expiration has passed
    Sweep,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::init_tracing()?;
    let cli = Cli::parse();

    let container = config::init_container(Settings::from_env()?).await?;
    let (registry, ledger) = container.read((url_registry_capsule, click_ledger_capsule));

    match cli.command {
        Command::Create {
            url,
            code,
            expires_in_days,
            notes,
            tags,
        } => {
            let link = registry
                .create(NewLink {
                    original_url: url,
                    custom_code: code,
                    expires_in: expires_in_days.map(time::Duration::days),
                    notes,
                    tags,
                })
                .await?;
            let shortened_url = registry.shortened_url(&link.short_code);
            print_json(&LinkDetails::new(link, shortened_url, None)?)?;
        }
        Command::Show { code } => {
            let Some(link) = registry.lookup(&code).await? else {
                bail!("No live link with short code {code}");
            };
            let clicks = ledger.count_for(&code).await?;
            print_json(&LinkDetails::new(link, registry.shortened_url(&code), Some(clicks))?)?;
        }
        Command::List { all, search } => {
            let links = match search {
                Some(term) => registry.search(&term).await?,
                None => registry.list(all).await?,
            };
            let details = links
                .into_iter()
                .map(|link| {
                    let shortened_url = registry.shortened_url(&link.short_code);
                    LinkDetails::new(link, shortened_url, None)
                })
                .collect::<Result<Vec<_>, _>>()?;
            print_json(&details)?;
        }
        Command::Update {
            code,
            url,
            notes,
            tags,
            expires_at,
        } => {
            let changes = LinkUpdate {
                original_url: url,
                notes,
                tags,
                expires_at: expires_at
                    .as_deref()
                    .map(parse_timestamp)
                    .transpose()
                    .context("--expires-at must be an RFC 3339 timestamp")?,
            };
            if changes.is_empty() {
                bail!("Nothing to update; pass --url, --notes, --tags or --expires-at");
            }
            if !registry.update(&code, changes).await? {
                bail!("No active link with short code {code}");
            }
            println!("Updated {code}");
        }
        Command::Delete { code, hard } => {
            let deleted = if hard {
                registry.hard_delete(&code).await?
            } else {
                registry.soft_delete(&code).await?
            };
            if !deleted {
                bail!("No link with short code {code}");
            }
            println!("Deleted {code}{}", if hard { " permanently" } else { "" });
        }
        Command::Clicks {
            code,
            since,
            until,
            limit,
        } => {
            let query = ClickQuery {
                short_code: code,
                start: since
                    .as_deref()
                    .map(parse_timestamp)
                    .transpose()
                    .context("--since must be an RFC 3339 timestamp")?,
                end: until
                    .as_deref()
                    .map(parse_timestamp)
                    .transpose()
                    .context("--until must be an RFC 3339 timestamp")?,
                limit,
            };
            let clicks = ledger
                .query(query)
                .await?
                .into_iter()
                .map(ClickRecord::try_from)
                .collect::<Result<Vec<_>, _>>()?;
            print_json(&clicks)?;
        }
        Command::Stats => print_json(&ledger.aggregate_stats().await?)?,
        Command::Sweep => {
            let count = registry.expire_sweep().await?;
            println!("Deactivated {count} expired link(s)");
        }
    }

    Ok(())
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}
