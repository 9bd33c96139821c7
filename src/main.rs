use std::fmt::Display;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;

use tagstore::config::Config;
use tagstore::{AppError, NewArticle, NewTag, Repository, TagCandidate, TagCriteria};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Database file, overrides the config
    #[arg(long, global = true)]
    db: Option<String>,

    /// Config file to use instead of the per-user one
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print one record per line instead of JSON
    #[arg(long, global = true)]
    plain: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the tables if they are missing
    Init,
    /// Store a new article and print its id
    AddArticle {
        #[arg(long)]
        url: String,
        #[arg(long)]
        platform: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        thumbnail: Option<String>,
    },
    /// List every article
    Articles,
    /// List every tag
    Tags,
    /// Store tags given as NAME or NAME:TYPE
    AddTags {
        #[arg(required = true)]
        tags: Vec<String>,
    },
    /// List tags whose name contains FRAGMENT
    SearchTags { fragment: String },
    /// List the tags attached to an article
    TagsOf { article_id: i64 },
    /// Attach tags (NAME or NAME:TYPE) to an article, creating them if needed
    Attach {
        article_id: i64,
        #[arg(required = true)]
        tags: Vec<String>,
    },
    /// Articles carrying all of the given tags
    Find {
        #[arg(long = "pair", value_name = "NAME[:TYPE]")]
        pairs: Vec<String>,
        #[arg(long = "name")]
        names: Vec<String>,
        #[arg(long = "id")]
        ids: Vec<i64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::load().context("loading config")?,
    };
    if let Some(db) = &args.db {
        config.db_path = db.clone();
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Schema failures are fatal to startup.
    let repo = Repository::new(&config.db_path)
        .await
        .with_context(|| format!("opening database {}", config.db_path))?;
    tracing::info!("Using database {}", config.db_path);

    let result = run(&repo, args.command, args.plain).await;

    if let Err(err) = &result {
        if is_fatal(err) {
            tracing::error!("Fatal store error: {}", err);
            eprintln!("Fatal: {err:#}");
            std::process::abort();
        }
    }

    settle(result, repo.close().await)
}

fn is_fatal(err: &anyhow::Error) -> bool {
    err.downcast_ref::<AppError>().is_some_and(AppError::is_fatal)
}

/// A command error wins over a close error; the close error is only logged.
fn settle(result: anyhow::Result<()>, closed: tagstore::Result<()>) -> anyhow::Result<()> {
    match (result, closed) {
        (Err(err), Err(close_err)) => {
            tracing::warn!("Failed to close database: {}", close_err);
            Err(err)
        }
        (Ok(()), Err(close_err)) => Err(close_err).context("closing database"),
        (result, Ok(())) => result,
    }
}

async fn run(repo: &Repository, command: Command, plain: bool) -> anyhow::Result<()> {
    match command {
        Command::Init => {
            // Repository::new already created the schema.
            println!("Initialized");
        }
        Command::AddArticle {
            url,
            platform,
            description,
            thumbnail,
        } => {
            let article = NewArticle {
                url,
                platform,
                description,
                thumbnail_url: thumbnail,
            };
            let id = repo.add_article(article).await?;
            println!("{id}");
        }
        Command::Articles => emit(&repo.get_articles().await?, plain)?,
        Command::Tags => emit(&repo.get_tag_list().await?, plain)?,
        Command::AddTags { tags } => {
            let inserted = repo.add_tags(parse_tags(&tags)?).await?;
            println!("{inserted}");
        }
        Command::SearchTags { fragment } => {
            emit(&repo.get_tags_containing(&fragment).await?, plain)?
        }
        Command::TagsOf { article_id } => {
            emit(&repo.get_tags_of_article(article_id).await?, plain)?
        }
        Command::Attach { article_id, tags } => {
            let candidates = parse_tags(&tags)?
                .into_iter()
                .map(TagCandidate::from)
                .collect();
            let attached = repo.attach_tags_to_article(article_id, candidates).await?;
            emit(&attached, plain)?;
        }
        Command::Find { pairs, names, ids } => {
            let criteria = match (pairs.is_empty(), names.is_empty(), ids.is_empty()) {
                (false, true, true) => TagCriteria::Pairs(parse_tags(&pairs)?),
                (true, false, true) => TagCriteria::Names(names),
                (true, true, false) => TagCriteria::Ids(ids),
                _ => bail!("pass exactly one kind of criteria: --pair, --name or --id"),
            };
            emit(&repo.find_articles_by_tags(criteria).await?, plain)?;
        }
    }
    Ok(())
}

fn parse_tags(raw: &[String]) -> anyhow::Result<Vec<NewTag>> {
    raw.iter()
        .map(|s| NewTag::parse(s).map_err(anyhow::Error::from))
        .collect()
}

fn emit<T: Serialize + Display>(items: &[T], plain: bool) -> anyhow::Result<()> {
    if plain {
        for item in items {
            println!("{item}");
        }
    } else {
        println!("{}", serde_json::to_string_pretty(items)?);
    }
    Ok(())
}
