use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::io::{stderr, stdout};
use std::path::PathBuf;
use tracing::{info, warn};

use querykit::config::Config;
use querykit::logging;
use querykit::posts::{self, add_post_mutation, posts_key, posts_store, MockPosts};

#[derive(Parser, Debug)]
#[command(name = "querykit")]
#[command(about = "Query cache demo: list and add posts against a slow in-memory source")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/querykit/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Simulated data source latency in milliseconds
  #[arg(long, global = true)]
  latency_ms: Option<u64>,

  /// Number of reads that fail before the source recovers
  #[arg(long, global = true, default_value_t = 0)]
  fail_reads: usize,

  /// Print cache entries as JSON
  #[arg(long, global = true)]
  json: bool,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch and print the posts (default)
  List,
  /// Add posts, then print the refetched list
  Add {
    /// Titles of the posts to add
    #[arg(required = true)]
    titles: Vec<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override latency if specified on command line
  let config = if let Some(latency_ms) = args.latency_ms {
    Config {
      latency_ms,
      ..config
    }
  } else {
    config
  };

  let _log_guard = logging::init(&config.log)?;

  let source = MockPosts::new(config.seed_titles.iter().cloned())
    .with_latency(config.latency())
    .with_failing_reads(args.fail_reads);
  let store = posts_store(&source, config.stale_time());

  let _subscription = store.subscribe(posts_key(), |entry| {
    info!(
      status = ?entry.status,
      posts = entry.data().map_or(0, Vec::len),
      "Posts entry changed"
    );
  });

  let entry = store.fetch(posts_key()).await;
  posts::print_entry(&entry, args.json, &mut stdout(), &mut stderr())?;

  if let Some(Command::Add { titles }) = args.command {
    let add_post = add_post_mutation(&store, &source);

    for title in titles {
      match add_post.run(title.clone(), &[posts_key()]).await {
        Ok(id) => info!(%id, title = %title, "Added post"),
        Err(e) => {
          warn!(title = %title, error = %e, "Failed to add post");
          eprintln!("Failed to add post {:?}: {}", title, e);
        }
      }
    }

    let entry = store.fetch(posts_key()).await;
    posts::print_entry(&entry, args.json, &mut stdout(), &mut stderr())?;
  }

  store.dispose();

  Ok(())
}
