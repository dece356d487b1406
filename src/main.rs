//! # Portal Mirror CLI (`pmirror`)
//!
//! The `pmirror` binary drives the fetch-and-sync engine: it initializes the
//! object database, mirrors single resources, lists what is stored, removes
//! artifacts that vanished upstream, and checks the proxy allocation
//! service.
//!
//! ## Usage
//!
//! ```bash
//! pmirror --config ./config/pmirror.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `pmirror init` | Create the SQLite database and object table |
//! | `pmirror fetch <url>` | Sync one resource into the primary bucket |
//! | `pmirror ls <prefix>` | List stored artifacts |
//! | `pmirror reconcile <prefix>` | Back up and remove artifacts gone upstream |
//! | `pmirror proxy` | Resolve one egress proxy |
//! | `pmirror completions <shell>` | Print shell completions |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! pmirror init --config ./config/pmirror.toml
//!
//! # Mirror a proposal page fetched with a form POST
//! pmirror fetch https://portal.example/bi/vo020.asp \
//!     --folder vorlagen/ --name vo12 --ending .html --form VOLFDNR=12
//!
//! # Remove proposals that are no longer listed, with their attachments
//! pmirror reconcile vorlagen/ --live live.txt --child-folder anlagen/ --since 2023-01-01
//! ```

use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;

use portal_mirror::ingest::{self, FetchArgs};
use portal_mirror::{config, logging, ls, migrate, proxy};

/// Portal Mirror CLI: a resilient fetch-and-sync engine for legacy web portals.
///
/// All commands except `completions` read a TOML configuration file given
/// with `--config`.
#[derive(Parser)]
#[command(
    name = "pmirror",
    about = "Portal Mirror: mirror a legacy web portal into a versioned object store",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/pmirror.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Sync one remote resource into the primary bucket.
    ///
    /// Serves the stored copy while it is fresh, otherwise fetches the
    /// resource, and writes it only if its content changed (backing up the
    /// previous version first).
    Fetch {
        /// URL of the resource.
        url: String,

        /// Target folder in the bucket, e.g. `vorlagen/`.
        #[arg(long)]
        folder: String,

        /// Base name of the stored artifact (sanitized).
        #[arg(long)]
        name: String,

        /// File ending appended to the name.
        #[arg(long, default_value = ".html")]
        ending: String,

        /// Form field sent with a POST (repeatable). Switches to POST.
        #[arg(long = "form", value_parser = parse_key_val)]
        form: Vec<(String, String)>,

        /// Expected content type prefix, `*` for any.
        #[arg(long, default_value = "*")]
        expect: String,

        /// Re-fetch unless the stored copy is younger than the minimum age.
        #[arg(long)]
        redownload: bool,

        /// Always fetch, ignoring the stored copy.
        #[arg(long)]
        force: bool,

        /// Creation time of the resource (RFC 3339 or YYYY-MM-DD). Defaults to now.
        #[arg(long)]
        created: Option<String>,
    },

    /// List stored artifacts under a prefix.
    Ls {
        /// Path prefix, e.g. `vorlagen/`. Empty lists everything.
        #[arg(default_value = "")]
        prefix: String,
    },

    /// Back up and delete stored artifacts that are gone upstream.
    Reconcile {
        /// Path prefix to reconcile.
        prefix: String,

        /// File with one live object path per line.
        #[arg(long)]
        live: PathBuf,

        /// Folder holding children of removed artifacts (repeatable).
        #[arg(long = "child-folder")]
        child_folders: Vec<String>,

        /// Only consider artifacts whose source time is after this
        /// (RFC 3339 or YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,
    },

    /// Resolve one proxy through the allocation service.
    Proxy,

    /// Print shell completions.
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Parse a `key=value` pair for `--form` arguments.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "pmirror", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.log)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Fetch {
            url,
            folder,
            name,
            ending,
            form,
            expect,
            redownload,
            force,
            created,
        } => {
            ingest::run_fetch(
                &cfg,
                FetchArgs {
                    url,
                    folder,
                    name,
                    ending,
                    form,
                    expect,
                    redownload,
                    force,
                    created,
                },
            )
            .await?;
        }
        Commands::Ls { prefix } => {
            ls::run_ls(&cfg, &prefix).await?;
        }
        Commands::Reconcile {
            prefix,
            live,
            child_folders,
            since,
        } => {
            ingest::run_reconcile(&cfg, &prefix, &live, child_folders, since).await?;
        }
        Commands::Proxy => {
            proxy::run_proxy(&cfg).await?;
        }
        Commands::Completions { .. } => {
            // Handled above (before config loading)
        }
    }

    Ok(())
}
