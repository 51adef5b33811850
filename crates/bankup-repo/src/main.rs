//! bankup-repo: firmware repository management CLI

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use bankup::stamp::{next_version, Stamp, STAMP_FILE};
use bankup::{Keypair, Repository};

#[derive(Parser, Debug)]
#[command(name = "bankup-repo")]
#[command(version, about = "Manage a signed firmware update repository")]
struct Cli {
    /// Repository directory
    #[arg(long, default_value = ".", global = true)]
    repo: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a fresh RSA keypair into the repository directory
    Keygen {
        /// Overwrite existing key material
        #[arg(long)]
        force: bool,
    },

    /// Add a firmware image to the catalog
    Add {
        /// Path to the image file
        image: PathBuf,

        /// Build stamp supplying uuid and version
        #[arg(long, conflicts_with = "version")]
        stamp: Option<PathBuf>,

        /// Explicit version (default: one past the highest in the catalog)
        #[arg(long)]
        version: Option<u32>,

        /// Labels attached to the catalog entry
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Add the image in disabled state
        #[arg(long)]
        disabled: bool,
    },

    /// List the catalog
    List,

    /// Remove an image by catalog index
    Delete { index: usize },

    /// Enable an image by catalog index
    Enable { index: usize },

    /// Disable an image by catalog index
    Disable { index: usize },

    /// Check every catalog entry against its blob
    Verify,

    /// Delete dangling files and drop broken catalog entries
    Repair,

    /// Write a build stamp for the next image
    Stamp {
        /// Uuid of the repository this build targets
        #[arg(long)]
        repo_uuid: String,

        /// Explicit version (default: one past the highest in the catalog)
        #[arg(long)]
        version: Option<u32>,

        /// Output path
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen { force } => keygen(&cli.repo, force),
        Commands::Add {
            image,
            stamp,
            version,
            tags,
            disabled,
        } => add(&cli.repo, &image, stamp.as_deref(), version, tags, !disabled),
        Commands::List => list(&cli.repo),
        Commands::Delete { index } => {
            open(&cli.repo)?.delete(index)?;
            Ok(())
        }
        Commands::Enable { index } => {
            open(&cli.repo)?.set_enabled(index, true)?;
            Ok(())
        }
        Commands::Disable { index } => {
            open(&cli.repo)?.set_enabled(index, false)?;
            Ok(())
        }
        Commands::Verify => verify(&cli.repo),
        Commands::Repair => {
            let changed = open(&cli.repo)?.repair()?;
            println!("{}", if changed { "repository repaired" } else { "nothing to repair" });
            Ok(())
        }
        Commands::Stamp {
            repo_uuid,
            version,
            output,
        } => stamp(&cli.repo, repo_uuid, version, output),
    }
}

fn open(repo: &std::path::Path) -> Result<Repository> {
    let keys = Keypair::load(repo)
        .with_context(|| format!("loading keys from {}", repo.display()))?;
    if !keys.has_private() {
        bail!("repository mutations require the private key half");
    }
    Ok(Repository::open(repo, keys)?)
}

fn keygen(repo: &std::path::Path, force: bool) -> Result<()> {
    let pub_path = repo.join(bankup::PUBLIC_KEY_FILE);
    if pub_path.exists() && !force {
        bail!("{} already exists, pass --force to overwrite", pub_path.display());
    }

    info!("generating {}-bit RSA keypair", bankup::crypto::RSA_KEY_BITS);
    let keys = Keypair::generate()?;
    keys.save(repo)?;
    println!("keypair written to {}", repo.display());
    Ok(())
}

fn add(
    repo_dir: &std::path::Path,
    image: &std::path::Path,
    stamp: Option<&std::path::Path>,
    version: Option<u32>,
    tags: Vec<String>,
    enabled: bool,
) -> Result<()> {
    let data = std::fs::read(image)
        .with_context(|| format!("reading image {}", image.display()))?;
    let mut repo = open(repo_dir)?;

    let (uuid, version) = match stamp {
        Some(path) => {
            let stamp = Stamp::load(path)
                .with_context(|| format!("loading stamp {}", path.display()))?;
            (stamp.uuid, stamp.version)
        }
        None => (
            Uuid::new_v4().to_string(),
            version.unwrap_or_else(|| next_version(repo.manifest())),
        ),
    };

    repo.add(&uuid, version, &data, enabled, tags)?;
    println!("added {} as version {}", uuid, version);
    Ok(())
}

fn list(repo_dir: &std::path::Path) -> Result<()> {
    let repo = open_read_only(repo_dir)?;
    let manifest = repo.manifest();

    println!(
        "serial {}  timestamp {}  {} image(s)",
        manifest.serial,
        manifest.timestamp,
        manifest.images.len()
    );
    for (index, image) in manifest.images.iter().enumerate() {
        println!(
            "{:3}  {}  v{:<5}  {:>9} bytes  {}  [{}]",
            index,
            image.uuid,
            image.version,
            image.size,
            if image.enabled { "enabled " } else { "disabled" },
            image.tags.join(", "),
        );
    }
    Ok(())
}

fn verify(repo_dir: &std::path::Path) -> Result<()> {
    let repo = open_read_only(repo_dir)?;
    let bad = repo.verify();
    if bad.is_empty() {
        println!("all {} image(s) verified", repo.manifest().images.len());
        Ok(())
    } else {
        for uuid in &bad {
            eprintln!("FAILED {uuid}");
        }
        bail!("{} image(s) failed verification", bad.len());
    }
}

// List and verify only need the public half.
fn open_read_only(repo: &std::path::Path) -> Result<Repository> {
    let keys = Keypair::load(repo)
        .with_context(|| format!("loading keys from {}", repo.display()))?;
    Ok(Repository::open(repo, keys)?)
}

fn stamp(
    repo_dir: &std::path::Path,
    repo_uuid: String,
    version: Option<u32>,
    output: Option<PathBuf>,
) -> Result<()> {
    let version = match version {
        Some(v) => v,
        None => next_version(open_read_only(repo_dir)?.manifest()),
    };

    let stamp = Stamp::new(repo_uuid, version);
    let path = output.unwrap_or_else(|| PathBuf::from(STAMP_FILE));
    stamp.save(&path)?;
    println!("stamp {} (version {}) written to {}", stamp.uuid, version, path.display());
    Ok(())
}
