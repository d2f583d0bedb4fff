use clap::{Parser, Subcommand};
use snaptime::config::Config;
use snaptime::version_mapper::VersionRecord;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = concat!("v", env!("CARGO_PKG_VERSION"), "+", env!("GIT_SHA")))]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the available ZFS snapshots, newest first
    Snapshots {
        /// Emit machine-readable JSON instead of a plain listing
        #[arg(long)]
        json: bool,
    },
    /// List every reconstructed version of an object, newest first
    Versions {
        bucket: String,
        key: String,
        /// Emit machine-readable JSON instead of a plain listing
        #[arg(long)]
        json: bool,
    },
    /// Fetch the content of a specific version and write it to a file
    Get {
        bucket: String,
        key: String,
        version_id: String,
        /// Destination path for the retrieved content
        #[arg(long, short = 'o')]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let args = Args::parse();
    let config = Config::from_env()?;
    let mapper = snaptime::build_mapper(&config);

    match args.command {
        Command::Snapshots { json } => {
            let snapshots = mapper.enumerate_snapshots().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshots)?);
            } else {
                for snapshot in &snapshots {
                    match snapshot.timestamp {
                        Some(ts) => println!("{}\t{}", snapshot.name, ts),
                        None => println!("{}\t-", snapshot.name),
                    }
                }
            }
        }
        Command::Versions { bucket, key, json } => {
            let versions = mapper.list_object_versions(&bucket, &key).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&versions)?);
            } else {
                for version in &versions {
                    print_version_line(version);
                }
            }
        }
        Command::Get {
            bucket,
            key,
            version_id,
            out,
        } => {
            let (content, version) = mapper.get_version_content(&bucket, &key, &version_id).await?;
            tokio::fs::write(&out, &content).await?;
            log::info!("wrote {} bytes to {}", content.len(), out.display());
            print_version_line(&version);
        }
    }

    Ok(())
}

fn print_version_line(version: &VersionRecord) {
    let modified = version
        .modified_time
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{}\t{:?}\t{} bytes\t{}",
        version.version_id, version.source, version.size, modified
    );
}
