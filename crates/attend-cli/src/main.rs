use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[zbus::proxy(
    interface = "org.freedesktop.Attend1",
    default_service = "org.freedesktop.Attend1",
    default_path = "/org/freedesktop/Attend1"
)]
trait Attend {
    async fn enroll(&self, identity: &str, embeddings: Vec<Vec<f64>>) -> zbus::Result<u32>;
    async fn finalize(&self, identity: &str) -> zbus::Result<bool>;
    async fn observe(
        &self,
        camera_id: &str,
        direction: &str,
        timestamp_ms: i64,
        embeddings: Vec<Vec<f64>>,
    ) -> zbus::Result<String>;
    async fn report(&self, identity: &str, from_ms: i64, to_ms: i64) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "attend", about = "Attendance daemon CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum DirectionArg {
    In,
    Out,
}

impl DirectionArg {
    fn as_str(self) -> &'static str {
        match self {
            DirectionArg::In => "in",
            DirectionArg::Out => "out",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Add enrollment samples for an identity
    Enroll {
        identity: String,
        /// JSON file with one embedding or an array of embeddings
        file: PathBuf,
    },
    /// Make an enrolled identity matchable
    Finalize { identity: String },
    /// Submit the faces of one frame for check-in or check-out
    Observe {
        #[arg(long, default_value = "cli")]
        camera: String,
        #[arg(long, value_enum)]
        direction: DirectionArg,
        /// Capture time (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
        /// JSON file with one embedding per detected face
        file: PathBuf,
    },
    /// Show attendance rows and summary
    Report {
        #[arg(long)]
        identity: Option<String>,
        /// Window start (RFC 3339)
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        /// Window end, exclusive (RFC 3339)
        #[arg(long)]
        to: Option<DateTime<Utc>>,
    },
    /// List enrolled identities
    List,
    /// Show daemon status
    Status,
}

/// Accepts `[0.1, ...]` or `[[0.1, ...], ...]`.
#[derive(Deserialize)]
#[serde(untagged)]
enum EmbeddingFile {
    Many(Vec<Vec<f64>>),
    One(Vec<f64>),
}

fn parse_embeddings(text: &str) -> Result<Vec<Vec<f64>>> {
    let parsed: EmbeddingFile =
        serde_json::from_str(text).context("expected a JSON array of numbers or of arrays")?;
    let embeddings = match parsed {
        EmbeddingFile::Many(many) => many,
        EmbeddingFile::One(one) => vec![one],
    };
    if embeddings.is_empty() {
        bail!("no embeddings in file");
    }
    Ok(embeddings)
}

fn read_embeddings(path: &Path) -> Result<Vec<Vec<f64>>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_embeddings(&text).with_context(|| format!("parsing {}", path.display()))
}

fn millis(ts: Option<DateTime<Utc>>) -> i64 {
    ts.map_or(0, |t| t.timestamp_millis())
}

fn print_json(text: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(text).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let builder = if cli.system {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let conn = builder
        .method_timeout(Duration::from_secs(10))
        .build()
        .await
        .context("connecting to D-Bus")?;
    let proxy = AttendProxy::new(&conn).await?;
    tracing::debug!(system = cli.system, "connected to attendd");

    match cli.command {
        Commands::Enroll { identity, file } => {
            let embeddings = read_embeddings(&file)?;
            let added = embeddings.len();
            let total = proxy.enroll(&identity, embeddings).await?;
            println!("Enrolled {added} sample(s) for {identity} ({total} total)");
        }
        Commands::Finalize { identity } => {
            if proxy.finalize(&identity).await? {
                println!("{identity} finalized");
            } else {
                println!("{identity} was already finalized");
            }
        }
        Commands::Observe {
            camera,
            direction,
            at,
            file,
        } => {
            let embeddings = read_embeddings(&file)?;
            let json = proxy
                .observe(&camera, direction.as_str(), millis(at), embeddings)
                .await?;
            print_json(&json)?;
        }
        Commands::Report { identity, from, to } => {
            let json = proxy
                .report(identity.as_deref().unwrap_or(""), millis(from), millis(to))
                .await?;
            print_json(&json)?;
        }
        Commands::List => {
            print_json(&proxy.list_identities().await?)?;
        }
        Commands::Status => {
            print_json(&proxy.status().await?)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_and_many() {
        assert_eq!(parse_embeddings("[0.5, 1]").unwrap(), vec![vec![0.5, 1.0]]);
        assert_eq!(
            parse_embeddings("[[0.5], [0.25]]").unwrap(),
            vec![vec![0.5], vec![0.25]]
        );
    }

    #[test]
    fn test_parse_rejects_empty_and_garbage() {
        assert!(parse_embeddings("[]").is_err());
        assert!(parse_embeddings("{\"a\": 1}").is_err());
    }

    #[test]
    fn test_observe_args() {
        let cli = Cli::try_parse_from([
            "attend",
            "observe",
            "--camera",
            "gate-2",
            "--direction",
            "out",
            "--at",
            "2026-03-02T08:00:00Z",
            "faces.json",
        ])
        .unwrap();
        match cli.command {
            Commands::Observe {
                camera,
                direction,
                at,
                ..
            } => {
                assert_eq!(camera, "gate-2");
                assert_eq!(direction.as_str(), "out");
                assert_eq!(millis(at), 1_772_438_400_000);
            }
            _ => panic!("expected observe"),
        }
    }
}
