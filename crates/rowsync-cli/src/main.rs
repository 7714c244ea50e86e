//! rowsync binary.
//!
//! Seeds an in-process kernel and drives client sessions against it.
//!
//! Usage:
//!   # Scroll a 50k-row document to row 20000 and show what got loaded
//!   cargo run -p rowsync-cli -- simulate --rows 50000 --scroll-to 20000
//!
//!   # Same, filtered, with a session config
//!   cargo run -p rowsync-cli -- simulate --search "str.12" --config session.ron
//!
//!   # Two clients racing for one row
//!   cargo run -p rowsync-cli -- contend --row 42

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use rowsync_client::{DocumentSession, SessionConfig};
use rowsync_kernel::{Hub, HubConfig, LocalTransport, SharedHub};
use rowsync_types::{DocumentId, Row, RowId, RowStatus, UserId, UserRef};

#[derive(Parser, Debug)]
#[command(name = "rowsync")]
#[command(about = "Virtualized row cache and row locking, in one process")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open a document, scroll, and report the cache state
    Simulate {
        /// Number of generated rows
        #[arg(long, default_value_t = 1000)]
        rows: u64,

        /// Load rows from a JSON array instead of generating them
        #[arg(long)]
        rows_file: Option<PathBuf>,

        /// 1-based row to scroll to
        #[arg(long)]
        scroll_to: Option<u64>,

        /// Viewport height in px
        #[arg(long)]
        viewport: Option<f64>,

        /// Filter rows by substring
        #[arg(long)]
        search: Option<String>,

        /// Session config (RON)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Two clients race for the same row lock
    Contend {
        /// Row id to fight over
        #[arg(long, default_value_t = 42)]
        row: u64,

        /// Number of generated rows
        #[arg(long, default_value_t = 200)]
        rows: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.command {
        Command::Simulate { rows, rows_file, scroll_to, viewport, search, config } => {
            simulate(rows, rows_file, scroll_to, viewport, search, config).await
        }
        Command::Contend { row, rows } => contend(RowId(row), rows).await,
    }
}

fn generate_rows(count: u64) -> Vec<Row> {
    (1..=count)
        .map(|n| {
            let mut source = format!("Segment {n}: {}", "lorem ipsum ".repeat((n % 9) as usize));
            if n % 13 == 0 {
                source.push_str("<br>second line");
            }
            let status = RowStatus::ALL[(n % 4) as usize];
            let target = if status == RowStatus::Pending {
                String::new()
            } else {
                format!("Segmento {n}")
            };
            Row { id: RowId(n), row_num: n, string_id: format!("str.{n}"), source, target, status }
        })
        .collect()
}

fn load_rows(path: &PathBuf) -> Result<Vec<Row>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let rows: Vec<Row> = serde_json::from_str(&text)
        .with_context(|| format!("parsing rows from {}", path.display()))?;
    Ok(rows)
}

fn seed(hub: &SharedHub, rows: Vec<Row>) -> DocumentId {
    let doc = DocumentId::new();
    hub.rows().insert_document(doc, rows);
    doc
}

async fn connect(
    hub: &SharedHub,
    doc: DocumentId,
    name: &str,
    config: SessionConfig,
) -> Result<DocumentSession> {
    let user = UserRef::new(UserId::new(), name);
    let transport = LocalTransport::shared(Arc::clone(hub), user.clone());
    let session = DocumentSession::open(doc, user, transport, config)
        .await
        .with_context(|| format!("{name} opening {doc}"))?;
    Ok(session)
}

async fn simulate(
    rows: u64,
    rows_file: Option<PathBuf>,
    scroll_to: Option<u64>,
    viewport: Option<f64>,
    search: Option<String>,
    config: Option<PathBuf>,
) -> Result<()> {
    let mut config = match config {
        Some(path) => SessionConfig::load(&path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(height) = viewport {
        config.viewport_height = height;
    }
    config.validate()?;

    let hub = Hub::shared(HubConfig::default());
    let rows = match rows_file {
        Some(path) => load_rows(&path)?,
        None => generate_rows(rows),
    };
    let doc = seed(&hub, rows);

    let mut session = connect(&hub, doc, "operator", config).await?;
    if search.is_some() {
        session.reload(search).await?;
    }
    if let Some(row_num) = scroll_to {
        let index = usize::try_from(row_num.saturating_sub(1))?;
        let offset = session.scroll_offset_of(index);
        info!("scrolling to row {} (offset {:.0}px)", row_num, offset);
        session.on_scroll(offset);
    }
    session.settle().await;

    let window = session.window();
    println!("document      {doc}");
    if let Some(search) = session.search() {
        println!("search        {search:?}");
    }
    println!("total rows    {}", session.total());
    println!("window        {} ({} rows)", window, window.len());
    println!("loaded pages  {:?}", session.loaded_pages());
    println!("fetches       {}", session.fetches_issued());
    println!("avg height    {:.1}px", session.cache().avg_height());
    println!("total height  {}px (estimated)", session.estimated_total_height());
    println!("status (loaded rows):");
    for (status, count) in session.status_counts() {
        println!("  {:<12}{}", status.as_str(), count);
    }
    println!("visible:");
    for index in window.range().take(10) {
        match session.row_at(index) {
            Some(row) => println!(
                "  {:>6}  {:<12} {:<10} {}",
                row.row_num,
                row.string_id,
                row.status.as_str(),
                truncate(&row.source, 48)
            ),
            None => println!("  {:>6}  (loading)", index + 1),
        }
    }

    session.close().await;
    Ok(())
}

async fn contend(row_id: RowId, rows: u64) -> Result<()> {
    let hub = Hub::shared(HubConfig::default());
    let doc = seed(&hub, generate_rows(rows));

    let mut alice = connect(&hub, doc, "alice", SessionConfig::default()).await?;
    let mut bob = connect(&hub, doc, "bob", SessionConfig::default()).await?;
    alice.process_events();
    println!("viewers       {}", bob.viewer_count());

    let mut edit = alice.begin_edit(row_id).await?;
    println!("alice         locked row {row_id}");

    bob.process_events();
    match bob.begin_edit(row_id).await {
        Ok(mut unexpected) => {
            bob.abandon_edit(&mut unexpected).await;
            anyhow::bail!("bob was granted row {row_id} while alice held it");
        }
        Err(err) => println!("bob           denied: {err}"),
    }

    let outcome = alice.commit_edit(&mut edit, "Hola", RowStatus::Translated).await?;
    println!("alice         committed {:?} ({})", outcome.row.target, outcome.row.status);

    for event in bob.process_events() {
        info!("bob saw {:?}", event);
    }
    let seen = bob.row_by_id(row_id).map(|r| r.target.clone()).unwrap_or_default();
    println!("bob           sees {seen:?}");

    let mut edit = bob.begin_edit(row_id).await?;
    println!("bob           locked row {row_id}");
    bob.abandon_edit(&mut edit).await;

    alice.close().await;
    bob.close().await;
    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let head: String = text.chars().take(max.saturating_sub(1)).collect();
        format!("{head}…")
    }
}
