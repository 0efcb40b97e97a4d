//! scholarfeed - personalized scholarly-paper discovery service.
//!
//! ## Usage
//!
//! ### HTTP server mode
//! ```bash
//! SESSION_SECRET=... scholarfeed serve --port 3000
//! ```
//!
//! ### One-off search (debugging the search plan)
//! ```bash
//! scholarfeed search "graph neural networks since 2020"
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scholarfeed::config::AppConfig;
use scholarfeed::openalex::{OpenAlexClient, SortBy};
use scholarfeed::paper_store::PaperStore;
use scholarfeed::query_parser::QueryParser;
use scholarfeed::search::SearchEngine;
use scholarfeed::server::{router, AppState};
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// Personalized scholarly-paper discovery service over OpenAlex
#[derive(Parser)]
#[command(name = "scholarfeed")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "3000")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// Run one search against the upstream index and print the results
    Search {
        /// Free-text query
        query: String,

        /// Sort order: recency or relevance
        #[arg(long, default_value = "recency")]
        sort_by: String,

        /// Page to fetch (1-indexed)
        #[arg(long, default_value = "1")]
        page: u32,

        /// Results per page (max 200)
        #[arg(long, default_value = "25")]
        per_page: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .init();

    match cli.command {
        Commands::Serve { port, host } => run_server(host, port).await,
        Commands::Search {
            query,
            sort_by,
            page,
            per_page,
        } => run_search(query, sort_by, page, per_page).await,
    }
}

async fn run_server(host: String, port: u16) -> Result<()> {
    let config = AppConfig::from_env().context("Invalid configuration")?;
    let state = AppState::new(config).context("Failed to wire application state")?;
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .context("Invalid host:port")?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(host = %host, port = port, "Starting HTTP server");
    println!("Listening on http://{}", addr);

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

async fn run_search(query: String, sort_by: String, page: u32, per_page: u32) -> Result<()> {
    let sort = match sort_by.as_str() {
        "recency" => SortBy::Recency,
        "relevance" => SortBy::Relevance,
        other => anyhow::bail!("Invalid sort_by: {}", other),
    };

    let openalex = Arc::new(OpenAlexClient::new(
        std::env::var("SCHOLARFEED_MAILTO").ok(),
    )?);
    let engine = SearchEngine::new(
        openalex,
        Arc::new(PaperStore::in_memory()),
        Arc::new(QueryParser::new(None)),
    );

    let papers = engine.search_text("cli", &query, sort, page, per_page).await?;
    println!("Found {} papers", papers.len());
    for paper in papers {
        let year = paper.year.map(|y| y.to_string()).unwrap_or_default();
        let authors: Vec<String> = paper
            .authors
            .iter()
            .take(3)
            .map(|a| a.display_name.clone())
            .collect();
        println!(
            "{}  {}  {}  [{}]",
            paper.paper_id,
            year,
            paper.title,
            authors.join(", ")
        );
    }
    Ok(())
}
