use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use vacsync_adapters::{HhApiSource, ListingQuery, VacancySource};
use vacsync_core::{BatchOutcome, OutcomeKind, VacancyGraph, VacancyPage};
use vacsync_storage::{MemoryStore, PgStore, Store};
use vacsync_sync::{stored_page_query, Origin, SyncConfig, SyncPipeline};

#[derive(Debug, Parser)]
#[command(name = "vacsync-cli")]
#[command(about = "Vacancy feed reconciler command-line interface")]
struct Cli {
    /// Keep everything in process memory instead of Postgres.
    #[arg(long, global = true)]
    memory: bool,
    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch one listing page and reconcile it into the store.
    Ingest(PageArgs),
    /// Listing page from the source, or from the store if the source fails.
    Browse(PageArgs),
    /// Fetch, reconcile and show one vacancy, falling back to the store.
    Vacancy { id: String },
    /// Stored vacancies, newest id first.
    List(PageArgs),
    /// One stored vacancy.
    Show { id: String },
}

#[derive(Debug, Args)]
struct PageArgs {
    #[arg(long, default_value_t = 0)]
    page: u32,
    #[arg(long)]
    per_page: Option<u32>,
    /// Exact vacancy name to filter by.
    #[arg(long)]
    text: Option<String>,
}

impl PageArgs {
    fn query(&self, config: &SyncConfig) -> ListingQuery {
        let query = ListingQuery::new(self.page, self.per_page.unwrap_or(config.page_size));
        match &self.text {
            Some(text) => query.with_text(text),
            None => query,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    tracing::info!(api_base = %config.api_base, memory = cli.memory, "vacsync starting");
    let source: Arc<dyn VacancySource> = Arc::new(
        HhApiSource::new(&config.api_base, config.http_config())
            .context("building vacancy source")?,
    );

    if cli.memory {
        run(SyncPipeline::new(MemoryStore::new(), source), &cli, &config).await
    } else {
        let store = PgStore::connect(&config.database_url, config.db_max_connections)
            .await
            .context("connecting to postgres")?;
        run(SyncPipeline::new(store, source), &cli, &config).await
    }
}

async fn run<S: Store>(pipeline: SyncPipeline<S>, cli: &Cli, config: &SyncConfig) -> Result<()> {
    match &cli.command {
        Commands::Ingest(args) => {
            let (listing, batch) = pipeline.ingest_listing(&args.query(config)).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&batch)?);
            } else {
                println!(
                    "ingested page {} of {} ({} found)",
                    listing.page.unwrap_or(0),
                    listing.pages.unwrap_or(0),
                    listing.found.unwrap_or(0)
                );
                print_batch(&batch);
            }
        }
        Commands::Browse(args) => {
            let result = pipeline.browse(&args.query(config)).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_origin(&result.origin);
                print_page(&result.page);
                if let Some(batch) = &result.batch {
                    print_batch(batch);
                }
            }
        }
        Commands::Vacancy { id } => {
            let view = pipeline.view_vacancy(id).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                print_origin(&view.origin);
                match &view.graph {
                    Some(graph) => print_graph(graph),
                    None => println!("vacancy {id} not found"),
                }
            }
        }
        Commands::List(args) => {
            let page = pipeline
                .store()
                .list_vacancies(&stored_page_query(&args.query(config)))
                .await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&page)?);
            } else {
                print_page(&page);
            }
        }
        Commands::Show { id } => {
            let graph = pipeline.store().find_vacancy(id).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&graph)?);
            } else {
                match &graph {
                    Some(graph) => print_graph(graph),
                    None => println!("vacancy {id} not stored"),
                }
            }
        }
    }

    Ok(())
}

fn print_origin(origin: &Origin) {
    match origin {
        Origin::Live => println!("source: live"),
        Origin::Stored { reason } => println!("source: stored data ({reason})"),
    }
}

fn print_page(page: &VacancyPage) {
    println!(
        "page {} of {} ({} found, {} per page)",
        page.page, page.pages, page.found, page.per_page
    );
    for graph in &page.items {
        println!(
            "  {:>10}  {}",
            graph.vacancy.id,
            graph.vacancy.name.as_deref().unwrap_or("-")
        );
    }
}

fn print_graph(graph: &VacancyGraph) {
    let vacancy = &graph.vacancy;
    println!("{} {}", vacancy.id, vacancy.name.as_deref().unwrap_or("-"));
    if let Some(published) = vacancy.published_at_parsed() {
        println!("  published: {published}");
    }
    if vacancy.archived {
        println!("  archived");
    }
    if let Some(kind) = &graph.type_vacancy {
        println!("  type: {}", kind.name.as_deref().unwrap_or(&kind.id));
    }
    if let Some(employment) = &graph.employment {
        println!("  employment: {}", employment.name.as_deref().unwrap_or(&employment.id));
    }
    if let Some(salary) = &graph.salary {
        println!(
            "  salary: {} - {} {}",
            salary.from.as_deref().unwrap_or("?"),
            salary.to.as_deref().unwrap_or("?"),
            salary.currency.as_deref().unwrap_or("")
        );
    }
    if let Some(address) = &graph.address {
        let parts = [&address.city, &address.street, &address.building]
            .into_iter()
            .filter_map(|p| p.as_deref())
            .collect::<Vec<_>>();
        println!("  address: {}", parts.join(", "));
    }
    if let Some(contacts) = &graph.contacts {
        println!(
            "  contacts: {} {}",
            contacts.name.as_deref().unwrap_or("-"),
            contacts.email.as_deref().unwrap_or("")
        );
    }
    for phone in &graph.phones {
        println!(
            "  phone: +{} ({}) {}",
            phone.country.as_deref().unwrap_or(""),
            phone.city.as_deref().unwrap_or(""),
            phone.number.as_deref().unwrap_or("")
        );
    }
}

fn print_batch(batch: &BatchOutcome) {
    println!(
        "reconciled: committed={} created={} updated={} failed={}",
        batch.committed.len(),
        batch.count(OutcomeKind::Created),
        batch.count(OutcomeKind::Updated),
        batch.failures.len()
    );
    for failure in &batch.failures {
        println!("  failed {}: {}", failure.vacancy_id, failure.reason);
    }
}
