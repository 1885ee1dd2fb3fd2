mod doctor;
mod prompt;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use forage_core::calendar::FileCalendar;
use forage_core::config::{AppConfig, ModelConfig};
use forage_core::domain::MealTag;
use forage_core::traits::{CalendarSource, PlacesService};

use forage_agent::{
    CatalogBuilder, LocationExtractor, RunInputs, RunLogger, WorkflowCoordinator,
};
use forage_places::OsmPlaces;

#[derive(Parser)]
#[command(
    name = "forage",
    version,
    about = "Plan where to eat around your day"
)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "forage.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Pick restaurants, plan the route and write up the day
    Plan {
        /// Meal to plan (repeatable): breakfast, lunch or dinner
        #[arg(short, long = "meal")]
        meals: Vec<MealTag>,
        /// City to search (overrides config)
        #[arg(long)]
        city: Option<String>,
        /// Food preferences, in plain words
        #[arg(short, long)]
        preferences: Option<String>,
        /// Dietary, budget or timing constraints
        #[arg(long)]
        constraints: Option<String>,
        /// Calendar file (overrides config)
        #[arg(long)]
        calendar: Option<PathBuf>,
        /// Print the full run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Extract location anchors from a calendar and print them
    Locate {
        /// Calendar file (overrides config)
        #[arg(long)]
        calendar: Option<PathBuf>,
        /// City used to qualify lookups (overrides config)
        #[arg(long)]
        city: Option<String>,
    },
    /// Build the venue catalog for a city and print it
    Catalog {
        /// City to search (overrides config)
        #[arg(long)]
        city: Option<String>,
        /// Also list every venue
        #[arg(long)]
        venues: bool,
    },
    /// Show current configuration
    Config,
    /// Check configuration and collaborators
    Doctor,
    /// Generate shell completions
    Completions {
        /// Shell to generate for
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("forage=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Some(Commands::Completions { shell }) = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "forage", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Some(Commands::Config) => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Commands::Doctor) => {
            println!("Forage Doctor");
            println!("=============");
            doctor::run_doctor(&config);
            Ok(())
        }
        Some(Commands::Locate { calendar, city }) => run_locate(&config, calendar, city).await,
        Some(Commands::Catalog { city, venues }) => run_catalog(&config, city, venues).await,
        Some(Commands::Plan {
            meals,
            city,
            preferences,
            constraints,
            calendar,
            json,
        }) => {
            let plan = PlanArgs {
                meals,
                city,
                preferences,
                constraints,
                calendar,
                json,
            };
            run_plan(&config, plan).await
        }
        None => {
            let plan = PlanArgs {
                meals: Vec::new(),
                city: None,
                preferences: None,
                constraints: None,
                calendar: None,
                json: false,
            };
            run_plan(&config, plan).await
        }
        Some(Commands::Completions { .. }) => unreachable!("handled before config load"),
    }
}

struct PlanArgs {
    meals: Vec<MealTag>,
    city: Option<String>,
    preferences: Option<String>,
    constraints: Option<String>,
    calendar: Option<PathBuf>,
    json: bool,
}

async fn run_plan(config: &AppConfig, args: PlanArgs) -> anyhow::Result<()> {
    let request = prompt::complete_request(
        args.meals,
        args.preferences,
        args.constraints,
        &config.workflow,
    )?;

    let (llm, cache) = forage_llm::build_client(config)?;
    let places = Arc::new(OsmPlaces::new(config.places.clone()));
    let shared_places: Arc<dyn PlacesService> = places.clone();
    let calendar = open_calendar(config, args.calendar);

    let mut inputs = RunInputs::new(request.meals);
    if let Some(city) = args.city {
        inputs = inputs.with_city(city);
    }
    if let Some(p) = request.food_preferences {
        inputs = inputs.with_preferences(p);
    }
    if let Some(c) = request.constraints {
        inputs = inputs.with_constraints(c);
    }

    let mut coordinator = WorkflowCoordinator::new(llm, shared_places, config).with_cache(cache);

    let cancel = CancellationToken::new();
    let logger = config.log_dir().map(|dir| {
        let level = config.log.as_ref().map_or(2, |l| l.level);
        info!(dir = %dir.display(), level, "Run logging enabled");
        RunLogger::new(dir, level).spawn(
            &coordinator.event_bus(),
            inputs.run_id.clone(),
            cancel.clone(),
        )
    });

    let outcome = coordinator
        .run(inputs, calendar.as_ref().map(|c| c as &dyn CalendarSource))
        .await;

    places.disconnect().await;
    if let Some(handle) = logger {
        // The logger stops on its own at RunComplete/RunFailed; make sure an
        // early error doesn't leave it waiting.
        if outcome.is_err() {
            cancel.cancel();
        }
        handle.await.ok();
    }

    let report = outcome?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        if let Some(narrative) = report.formatted_narrative() {
            println!("{narrative}");
            println!();
        }
        println!("{}", report.summary());
    }

    if !report.is_done() {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_locate(
    config: &AppConfig,
    calendar: Option<PathBuf>,
    city: Option<String>,
) -> anyhow::Result<()> {
    let Some(calendar) = open_calendar(config, calendar) else {
        anyhow::bail!("no calendar configured; pass --calendar or set [calendar] path");
    };
    let entries = calendar.entries().await?;
    let city = city.unwrap_or_else(|| config.workflow.city.clone());

    let places = OsmPlaces::new(config.places.clone());
    let extraction = LocationExtractor::new(
        &places,
        city.as_str(),
        Duration::from_secs(config.places.timeout_secs),
    )
    .extract(&entries)
    .await;
    places.disconnect().await;

    println!(
        "{} calendar entries, {} anchors",
        entries.len(),
        extraction.anchors.len()
    );
    for anchor in &extraction.anchors {
        println!(
            "  {}  {} -> {} ({:.5}, {:.5})",
            anchor.time_range,
            anchor.location_phrase,
            anchor.display_name,
            anchor.latitude,
            anchor.longitude
        );
    }
    for skipped in &extraction.skipped {
        println!("  skipped: {} ({:?})", skipped.description, skipped.reason);
    }
    Ok(())
}

async fn run_catalog(
    config: &AppConfig,
    city: Option<String>,
    list_venues: bool,
) -> anyhow::Result<()> {
    let city = city.unwrap_or_else(|| config.workflow.city.clone());
    let places = OsmPlaces::new(config.places.clone());
    let built = CatalogBuilder::new(
        &places,
        city.as_str(),
        Duration::from_secs(config.places.timeout_secs),
    )
    .radius(config.workflow.search_radius_m)
    .limit(config.workflow.venue_limit)
    .build()
    .await;
    places.disconnect().await;
    let catalog = built?;

    println!(
        "{}: {} usable venues ({} returned)",
        city,
        catalog.venues.len(),
        catalog.total_returned
    );
    for line in catalog.stat_lines() {
        println!("  {line}");
    }
    if list_venues {
        println!();
        for venue in &catalog.venues {
            println!(
                "  {} [{}] ({:.5}, {:.5})",
                venue.name, venue.category, venue.latitude, venue.longitude
            );
        }
    }
    Ok(())
}

/// The `--calendar` flag wins over `[calendar] path`.
fn open_calendar(config: &AppConfig, flag: Option<PathBuf>) -> Option<FileCalendar> {
    let timeout = config.calendar.as_ref().map_or(10, |c| c.timeout_secs);
    let path = flag.or_else(|| config.calendar.as_ref().map(|c| PathBuf::from(&c.path)))?;
    Some(FileCalendar::new(path, timeout))
}

fn load_config(path: &std::path::Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }

    // Check for config in common locations
    if let Some(home) = dirs_home().map(|h| h.join(".forage").join("config.toml")) {
        if home.exists() {
            info!(path = %home.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home)?);
        }
    }

    warn!("No config file found; building one from the environment");
    eprintln!("Warning: No config file found. Set OPENAI_API_KEY or create forage.toml");
    eprintln!("See forage.toml.example for reference.");
    Ok(create_env_config())
}

fn create_env_config() -> AppConfig {
    let (provider, model_id, api_key) = match std::env::var("OPENAI_API_KEY") {
        Ok(key) => ("openai".to_string(), "gpt-4o".to_string(), Some(key)),
        // Default to Ollama (local)
        Err(_) => ("ollama".to_string(), "llama3.2".to_string(), None),
    };

    AppConfig {
        model: ModelConfig {
            provider,
            model_id,
            api_key,
            base_url: None,
            max_tokens: 4096,
            temperature: 0.7,
            top_p: 0.95,
            extra_headers: Default::default(),
            retry: None,
        },
        fallback_models: vec![],
        workflow: Default::default(),
        places: Default::default(),
        calendar: None,
        log: None,
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
