use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use sdp_core::{SourceDataProvider, Sport};
use sdp_sync::{
    PipelineConfig, ReprocessRequest, SourceSeasonRequest, SyncPipeline, TierDelayOverrides,
};
use sdp_web::AppState;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "sdp")]
#[command(about = "Sports document pipeline")]
struct Cli {
    /// Keep all state in process; documents are still fetched over HTTP.
    #[arg(long, global = true)]
    in_memory: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Seed the resource catalog for every sport.
    Seed {
        #[arg(long, default_value = "Espn")]
        provider: SourceDataProvider,
    },
    /// Schedule the tiered historical sourcing of one season.
    SourceSeason(SourceSeasonArgs),
    /// Queue a bounded re-publish of dead-lettered messages.
    ReprocessDlq {
        #[arg(long)]
        count: u32,
        #[arg(long)]
        queue: Option<String>,
    },
    /// Run workers, the consumer and outbox dispatchers until ctrl-c.
    Work,
    /// `work` plus the operator HTTP API.
    Serve,
    Migrate,
}

#[derive(Debug, Args)]
struct SourceSeasonArgs {
    #[arg(long)]
    sport: Sport,
    #[arg(long)]
    year: i32,
    #[arg(long, default_value = "Espn")]
    provider: SourceDataProvider,
    #[arg(long)]
    force: bool,
    #[arg(long)]
    season_delay: Option<i64>,
    #[arg(long)]
    venue_delay: Option<i64>,
    #[arg(long)]
    team_season_delay: Option<i64>,
    #[arg(long)]
    athlete_season_delay: Option<i64>,
    /// Run whatever is due now on this process before exiting.
    #[arg(long)]
    drain: bool,
}

impl SourceSeasonArgs {
    fn request(&self) -> SourceSeasonRequest {
        let overrides = TierDelayOverrides {
            season: self.season_delay,
            venue: self.venue_delay,
            team_season: self.team_season_delay,
            athlete_season: self.athlete_season_delay,
        };
        SourceSeasonRequest {
            sport: self.sport,
            provider: self.provider,
            season_year: self.year,
            tier_delays: (overrides != TierDelayOverrides::default()).then_some(overrides),
            force: self.force,
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sdp=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

async fn pipeline(config: PipelineConfig, in_memory: bool) -> Result<SyncPipeline> {
    if in_memory {
        let source = sdp_sync::http_source(&config)?;
        SyncPipeline::in_memory(config, source)
    } else {
        SyncPipeline::connect(config).await
    }
}

fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        let _ = tx.send(true);
    });
    rx
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command {
        Commands::Migrate => {
            sdp_sync::run_migrations(&config).await?;
        }
        Commands::Seed { provider } => {
            let pipeline = pipeline(config, cli.in_memory).await?;
            let inserted = pipeline.seed_all(provider).await?;
            println!("catalog seeded: inserted={inserted}");
        }
        Commands::SourceSeason(args) => {
            let pipeline = pipeline(config, cli.in_memory).await?;
            let correlation_id = pipeline
                .scheduler()
                .source_season(args.request())
                .await
                .with_context(|| format!("sourcing {} {}", args.sport, args.year))?;
            println!("sourcing scheduled: correlation_id={correlation_id}");
            if args.drain {
                let report = pipeline.run_until_idle().await?;
                println!(
                    "drained: jobs={} consumed={} relayed={}",
                    report.jobs_run, report.consumed, report.relayed
                );
            }
        }
        Commands::ReprocessDlq { count, queue } => {
            let pipeline = pipeline(config, cli.in_memory).await?;
            let job_id = pipeline
                .reprocessor()
                .reprocess(ReprocessRequest {
                    count,
                    queue_name: queue,
                })
                .await?;
            println!("reprocess queued: job_id={job_id}");
        }
        Commands::Work => {
            let pipeline = pipeline(config, cli.in_memory).await?;
            pipeline.run(shutdown_on_ctrl_c()).await?;
        }
        Commands::Serve => {
            let bind = config.bind_addr.clone();
            let pipeline = pipeline(config, cli.in_memory).await?;
            let shutdown = shutdown_on_ctrl_c();
            let state = AppState::from_pipeline(&pipeline);
            let (worked, served) = tokio::join!(
                pipeline.run(shutdown.clone()),
                sdp_web::serve(state, &bind, shutdown)
            );
            worked?;
            served?;
        }
    }

    Ok(())
}
