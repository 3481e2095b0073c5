use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::info;

use strata_core::config::StrataConfig;
use strata_runtime::driver::PostgresConnection;
use strata_runtime::migrations::{
    load_registry, Direction, MigrationRegistry, MigrationReport, MigrationRunner, RunnerOptions,
    Target,
};

/// Manage database migrations.
#[derive(Parser, Debug)]
pub struct MigrateCommand {
    #[command(subcommand)]
    pub action: MigrateAction,

    /// Configuration file path.
    #[arg(short, long, default_value = "strata.toml", global = true)]
    pub config: String,

    /// Migrations directory path (overrides the config file).
    #[arg(short, long, global = true)]
    pub migrations_dir: Option<String>,

    /// Database URL (overrides the config file).
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum MigrateAction {
    /// Apply pending migrations.
    Up {
        /// Stop after this migration id.
        #[arg(long)]
        to: Option<String>,

        /// Print the statements instead of running them.
        #[arg(long)]
        dry_run: bool,
    },

    /// Revert migrations. Without flags, reverts the most recent one.
    Down {
        /// Revert everything applied after this migration id.
        #[arg(long, conflicts_with = "all")]
        to: Option<String>,

        /// Revert every applied migration.
        #[arg(long)]
        all: bool,

        /// Print the statements instead of running them.
        #[arg(long)]
        dry_run: bool,
    },

    /// Show migration status.
    Status,

    /// Check migration files without touching the database.
    Validate,
}

fn banner(title: &str) {
    println!();
    println!("  {} {}", style("STRATA").bold().cyan(), title);
    println!();
}

impl MigrateCommand {
    /// Resolve configuration from the file and command-line overrides.
    ///
    /// A missing config file is fine when a database URL is given.
    pub fn load_config(&self) -> Result<StrataConfig> {
        let path = Path::new(&self.config);
        let mut config = if path.exists() {
            StrataConfig::from_file(path)
                .with_context(|| format!("Failed to load {}", self.config))?
        } else {
            match &self.database_url {
                Some(url) => StrataConfig::default_with_database_url(url),
                None => anyhow::bail!(
                    "Configuration file not found: {}\nPass --database-url or set DATABASE_URL.",
                    self.config
                ),
            }
        };

        if let Some(url) = &self.database_url {
            config.database.url = url.clone();
        }
        if let Some(dir) = &self.migrations_dir {
            config.migrations.dir = dir.clone();
        }
        Ok(config)
    }

    pub async fn execute(self) -> Result<()> {
        let config = self.load_config()?;
        crate::logging::init(&config.logging);

        info!("Loading migrations from {}", config.migrations.dir);
        let registry = load_registry(Path::new(&config.migrations.dir))?;

        if self.action == MigrateAction::Validate {
            return validate(&registry);
        }

        let dry_run = matches!(
            self.action,
            MigrateAction::Up { dry_run: true, .. } | MigrateAction::Down { dry_run: true, .. }
        );
        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                on_signal.cancel();
            }
        });
        let options = RunnerOptions::from_config(&config.migrations)
            .dry_run(dry_run)
            .with_cancellation(cancel);

        let conn = PostgresConnection::connect(&config.database).await?;
        let mut runner = MigrationRunner::new(conn, &registry, options);

        let result = self.run(&mut runner, &registry).await;
        runner.into_connection().close().await?;
        result
    }

    async fn run(
        &self,
        runner: &mut MigrationRunner<'_, PostgresConnection>,
        registry: &MigrationRegistry,
    ) -> Result<()> {
        match &self.action {
            MigrateAction::Up { to, .. } => {
                banner("Migrations");
                if registry.is_empty() {
                    println!("  {} No migrations found", style("ℹ").blue());
                    return Ok(());
                }
                let target = to.clone().map_or(Target::Latest, Target::Id);
                let report = runner.up_to(target).await?;
                print_report(&report);
            }

            MigrateAction::Down { to, all, .. } => {
                banner("Migrations");
                let report = match (to, all) {
                    (Some(id), _) => runner.down_to(Target::id(id.as_str())).await?,
                    (None, true) => runner.down_to(Target::Zero).await?,
                    (None, false) => runner.revert_latest().await?,
                };
                print_report(&report);
            }

            MigrateAction::Status => {
                banner("Migration Status");
                let status = runner.status().await?;
                if status.is_empty() {
                    println!("  {} No migrations found", style("ℹ").blue());
                    return Ok(());
                }

                let applied = status.iter().filter(|s| s.applied).count();
                for s in &status {
                    match s.applied_at {
                        Some(at) => println!(
                            "  {} {} {} ({})",
                            style("✓").green(),
                            style(&s.id).cyan(),
                            style("at").dim(),
                            at.format("%Y-%m-%d %H:%M:%S")
                        ),
                        None => println!("  {} {}", style("○").yellow(), style(&s.id).yellow()),
                    }
                }
                println!();
                println!(
                    "  {} {} applied, {} pending",
                    style("ℹ").blue(),
                    applied,
                    status.len() - applied
                );
                println!();
            }

            MigrateAction::Validate => validate(registry)?,
        }

        Ok(())
    }
}

fn print_report(report: &MigrationReport) {
    if report.is_empty() {
        println!("  {} Nothing to do", style("ℹ").blue());
        println!();
        return;
    }

    for planned in &report.dry_run_statements {
        println!("  {} {}", style("→").dim(), style(&planned.id).cyan());
        for sql in &planned.statements {
            println!("{};", sql);
        }
        println!();
    }

    let verb = match report.direction {
        Direction::Up => "Applied",
        Direction::Down => "Reverted",
    };
    for id in &report.executed {
        println!("  {} {}: {}", style("✓").green(), verb, id);
    }
    if !report.executed.is_empty() {
        println!();
        println!(
            "  {} {} {} migration(s)",
            style("✓").green(),
            verb,
            report.executed.len()
        );
        println!();
    }
}

/// Static checks over every registered script.
pub fn validate(registry: &MigrationRegistry) -> Result<()> {
    banner("Validate");
    let mut failures = 0;

    for script in registry.all() {
        match script.validate() {
            Ok(()) if script.follows_id_convention() => {
                println!("  {} {}", style("✓").green(), script.id());
            }
            Ok(()) => println!(
                "  {} {} does not follow YYYYMMDDHHMMSS_Name",
                style("!").yellow(),
                script.id()
            ),
            Err(e) => {
                failures += 1;
                println!("  {} {}", style("✗").red(), e);
            }
        }
    }
    println!();

    if failures > 0 {
        anyhow::bail!("{} of {} migrations are invalid", failures, registry.len());
    }
    println!(
        "  {} {} migrations valid",
        style("✓").green(),
        registry.len()
    );
    println!();
    Ok(())
}
