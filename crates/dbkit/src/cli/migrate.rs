use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use dbkit_runtime::{Direction, MigrationReport, MigrationRunner};

use super::Invocation;

/// Manage database migrations.
#[derive(Parser)]
pub struct MigrateCommand {
    #[command(subcommand)]
    pub action: MigrateAction,
}

#[derive(Subcommand)]
pub enum MigrateAction {
    /// Create an empty up/down migration pair.
    New {
        /// Migration name, e.g. `add_users`.
        name: String,
    },

    /// Apply pending migrations.
    Up {
        /// Number of migrations to apply; all pending when omitted.
        #[arg(value_parser = clap::value_parser!(u32).range(1..))]
        steps: Option<u32>,
    },

    /// Roll back applied migrations, newest first.
    Down {
        /// Number of migrations to roll back.
        #[arg(default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
        steps: u32,
    },

    /// Show applied and pending migrations.
    Status,
}

impl MigrateCommand {
    pub async fn execute(self, ctx: &Invocation) -> Result<()> {
        let runner = MigrationRunner::new(
            ctx.config.clone(),
            ctx.databases.clone(),
            ctx.sources.clone(),
        );

        match self.action {
            MigrateAction::New { name } => {
                let id = runner.create(&ctx.cancel, &name).await?;
                println!("{} Created migration {}", style("✓").green(), style(id).cyan());
            }

            MigrateAction::Up { steps } => {
                let report = runner
                    .run(&ctx.cancel, Direction::Up, steps.map(|s| s as usize))
                    .await?;
                print_report(&report);
            }

            MigrateAction::Down { steps } => {
                let report = runner
                    .run(&ctx.cancel, Direction::Down, Some(steps as usize))
                    .await?;
                print_report(&report);
            }

            MigrateAction::Status => {
                let status = runner.status(&ctx.cancel).await?;
                for applied in &status.applied {
                    let at = applied.finished_at.unwrap_or(applied.started_at);
                    println!(
                        "{} {} {}",
                        style("✓").green(),
                        style(&applied.id).cyan(),
                        style(at.format("%Y-%m-%d %H:%M:%S")).dim()
                    );
                }
                for id in &status.pending {
                    println!("{} {}", style("○").yellow(), style(id).yellow());
                }
                println!(
                    "{} applied, {} pending",
                    status.applied.len(),
                    status.pending.len()
                );
            }
        }

        Ok(())
    }
}

fn print_report(report: &MigrationReport) {
    if report.is_empty() {
        println!("{} No pending {} migrations", style("ℹ").blue(), report.direction);
        return;
    }

    let verb = match report.direction {
        Direction::Up => "Applied",
        Direction::Down => "Rolled back",
    };
    for id in &report.applied {
        println!("{} {} {}", style("✓").green(), verb, style(id).cyan());
    }
}
