use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use dbkit_runtime::SeedRunner;

use super::Invocation;

/// Run every seed, or create a new one.
#[derive(Parser)]
pub struct SeedCommand {
    #[command(subcommand)]
    pub action: Option<SeedAction>,
}

#[derive(Subcommand)]
pub enum SeedAction {
    /// Create an empty seed.
    New {
        /// Seed name, e.g. `demo_users`.
        name: String,
    },
}

impl SeedCommand {
    pub async fn execute(self, ctx: &Invocation) -> Result<()> {
        let runner = SeedRunner::new(
            ctx.config.clone(),
            ctx.databases.clone(),
            ctx.sources.clone(),
        );

        match self.action {
            Some(SeedAction::New { name }) => {
                let id = runner.create(&ctx.cancel, &name).await?;
                println!("{} Created seed {}", style("✓").green(), style(id).cyan());
            }
            None => {
                let ran = runner.run(&ctx.cancel).await?;
                if ran.is_empty() {
                    println!("{} No seeds to run", style("ℹ").blue());
                }
                for id in &ran {
                    println!("{} Seeded {}", style("✓").green(), style(id).cyan());
                }
            }
        }

        Ok(())
    }
}
