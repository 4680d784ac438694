//! `dryer`: train, validate, evaluate and adapt the dryer-line models.

mod commands;
mod settings;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;

use dryer_core::setup_cli_logging;

/// Model lifecycle for the food-drying line
#[derive(Parser, Debug)]
#[command(name = "dryer")]
#[command(version)]
#[command(about = "Train, cross-validate, evaluate and fine-tune dryer-line models", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Workspace settings (TOML); `dryer.toml` is used when present
    #[arg(short, long, global = true, value_name = "FILE")]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a model for a product type and train it on the registered sets
    Train {
        #[arg(short, long)]
        product: String,

        /// Model name
        #[arg(short, long, default_value = "model")]
        name: String,

        /// Model config (JSON); overrides the settings file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Score the configuration with 5-fold cross-validation
    CrossValidate {
        #[arg(short, long)]
        product: String,

        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Evaluate a persisted model against a validation file
    Evaluate {
        #[arg(short, long)]
        product: String,

        /// Validation entries (JSON array)
        #[arg(long, value_name = "FILE")]
        validation: PathBuf,

        /// Artifact name; the latest version of the product otherwise
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Predict the actual readings for the latest logged record
    Predict {
        #[arg(short, long)]
        product: String,

        /// Three conforming image paths, comma-separated
        #[arg(long, value_delimiter = ',', num_args = 1..)]
        conforming: Vec<PathBuf>,

        /// Three observed image paths, comma-separated
        #[arg(long, value_delimiter = ',', num_args = 1..)]
        observed: Vec<PathBuf>,

        #[arg(short, long)]
        model: Option<String>,
    },

    /// Fine-tune a persisted model on new production entries and save a new version
    FineTune {
        #[arg(short, long)]
        product: String,

        /// New production entries (same layout as a validation file)
        #[arg(long, value_name = "FILE")]
        batch: PathBuf,

        #[arg(short, long)]
        model: Option<String>,

        /// Fail instead of degrading when layer freezing cannot be applied
        #[arg(long, default_value = "false")]
        require_freezing: bool,
    },

    /// List the persisted versions of a product type
    Models {
        #[arg(short, long)]
        product: String,
    },

    /// Print the layer summary of a model
    Summary {
        #[arg(short, long)]
        product: String,

        #[arg(short, long)]
        model: Option<String>,

        /// Build from the current config instead of loading an artifact
        #[arg(long, default_value = "false")]
        fresh: bool,
    },

    /// Inspect, export or import the model config
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Manage training sets
    Sets {
        #[command(subcommand)]
        action: SetsAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective config
    Show,
    /// Write the effective config to a file
    Export { path: PathBuf },
    /// Read a config file, report what was kept, and store it as the workspace config
    Import { path: PathBuf },
}

#[derive(Subcommand, Debug)]
enum SetsAction {
    /// List registered sets
    List {
        /// Only this product type
        #[arg(short, long)]
        product: Option<String>,
    },
    /// Register a set from the latest logged record and six images
    Add {
        #[arg(short, long)]
        product: String,

        /// Set name; `set_<n>` otherwise
        #[arg(short, long)]
        name: Option<String>,

        #[arg(long, value_delimiter = ',', num_args = 1..)]
        conforming: Vec<PathBuf>,

        #[arg(long, value_delimiter = ',', num_args = 1..)]
        observed: Vec<PathBuf>,
    },
    /// Write the registry to a file
    Export { path: PathBuf },
    /// Replace the registry with the sets in a file
    Import { path: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_cli_logging(cli.verbose)?;

    let settings = settings::WorkspaceSettings::resolve(cli.settings.as_deref())?;
    let ctx = commands::Context::new(settings);

    let outcome = match cli.command {
        Commands::Train {
            product,
            name,
            config,
        } => commands::train(&ctx, &product, &name, config.as_deref()),
        Commands::CrossValidate { product, config } => {
            commands::cross_validate(&ctx, &product, config.as_deref())
        }
        Commands::Evaluate {
            product,
            validation,
            model,
        } => commands::evaluate(&ctx, &product, &validation, model.as_deref()),
        Commands::Predict {
            product,
            conforming,
            observed,
            model,
        } => commands::predict(&ctx, &product, conforming, observed, model.as_deref()),
        Commands::FineTune {
            product,
            batch,
            model,
            require_freezing,
        } => commands::fine_tune(&ctx, &product, &batch, model.as_deref(), require_freezing),
        Commands::Models { product } => commands::models(&ctx, &product),
        Commands::Summary {
            product,
            model,
            fresh,
        } => commands::summary(&ctx, &product, model.as_deref(), fresh),
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_show(&ctx),
            ConfigAction::Export { path } => commands::config_export(&ctx, &path),
            ConfigAction::Import { path } => commands::config_import(&ctx, &path),
        },
        Commands::Sets { action } => match action {
            SetsAction::List { product } => commands::sets_list(&ctx, product.as_deref()),
            SetsAction::Add {
                product,
                name,
                conforming,
                observed,
            } => commands::sets_add(&ctx, &product, name, conforming, observed),
            SetsAction::Export { path } => commands::sets_export(&ctx, &path),
            SetsAction::Import { path } => commands::sets_import(&ctx, &path),
        },
    };

    if let Err(err) = outcome {
        eprintln!("{} {err:#}", "error:".red().bold());
        std::process::exit(1);
    }
    Ok(())
}
