use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;

use sparks_core_sdk::{caller::GenerationCaller, config::Config, models, server, telemetry};

/**
 * \brief Sparks generation proxy: serve it, call it, browse the model catalog.
 */
#[derive(Parser, Debug)]
#[command(name = "sparks", version, about = "Sparks AI generation proxy")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief Start the HTTP proxy. Reads OPENROUTER_API_KEY, APP_URL, APP_NAME from the environment.
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:3000")]
        addr: String,
    },

    /**
     * \brief Ask a running proxy for a complete answer.
     */
    Generate {
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value = models::DEFAULT_MODEL)]
        model: String,
        #[arg(long, default_value_t = models::DEFAULT_TEMPERATURE)]
        temperature: f64,
        #[arg(long, default_value = "http://127.0.0.1:3000")]
        endpoint: String,
    },

    /**
     * \brief Ask a running proxy for a streamed answer and print it as it arrives.
     */
    Stream {
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value = models::DEFAULT_MODEL)]
        model: String,
        #[arg(long, default_value_t = models::DEFAULT_TEMPERATURE)]
        temperature: f64,
        #[arg(long, default_value = "http://127.0.0.1:3000")]
        endpoint: String,
    },

    /** \brief List the model catalog. */
    Models {
        #[arg(long, default_value_t = false, conflicts_with = "paid")]
        free: bool,
        #[arg(long, default_value_t = false)]
        paid: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_env().context("load configuration failed")?;
    telemetry::configure(&config);

    match cli.command {
        Commands::Serve { addr } => {
            server::run(config, &addr).await?;
        }
        Commands::Generate {
            prompt,
            model,
            temperature,
            endpoint,
        } => {
            warn_if_uncatalogued(&model);
            let caller = GenerationCaller::new(endpoint);
            telemetry::log_event(
                "cli.generate",
                &format!("model={} prompt_len={}", model, prompt.len()),
            );
            match caller.generate_text(&prompt, &model, temperature).await {
                Ok(text) => println!("{}", text),
                Err(failure) => {
                    eprintln!("{}", failure.guidance());
                    return Err(failure).context("generation failed");
                }
            }
        }
        Commands::Stream {
            prompt,
            model,
            temperature,
            endpoint,
        } => {
            warn_if_uncatalogued(&model);
            let caller = GenerationCaller::new(endpoint);
            telemetry::log_event(
                "cli.stream",
                &format!("model={} prompt_len={}", model, prompt.len()),
            );
            let mut stream = match caller.stream_text(&prompt, &model, temperature).await {
                Ok(stream) => stream,
                Err(failure) => {
                    eprintln!("{}", failure.guidance());
                    return Err(failure).context("create stream failed");
                }
            };

            while let Some(delta) = stream
                .as_mut()
                .next()
                .await
                .transpose()
                .context("stream error")?
            {
                print!("{}", delta);
                use std::io::Write;
                std::io::stdout().flush().ok();
            }
            println!();
        }
        Commands::Models { free, paid } => {
            let list: Vec<&models::ModelInfo> = if free {
                models::free_models().collect()
            } else if paid {
                models::paid_models().collect()
            } else {
                models::AVAILABLE_MODELS.iter().collect()
            };
            for m in list {
                println!(
                    "{:<42} {:<22} {:<10} {}",
                    m.id,
                    m.name,
                    m.provider,
                    if m.is_free { "free" } else { "paid" }
                );
            }
        }
    }

    Ok(())
}

/** \brief The proxy forwards any model id; flag ones the catalog does not know. */
fn warn_if_uncatalogued(model: &str) {
    if models::find_model(model).is_none() {
        eprintln!(
            "note: {} is not in the model catalog; the provider may reject it",
            model
        );
    }
}
