use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Select, Text};
use std::path::PathBuf;
use std::time::Duration;

use storyflip::core::config::{Config, CONFIG_FILE};
use storyflip::core::model::{GenerationRequest, IllustrationStyle, StoryLength};
use storyflip::services::backend::{ConfigServiceFactory, LocalBackend, StoryBackend};
use storyflip::services::remote::RemoteBackend;
use storyflip::services::server;
use storyflip::services::workflow::WorkflowManager;

#[derive(Parser)]
#[command(name = "storyflip", version, about = "Turns a story idea into an illustrated flipbook")]
struct Cli {
    /// Path to the YAML configuration.
    #[arg(short, long, default_value = CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the story and flipbook endpoints over HTTP.
    Serve {
        #[arg(long)]
        bind: Option<String>,
    },
    /// Create a storybook without prompting.
    Generate {
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value = "Watercolor")]
        style: IllustrationStyle,
        /// Short, Medium or Long.
        #[arg(long, default_value = "Short")]
        length: String,
        #[arg(long)]
        personalization: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let mut config = Config::load_or_default(&cli.config)?;

    match cli.command {
        Some(Command::Serve { bind }) => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            server::serve(config).await
        }
        Some(Command::Generate {
            prompt,
            style,
            length,
            personalization,
        }) => {
            let request =
                GenerationRequest::new(prompt, style, personalization, StoryLength::page_count_for(&length))?;
            run_pipeline(&config, request).await
        }
        None => {
            let request = ask_for_request()?;
            run_pipeline(&config, request).await
        }
    }
}

fn ask_for_request() -> Result<GenerationRequest> {
    let subject = Text::new("What should the story be about?").prompt()?;
    let style = Select::new("Illustration style:", IllustrationStyle::ALL.to_vec()).prompt()?;
    let length = Select::new("Story length:", StoryLength::ALL.to_vec()).prompt()?;
    let personalization = Text::new("Who is it for? (name, age, a favourite thing)").prompt()?;
    Ok(GenerationRequest::new(subject, style, personalization, length.page_count())?)
}

fn create_backend(config: &Config) -> Result<Box<dyn StoryBackend>> {
    let backend: Box<dyn StoryBackend> = match &config.remote {
        Some(url) => Box::new(RemoteBackend::new(url)?),
        None => Box::new(LocalBackend::from_factory(&ConfigServiceFactory::new(config.clone()))?),
    };
    Ok(backend)
}

async fn run_pipeline(config: &Config, request: GenerationRequest) -> Result<()> {
    let mut manager = WorkflowManager::new(create_backend(config)?, config.pdf.clone());

    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?);
    pb.enable_steady_tick(Duration::from_millis(120));

    let mut progress = manager.subscribe();
    let spinner = pb.clone();
    let watcher = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let message = progress.borrow_and_update().progress_message();
            spinner.set_message(message);
        }
    });

    let outcome = manager.run(request).await;
    watcher.abort();

    match outcome {
        Ok(result) => {
            pb.finish_with_message("Your storybook is ready!");
            println!("{}", result.url);
            Ok(())
        }
        Err(e) => {
            pb.abandon_with_message(manager.state().progress_message());
            Err(e.into())
        }
    }
}
