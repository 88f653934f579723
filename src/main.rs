use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::{
    checkpoint::CommandFetcher, comfyui::ComfyUi, params::PredictionInput, predictor::Predictor,
};

mod checkpoint;
mod comfyui;
mod config;
mod error;
mod packager;
mod params;
mod patcher;
mod predictor;
mod workflow;

#[derive(Parser, Debug)]
#[command(about = "Builds TensorRT engines from checkpoints through ComfyUI")]
struct CommandLineFlags {
    /// TOML config file. Defaults apply when omitted.
    #[arg(long, short)]
    pub config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a single prediction and print the output paths as JSON.
    Predict(PredictionInput),
    /// Read JSON requests from stdin, one per line, and answer each on stdout.
    Serve,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Response {
    Output { output: Vec<PathBuf> },
    Error { error: String },
}

impl From<Result<Vec<PathBuf>>> for Response {
    fn from(result: Result<Vec<PathBuf>>) -> Self {
        match result {
            Ok(output) => Response::Output { output },
            Err(e) => Response::Error {
                error: format!("{:#}", e),
            },
        }
    }
}

type ComfyPredictor = Predictor<ComfyUi, CommandFetcher>;

async fn serve(predictor: &mut ComfyPredictor) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    info!("Waiting for requests on stdin");
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let response: Response = match serde_json::from_str::<PredictionInput>(&line) {
            Ok(input) => predictor.predict(&input).await.into(),
            Err(e) => {
                error!("Bad request: {}", e);
                Response::Error {
                    error: format!("bad request: {}", e),
                }
            }
        };
        let mut text = serde_json::to_string(&response).context("failed to serialize response")?;
        text.push('\n');
        stdout.write_all(text.as_bytes()).await.context("failed to write stdout")?;
        stdout.flush().await.context("failed to flush stdout")?;
    }
    info!("stdin closed, shutting down");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = CommandLineFlags::parse();

    // Immediately crash on panic.
    std::panic::set_hook(Box::new(|panic_info| {
        error!("Panic: {:?}", panic_info);
        std::process::exit(1);
    }));

    let config = config::load(args.config_path.as_deref()).context("failed to initialize config")?;
    info!("Loaded config: {:?}", config);

    // Setup: one ComfyUI for the life of the process.
    let engine = ComfyUi::setup(&config.server, &config.paths)
        .await
        .context("failed to set up ComfyUI")?;
    let fetcher = CommandFetcher::new(config.fetch.clone());
    let mut predictor = Predictor::new(config, engine, fetcher);

    match args.command {
        Command::Predict(input) => {
            let outputs = predictor.predict(&input).await?;
            println!("{}", serde_json::to_string_pretty(&outputs)?);
            Ok(())
        }
        Command::Serve => serve(&mut predictor).await,
    }
}
