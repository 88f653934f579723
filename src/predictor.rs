// The per-request pipeline.
//
// Predictor owns everything that lives across requests (the engine handle, the checkpoint
// resolver, the config) and runs one request at a time: it takes &mut self, so there's no
// way to overlap two requests on the same scratch directories.

use std::{fmt, path::PathBuf};

use anyhow::{Context, Result};
use log::{error, info};

use crate::{
    checkpoint::{CheckpointResolver, Fetcher},
    comfyui::{self, Engine},
    config::{PackagingMode, PredictorConfig},
    packager, patcher,
    params::PredictionInput,
    workflow::Workflow,
};

/// Where a request is. Logged on every transition; any failure ends the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    Cleaning,
    ResolvingCheckpoint,
    Patching,
    Submitting,
    Running,
    Collecting,
    Packaging,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Validating => "validating input",
            Stage::Cleaning => "cleaning",
            Stage::ResolvingCheckpoint => "resolving checkpoint",
            Stage::Patching => "patching",
            Stage::Submitting => "submitting workflow",
            Stage::Running => "running workflow",
            Stage::Collecting => "collecting outputs",
            Stage::Packaging => "packaging outputs",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

pub struct Predictor<E, F> {
    config: PredictorConfig,
    engine: E,
    resolver: CheckpointResolver<F>,
}

impl<E: Engine, F: Fetcher> Predictor<E, F> {
    pub fn new(config: PredictorConfig, engine: E, fetcher: F) -> Self {
        let resolver = CheckpointResolver::new(config.paths.models_dir.clone(), fetcher);
        Self {
            config,
            engine,
            resolver,
        }
    }

    /// Runs one prediction. Returns the output files (or archive chunks), in order.
    /// On failure nothing is returned; whatever is left in the output directory gets wiped
    /// by the next request.
    pub async fn predict(&mut self, input: &PredictionInput) -> Result<Vec<PathBuf>> {
        let mut stage = Stage::Validating;
        let result = self.run_stages(input, &mut stage).await;
        match &result {
            Ok(outputs) => info!("Prediction finished with {} outputs", outputs.len()),
            Err(e) => error!("Prediction failed while {}: {:#}", stage, e),
        }
        result.with_context(|| format!("prediction failed while {stage}"))
    }

    async fn run_stages(&mut self, input: &PredictionInput, stage: &mut Stage) -> Result<Vec<PathBuf>> {
        let mut enter = |next: Stage| {
            info!("Stage: {}", next);
            *stage = next;
        };

        enter(Stage::Validating);
        input.validate(self.config.patch.strict_ranges)?;

        enter(Stage::Cleaning);
        comfyui::cleanup(&self.config.paths.scratch_dirs()).await?;

        enter(Stage::ResolvingCheckpoint);
        let checkpoint = self.resolver.resolve(&input.checkpoint).await?;

        enter(Stage::Patching);
        let mut workflow = Workflow::load(&self.config.paths.workflow)?;
        patcher::patch_workflow(
            &mut workflow,
            &self.config.nodes,
            &checkpoint,
            input,
            &self.config.patch,
        )?;

        enter(Stage::Submitting);
        let job = self.engine.submit(&workflow).await?;

        enter(Stage::Running);
        self.engine.wait(job).await?;

        enter(Stage::Collecting);
        let paths = &self.config.paths;
        let files = packager::collect(&paths.output_dir).await?;
        let outputs = match self.config.packaging.mode {
            PackagingMode::Files => files,
            PackagingMode::Chunked => {
                enter(Stage::Packaging);
                packager::package(&self.config.packaging, files, &paths.output_dir, &paths.package_dir).await?
            }
        };

        enter(Stage::Done);
        Ok(outputs)
    }
}
