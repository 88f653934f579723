// Request parameters.
// These are flat on the wire (batch_size_min, batch_size_opt, ...), since that's what the
// command line and the JSON requests look like. The patcher wants them as triples.

use clap::Args;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::PredictError;

pub const BATCH_SIZE_MIN: u32 = 1;
pub const BATCH_SIZE_MAX: u32 = 100;
pub const DIMENSION_MIN: u32 = 256;
pub const DIMENSION_MAX: u32 = 4096;
pub const CONTEXT_MIN: u32 = 1;
pub const CONTEXT_MAX: u32 = 128;

/// A {min, optimal, max} triple, as the TensorRT builder node wants it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub min: u32,
    pub opt: u32,
    pub max: u32,
}

impl Bounds {
    pub fn new(min: u32, opt: u32, max: u32) -> Self {
        Self { min, opt, max }
    }

    pub fn is_ordered(&self) -> bool {
        self.min <= self.opt && self.opt <= self.max
    }

    pub fn map(self, f: impl Fn(u32) -> u32) -> Self {
        Self {
            min: f(self.min),
            opt: f(self.opt),
            max: f(self.max),
        }
    }
}

#[derive(Args, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PredictionInput {
    /// The checkpoint to use: a filename ComfyUI can see, or an http(s) URL to download.
    #[arg(long, default_value = "")]
    pub checkpoint: String,

    /// The minimum batch size during inference
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..=100))]
    pub batch_size_min: u32,
    /// The optimal batch size during inference
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..=100))]
    pub batch_size_opt: u32,
    /// The maximum batch size during inference
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..=100))]
    pub batch_size_max: u32,

    /// The minimum height during inference
    #[arg(long, default_value_t = 512, value_parser = clap::value_parser!(u32).range(256..=4096))]
    pub height_min: u32,
    /// The optimal height during inference
    #[arg(long, default_value_t = 1024, value_parser = clap::value_parser!(u32).range(256..=4096))]
    pub height_opt: u32,
    /// The maximum height during inference
    #[arg(long, default_value_t = 1536, value_parser = clap::value_parser!(u32).range(256..=4096))]
    pub height_max: u32,

    /// The minimum width during inference
    #[arg(long, default_value_t = 512, value_parser = clap::value_parser!(u32).range(256..=4096))]
    pub width_min: u32,
    /// The optimal width during inference
    #[arg(long, default_value_t = 1024, value_parser = clap::value_parser!(u32).range(256..=4096))]
    pub width_opt: u32,
    /// The maximum width during inference
    #[arg(long, default_value_t = 1536, value_parser = clap::value_parser!(u32).range(256..=4096))]
    pub width_max: u32,

    /// The minimum context during inference
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..=128))]
    pub context_min: u32,
    /// The optimal context during inference
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..=128))]
    pub context_opt: u32,
    /// The maximum context during inference
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..=128))]
    pub context_max: u32,
}

impl Default for PredictionInput {
    fn default() -> Self {
        Self {
            checkpoint: "".to_string(),
            batch_size_min: 1,
            batch_size_opt: 1,
            batch_size_max: 1,
            height_min: 512,
            height_opt: 1024,
            height_max: 1536,
            width_min: 512,
            width_opt: 1024,
            width_max: 1536,
            context_min: 1,
            context_opt: 1,
            context_max: 1,
        }
    }
}

impl PredictionInput {
    pub fn batch_size(&self) -> Bounds {
        Bounds::new(self.batch_size_min, self.batch_size_opt, self.batch_size_max)
    }

    pub fn height(&self) -> Bounds {
        Bounds::new(self.height_min, self.height_opt, self.height_max)
    }

    pub fn width(&self) -> Bounds {
        Bounds::new(self.width_min, self.width_opt, self.width_max)
    }

    pub fn context(&self) -> Bounds {
        Bounds::new(self.context_min, self.context_opt, self.context_max)
    }

    fn triples(&self) -> [(&'static str, [&'static str; 3], Bounds, u32, u32); 4] {
        [
            (
                "batch_size",
                ["batch_size_min", "batch_size_opt", "batch_size_max"],
                self.batch_size(),
                BATCH_SIZE_MIN,
                BATCH_SIZE_MAX,
            ),
            (
                "height",
                ["height_min", "height_opt", "height_max"],
                self.height(),
                DIMENSION_MIN,
                DIMENSION_MAX,
            ),
            (
                "width",
                ["width_min", "width_opt", "width_max"],
                self.width(),
                DIMENSION_MIN,
                DIMENSION_MAX,
            ),
            (
                "context",
                ["context_min", "context_opt", "context_max"],
                self.context(),
                CONTEXT_MIN,
                CONTEXT_MAX,
            ),
        ]
    }

    /// Checks the declared ranges.
    /// Inverted triples (min > opt, opt > max) are only an error if `strict`; otherwise
    /// they're passed through to the engine with a warning.
    pub fn validate(&self, strict: bool) -> Result<(), PredictError> {
        for (name, fields, bounds, lo, hi) in self.triples() {
            for (field, value) in fields.into_iter().zip([bounds.min, bounds.opt, bounds.max]) {
                if !(lo..=hi).contains(&value) {
                    return Err(PredictError::OutOfRange {
                        name: field,
                        value,
                        min: lo,
                        max: hi,
                    });
                }
            }
            if !bounds.is_ordered() {
                if strict {
                    return Err(PredictError::InvertedRange {
                        name,
                        min: bounds.min,
                        opt: bounds.opt,
                        max: bounds.max,
                    });
                }
                warn!(
                    "{} range is inverted ({}/{}/{}); passing it through anyway",
                    name, bounds.min, bounds.opt, bounds.max
                );
            }
        }
        Ok(())
    }
}
