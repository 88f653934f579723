// Fills in the TensorRT conversion workflow.
//
// Two nodes get touched: the checkpoint loader, and the builder that does the conversion.
// Everything else in the template is left alone.

use std::path::Path;

use anyhow::Result;
use log::debug;

use crate::{
    config::{NodesConfig, PatchConfig, PrefixStyle},
    params::{Bounds, PredictionInput},
    workflow::Workflow,
};

/// Rounds up to the next multiple of 8. TensorRT wants its spatial dimensions aligned.
pub fn round_up_to_8(value: u32) -> u32 {
    value.div_ceil(8) * 8
}

/// With `Dyn`: "sdxl/model.safetensors" -> "model_DYN". With `Checkpoint`, unchanged.
pub fn filename_prefix(checkpoint: &str, style: PrefixStyle) -> String {
    match style {
        PrefixStyle::Checkpoint => checkpoint.to_owned(),
        PrefixStyle::Dyn => {
            let stem = Path::new(checkpoint)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(checkpoint);
            format!("{stem}_DYN")
        }
    }
}

pub fn patch_workflow(
    workflow: &mut Workflow,
    nodes: &NodesConfig,
    checkpoint: &str,
    input: &PredictionInput,
    patch: &PatchConfig,
) -> Result<()> {
    // Look both nodes up before writing anything, so a bad template doesn't get half-patched.
    workflow.node(&nodes.loader)?;
    workflow.node(&nodes.builder)?;

    let loader = workflow.node_mut(&nodes.loader)?;
    loader.set_input("ckpt_name", checkpoint);

    let (height, width) = if patch.round_to_multiple_of_8 {
        (input.height().map(round_up_to_8), input.width().map(round_up_to_8))
    } else {
        (input.height(), input.width())
    };

    let builder = workflow.node_mut(&nodes.builder)?;
    builder.set_input("filename_prefix", filename_prefix(checkpoint, patch.prefix_style));
    for (name, bounds) in [
        ("batch_size", input.batch_size()),
        ("height", height),
        ("width", width),
        ("context", input.context()),
    ] {
        let Bounds { min, opt, max } = bounds;
        builder.set_input(&format!("{name}_min"), min);
        builder.set_input(&format!("{name}_opt"), opt);
        builder.set_input(&format!("{name}_max"), max);
    }
    debug!(
        "Patched workflow: checkpoint {}, batch {:?}, height {:?}, width {:?}, context {:?}",
        checkpoint,
        input.batch_size(),
        height,
        width,
        input.context()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::PredictError, workflow::Input};

    const TEMPLATE: &str = include_str!("../testdata/workflow_api.json");

    fn literal(workflow: &Workflow, node: &str, name: &str) -> serde_json::Value {
        workflow
            .node(node)
            .unwrap()
            .input(name)
            .and_then(Input::as_literal)
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_round_up_to_8() {
        assert_eq!(round_up_to_8(0), 0);
        assert_eq!(round_up_to_8(1), 8);
        assert_eq!(round_up_to_8(513), 520);
        assert_eq!(round_up_to_8(520), 520);
        for v in 0..5000 {
            let r = round_up_to_8(v);
            assert_eq!(r % 8, 0);
            assert!(r >= v && r - v < 8, "{v} -> {r}");
        }
        for k in 0..1000 {
            assert_eq!(round_up_to_8(8 * k), 8 * k);
        }
    }

    fn rounding() -> PatchConfig {
        PatchConfig {
            round_to_multiple_of_8: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_filename_prefix() {
        use PrefixStyle::*;
        assert_eq!(filename_prefix("model.safetensors", Checkpoint), "model.safetensors");
        assert_eq!(filename_prefix("sdxl/juggernaut.v9.ckpt", Checkpoint), "sdxl/juggernaut.v9.ckpt");
        assert_eq!(filename_prefix("model.safetensors", Dyn), "model_DYN");
        assert_eq!(filename_prefix("sdxl/juggernaut.v9.ckpt", Dyn), "juggernaut.v9_DYN");
        assert_eq!(filename_prefix("noext", Dyn), "noext_DYN");
    }

    #[test]
    fn test_patch_checkpoint() {
        let mut workflow = Workflow::parse(TEMPLATE).unwrap();
        let input = PredictionInput::default();
        let patch = PatchConfig::default();
        patch_workflow(&mut workflow, &NodesConfig::default(), "model.safetensors", &input, &patch).unwrap();
        assert_eq!(literal(&workflow, "4", "ckpt_name"), "model.safetensors");
        // The prefix is the checkpoint name itself unless configured otherwise.
        assert_eq!(literal(&workflow, "3", "filename_prefix"), "model.safetensors");

        let patch = PatchConfig {
            prefix_style: PrefixStyle::Dyn,
            ..Default::default()
        };
        patch_workflow(&mut workflow, &NodesConfig::default(), "model.safetensors", &input, &patch).unwrap();
        assert_eq!(literal(&workflow, "3", "filename_prefix"), "model_DYN");
    }

    #[test]
    fn test_patch_writes_only_designated_fields() {
        let original = Workflow::parse(TEMPLATE).unwrap();
        let mut workflow = original.clone();
        let input = PredictionInput {
            batch_size_max: 4,
            height_min: 513,
            width_max: 2048,
            context_opt: 2,
            context_max: 3,
            ..Default::default()
        };
        patch_workflow(&mut workflow, &NodesConfig::default(), "m.safetensors", &input, &PatchConfig::default())
            .unwrap();

        // Untouched nodes are identical.
        assert_eq!(workflow.node("5").unwrap(), original.node("5").unwrap());
        assert_eq!(workflow.len(), original.len());

        let builder = workflow.node("3").unwrap();
        let before = original.node("3").unwrap();
        assert_eq!(builder.class_type, before.class_type);
        assert_eq!(builder.extra, before.extra);
        assert_eq!(builder.input("model"), before.input("model"));
        assert_eq!(builder.input("num_video_frames"), before.input("num_video_frames"));

        assert_eq!(literal(&workflow, "3", "batch_size_max"), 4);
        assert_eq!(literal(&workflow, "3", "height_min"), 513);
        assert_eq!(literal(&workflow, "3", "height_opt"), 1024);
        assert_eq!(literal(&workflow, "3", "width_max"), 2048);
        assert_eq!(literal(&workflow, "3", "context_opt"), 2);
        assert_eq!(literal(&workflow, "3", "context_max"), 3);
    }

    #[test]
    fn test_patch_rounds_dimensions() {
        let mut workflow = Workflow::parse(TEMPLATE).unwrap();
        let input = PredictionInput {
            height_min: 513,
            width_opt: 1001,
            batch_size_min: 3,
            ..Default::default()
        };
        patch_workflow(&mut workflow, &NodesConfig::default(), "m.safetensors", &input, &rounding()).unwrap();
        assert_eq!(literal(&workflow, "3", "height_min"), 520);
        assert_eq!(literal(&workflow, "3", "width_opt"), 1008);
        assert_eq!(literal(&workflow, "3", "width_max"), 1536);
        // Only spatial dimensions are rounded.
        assert_eq!(literal(&workflow, "3", "batch_size_min"), 3);
    }

    #[test]
    fn test_patch_missing_builder_leaves_template_alone() {
        let original = Workflow::parse(TEMPLATE).unwrap();
        let mut workflow = original.clone();
        let nodes = NodesConfig {
            builder: "99".to_string(),
            ..Default::default()
        };
        let err = patch_workflow(
            &mut workflow,
            &nodes,
            "m.safetensors",
            &PredictionInput::default(),
            &PatchConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PredictError>(),
            Some(PredictError::NodeNotFound(id)) if id == "99"
        ));
        assert_eq!(workflow, original);
    }
}
