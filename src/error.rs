use std::process::ExitStatus;

/// The ways a prediction can fail.
/// These travel inside anyhow chains; use `downcast_ref` to tell them apart.
#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    /// The workflow template doesn't contain a node we need to patch.
    #[error("workflow has no node with id {0:?}")]
    NodeNotFound(String),

    #[error("checkpoint URL has no filename: {0}")]
    InvalidCheckpointUrl(String),

    #[error("fetching {url} failed: {status}")]
    CheckpointFetch { url: String, status: ExitStatus },

    /// ComfyUI refused the workflow at submission time.
    #[error("ComfyUI rejected the workflow ({status}): {body}")]
    PromptRejected { status: u16, body: String },

    #[error("ComfyUI execution failed at node {node}: {message}")]
    Execution { node: String, message: String },

    #[error("ComfyUI interrupted the workflow")]
    Interrupted,

    #[error("ComfyUI closed the websocket before the workflow finished")]
    ConnectionClosed,

    #[error("{name} = {value} is outside {min}..={max}")]
    OutOfRange {
        name: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("{name} range is inverted: min {min}, opt {opt}, max {max}")]
    InvertedRange {
        name: &'static str,
        min: u32,
        opt: u32,
        max: u32,
    },
}
