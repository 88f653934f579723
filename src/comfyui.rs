// The ComfyUI side of things.
//
// We start (or attach to) one ComfyUI server at setup, and keep the handle for the life of the
// process. Each request then wipes the scratch directories, opens a websocket, POSTs the workflow
// to /prompt and sits on the websocket until ComfyUI says it's done. Output files are picked up
// from the output directory afterwards; nothing is downloaded over HTTP.

use std::{future::Future, path::PathBuf, process::Stdio};

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio_retry::{strategy::FixedInterval, Retry};
use tokio_tungstenite as ws;
use ws::tungstenite::Message;

use crate::{
    config::{PathsConfig, ServerConfig},
    error::PredictError,
    workflow::Workflow,
};

/// Something that can execute a workflow to completion.
///
/// `submit` hands the workflow over and returns once it is queued; `wait` blocks until it has
/// finished running.
pub trait Engine {
    type Job: Send;

    fn submit(&mut self, workflow: &Workflow) -> impl Future<Output = Result<Self::Job>> + Send;
    fn wait(&mut self, job: Self::Job) -> impl Future<Output = Result<()>> + Send;
}

type Socket = ws::WebSocketStream<ws::MaybeTlsStream<tokio::net::TcpStream>>;

/// A queued prompt, and the websocket its progress arrives on.
pub struct Submission {
    prompt_id: String,
    socket: Socket,
}

pub struct ComfyUi {
    address: String,
    http: reqwest::Client,
    /// The server process, if we started it. Killed on drop.
    server: Option<Child>,
}

#[derive(Debug, Serialize)]
struct ComfyUIRequest<'a> {
    prompt: serde_json::Value,
    client_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct ComfyUIResponse {
    prompt_id: String,
    #[allow(dead_code)]
    number: u32,
}

/// The websocket messages we care about. Anything else fails to parse and is skipped.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
enum ServerMessage {
    ExecutionStart {
        prompt_id: String,
    },
    /// `node: None` means the prompt is finished.
    Executing {
        node: Option<String>,
        #[serde(default)]
        prompt_id: Option<String>,
    },
    Progress {
        value: u64,
        max: u64,
        #[serde(default)]
        node: Option<String>,
    },
    ExecutionSuccess {
        prompt_id: String,
    },
    ExecutionError {
        prompt_id: String,
        #[serde(default)]
        node_id: String,
        #[serde(default)]
        node_type: String,
        #[serde(default)]
        exception_message: String,
    },
    ExecutionInterrupted {
        prompt_id: String,
    },
}

impl ComfyUi {
    pub fn new(address: String) -> Self {
        Self {
            address,
            http: reqwest::Client::new(),
            server: None,
        }
    }

    /// Launches ComfyUI (unless the config says to attach to an existing one) and waits for it.
    pub async fn setup(server: &ServerConfig, paths: &PathsConfig) -> Result<Self> {
        let mut comfy = Self::new(server.address());
        if server.launch {
            comfy.start_server(server, paths)?;
        } else {
            info!("Attaching to ComfyUI at {}", comfy.address);
        }
        comfy
            .wait_for_server(server.startup_attempts, server.startup_interval_ms)
            .await?;
        Ok(comfy)
    }

    fn start_server(&mut self, server: &ServerConfig, paths: &PathsConfig) -> Result<()> {
        let mut command = Command::new(&server.python);
        command
            .arg("main.py")
            .arg("--listen")
            .arg(&server.host)
            .arg("--port")
            .arg(server.port.to_string())
            .arg("--output-directory")
            .arg(&paths.output_dir)
            .arg("--input-directory")
            .arg(&paths.input_dir)
            .current_dir(&server.comfyui_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        debug!("Running {:?}", &command);
        let child = command
            .spawn()
            .with_context(|| format!("failed to start ComfyUI in {}", server.comfyui_dir.display()))?;
        info!("Started ComfyUI (pid {:?}) on {}", child.id(), self.address);
        self.server = Some(child);
        Ok(())
    }

    async fn wait_for_server(&mut self, attempts: usize, interval_ms: u64) -> Result<()> {
        let strategy = FixedInterval::from_millis(interval_ms).take(attempts);
        let url = format!("http://{}/history/123", self.address);
        let url = url.as_str();
        let http = &self.http;
        let ready = Retry::spawn(strategy, move || async move {
            trace!("Polling {}", url);
            http.get(url).send().await?.error_for_status().map(|_| ())
        })
        .await;
        if let Err(e) = ready {
            if let Some(child) = self.server.as_mut() {
                if let Some(status) = child.try_wait().context("failed to poll ComfyUI process")? {
                    bail!("ComfyUI exited during startup: {}", status);
                }
            }
            return Err(anyhow::Error::new(e)
                .context(format!("ComfyUI at {} never became ready", self.address)));
        }
        info!("ComfyUI is up at {}", self.address);
        Ok(())
    }

    /// POSTs the workflow to /prompt. Returns the prompt ID.
    async fn queue_prompt(&self, workflow: &Workflow, client_id: &str) -> Result<String> {
        let request = ComfyUIRequest {
            prompt: workflow.to_json()?,
            client_id,
        };
        let response = self
            .http
            .post(format!("http://{}/prompt", self.address))
            .json(&request)
            .send()
            .await
            .context("failed to send prompt")?;
        let status = response.status();
        let text = response.text().await.context("failed to read response")?;
        trace!("Response: {}", text);
        if !status.is_success() {
            // ComfyUI puts its validation complaints (error, node_errors) in the body.
            return Err(PredictError::PromptRejected {
                status: status.as_u16(),
                body: text,
            }
            .into());
        }
        let parsed = serde_json::from_str::<ComfyUIResponse>(&text).context("failed to parse response")?;
        Ok(parsed.prompt_id)
    }

    /// Connects the websocket first, so no message about the prompt can be missed, then queues it.
    async fn submit_prompt(&self, workflow: &Workflow) -> Result<Submission> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let url = format!("ws://{}/ws?clientId={}", self.address, client_id);
        let socket = ws::connect_async(url)
            .await
            .context("failed to connect to websocket")?
            .0;
        debug!("Connected to {} as {}", self.address, client_id);

        let prompt_id = self.queue_prompt(workflow, &client_id).await?;
        info!("Queued prompt {}", prompt_id);
        Ok(Submission { prompt_id, socket })
    }
}

/// Blocks until ComfyUI reports the prompt finished. There is no timeout.
async fn wait_for_prompt(submission: Submission) -> Result<()> {
    let Submission {
        prompt_id,
        mut socket,
    } = submission;
    while let Some(msg) = socket.next().await {
        let text = match msg.context("websocket error")? {
            Message::Text(text) => text,
            Message::Close(frame) => {
                debug!("Websocket closed: {:?}", frame);
                break;
            }
            // Binary frames are previews. We don't want them.
            _ => continue,
        };
        trace!("Got websocket message: {}", text);
        let Ok(message) = serde_json::from_str::<ServerMessage>(&text) else {
            continue;
        };
        if let Some(outcome) = handle_message(&prompt_id, message) {
            return outcome;
        }
    }
    Err(PredictError::ConnectionClosed.into())
}

/// Some(..) once the prompt has finished one way or the other.
fn handle_message(prompt_id: &str, message: ServerMessage) -> Option<Result<()>> {
    match message {
        ServerMessage::ExecutionStart { prompt_id: id } if id == prompt_id => {
            info!("Executing prompt {}", prompt_id);
            None
        }
        ServerMessage::Executing { node: Some(node), prompt_id: id }
            if id.as_deref().map_or(true, |id| id == prompt_id) =>
        {
            debug!("Executing node {}", node);
            None
        }
        ServerMessage::Executing { node: None, prompt_id: id } if id.as_deref() == Some(prompt_id) => {
            info!("Prompt {} finished", prompt_id);
            Some(Ok(()))
        }
        ServerMessage::ExecutionSuccess { prompt_id: id } if id == prompt_id => {
            info!("Prompt {} finished", prompt_id);
            Some(Ok(()))
        }
        ServerMessage::Progress { value, max, node } => {
            debug!("Progress {}/{} (node {:?})", value, max, node);
            None
        }
        ServerMessage::ExecutionError {
            prompt_id: id,
            node_id,
            node_type,
            exception_message,
        } if id == prompt_id => {
            warn!("Prompt {} failed in {} ({})", prompt_id, node_id, node_type);
            Some(Err(PredictError::Execution {
                node: format!("{node_id} ({node_type})"),
                message: exception_message,
            }
            .into()))
        }
        ServerMessage::ExecutionInterrupted { prompt_id: id } if id == prompt_id => {
            Some(Err(PredictError::Interrupted.into()))
        }
        _ => None,
    }
}

impl Engine for ComfyUi {
    type Job = Submission;

    async fn submit(&mut self, workflow: &Workflow) -> Result<Submission> {
        self.submit_prompt(workflow).await
    }

    async fn wait(&mut self, job: Submission) -> Result<()> {
        wait_for_prompt(job).await
    }
}

/// Empties each directory, creating it if need be.
pub async fn cleanup(dirs: &[PathBuf]) -> Result<()> {
    for dir in dirs {
        let exists = tokio::fs::try_exists(dir)
            .await
            .with_context(|| format!("failed to check {}", dir.display()))?;
        if exists {
            tokio::fs::remove_dir_all(dir)
                .await
                .with_context(|| format!("failed to clear {}", dir.display()))?;
        }
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    trace!("Cleaned {:?}", dirs);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> ServerMessage {
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn test_finished() {
        let msg = parse(r#"{"type": "executing", "data": {"node": null, "prompt_id": "abc"}}"#);
        assert!(matches!(handle_message("abc", msg), Some(Ok(()))));
        let msg = parse(r#"{"type": "execution_success", "data": {"prompt_id": "abc", "timestamp": 1}}"#);
        assert!(matches!(handle_message("abc", msg), Some(Ok(()))));
    }

    #[test]
    fn test_other_prompts_ignored() {
        let msg = parse(r#"{"type": "executing", "data": {"node": null, "prompt_id": "other"}}"#);
        assert!(handle_message("abc", msg).is_none());
        let msg = parse(
            r#"{"type": "execution_error", "data": {"prompt_id": "other", "node_id": "3", "node_type": "X", "exception_message": "boom"}}"#,
        );
        assert!(handle_message("abc", msg).is_none());
    }

    #[test]
    fn test_running() {
        let msg = parse(r#"{"type": "executing", "data": {"node": "3", "prompt_id": "abc"}}"#);
        assert!(handle_message("abc", msg).is_none());
        let msg = parse(r#"{"type": "progress", "data": {"value": 3, "max": 10, "node": "3", "prompt_id": "abc"}}"#);
        assert!(handle_message("abc", msg).is_none());
    }

    #[test]
    fn test_execution_error() {
        let msg = parse(
            r#"{"type": "execution_error", "data": {"prompt_id": "abc", "node_id": "3", "node_type": "DYNAMIC_TRT_MODEL_CONVERSION", "exception_message": "out of memory", "traceback": []}}"#,
        );
        let err = handle_message("abc", msg).unwrap().unwrap_err();
        match err.downcast_ref::<PredictError>() {
            Some(PredictError::Execution { node, message }) => {
                assert_eq!(node, "3 (DYNAMIC_TRT_MODEL_CONVERSION)");
                assert_eq!(message, "out of memory");
            }
            other => panic!("expected Execution, got {:?}", other),
        }
        let msg = parse(r#"{"type": "execution_interrupted", "data": {"prompt_id": "abc", "node_id": "3"}}"#);
        assert!(handle_message("abc", msg).unwrap().is_err());
    }

    #[test]
    fn test_unknown_messages_do_not_parse() {
        assert!(serde_json::from_str::<ServerMessage>(
            r#"{"type": "status", "data": {"status": {"exec_info": {"queue_remaining": 0}}}}"#
        )
        .is_err());
    }

    #[test_log::test(tokio::test)]
    async fn test_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let outputs = dir.path().join("outputs");
        let missing = dir.path().join("inputs");
        std::fs::create_dir_all(outputs.join("nested")).unwrap();
        std::fs::write(outputs.join("stale.png"), b"old").unwrap();
        std::fs::write(outputs.join("nested/stale.engine"), b"old").unwrap();

        cleanup(&[outputs.clone(), missing.clone()]).await.unwrap();
        assert!(outputs.is_dir());
        assert_eq!(std::fs::read_dir(&outputs).unwrap().count(), 0);
        assert!(missing.is_dir());
    }

    #[cfg(unix)]
    #[test_log::test(tokio::test)]
    async fn test_cleanup_unreadable_parent_fails() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let locked = dir.path().join("locked");
        std::fs::create_dir_all(locked.join("outputs")).unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();
        // Root ignores permissions; nothing to check then.
        let readable = std::fs::read_dir(&locked).is_ok();
        let result = cleanup(&[locked.join("outputs")]).await;
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
        if !readable {
            assert!(result.is_err());
        }
    }

    /// Answers every HTTP request with 200 and an empty JSON object.
    async fn fake_server() -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let response = "HTTP/1.1 200 OK\r\n\
                    content-type: application/json\r\n\
                    content-length: 2\r\n\
                    connection: close\r\n\r\n{}";
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        address
    }

    #[test_log::test(tokio::test)]
    async fn test_wait_for_server_ready() {
        let mut comfy = ComfyUi::new(fake_server().await);
        comfy.wait_for_server(5, 10).await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_wait_for_server_gives_up() {
        // Grab a free port, then close it again.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        let mut comfy = ComfyUi::new(address);
        let err = comfy.wait_for_server(3, 10).await.unwrap_err();
        assert!(format!("{err:#}").contains("never became ready"));
    }
}
