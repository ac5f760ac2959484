use bytes::Bytes;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use super::io::{handle_stderr, read_lines, write_lines};
use crate::error::Error;

const MESSAGE_BUFFER_SIZE: usize = 100;

/// Owns a locally spawned MCP server process and its stdio pumps
pub struct ProcessManager {
    child: Option<Child>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self { child: None }
    }

    /// Spawns `command` and wires its stdio to channels.
    ///
    /// Lines the child prints on stdout are forwarded to `output_tx`; the returned
    /// sender writes lines to the child's stdin.
    pub async fn start_process(
        &mut self,
        command: Command,
        output_tx: mpsc::Sender<Bytes>,
    ) -> Result<mpsc::Sender<Bytes>, Error> {
        let child = self.spawn_process(command)?;
        let (process_tx, process_rx) = mpsc::channel::<Bytes>(MESSAGE_BUFFER_SIZE);

        self.setup_io_handlers(child, process_rx, output_tx)?;

        Ok(process_tx)
    }

    fn spawn_process(&mut self, mut command: Command) -> Result<Child, Error> {
        log::debug!("spawning process: {:?}", command);

        let child = command
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        Ok(child)
    }

    fn setup_io_handlers(
        &mut self,
        mut child: Child,
        process_rx: mpsc::Receiver<Bytes>,
        output_tx: mpsc::Sender<Bytes>,
    ) -> Result<(), Error> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("failed to get child stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("failed to get child stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Transport("failed to get child stderr".to_string()))?;

        self.child = Some(child);

        tokio::spawn(write_lines(stdin, process_rx));
        tokio::spawn(read_lines(stdout, output_tx));
        tokio::spawn(handle_stderr(stderr));

        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    pub async fn shutdown(&mut self) {
        if let Some(mut child) = self.child.take() {
            log::debug!("stopping child process...");
            if let Err(e) = child.kill().await {
                log::error!("failed to stop child process: {}", e);
            }
            if let Err(e) = child.wait().await {
                log::error!("error waiting for child process to exit: {}", e);
            }
            log::debug!("child process stopped");
        }
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}
