use std::path::Path;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{Result, VmError};

const COMMAND_DEADLINE: Duration = Duration::from_secs(10);

/// A session against a VM's QMP Unix socket (spec.md §4.6). Connect performs
/// the mandatory `qmp_capabilities` handshake; every subsequent command
/// carries a 10s deadline. `close` shuts down the write half and drains
/// until EOF, so callers can await confirmation of teardown.
pub struct QmpClient {
    reader: BufReader<UnixStream>,
    vm: String,
}

impl QmpClient {
    pub async fn connect(vm: &str, socket_path: &Path) -> Result<Self> {
        let stream = timeout(COMMAND_DEADLINE, UnixStream::connect(socket_path))
            .await
            .map_err(|_| VmError::QmpTimeout {
                vm: vm.to_string(),
                command: "connect".into(),
                deadline_secs: COMMAND_DEADLINE.as_secs(),
            })?
            .map_err(|e| VmError::io(format!("connect to {}", socket_path.display()), e))?;

        let mut client = Self {
            reader: BufReader::new(stream),
            vm: vm.to_string(),
        };

        // Greeting banner precedes the handshake.
        client.read_line().await?;
        client
            .call(json!({"execute": "qmp_capabilities"}))
            .await?;

        Ok(client)
    }

    /// Reads one line from the persistent buffered reader. Must stay
    /// persistent across calls: QEMU can deliver an event and a command
    /// `return` in the same read, and a fresh `BufReader` per call would
    /// buffer and then discard the second line on drop.
    async fn read_line(&mut self) -> Result<Value> {
        let mut line = String::new();
        let n = timeout(COMMAND_DEADLINE, self.reader.read_line(&mut line))
            .await
            .map_err(|_| VmError::QmpTimeout {
                vm: self.vm.clone(),
                command: "read".into(),
                deadline_secs: COMMAND_DEADLINE.as_secs(),
            })?
            .map_err(|e| VmError::io("read qmp line", e))?;

        if n == 0 {
            return Err(VmError::Qmp {
                vm: self.vm.clone(),
                detail: "connection closed".into(),
            });
        }

        serde_json::from_str(&line).map_err(|e| VmError::json("parse qmp response", e))
    }

    async fn call(&mut self, command: Value) -> Result<Value> {
        let mut line = serde_json::to_vec(&command).map_err(|e| VmError::json("serialize qmp command", e))?;
        line.push(b'\n');

        timeout(COMMAND_DEADLINE, self.reader.get_mut().write_all(&line))
            .await
            .map_err(|_| VmError::QmpTimeout {
                vm: self.vm.clone(),
                command: command_name(&command),
                deadline_secs: COMMAND_DEADLINE.as_secs(),
            })?
            .map_err(|e| VmError::io("write qmp command", e))?;

        loop {
            let resp = self.read_line().await?;
            if resp.get("event").is_some() {
                debug!(vm = %self.vm, event = ?resp, "qmp event (ignored)");
                continue;
            }
            if let Some(err) = resp.get("error") {
                return Err(VmError::Qmp {
                    vm: self.vm.clone(),
                    detail: err.to_string(),
                });
            }
            return Ok(resp.get("return").cloned().unwrap_or(Value::Null));
        }
    }

    /// `query-status` — returns the raw QEMU run-state string (`running`,
    /// `paused`, etc).
    pub async fn query_status(&mut self) -> Result<String> {
        let resp = self.call(json!({"execute": "query-status"})).await?;
        Ok(resp
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string())
    }

    /// `system_powerdown` — requests ACPI shutdown; does not wait for the
    /// guest to actually power off.
    pub async fn system_powerdown(&mut self) -> Result<()> {
        self.call(json!({"execute": "system_powerdown"})).await?;
        Ok(())
    }

    /// `quit` — terminates the QEMU process immediately.
    pub async fn quit(&mut self) -> Result<()> {
        self.call(json!({"execute": "quit"})).await?;
        Ok(())
    }

    /// `query-vnc` — returns the VNC service port as a string, if enabled.
    pub async fn query_vnc(&mut self) -> Result<Option<String>> {
        let resp = self.call(json!({"execute": "query-vnc"})).await?;
        if resp.get("enabled").and_then(Value::as_bool) != Some(true) {
            return Ok(None);
        }
        Ok(resp
            .get("service")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    /// Close the session: shut down the write half, then drain until the
    /// peer closes its end too, confirming teardown before returning.
    pub async fn close(mut self) -> Result<()> {
        let _ = self.reader.get_mut().shutdown().await;
        let mut buf = [0u8; 64];
        let _ = timeout(COMMAND_DEADLINE, async {
            loop {
                match self.reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        })
        .await;
        Ok(())
    }
}

fn command_name(command: &Value) -> String {
    command
        .get("execute")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixListener;

    /// A trivial QMP server stub: sends the greeting, answers
    /// `qmp_capabilities` and `query-status` with canned responses.
    async fn spawn_stub(path: std::path::PathBuf) {
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let greeting = b"{\"QMP\": {\"version\": {}}}\n";
            stream.write_all(greeting).await.unwrap();

            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                let text = String::from_utf8_lossy(&buf[..n]);
                if text.contains("qmp_capabilities") {
                    stream.write_all(b"{\"return\": {}}\n").await.unwrap();
                } else if text.contains("query-status") {
                    stream
                        .write_all(b"{\"return\": {\"status\": \"running\"}}\n")
                        .await
                        .unwrap();
                } else if text.contains("quit") {
                    stream.write_all(b"{\"return\": {}}\n").await.unwrap();
                    break;
                } else {
                    stream.write_all(b"{\"return\": {}}\n").await.unwrap();
                }
            }
        });
    }

    #[tokio::test]
    async fn connect_handshakes_and_queries_status() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("qmp.socket");
        spawn_stub(sock_path.clone()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut client = QmpClient::connect("vm1", &sock_path).await.unwrap();
        let status = client.query_status().await.unwrap();
        assert_eq!(status, "running");
    }

    #[tokio::test]
    async fn connect_to_missing_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("missing.socket");
        let err = QmpClient::connect("vm1", &sock_path).await.unwrap_err();
        assert!(matches!(err, VmError::Io { .. }));
    }
}
