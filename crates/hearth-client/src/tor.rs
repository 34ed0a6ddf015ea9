//! Tor control-port client used to rotate circuits.
//!
//! Speaks just enough of the control protocol: `AUTHENTICATE`,
//! `SIGNAL NEWNYM` and `GETINFO circuit-status`. Every command opens a fresh
//! connection, so the controller is cheap to clone and share.

use std::sync::Arc;
use std::time::Duration;

use hearth_core::error::AppError;
use hearth_core::traits::CircuitController;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

#[derive(Debug, Clone)]
pub struct TorConfig {
    /// `host:port` of the control port.
    pub control_addr: String,
    pub password: Option<String>,
    /// Bound on connecting and on each reply.
    pub io_timeout: Duration,
    /// Pause after NEWNYM so the new circuit is built before the next request.
    pub settle_delay: Duration,
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            control_addr: "127.0.0.1:9051".to_string(),
            password: None,
            io_timeout: Duration::from_secs(10),
            settle_delay: Duration::from_secs(2),
        }
    }
}

impl TorConfig {
    pub fn with_control_addr(mut self, addr: impl Into<String>) -> Self {
        self.control_addr = addr.into();
        self
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password.filter(|p| !p.is_empty());
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }
}

struct ControlConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    io_timeout: Duration,
}

impl ControlConnection {
    async fn send(&mut self, command: &str) -> Result<(), AppError> {
        let line = format!("{command}\r\n");
        tokio::time::timeout(self.io_timeout, self.writer.write_all(line.as_bytes()))
            .await
            .map_err(|_| AppError::CircuitError("control port write timed out".into()))?
            .map_err(|e| AppError::CircuitError(format!("failed to send command: {e}")))
    }

    async fn read_line(&mut self) -> Result<String, AppError> {
        let mut line = String::new();
        let n = tokio::time::timeout(self.io_timeout, self.reader.read_line(&mut line))
            .await
            .map_err(|_| AppError::CircuitError("control port reply timed out".into()))?
            .map_err(|e| AppError::CircuitError(format!("failed to read reply: {e}")))?;
        if n == 0 {
            return Err(AppError::CircuitError("control port closed the connection".into()));
        }
        Ok(line.trim_end().to_string())
    }

    /// Send a command whose single-line reply must start with `250`.
    async fn expect_ok(&mut self, command: &str, what: &str) -> Result<(), AppError> {
        self.send(command).await?;
        let reply = self.read_line().await?;
        if reply.starts_with("250") {
            Ok(())
        } else {
            Err(AppError::CircuitError(format!("{what} failed: {reply}")))
        }
    }
}

/// Client for Tor's control port.
#[derive(Debug, Clone)]
pub struct TorController {
    config: Arc<TorConfig>,
}

impl TorController {
    pub fn new(config: TorConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    async fn connect(&self) -> Result<ControlConnection, AppError> {
        let addr = &self.config.control_addr;
        let stream = tokio::time::timeout(self.config.io_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| AppError::CircuitError(format!("connecting to {addr} timed out")))?
            .map_err(|e| {
                AppError::CircuitError(format!("failed to connect to Tor control port: {e}"))
            })?;

        let (read, write) = stream.into_split();
        let mut conn = ControlConnection {
            reader: BufReader::new(read),
            writer: write,
            io_timeout: self.config.io_timeout,
        };

        let auth = match &self.config.password {
            Some(password) => format!("AUTHENTICATE \"{}\"", escape(password)),
            None => "AUTHENTICATE".to_string(),
        };
        conn.expect_ok(&auth, "authentication").await?;
        Ok(conn)
    }

    /// Request a new circuit, then wait for it to settle.
    pub async fn new_identity(&self) -> Result<(), AppError> {
        let mut conn = self.connect().await?;
        conn.expect_ok("SIGNAL NEWNYM", "NEWNYM signal").await?;
        tracing::info!(control = %self.config.control_addr, "Tor circuit rotated");

        if !self.config.settle_delay.is_zero() {
            tokio::time::sleep(self.config.settle_delay).await;
        }
        Ok(())
    }

    /// Raw `circuit-status` listing, one circuit per line.
    pub async fn circuit_status(&self) -> Result<String, AppError> {
        let mut conn = self.connect().await?;
        conn.send("GETINFO circuit-status").await?;

        // Either `250-circuit-status=<one line>` or a `250+circuit-status=`
        // data block terminated by `.`, then `250 OK`.
        let mut lines = Vec::new();
        loop {
            let line = conn.read_line().await?;
            if line.starts_with("250 ") {
                break;
            }
            if let Some(rest) = line.strip_prefix("250-circuit-status=") {
                lines.push(rest.to_string());
            } else if line.starts_with("250+circuit-status=") || line == "." {
                continue;
            } else if line.starts_with('5') || line.starts_with('4') {
                return Err(AppError::CircuitError(format!("GETINFO failed: {line}")));
            } else {
                lines.push(line);
            }
        }
        Ok(lines.join("\n"))
    }
}

impl CircuitController for TorController {
    async fn rotate_circuit(&self) -> Result<(), AppError> {
        self.new_identity().await
    }
}

fn escape(password: &str) -> String {
    password.replace('\\', "\\\\").replace('"', "\\\"")
}
