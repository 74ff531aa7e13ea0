//! LSP Transport Layer
//!
//! The client core only sees [`Transport`]: it sends bare JSON-RPC text and
//! subscribes to inbound text. Framing is the transport's business.
//! - [`ChannelTransport`]: in-process pair, the other end plays the server
//! - [`StdioTransport`]: child process with `Content-Length` framing

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;

use crate::workspace::lock;

/// Inbound message callback
pub type MessageHandler = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Bidirectional channel for JSON-RPC text messages
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one message. Fails if the channel is broken.
    async fn send(&self, message: &str) -> io::Result<()>;

    /// Deliver every inbound message to `handler`
    fn subscribe(&self, handler: MessageHandler) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId);
}

/// Subscriber list shared by the transports
#[derive(Default)]
struct Fanout {
    next: u64,
    handlers: Vec<(SubscriptionId, MessageHandler)>,
}

impl Fanout {
    fn add(&mut self, handler: MessageHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next);
        self.next += 1;
        self.handlers.push((id, handler));
        id
    }

    fn remove(&mut self, id: SubscriptionId) {
        self.handlers.retain(|(existing, _)| *existing != id);
    }
}

fn deliver(fanout: &Mutex<Fanout>, message: &str) {
    // Handlers run outside the lock so they may subscribe or unsubscribe
    let handlers: Vec<MessageHandler> = lock(fanout)
        .handlers
        .iter()
        .map(|(_, handler)| Arc::clone(handler))
        .collect();
    if handlers.is_empty() {
        tracing::debug!("No subscriber for inbound message, dropping it");
    }
    for handler in handlers {
        handler(message);
    }
}

// ============================================================================
// In-process transport
// ============================================================================

/// Client half of an in-process transport
pub struct ChannelTransport {
    to_server: mpsc::UnboundedSender<String>,
    fanout: Arc<Mutex<Fanout>>,
    closed: Arc<AtomicBool>,
    failing: Arc<AtomicBool>,
}

/// Server half of an in-process transport
pub struct ServerEnd {
    from_client: mpsc::UnboundedReceiver<String>,
    fanout: Arc<Mutex<Fanout>>,
    closed: Arc<AtomicBool>,
    failing: Arc<AtomicBool>,
}

impl ChannelTransport {
    pub fn pair() -> (Arc<ChannelTransport>, ServerEnd) {
        let (to_server, from_client) = mpsc::unbounded_channel();
        let fanout = Arc::new(Mutex::new(Fanout::default()));
        let closed = Arc::new(AtomicBool::new(false));
        let failing = Arc::new(AtomicBool::new(false));
        let client = ChannelTransport {
            to_server,
            fanout: Arc::clone(&fanout),
            closed: Arc::clone(&closed),
            failing: Arc::clone(&failing),
        };
        let server = ServerEnd {
            from_client,
            fanout,
            closed,
            failing,
        };
        (Arc::new(client), server)
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.fanout).handlers.len()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, message: &str) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "Transport closed"));
        }
        if self.failing.load(Ordering::Acquire) {
            return Err(io::Error::other("Transport refused message"));
        }
        self.to_server
            .send(message.to_string())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "Server end dropped"))
    }

    fn subscribe(&self, handler: MessageHandler) -> SubscriptionId {
        lock(&self.fanout).add(handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        lock(&self.fanout).remove(id);
    }
}

impl ServerEnd {
    /// Next message the client sent, `None` once the client half is gone
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Next message parsed as JSON
    pub async fn recv_json(&mut self) -> Option<Value> {
        let raw = self.recv().await?;
        serde_json::from_str(&raw).ok()
    }

    /// Message already sent, without waiting
    pub fn try_recv_json(&mut self) -> Option<Value> {
        let raw = self.from_client.try_recv().ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Deliver a message to the client's subscribers, synchronously
    pub fn send(&self, message: &str) {
        deliver(&self.fanout, message);
    }

    pub fn send_json(&self, message: &Value) {
        self.send(&message.to_string());
    }

    /// Make every further client send fail
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Make client sends fail (or succeed again) without closing
    pub fn fail_sends(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }
}

// ============================================================================
// Stdio transport
// ============================================================================

/// Language server child process speaking `Content-Length` framed JSON-RPC
pub struct StdioTransport {
    child: AsyncMutex<Child>,
    stdin: AsyncMutex<ChildStdin>,
    fanout: Arc<Mutex<Fanout>>,
    reader: JoinHandle<()>,
}

impl StdioTransport {
    /// Spawn `command` and start reading its stdout
    pub fn spawn(command: &str, args: &[String], cwd: Option<&Path>) -> io::Result<Self> {
        tracing::info!("Starting language server: {} {:?}", command, args);

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        let mut child = cmd.spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("Failed to get stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("Failed to get stdout"))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("server stderr: {}", line);
                }
            });
        }

        let fanout = Arc::new(Mutex::new(Fanout::default()));
        let reader = {
            let fanout = Arc::clone(&fanout);
            tokio::spawn(async move {
                let mut frames = FrameReader::new(BufReader::new(stdout));
                loop {
                    match frames.read_frame().await {
                        Ok(json) => deliver(&fanout, &json),
                        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                            tracing::debug!("Language server closed its output");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!("Failed to read from language server: {}", e);
                            break;
                        }
                    }
                }
            })
        };

        Ok(Self {
            child: AsyncMutex::new(child),
            stdin: AsyncMutex::new(stdin),
            fanout,
            reader,
        })
    }

    /// Whether the child is still running
    pub async fn is_running(&self) -> bool {
        matches!(self.child.lock().await.try_wait(), Ok(None))
    }

    pub async fn kill(&self) -> io::Result<()> {
        self.child.lock().await.kill().await
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, message: &str) -> io::Result<()> {
        let mut stdin = self.stdin.lock().await;
        write_frame(&mut *stdin, message).await
    }

    fn subscribe(&self, handler: MessageHandler) -> SubscriptionId {
        lock(&self.fanout).add(handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        lock(&self.fanout).remove(id);
    }
}

// ============================================================================
// Framing
// ============================================================================

/// Reads `Content-Length` framed messages
pub struct FrameReader<R> {
    reader: R,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Read the next message body
    ///
    /// LSP messages are framed with headers:
    /// ```text
    /// Content-Length: 123\r\n
    /// \r\n
    /// {"jsonrpc":"2.0",...}
    /// ```
    pub async fn read_frame(&mut self) -> io::Result<String> {
        let content_length = self.read_headers().await?;

        let mut body = vec![0u8; content_length];
        self.reader.read_exact(&mut body).await?;

        String::from_utf8(body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    async fn read_headers(&mut self) -> io::Result<usize> {
        let mut content_length: Option<usize> = None;
        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = self.reader.read_line(&mut line).await?;
            if bytes_read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "Server closed connection",
                ));
            }

            let line = line.trim();
            if line.is_empty() {
                break;
            }

            if let Some(value) = line.strip_prefix("Content-Length:") {
                content_length = Some(
                    value
                        .trim()
                        .parse()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
                );
            }
            // Content-Type and anything else is ignored
        }

        content_length
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "Missing Content-Length"))
    }
}

/// Write one message with `Content-Length` framing
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, json: &str) -> io::Result<()> {
    let message = format!("Content-Length: {}\r\n\r\n{}", json.len(), json);
    writer.write_all(message.as_bytes()).await?;
    writer.flush().await
}
