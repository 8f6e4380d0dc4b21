use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[cfg(unix)]
use std::fs;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::process::{Child, Command as ProcessCommand};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[cfg(feature = "websocket")]
use futures::sink::SinkExt;
#[cfg(feature = "websocket")]
use futures::stream::TryStreamExt;
#[cfg(feature = "websocket")]
use tokio_tungstenite::tungstenite::Message as WsMessage;
#[cfg(feature = "websocket")]
use tokio_tungstenite::{WebSocketStream, accept_async};

use tracing::{debug, error, info, warn};

use clap::Parser;

use lsp_mutualizer::binding::bind_language_client;
use lsp_mutualizer::client::LanguageClient;
use lsp_mutualizer::config::MutualizerOptions;
use lsp_mutualizer::logging::init_logging;
use lsp_mutualizer::rpc::{CloseCause, Connection};

#[derive(Debug, Clone, PartialEq)]
enum ListenMode {
    Stdio,
    Socket(u16),
    WebSocket(u16),
    Pipe(String),
}

#[derive(Debug, Clone)]
enum UpstreamMode {
    /// Spawn the server as a child process and talk LSP over its stdio.
    Spawn(Vec<String>),
    /// Dial a server already listening on TCP.
    Tcp(String, u16),
}

#[derive(Debug)]
struct BrokerConfig {
    log_level: String,
    no_color: bool,
    listen_mode: ListenMode,
    upstream: UpstreamMode,
    server_name: String,
    disable_save_notifications: bool,
}

impl BrokerConfig {
    fn from_args() -> io::Result<Self> {
        #[derive(Parser, Debug)]
        #[command(
            version,
            about = "LSP multiplexer",
            long_about = "Shares one language server between many LSP clients."
        )]
        struct Args {
            #[arg(
                long,
                default_value = "info",
                help = "Set the logging level for the broker",
                value_parser = ["error", "warn", "info", "debug", "trace"]
            )]
            log_level: String,
            #[arg(long, help = "Disable ANSI color output")]
            no_color: bool,
            #[arg(
                long,
                help = "Serve a single client over stdin/stdout (mutually exclusive with --socket, --websocket, --pipe)",
                conflicts_with_all = ["socket", "websocket", "pipe"]
            )]
            stdio: bool,
            #[arg(
                long,
                requires = "port",
                help = "Accept clients over TCP (requires --port)",
                conflicts_with_all = ["stdio", "websocket", "pipe"]
            )]
            socket: bool,
            #[arg(
                long,
                requires = "port",
                help = "Accept clients over WebSocket (requires --port)",
                conflicts_with_all = ["stdio", "socket", "pipe"]
            )]
            websocket: bool,
            #[arg(long, help = "Port number for socket or WebSocket communication")]
            port: Option<u16>,
            #[arg(
                long,
                help = "Accept clients on a Unix domain socket at the given path",
                conflicts_with_all = ["stdio", "socket", "websocket"]
            )]
            pipe: Option<String>,
            #[arg(
                long,
                help = "Command line of the language server to spawn (LSP over its stdio), e.g. --server-cmd 'rust-analyzer'",
                conflicts_with = "server_port"
            )]
            server_cmd: Option<String>,
            #[arg(long, default_value = "127.0.0.1", help = "Address of a TCP language server")]
            server_address: String,
            #[arg(long, help = "Port of a TCP language server")]
            server_port: Option<u16>,
            #[arg(long, default_value = "lsp-mutualizer", help = "Name advertised to clients in serverInfo")]
            server_name: String,
            #[arg(long, help = "Suppress the will/did-save pathways toward the server")]
            disable_save_notifications: bool,
        }

        let args = Args::parse();

        let listen_mode = match (args.stdio, args.socket, args.websocket, args.pipe) {
            (true, false, false, None) => ListenMode::Stdio,
            (false, true, false, None) => {
                ListenMode::Socket(args.port.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "Port required for socket mode")
                })?)
            }
            (false, false, true, None) => {
                ListenMode::WebSocket(args.port.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "Port required for websocket mode")
                })?)
            }
            (false, false, false, Some(pipe)) => ListenMode::Pipe(pipe),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "Exactly one of --stdio, --socket, --websocket, --pipe must be specified",
                ));
            }
        };

        let upstream = match (args.server_cmd, args.server_port) {
            (Some(cmd), None) => {
                let parts: Vec<String> = cmd.split_whitespace().map(str::to_string).collect();
                if parts.is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "--server-cmd must not be empty",
                    ));
                }
                UpstreamMode::Spawn(parts)
            }
            (None, Some(port)) => UpstreamMode::Tcp(args.server_address, port),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "Exactly one of --server-cmd or --server-port must be specified",
                ));
            }
        };

        Ok(BrokerConfig {
            log_level: args.log_level,
            no_color: args.no_color,
            listen_mode,
            upstream,
            server_name: args.server_name,
            disable_save_notifications: args.disable_save_notifications,
        })
    }
}

#[cfg(feature = "websocket")]
struct WebSocketStreamAdapter<S> {
    inner: WebSocketStream<S>,
    read_buffer: Vec<u8>,
}

#[cfg(feature = "websocket")]
impl<S> WebSocketStreamAdapter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(inner: WebSocketStream<S>) -> Self {
        WebSocketStreamAdapter {
            inner,
            read_buffer: Vec::new(),
        }
    }
}

#[cfg(feature = "websocket")]
impl<S> AsyncRead for WebSocketStreamAdapter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        use std::task::Poll;
        let this = self.get_mut();
        loop {
            if !this.read_buffer.is_empty() {
                let to_copy = std::cmp::min(buf.remaining(), this.read_buffer.len());
                buf.put_slice(&this.read_buffer[..to_copy]);
                this.read_buffer.drain(..to_copy);
                return Poll::Ready(Ok(()));
            }
            match this.inner.try_poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(WsMessage::Text(text)))) => {
                    this.read_buffer.extend_from_slice(text.as_bytes());
                }
                Poll::Ready(Some(Ok(WsMessage::Binary(data)))) => {
                    this.read_buffer.extend_from_slice(&data);
                }
                Poll::Ready(Some(Ok(_control_frame))) => continue,
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(io::Error::other(e))),
                // Stream end maps to EOF.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(feature = "websocket")]
impl<S> AsyncWrite for WebSocketStreamAdapter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        use std::task::Poll;
        let this = self.get_mut();
        match this.inner.poll_ready_unpin(cx) {
            Poll::Ready(Ok(())) => {
                match this.inner.start_send_unpin(WsMessage::Binary(buf.to_vec())) {
                    Ok(()) => Poll::Ready(Ok(buf.len())),
                    Err(e) => Poll::Ready(Err(io::Error::other(e))),
                }
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::other(e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        self.get_mut()
            .inner
            .poll_flush_unpin(cx)
            .map_err(io::Error::other)
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        self.get_mut()
            .inner
            .poll_close_unpin(cx)
            .map_err(io::Error::other)
    }
}

#[derive(Clone)]
struct ConnectionManager {
    shutdown_notify: Arc<Notify>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ConnectionManager {
    fn new() -> Self {
        ConnectionManager {
            shutdown_notify: Arc::new(Notify::new()),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn add_task(&self, task: JoinHandle<()>) {
        self.tasks.lock().unwrap().push(task);
    }

    async fn wait_for_tasks(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.drain(..).collect()
        };
        for task in tasks {
            if let Err(e) = tokio::time::timeout(Duration::from_secs(5), task).await {
                error!("task did not complete in time: {:?}", e);
            }
        }
    }
}

/// The upstream server link; the child process (if we spawned one) lives as
/// long as the broker.
struct Upstream {
    connection: Arc<Connection>,
    _child: Option<Child>,
}

async fn connect_upstream(mode: &UpstreamMode) -> io::Result<Upstream> {
    match mode {
        UpstreamMode::Spawn(command_line) => {
            info!("spawning language server: {}", command_line.join(" "));
            let mut child = ProcessCommand::new(&command_line[0])
                .args(&command_line[1..])
                .stdin(std::process::Stdio::piped())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::inherit())
                .kill_on_drop(true)
                .spawn()?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| io::Error::other("server stdout unavailable"))?;
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| io::Error::other("server stdin unavailable"))?;
            Ok(Upstream {
                connection: Connection::new(BufReader::new(stdout), stdin, "server"),
                _child: Some(child),
            })
        }
        UpstreamMode::Tcp(address, port) => {
            info!("connecting to language server at {}:{}", address, port);
            let stream = tokio::net::TcpStream::connect((address.as_str(), *port)).await?;
            let (read, write) = tokio::io::split(stream);
            Ok(Upstream {
                connection: Connection::new(read, write, "server"),
                _child: None,
            })
        }
    }
}

fn serve_client<R, W>(
    read: R,
    write: W,
    addr: impl std::fmt::Display + Send + 'static,
    client: Arc<LanguageClient>,
    manager: &ConnectionManager,
) where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    info!("accepted client connection from {}", addr);
    let connection = Connection::new(read, write, format!("client:{}", addr));
    let task = tokio::spawn(async move {
        match bind_language_client(client, connection).await {
            Ok(cause) => info!("client {} ended ({:?})", addr, cause),
            Err(e) => warn!("client {} failed to attach: {}", addr, e),
        }
    });
    manager.add_task(task);
}

async fn run_stdio(client: Arc<LanguageClient>, manager: ConnectionManager) -> io::Result<()> {
    info!("serving one client over stdin/stdout");
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    let connection = Connection::new(stdin, stdout, "client:stdio");
    let shutdown = manager.shutdown_notify.clone();
    tokio::select! {
        result = bind_language_client(client, connection) => match result {
            Ok(cause) => info!("stdio client ended ({:?})", cause),
            Err(e) => warn!("stdio client failed to attach: {}", e),
        },
        _ = shutdown.notified() => info!("shutdown requested, dropping stdio client"),
    }
    Ok(())
}

async fn run_socket(
    client: Arc<LanguageClient>,
    manager: ConnectionManager,
    port: u16,
) -> io::Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    info!("accepting clients on 127.0.0.1:{}", port);
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, addr)) => {
                    let (read, write) = tokio::io::split(stream);
                    serve_client(read, write, addr, client.clone(), &manager);
                }
                Err(e) => error!("failed to accept TCP connection: {}", e),
            },
            _ = manager.shutdown_notify.notified() => {
                info!("shutdown requested, closing TCP listener");
                break;
            }
        }
    }
    Ok(())
}

#[cfg(feature = "websocket")]
async fn run_websocket(
    client: Arc<LanguageClient>,
    manager: ConnectionManager,
    port: u16,
) -> io::Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    info!("accepting WebSocket clients on 127.0.0.1:{}", port);
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, addr)) => match accept_async(stream).await {
                    Ok(ws_stream) => {
                        let adapter = WebSocketStreamAdapter::new(ws_stream);
                        let (read, write) = tokio::io::split(adapter);
                        serve_client(read, write, addr, client.clone(), &manager);
                    }
                    Err(e) => error!("WebSocket handshake with {} failed: {}", addr, e),
                },
                Err(e) => error!("failed to accept TCP connection: {}", e),
            },
            _ = manager.shutdown_notify.notified() => {
                info!("shutdown requested, closing WebSocket listener");
                break;
            }
        }
    }
    Ok(())
}

#[cfg(not(feature = "websocket"))]
async fn run_websocket(
    _client: Arc<LanguageClient>,
    _manager: ConnectionManager,
    _port: u16,
) -> io::Result<()> {
    Err(io::Error::other(
        "this build does not include WebSocket support",
    ))
}

async fn run_pipe(
    client: Arc<LanguageClient>,
    manager: ConnectionManager,
    pipe_path: &str,
) -> io::Result<()> {
    #[cfg(unix)]
    {
        info!("accepting clients on Unix socket {}", pipe_path);
        if std::path::Path::new(pipe_path).exists() {
            fs::remove_file(pipe_path)?;
        }
        let listener = UnixListener::bind(pipe_path)?;
        let cleanup = scopeguard::guard(pipe_path.to_string(), |path| {
            if let Err(e) = fs::remove_file(&path) {
                error!("failed to clean up Unix socket file {}: {}", path, e);
            } else {
                debug!("cleaned up Unix socket file {}", path);
            }
        });
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        let addr = format!("unix:{:?}", addr);
                        let (read, write) = tokio::io::split(stream);
                        serve_client(read, write, addr, client.clone(), &manager);
                    }
                    Err(e) => error!("failed to accept Unix socket connection: {}", e),
                },
                _ = manager.shutdown_notify.notified() => {
                    info!("shutdown requested, closing Unix socket listener");
                    break;
                }
            }
        }
        drop(cleanup);
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = (client, manager, pipe_path);
        Err(io::Error::other(
            "pipe mode is only supported on Unix platforms",
        ))
    }
}

async fn run_broker(config: BrokerConfig, manager: ConnectionManager) -> io::Result<()> {
    init_logging(Some(&config.log_level), !config.no_color);
    info!("starting lsp-mutualizer (log level {})", config.log_level);

    let upstream = connect_upstream(&config.upstream).await?;

    let options = MutualizerOptions {
        server_name: config.server_name.clone(),
        disable_save_notifications: config.disable_save_notifications,
        ..MutualizerOptions::default()
    };
    let client = LanguageClient::new(upstream.connection.clone(), options);

    // A dead server ends the broker: every binding resolves EndCause::Server
    // and the accept loops shut down.
    let notify = manager.shutdown_notify.clone();
    let dispose_subscription = client.on_dispose.subscribe(move |reason| {
        info!(?reason, "language client disposed, shutting broker down");
        notify.notify_waiters();
    });

    let result = match config.listen_mode {
        ListenMode::Stdio => run_stdio(client.clone(), manager.clone()).await,
        ListenMode::Socket(port) => run_socket(client.clone(), manager.clone(), port).await,
        ListenMode::WebSocket(port) => run_websocket(client.clone(), manager.clone(), port).await,
        ListenMode::Pipe(ref path) => run_pipe(client.clone(), manager.clone(), path).await,
    };

    client.dispose().await;
    drop(dispose_subscription);
    if !upstream.connection.is_closed() {
        upstream.connection.close(CloseCause::Local);
    }
    manager.wait_for_tasks().await;
    info!("broker terminated");
    result
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = BrokerConfig::from_args()?;
    let manager = ConnectionManager::new();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = run_broker(config, manager.clone()) => result.map_err(anyhow::Error::from),
            _ = sigint.recv() => {
                info!("received SIGINT, initiating shutdown");
                manager.shutdown_notify.notify_waiters();
                manager.wait_for_tasks().await;
                Ok(())
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, initiating shutdown");
                manager.shutdown_notify.notify_waiters();
                manager.wait_for_tasks().await;
                Ok(())
            }
        }
    }

    #[cfg(not(unix))]
    {
        use tokio::signal::ctrl_c;
        tokio::select! {
            result = run_broker(config, manager.clone()) => result.map_err(anyhow::Error::from),
            _ = ctrl_c() => {
                info!("received Ctrl+C, initiating shutdown");
                manager.shutdown_notify.notify_waiters();
                manager.wait_for_tasks().await;
                Ok(())
            }
        }
    }
}
