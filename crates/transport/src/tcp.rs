//! TCP transport: one request/response exchange at a time per connection

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use driftsync_core::protocol::{HEADER_LEN, parse_header};
use driftsync_core::{Message, SyncService};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::{MAX_POLL_TIMEOUT, dispatch};
use crate::rpc::{Channel, RpcClient};

/// Read one frame. Returns `None` on a clean EOF before the header.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Message>> {
    let mut header = [0u8; HEADER_LEN];
    match r.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let (msg_type, len) = parse_header(header)?;

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;
    Message::decode(msg_type, &payload).map(Some)
}

/// Write one frame and flush
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, message: &Message) -> Result<()> {
    w.write_all(&message.encode_frame()?).await?;
    w.flush().await?;
    Ok(())
}

/// Accepts replicas and answers their requests from `service`
pub struct TcpServer {
    listener: TcpListener,
    service: Arc<dyn SyncService>,
    cancel: CancellationToken,
}

impl TcpServer {
    pub async fn bind(addr: impl ToSocketAddrs, service: Arc<dyn SyncService>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.wrap_err("Failed to bind listener")?;
        Ok(Self {
            listener,
            service,
            cancel: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Token that stops [`TcpServer::run`] and every connection it spawned
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Accept connections until cancelled
    pub async fn run(self) -> Result<()> {
        info!("Listening on {}", self.listener.local_addr()?);
        loop {
            let (stream, peer) = tokio::select! {
                () = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {e}");
                        continue;
                    }
                },
            };
            debug!("Connection from {peer}");
            let service = Arc::clone(&self.service);
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, service.as_ref(), cancel).await {
                    warn!("Connection from {peer} failed: {e:#}");
                }
                debug!("Connection from {peer} closed");
            });
        }
        info!("Listener stopped");
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    service: &dyn SyncService,
    cancel: CancellationToken,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let request = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            request = read_frame(&mut reader) => request?,
        };
        let Some(request) = request else {
            return Ok(());
        };
        let response = dispatch(service, request).await;
        write_frame(&mut write_half, &response).await?;
    }
}

/// Pooled connections to a [`TcpServer`].
///
/// Each call borrows an idle connection or opens a new one, so concurrent
/// callers do not wait behind each other's long polls. A connection that
/// fails mid-call is dropped.
pub struct TcpChannel {
    addr: SocketAddr,
    idle: Mutex<Vec<TcpStream>>,
    call_timeout: Duration,
}

impl TcpChannel {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let addr = tokio::net::lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| eyre!("Address resolved to nothing"))?;
        let stream = Self::open(addr).await?;
        Ok(Self {
            addr,
            idle: Mutex::new(vec![stream]),
            call_timeout: MAX_POLL_TIMEOUT + Duration::from_secs(30),
        })
    }

    /// Give up on a call after `timeout`
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    async fn open(addr: SocketAddr) -> Result<TcpStream> {
        let stream = TcpStream::connect(addr)
            .await
            .wrap_err_with(|| format!("Failed to connect to {addr}"))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    async fn exchange(stream: &mut TcpStream, request: &Message) -> Result<Message> {
        write_frame(stream, request).await?;
        read_frame(stream)
            .await?
            .ok_or_else(|| eyre!("Server closed the connection"))
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn call(&self, request: Message) -> Result<Message> {
        let pooled = self.idle.lock().await.pop();
        let mut stream = match pooled {
            Some(stream) => stream,
            None => Self::open(self.addr).await?,
        };

        let response = tokio::time::timeout(self.call_timeout, Self::exchange(&mut stream, &request))
            .await
            .map_err(|_| eyre!("No response within {:?}", self.call_timeout))??;

        self.idle.lock().await.push(stream);
        Ok(response)
    }
}

/// Connect an [`RpcClient`] to a server
pub async fn connect(addr: impl ToSocketAddrs) -> Result<RpcClient<TcpChannel>> {
    Ok(RpcClient::new(TcpChannel::connect(addr).await?))
}
