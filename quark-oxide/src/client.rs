//! The client driver
//!
//! A [`Client`] keeps one logical connection alive: a supervisor task cycles
//! through resolve → connect → handshake → pump, tearing down and
//! reconnecting with exponential backoff on any transport or protocol
//! failure. While a connection is up, a writer future flushes staged
//! requests in order and a reader future matches replies to them by flush
//! order, so arbitrarily many requests can be pipelined.
//!
//! `MOVED` redirects are followed transparently when enabled: the in-flight
//! requests are retained, the connection is re-established against the
//! redirect target without backoff, and the requests are replayed there.

use crate::backpressure::BackpressureGate;
use crate::executor::{CallbackExecutor, Completion, ReplyCallback};
use crate::handshake::{Handshake, HandshakeStatus};
use crate::protocol::encoder::EncodedRequest;
use crate::protocol::parser::{ParseOutcome, ResponseParser};
use crate::pubsub::message::{parse_message, Message};
use crate::resolver::HostResolver;
use crate::staging::RequestStager;
use crate::stream::{NetworkStream, TlsAdapter};
use quark_oxide_core::config::{Options, BACKOFF_CAP, BACKOFF_INITIAL};
use quark_oxide_core::error::QuarkError;
use quark_oxide_core::types::{Endpoint, Members, ServiceEndpoint};
use quark_oxide_core::value::RespValue;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Resolves to the reply of a single staged request, or `None` if the
/// library could not guarantee the command reached the server and got an
/// answer.
pub struct ReplyFuture {
    rx: oneshot::Receiver<Option<RespValue>>,
}

impl ReplyFuture {
    fn ready_none() -> Self {
        let (tx, rx) = oneshot::channel();
        drop(tx);
        Self { rx }
    }
}

impl Future for ReplyFuture {
    type Output = Option<RespValue>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(reply)) => Poll::Ready(reply),
            Poll::Ready(Err(_)) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub(crate) struct ClientInner {
    options: Options,
    members: Members,
    stager: RequestStager,
    gate: BackpressureGate,
    executor: CallbackExecutor,
    shutdown_tx: watch::Sender<bool>,
    epoch_tx: watch::Sender<u64>,
    listener: Option<mpsc::UnboundedSender<Message>>,
    full_listener: bool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ClientInner {
    fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn bump_epoch(&self) {
        self.epoch_tx.send_modify(|epoch| *epoch += 1);
    }
}

/// Triggers shutdown once the last external client handle is gone.
struct ClientGuard {
    inner: Arc<ClientInner>,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        let _ = self.inner.shutdown_tx.send(true);
    }
}

/// Builder for clients that need more than the default wiring.
pub struct ClientBuilder {
    members: Members,
    options: Options,
    handshake: Option<Box<dyn Handshake>>,
    tls: Option<Arc<dyn TlsAdapter>>,
    listener: Option<mpsc::UnboundedSender<Message>>,
    full_listener: bool,
}

impl ClientBuilder {
    /// Install the handshake run at the start of every connection
    #[must_use]
    pub fn handshake(mut self, handshake: Box<dyn Handshake>) -> Self {
        self.handshake = Some(handshake);
        self
    }

    /// Install the TLS transport adapter
    #[must_use]
    pub fn tls_adapter(mut self, adapter: Arc<dyn TlsAdapter>) -> Self {
        self.tls = Some(adapter);
        self
    }

    /// Route pub/sub traffic to the given sink. With `full_listener`, every
    /// reply is treated as a pub/sub message (RESP2 subscription fallback);
    /// otherwise only `>` push frames are routed.
    pub(crate) fn listener(
        mut self,
        sink: mpsc::UnboundedSender<Message>,
        full_listener: bool,
    ) -> Self {
        self.listener = Some(sink);
        self.full_listener = full_listener;
        self
    }

    /// Spawn the supervisor and return the client handle. Must be called
    /// within a tokio runtime.
    pub fn build(self) -> Client {
        let (shutdown_tx, _) = watch::channel(false);
        let (epoch_tx, _) = watch::channel(0u64);

        let inner = Arc::new(ClientInner {
            gate: BackpressureGate::new(self.options.backpressure),
            options: self.options,
            members: self.members,
            stager: RequestStager::new(),
            executor: CallbackExecutor::new(),
            shutdown_tx,
            epoch_tx,
            listener: self.listener,
            full_listener: self.full_listener,
            supervisor: Mutex::new(None),
        });

        if inner.full_listener {
            inner.stager.enable_trim_after_flush();
        }

        let handle = tokio::spawn(supervisor(inner.clone(), self.handshake, self.tls));
        *inner.supervisor.lock().unwrap_or_else(std::sync::PoisonError::into_inner) =
            Some(handle);

        Client {
            inner: inner.clone(),
            _guard: Arc::new(ClientGuard { inner }),
        }
    }
}

/// Handle to one logical, reconnecting, pipelined connection.
///
/// Cloning is cheap and all clones drive the same connection. The
/// connection shuts down when the last clone is dropped; use
/// [`Client::shutdown`] to wait for the teardown to finish, after which no
/// completion will fire anymore.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
    _guard: Arc<ClientGuard>,
}

impl Client {
    /// Connect with default wiring. Must be called within a tokio runtime.
    pub fn new(members: Members, options: Options) -> Self {
        Self::builder(members, options).build()
    }

    /// Start building a customized client
    pub fn builder(members: Members, options: Options) -> ClientBuilder {
        ClientBuilder {
            members,
            options,
            handshake: None,
            tls: None,
            listener: None,
            full_listener: false,
        }
    }

    /// Execute a command and wait for its reply.
    pub async fn execute<A: AsRef<[u8]>>(&self, args: &[A]) -> Option<RespValue> {
        self.enqueue(EncodedRequest::from_args(args)).await.await
    }

    /// Stage a command and return a future for its reply, allowing further
    /// commands to be pipelined behind it. Honors backpressure.
    pub async fn enqueue(&self, request: EncodedRequest) -> ReplyFuture {
        if !self
            .inner
            .gate
            .acquire(self.inner.shutdown_tx.subscribe())
            .await
        {
            return ReplyFuture::ready_none();
        }

        let (tx, rx) = oneshot::channel();
        match self
            .inner
            .stager
            .stage(request.into_bytes(), Completion::Future(tx))
        {
            Ok(()) => ReplyFuture { rx },
            Err(completion) => {
                self.inner.gate.release();
                completion.complete(None);
                ReplyFuture { rx }
            }
        }
    }

    /// Execute a command, delivering the reply to a callback on the
    /// completion executor. A callback invoked with `None` must not issue
    /// further requests on this client, which may be shutting down.
    pub async fn execute_callback<A: AsRef<[u8]>>(&self, args: &[A], callback: ReplyCallback) {
        let request = EncodedRequest::from_args(args);
        if !self
            .inner
            .gate
            .acquire(self.inner.shutdown_tx.subscribe())
            .await
        {
            self.inner.executor.submit(Completion::Callback(callback), None);
            return;
        }

        if let Err(completion) = self
            .inner
            .stager
            .stage(request.into_bytes(), Completion::Callback(callback))
        {
            self.inner.gate.release();
            self.inner.executor.submit(completion, None);
        }
    }

    /// Stage a fire-and-forget command (used for subscription traffic).
    pub(crate) async fn enqueue_discard(&self, request: EncodedRequest) {
        if !self
            .inner
            .gate
            .acquire(self.inner.shutdown_tx.subscribe())
            .await
        {
            return;
        }
        if self
            .inner
            .stager
            .stage(request.into_bytes(), Completion::Discard)
            .is_err()
        {
            self.inner.gate.release();
        }
    }

    /// Observe reconnections: the value increments on every completed
    /// handshake.
    pub fn reconnection_watch(&self) -> watch::Receiver<u64> {
        self.inner.epoch_tx.subscribe()
    }

    /// Number of staged, not yet acknowledged requests.
    pub fn pending_requests(&self) -> usize {
        self.inner.stager.pending_len()
    }

    /// Signal shutdown without waiting for the teardown.
    pub fn close(&self) {
        let _ = self.inner.shutdown_tx.send(true);
    }

    /// Shut down and wait until the supervisor has drained: every
    /// outstanding handle is completed with `None` before this returns, and
    /// no completion fires afterwards.
    pub async fn shutdown(&self) {
        self.close();
        let handle = self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        // Barrier through the completion executor: once it comes back,
        // every completion queued by the teardown has been delivered.
        let (tx, rx) = oneshot::channel();
        self.inner.executor.submit(
            Completion::Callback(Box::new(move |_| {
                let _ = tx.send(());
            })),
            None,
        );
        let _ = rx.await;
    }
}

enum Exit {
    Shutdown,
    Redirect(Endpoint),
    Failure,
}

async fn supervisor(
    inner: Arc<ClientInner>,
    master_handshake: Option<Box<dyn Handshake>>,
    tls: Option<Arc<dyn TlsAdapter>>,
) {
    let resolver = HostResolver::new();
    let mut backoff = BACKOFF_INITIAL;
    let mut redirect: Option<Endpoint> = None;

    while !inner.is_shutdown() {
        let targets = resolve_targets(&resolver, &inner.members, redirect.take()).await;
        if targets.is_empty() {
            warn!("no endpoints resolved, cannot attempt a connection");
            inner
                .stager
                .handle_disconnect(inner.options.retry_strategy, &inner.executor, &inner.gate);
            if sleep_or_shutdown(&inner, backoff).await {
                break;
            }
            backoff = grow(backoff);
            continue;
        }

        let stream = match NetworkStream::connect(
            &targets,
            inner.options.connect_timeout,
            inner.options.tcp_keepalive,
            tls.as_deref(),
        )
        .await
        {
            Ok(stream) => stream,
            Err(e) => {
                debug!(error = %e, "connection attempt failed");
                inner.stager.handle_disconnect(
                    inner.options.retry_strategy,
                    &inner.executor,
                    &inner.gate,
                );
                if sleep_or_shutdown(&inner, backoff).await {
                    break;
                }
                backoff = grow(backoff);
                continue;
            }
        };

        info!(peer = %stream.peer(), "connection established");

        let mut handshake = master_handshake.as_ref().map(|hs| hs.clone_fresh());
        let first = handshake.as_mut().map(|hs| hs.provide().into_bytes());
        inner.stager.begin_connection(first);
        if handshake.is_none() {
            // Nothing to validate: the connection is usable right away.
            backoff = BACKOFF_INITIAL;
            inner.bump_epoch();
        }

        match run_connection(&inner, stream, &mut handshake, &mut backoff).await {
            Exit::Shutdown => break,
            Exit::Redirect(endpoint) => {
                // Redirects retain in-flight entries and skip backoff.
                inner.stager.rewind();
                redirect = Some(endpoint);
            }
            Exit::Failure => {
                inner.stager.handle_disconnect(
                    inner.options.retry_strategy,
                    &inner.executor,
                    &inner.gate,
                );
                if sleep_or_shutdown(&inner, backoff).await {
                    break;
                }
                backoff = grow(backoff);
            }
        }
    }

    inner.stager.fail_all(&inner.executor, &inner.gate);
}

async fn resolve_targets(
    resolver: &HostResolver,
    members: &Members,
    redirect: Option<Endpoint>,
) -> Vec<ServiceEndpoint> {
    match redirect {
        Some(target) => match resolver.resolve(&target).await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                warn!(target = %target, error = %e, "cannot resolve redirect target");
                Vec::new()
            }
        },
        None => {
            let mut all = Vec::new();
            for endpoint in members.endpoints() {
                match resolver.resolve(endpoint).await {
                    Ok(mut endpoints) => all.append(&mut endpoints),
                    Err(e) => debug!(endpoint = %endpoint, error = %e, "resolution failed"),
                }
            }
            all
        }
    }
}

fn grow(backoff: Duration) -> Duration {
    (backoff * 2).min(BACKOFF_CAP)
}

/// Sleep for the backoff period; returns true if shutdown fired instead.
async fn sleep_or_shutdown(inner: &ClientInner, backoff: Duration) -> bool {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    tokio::select! {
        () = tokio::time::sleep(backoff) => false,
        () = wait_true(&mut shutdown_rx) => true,
    }
}

async fn wait_true(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

struct ConnectionState {
    in_handshake: bool,
}

async fn run_connection(
    inner: &Arc<ClientInner>,
    stream: NetworkStream,
    handshake: &mut Option<Box<dyn Handshake>>,
    backoff: &mut Duration,
) -> Exit {
    let (mut rd, mut wr) = stream.into_split();
    let mut shutdown_rx = inner.shutdown_tx.subscribe();

    let writer = async {
        loop {
            let Some(buf) = inner.stager.next_to_write(&inner.gate).await else {
                return Exit::Shutdown;
            };
            if let Err(e) = wr.write_all(&buf).await {
                debug!(error = %e, "write failed");
                return Exit::Failure;
            }
        }
    };

    let reader = async {
        let mut parser = ResponseParser::new();
        let mut conn = ConnectionState {
            in_handshake: handshake.is_some(),
        };
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let n = match rd.read(&mut buf).await {
                Ok(0) => {
                    debug!("connection closed by server");
                    return Exit::Failure;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "read failed");
                    return Exit::Failure;
                }
            };
            parser.feed(&buf[..n]);

            loop {
                match parser.try_pull() {
                    ParseOutcome::Incomplete => break,
                    ParseOutcome::ProtocolError(e) => {
                        warn!(error = %e, "protocol violation, dropping connection");
                        return Exit::Failure;
                    }
                    ParseOutcome::Complete(reply) => {
                        if let Err(exit) =
                            consume_reply(inner, &mut conn, handshake, reply, backoff)
                        {
                            return exit;
                        }
                    }
                }
            }
        }
    };

    tokio::select! {
        () = wait_true(&mut shutdown_rx) => Exit::Shutdown,
        exit = reader => exit,
        exit = writer => exit,
    }
}

/// QuarkDB signals transient cluster trouble with these error prefixes.
fn is_unavailable_error(reply: &RespValue) -> bool {
    match reply {
        RespValue::Error(msg) => {
            msg.starts_with("ERR unavailable") || msg.starts_with("UNAVAILABLE")
        }
        _ => false,
    }
}

fn consume_reply(
    inner: &ClientInner,
    conn: &mut ConnectionState,
    handshake: &mut Option<Box<dyn Handshake>>,
    reply: RespValue,
    backoff: &mut Duration,
) -> Result<(), Exit> {
    // Transient "unavailable" errors break the connection so the request is
    // replayed elsewhere, instead of surfacing to the caller.
    if inner.options.retry_strategy.active() && is_unavailable_error(&reply) {
        warn!("cluster temporarily unavailable, breaking connection");
        return Err(Exit::Failure);
    }

    if conn.in_handshake {
        let hs = handshake.as_mut().expect("handshake present while in handshake");
        return match hs.validate(&reply) {
            HandshakeStatus::Invalid => {
                warn!("handshake stage rejected by server");
                Err(Exit::Failure)
            }
            HandshakeStatus::ValidIncomplete => {
                let next = hs.provide().into_bytes();
                inner.stager.stage_handshake(next);
                Ok(())
            }
            HandshakeStatus::ValidComplete => {
                conn.in_handshake = false;
                inner.stager.handshake_completed();
                *backoff = BACKOFF_INITIAL;
                inner.bump_epoch();
                Ok(())
            }
        };
    }

    // Push frames go to the subscriber without consuming a reply slot.
    if reply.is_push() {
        if let Some(listener) = &inner.listener {
            return match parse_message(&reply) {
                Some(msg) => {
                    let _ = listener.send(msg);
                    Ok(())
                }
                None => {
                    warn!("unparseable push frame, dropping connection");
                    Err(Exit::Failure)
                }
            };
        }
    }

    // RESP2 subscription fallback: every reply is pub/sub traffic.
    if inner.full_listener {
        if let Some(listener) = &inner.listener {
            return match parse_message(&reply) {
                Some(msg) => {
                    let _ = listener.send(msg);
                    Ok(())
                }
                None => {
                    warn!("expected pub/sub message, got something else");
                    Err(Exit::Failure)
                }
            };
        }
    }

    if inner.options.transparent_redirects && inner.stager.has_pending() {
        if let RespValue::Error(msg) = &reply {
            if let Some(QuarkError::Moved { slot, host, port }) = QuarkError::parse_redirect(msg)
            {
                info!(slot, host = %host, port, "following MOVED redirect");
                return Err(Exit::Redirect(Endpoint::new(host, port)));
            }
        }
    }

    match inner.stager.acknowledge(reply, &inner.executor, &inner.gate) {
        Ok(()) => Ok(()),
        Err(()) => {
            warn!("server sent more replies than there were requests");
            Err(Exit::Failure)
        }
    }
}
