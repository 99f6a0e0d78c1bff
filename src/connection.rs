use crate::modbus::{self, ModbusTcpCodec, Operation, Request, Response, ResponseKind};
use crate::registers::RegisterKind;
use futures::future::BoxFuture;
use futures::{SinkExt as _, StreamExt as _};
use std::collections::BTreeMap;
use std::pin;
use std::sync::atomic::AtomicU16;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::SendError;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup of `{1}` failed")]
    LookupHost(#[source] std::io::Error, String),
    #[error("could not connect to `{1}` over TCP")]
    Connect(#[source] std::io::Error, String),
    #[error("`{0}` did not resolve to any address")]
    NoAddresses(String),
    #[error("scheduling a request failed")]
    ScheduleRequest(#[source] SendError<modbus::Request>),
    #[error("could not read data from the stream")]
    Receive(#[source] std::io::Error),
    #[error("the modbus server closed the connection")]
    Disconnected,
    #[error("could not shut down the connection")]
    Shutdown(#[source] std::io::Error),
    #[error("could not send out the request")]
    Send(#[source] std::io::Error),
    #[error("sending the request timed out")]
    SendTimeout,
    #[error("no response to {0:?}")]
    Timeout(Operation),
    #[error("modbus server responded to {operation:?} with exception code {code}")]
    Exception { code: u8, operation: Operation },
    #[error("response to {operation:?} carried {got} registers")]
    ShortResponse { operation: Operation, got: usize },
    #[error("response to {0:?} does not match the request")]
    UnexpectedResponse(Operation),
}

/// Single-register access to the unit. This is the hub every entity talks through.
pub trait RegisterAccess: Send + Sync {
    /// Read `count` consecutive registers starting at `address`.
    fn read(
        &self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> BoxFuture<'_, Result<Vec<u16>, Error>>;

    /// Write a single holding register.
    fn write(&self, address: u16, value: u16) -> BoxFuture<'_, Result<(), Error>>;
}

enum Slot {
    Waiting,
    Done(Option<modbus::Response>),
}

/// Routes answers from the worker to the requests waiting for them. Only transaction ids with a
/// live waiter are tracked; anything else the worker reports is dropped.
#[derive(Default)]
pub struct ResponseTracker {
    responses: Mutex<BTreeMap<u16, Slot>>,
    change_notify: Notify,
}

impl ResponseTracker {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<u16, Slot>> {
        self.responses.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start waiting for `transaction_id`, replacing whatever an earlier use of the id left.
    /// The slot is released when the returned handle is dropped.
    pub fn expect(&self, transaction_id: u16) -> Pending<'_> {
        self.lock().insert(transaction_id, Slot::Waiting);
        Pending { tracker: self, transaction_id }
    }

    pub fn mark_timeout(&self, transaction_id: u16) {
        self.complete(transaction_id, None);
    }

    pub fn add_response(&self, response: modbus::Response) {
        self.complete(response.transaction_id, Some(response));
    }

    fn complete(&self, transaction_id: u16, outcome: Option<modbus::Response>) {
        let mut guard = self.lock();
        match guard.get_mut(&transaction_id) {
            Some(slot) => {
                *slot = Slot::Done(outcome);
                self.change_notify.notify_waiters();
            }
            None => trace!(message = "nobody waits for this transaction anymore", transaction_id),
        }
        drop(guard);
    }
}

/// A request in flight. See [`ResponseTracker::expect`].
pub struct Pending<'a> {
    tracker: &'a ResponseTracker,
    transaction_id: u16,
}

impl Pending<'_> {
    pub async fn wait(&self) -> Option<modbus::Response> {
        loop {
            // Register interest before looking, so a response landing in between is not missed.
            let mut notified = pin::pin!(self.tracker.change_notify.notified());
            notified.as_mut().enable();
            {
                let mut guard = self.tracker.lock();
                match guard.get(&self.transaction_id) {
                    Some(Slot::Waiting) => {}
                    Some(Slot::Done(_)) => match guard.remove(&self.transaction_id) {
                        Some(Slot::Done(outcome)) => return outcome,
                        _ => return None,
                    },
                    None => return None,
                }
            }
            notified.await;
        }
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        self.tracker.lock().remove(&self.transaction_id);
    }
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "connection::Args")]
pub struct Args {
    /// Connect to the Systemair unit over Modbus TCP (e.g. `192.168.1.20:502`).
    #[arg(long)]
    tcp: String,

    /// The modbus device (slave) ID.
    #[arg(long, short = 'i', default_value = "1")]
    device_id: u8,

    /// If the modbus response isn't received in this amount of time, consider the request failed.
    #[arg(long, default_value = "1s")]
    read_timeout: humantime::Duration,

    /// Reconnect, if the modbus request can't be sent in this amount of time.
    #[arg(long, default_value = "3s")]
    send_timeout: humantime::Duration,

    /// Reconnect to the modbus server after the specified number of reads timeout.
    #[arg(long, default_value = "3")]
    reconnect_after_timeouts: usize,

    /// The amount of time to wait between subsequent requests.
    ///
    /// Interacting too fast can make some Modbus TCP interfaces behave poorly.
    #[arg(long, default_value = "100ms")]
    request_delay: humantime::Duration,

    /// How many times a timed out or busy request is repeated before giving up.
    #[arg(long, default_value = "5")]
    retries: u32,

    /// The amount of additional time to wait after receiving a server busy exception.
    #[arg(long, default_value = "25ms")]
    server_busy_retry_delay: humantime::Duration,
}

impl Args {
    pub fn device_id(&self) -> u8 {
        self.device_id
    }
}

pub struct Connection {
    request_queue: tokio::sync::mpsc::UnboundedSender<modbus::Request>,
    #[allow(unused)] // exists for its drop handler
    worker: tokio_util::task::AbortOnDropHandle<Result<(), Error>>,
    response_tracker: Arc<ResponseTracker>,
    transaction_id_generator: AtomicU16,
    args: Args,
}

impl Connection {
    /// Start the connection worker. Must be called from within a tokio runtime.
    pub fn new(args: Args) -> Connection {
        let (request_queue, jobs) = tokio::sync::mpsc::unbounded_channel();
        let response_tracker = Arc::<ResponseTracker>::default();
        let worker = TcpWorker {
            reconnect_countdown: args.reconnect_after_timeouts,
            args: args.clone(),
            responses: Arc::clone(&response_tracker),
        }
        .spawn(jobs);
        Self {
            request_queue,
            worker: tokio_util::task::AbortOnDropHandle::new(worker),
            response_tracker,
            transaction_id_generator: AtomicU16::new(0),
            args,
        }
    }

    pub fn new_transaction_id(&self) -> u16 {
        self.transaction_id_generator.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    /// Send a single request. Returns `None` if the request timed out.
    pub async fn send(&self, operation: Operation) -> Result<Option<modbus::Response>, Error> {
        let transaction_id = self.new_transaction_id();
        let request = modbus::Request { device_id: self.args.device_id, transaction_id, operation };
        let pending = self.response_tracker.expect(transaction_id);
        self.request_queue.send(request).map_err(Error::ScheduleRequest)?;
        Ok(pending.wait().await)
    }

    /// [`Self::send`] but retries timeouts and `Server Busy` exceptions a bounded number of times.
    pub async fn send_retrying(&self, operation: Operation) -> Result<Response, Error> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let retries_left = attempt <= self.args.retries;
            match self.send(operation).await? {
                None if retries_left => {
                    debug!(?operation, attempt, "request timed out, retrying");
                }
                None => return Err(Error::Timeout(operation)),
                Some(response) if response.is_server_busy() && retries_left => {
                    trace!(?operation, attempt, "server busy, retrying");
                    tokio::time::sleep(*self.args.server_busy_retry_delay).await;
                }
                Some(response) => return Ok(response),
            }
        }
    }
}

impl RegisterAccess for Connection {
    fn read(
        &self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> BoxFuture<'_, Result<Vec<u16>, Error>> {
        Box::pin(async move {
            let operation = Operation::read(kind, address, count);
            let response = self.send_retrying(operation).await?;
            match response.kind {
                ResponseKind::Registers(mut values) if values.len() >= usize::from(count) => {
                    values.truncate(usize::from(count));
                    Ok(values)
                }
                ResponseKind::Registers(values) => {
                    Err(Error::ShortResponse { operation, got: values.len() })
                }
                ResponseKind::Exception(code) => Err(Error::Exception { code, operation }),
                ResponseKind::Written { .. } => Err(Error::UnexpectedResponse(operation)),
            }
        })
    }

    fn write(&self, address: u16, value: u16) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            let operation = Operation::WriteHolding { address, value };
            let response = self.send_retrying(operation).await?;
            match response.kind {
                ResponseKind::Written { address: a, .. } if a == address => Ok(()),
                ResponseKind::Exception(code) => Err(Error::Exception { code, operation }),
                ResponseKind::Written { .. } | ResponseKind::Registers(_) => {
                    Err(Error::UnexpectedResponse(operation))
                }
            }
        })
    }
}

type TcpIo = Framed<TcpStream, ModbusTcpCodec>;

enum Exchange {
    Response(Response),
    Timeout,
    Broken(Error),
}

struct TcpWorker {
    args: Args,
    responses: Arc<ResponseTracker>,
    reconnect_countdown: usize,
}

impl TcpWorker {
    fn spawn(
        self,
        jobs: UnboundedReceiver<modbus::Request>,
    ) -> tokio::task::JoinHandle<Result<(), Error>> {
        tokio::task::spawn(self.main_loop(jobs))
    }

    /// Serve requests one at a time. Every request taken off the queue is answered, either with a
    /// response or by being marked as timed out.
    async fn main_loop(mut self, mut jobs: UnboundedReceiver<modbus::Request>) -> Result<(), Error> {
        let mut io: Option<TcpIo> = None;
        let mut next_send = Instant::now();
        while let Some(request) = jobs.recv().await {
            tokio::time::sleep_until(next_send).await;
            let framed = match &mut io {
                Some(framed) => framed,
                None => match self.connect().await {
                    Ok(framed) => io.insert(framed),
                    Err(e) => {
                        warn!(
                            message = "could not connect, will retry",
                            error = (&e as &dyn std::error::Error)
                        );
                        self.responses.mark_timeout(request.transaction_id);
                        next_send = Instant::now() + *self.args.send_timeout;
                        continue;
                    }
                },
            };
            let outcome = self.exchange(framed, request).await;
            next_send = Instant::now() + *self.args.request_delay;
            match outcome {
                Exchange::Response(response) => {
                    self.reconnect_countdown = self.args.reconnect_after_timeouts;
                    self.responses.add_response(response);
                }
                Exchange::Timeout => {
                    debug!(
                        message = "a request timed out",
                        transaction_id = request.transaction_id,
                        reconnect_countdown = self.reconnect_countdown
                    );
                    self.responses.mark_timeout(request.transaction_id);
                    if let Some(new_count) = self.reconnect_countdown.checked_sub(1) {
                        self.reconnect_countdown = new_count;
                    } else {
                        warn!("too many requests timed out, will reconnect");
                        io = None;
                    }
                }
                Exchange::Broken(e) => {
                    warn!(
                        message = "connection failed, will reconnect",
                        error = (&e as &dyn std::error::Error)
                    );
                    self.responses.mark_timeout(request.transaction_id);
                    io = None;
                }
            }
        }
        if let Some(mut io) = io {
            io.close().await.map_err(Error::Shutdown)?;
        }
        Ok(())
    }

    async fn exchange(&self, io: &mut TcpIo, request: Request) -> Exchange {
        match tokio::time::timeout(*self.args.send_timeout, io.send(request)).await {
            Err(_) => return Exchange::Broken(Error::SendTimeout),
            Ok(Err(e)) => return Exchange::Broken(Error::Send(e)),
            Ok(Ok(())) => {}
        }
        let deadline = Instant::now() + *self.args.read_timeout;
        loop {
            match tokio::time::timeout_at(deadline, io.next()).await {
                Err(_) => return Exchange::Timeout,
                Ok(None) => return Exchange::Broken(Error::Disconnected),
                Ok(Some(Err(e))) => return Exchange::Broken(Error::Receive(e)),
                Ok(Some(Ok(response))) if response.transaction_id == request.transaction_id => {
                    trace!(message = "decoded a response", transaction = response.transaction_id);
                    return Exchange::Response(response);
                }
                Ok(Some(Ok(response))) => {
                    // Most likely a late answer to a request that has already timed out.
                    debug!(
                        message = "a response we were not expecting",
                        transaction = response.transaction_id
                    );
                }
            }
        }
    }

    async fn connect(&mut self) -> Result<TcpIo, Error> {
        let address = &self.args.tcp;
        info!(message = "connecting...", address);
        let addresses = tokio::net::lookup_host(address)
            .await
            .map_err(|e| Error::LookupHost(e, address.to_string()))?
            .collect::<Vec<_>>();
        debug!(message = "resolved", ?addresses);
        if addresses.is_empty() {
            return Err(Error::NoAddresses(address.to_string()));
        }
        let socket = TcpStream::connect(&*addresses)
            .await
            .map_err(|e| Error::Connect(e, address.to_string()))?;
        let nodelay_result = socket.set_nodelay(true);
        trace!(message = "setting nodelay", is_error = ?nodelay_result.err());
        info!(message = "connected");
        self.reconnect_countdown = self.args.reconnect_after_timeouts;
        Ok(Framed::new(socket, ModbusTcpCodec::default()))
    }
}
