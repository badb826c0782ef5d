//! The multi-connection acceptor. One readiness descriptor multiplexes the
//! listening socket and every connection; a fixed pool bounds admission and
//! a fixed timer table bounds how long a peer may dawdle in its handshake.
//! Everything runs on the caller's thread, one `poll` at a time.

use crate::buffer::PROTOCOL_BUFFER_SIZE;
use crate::codec::Protocol;
use crate::config::ServerConfig;
use crate::connection::{Connection, Incoming, Routed};
use crate::pool::{Handle, Pool};
use crate::shared::{NetError, NetResult, Payload, RecvError};
use mio;
use mio::net::TcpListener;
use socket2::{Domain, Socket, Type};
use std::io;
use std::marker::PhantomData;
use std::mem;
use std::net;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tenon::logging;
use tenon::logging::Logger;

/// Readiness token reserved for the listening socket, distinct from every
/// connection handle. `Token(usize::MAX)` itself belongs to the poller's
/// internal awakener.
pub const LISTENER_TOKEN: mio::Token = mio::Token(::std::usize::MAX - 1);

#[derive(Debug, Copy, Clone)]
struct HandshakeTimer {
    handle: Handle,
    since: Instant,
}

struct Listener<P: Protocol> {
    socket: TcpListener,
    args: P::Args,
}

pub struct Server<P: Protocol, M: Payload> {
    poll: mio::Poll,
    events: mio::Events,
    ready: Vec<mio::Token>,

    listener: Option<Listener<P>>,

    timers: Box<[Option<HandshakeTimer>]>,
    connections: Pool<Connection<P>>,

    // Opens produced by connect() completing synchronously; no readiness
    // event will ever fire for them.
    pending_open: Vec<(Handle, P::Output)>,

    log: Logger,
    _message: PhantomData<M>,
}

impl<P: Protocol, M: Payload> Server<P, M> {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        config: &ServerConfig,
        log: L,
    ) -> io::Result<Server<P, M>> {
        let log = logging::child(log);

        let mut timers = Vec::with_capacity(config.max_active_handshakes);
        for _ in 0..config.max_active_handshakes {
            timers.push(None);
        }

        Ok(Server {
            poll: mio::Poll::new()?,
            events: mio::Events::with_capacity(config.max_events),
            ready: Vec::with_capacity(config.max_events),
            listener: None,
            timers: timers.into_boxed_slice(),
            connections: Pool::new(config.max_connections),
            pending_open: Vec::new(),
            log,
            _message: PhantomData,
        })
    }

    /// Binds `0.0.0.0:<port>` with `SO_REUSEADDR` and the supplied backlog
    /// and starts watching for incoming connections.
    pub fn listen(&mut self, port: u16, backlog: i32, args: P::Args) -> NetResult<()> {
        if self.listener.is_some() {
            return Err(NetError::AlreadyListening);
        }

        let address: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(socket2::Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&address.into())?;
        socket.listen(backlog)?;

        let listener: net::TcpListener = socket.into();
        listener.set_nonblocking(true)?;

        let socket = TcpListener::from_std(listener)?;

        self.poll.register(
            &socket,
            LISTENER_TOKEN,
            mio::Ready::readable(),
            mio::PollOpt::level(),
        )?;

        logging::info!(self.log, "listening"; "context" => "listen", "port" => port);

        self.listener = Some(Listener { socket, args });

        Ok(())
    }

    /// Address the listener actually bound, for callers that asked for an
    /// ephemeral port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .as_ref()
            .and_then(|listener| listener.socket.local_addr().ok())
    }

    #[inline]
    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    #[inline]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Dials out and admits the new connection into the pool as an
    /// initiator. No handshake timer is armed for outbound connections.
    pub fn connect(&mut self, address: SocketAddr, args: &P::Args) -> NetResult<Handle> {
        let stream = net::TcpStream::connect(address)?;
        stream.set_nonblocking(true)?;
        let stream = mio::net::TcpStream::from_stream(stream)?;

        let connection = Connection::connect(stream, args, M::SIZE, &self.log)?;

        self.insert(connection)
    }

    /// Serializes and transmits one message on an open connection.
    pub fn send(&mut self, handle: Handle, message: &M) -> NetResult<()> {
        let connection = match self.connections.get_mut(handle) {
            Some(connection) => connection,
            None => return Err(NetError::InvalidHandle),
        };

        let mut scratch = [0u8; PROTOCOL_BUFFER_SIZE];
        let body = &mut scratch[..M::SIZE];
        message.serialize(body);

        match connection.send(body) {
            Err(NetError::Closed) => {
                // The failed send already closed the socket; reap the slot.
                self.clear_timer(handle);
                self.connections.destroy(handle);
                Err(NetError::Closed)
            }
            other => other,
        }
    }

    /// Runs one readiness cycle: waits up to `wait`, accepts and receives,
    /// dispatches typed events to the callbacks, then reaps handshakes
    /// older than `handshake_timeout`.
    ///
    /// `on_close` fires exactly once when an open connection ends; failed
    /// or timed-out handshakes are reaped without a callback.
    pub fn poll<FO, FM, FC>(
        &mut self,
        mut on_open: FO,
        mut on_message: FM,
        mut on_close: FC,
        wait: Option<Duration>,
        handshake_timeout: Duration,
    ) -> NetResult<()>
    where
        FO: FnMut(Handle, P::Output),
        FM: FnMut(Handle, M),
        FC: FnMut(Handle),
    {
        for (handle, output) in mem::replace(&mut self.pending_open, Vec::new()) {
            if self.connections.get(handle).is_some() {
                on_open(handle, output);
            }
        }

        self.poll.poll(&mut self.events, wait)?;

        let mut ready = mem::replace(&mut self.ready, Vec::new());
        ready.clear();
        ready.extend(self.events.iter().map(|event| event.token()));

        for &token in &ready {
            if token == LISTENER_TOKEN {
                self.accept_incoming();
            } else {
                self.dispatch(token.0 as Handle, &mut on_open, &mut on_message, &mut on_close);
            }
        }

        self.ready = ready;

        self.sweep_timers(handshake_timeout);

        Ok(())
    }

    /// Closes every live connection, clears the timer table and stops
    /// listening.
    pub fn halt(&mut self) {
        let handles: Vec<Handle> = self.connections.iter().map(|(handle, _)| handle).collect();

        for handle in handles {
            if let Some(connection) = self.connections.get_mut(handle) {
                connection.close();
            }
            self.connections.destroy(handle);
        }

        for slot in self.timers.iter_mut() {
            *slot = None;
        }

        self.pending_open.clear();
        self.listener = None;

        logging::info!(self.log, "halted"; "context" => "halt");
    }

    fn insert(&mut self, connection: Connection<P>) -> NetResult<Handle> {
        let opened = connection.is_open();

        let handle = match self.connections.create(connection) {
            Ok(handle) => handle,
            Err(_) => return Err(NetError::OutOfSpace),
        };

        let registered = {
            let connection = self
                .connections
                .get(handle)
                .expect("Freshly created connection must exist");
            connection.register(&self.poll, mio::Token(handle as usize))
        };

        if let Err(error) = registered {
            self.connections.destroy(handle);
            return Err(error.into());
        }

        if opened {
            let output = self
                .connections
                .get(handle)
                .expect("Freshly created connection must exist")
                .output();
            self.pending_open.push((handle, output));
        }

        Ok(handle)
    }

    /// Admits one pending socket. Level triggering redelivers the listener
    /// event while more are queued.
    fn accept_incoming(&mut self) {
        let (stream, address) = {
            let listener = match &self.listener {
                Some(listener) => listener,
                None => return,
            };

            match listener.socket.accept() {
                Ok(pair) => pair,
                Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => return,
                Err(error) => {
                    logging::warn!(self.log, "accept failed"; "context" => "accept", "error" => ?error);
                    return;
                }
            }
        };

        let slot = match self.timers.iter().position(|slot| slot.is_none()) {
            Some(slot) => slot,
            None => {
                // Dropping the stream rejects the peer without touching the
                // connections already negotiating.
                logging::warn!(self.log, "handshake queue full, rejecting";
                               "context" => "accept",
                               "peer" => %address);
                return;
            }
        };

        let args = self
            .listener
            .as_ref()
            .expect("Listener must outlive the accept")
            .args
            .clone();

        let connection = Connection::accept(stream, &args, M::SIZE, &self.log);

        match self.insert(connection) {
            Ok(handle) => {
                let negotiating = self
                    .connections
                    .get(handle)
                    .map(|connection| connection.is_init())
                    .unwrap_or(false);

                if negotiating {
                    self.timers[slot] = Some(HandshakeTimer {
                        handle,
                        since: Instant::now(),
                    });
                }

                logging::debug!(self.log, "connection admitted";
                                "context" => "accept",
                                "handle" => handle,
                                "peer" => %address);
            }
            Err(error) => {
                logging::warn!(self.log, "connection rejected";
                               "context" => "accept",
                               "peer" => %address,
                               "error" => ?error);
            }
        }
    }

    fn dispatch<FO, FM, FC>(
        &mut self,
        handle: Handle,
        on_open: &mut FO,
        on_message: &mut FM,
        on_close: &mut FC,
    ) where
        FO: FnMut(Handle, P::Output),
        FM: FnMut(Handle, M),
        FC: FnMut(Handle),
    {
        let routed = {
            let connection = match self.connections.get_mut(handle) {
                Some(connection) => connection,
                // A stale event for a handle destroyed earlier in this poll.
                None => return,
            };

            let was_open = connection.is_open();

            match connection.recv() {
                Ok(Incoming::Pending) => Routed::Skip,
                Ok(Incoming::Open(output)) => Routed::Opened(output),
                Ok(Incoming::Payload(body)) => match M::deserialize(body) {
                    Ok(message) => Routed::Message(message),
                    Err(error) => Routed::BadMessage(error),
                },
                Err(RecvError::Frame(_)) => Routed::CloseNotify,
                Err(RecvError::Closed) => {
                    if was_open {
                        Routed::CloseNotify
                    } else {
                        Routed::Discard
                    }
                }
                Err(RecvError::Handshake(_)) => Routed::Discard,
            }
        };

        match routed {
            Routed::Skip => {}
            Routed::Opened(output) => {
                self.clear_timer(handle);
                on_open(handle, output);
            }
            Routed::Message(message) => on_message(handle, message),
            Routed::BadMessage(error) => {
                logging::warn!(self.log, "message discarded";
                               "context" => "dispatch",
                               "handle" => handle,
                               "error" => ?error);
            }
            Routed::CloseNotify => {
                self.connections.destroy(handle);
                on_close(handle);
            }
            Routed::Discard => {
                self.clear_timer(handle);
                self.connections.destroy(handle);
            }
        }
    }

    fn clear_timer(&mut self, handle: Handle) {
        for slot in self.timers.iter_mut() {
            match slot {
                Some(timer) if timer.handle == handle => {
                    *slot = None;
                    return;
                }
                _ => {}
            }
        }
    }

    fn sweep_timers(&mut self, timeout: Duration) {
        let now = Instant::now();

        for index in 0..self.timers.len() {
            let expired = match self.timers[index] {
                Some(timer) => now.duration_since(timer.since) >= timeout,
                None => false,
            };

            if !expired {
                continue;
            }

            if let Some(timer) = self.timers[index].take() {
                if let Some(connection) = self.connections.get_mut(timer.handle) {
                    connection.close();
                }
                self.connections.destroy(timer.handle);

                logging::debug!(self.log, "handshake timed out";
                                "context" => "sweep",
                                "handle" => timer.handle);
            }
        }
    }
}
