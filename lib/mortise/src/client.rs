//! Single-connection counterpart of the server. The extra `connecting`
//! state covers non-blocking TCP connect: the socket is watched for write
//! readiness, and only once the connect resolves is the connection built
//! and the codec's opening chunk sent.

use crate::buffer::PROTOCOL_BUFFER_SIZE;
use crate::codec::Protocol;
use crate::config::ClientConfig;
use crate::connection::{Connection, Incoming, Routed};
use crate::shared::{NetError, NetResult, Payload, RecvError};
use mio;
use mio::net::TcpStream;
use std::io;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tenon::logging;
use tenon::logging::Logger;

const CLIENT_TOKEN: mio::Token = mio::Token(0);

enum ClientState<P: Protocol> {
    Idle,
    Connecting { stream: Option<TcpStream>, args: P::Args },
    Live(Connection<P>),
}

pub struct Client<P: Protocol, M: Payload> {
    poll: mio::Poll,
    events: mio::Events,
    state: ClientState<P>,

    // Armed from connect() until the handshake resolves either way.
    handshake_since: Option<Instant>,

    log: Logger,
    _message: PhantomData<M>,
}

impl<P: Protocol, M: Payload> Client<P, M> {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        config: &ClientConfig,
        log: L,
    ) -> io::Result<Client<P, M>> {
        Ok(Client {
            poll: mio::Poll::new()?,
            events: mio::Events::with_capacity(config.max_events),
            state: ClientState::Idle,
            handshake_since: None,
            log: logging::child(log),
            _message: PhantomData,
        })
    }

    /// Starts a non-blocking connect. The handshake begins once the socket
    /// reports write readiness.
    pub fn connect(&mut self, address: SocketAddr, args: P::Args) -> NetResult<()> {
        match self.state {
            ClientState::Idle => {}
            _ => return Err(NetError::AlreadyConnected),
        }

        let stream = TcpStream::connect(&address)?;

        self.poll.register(
            &stream,
            CLIENT_TOKEN,
            mio::Ready::writable(),
            mio::PollOpt::edge(),
        )?;

        logging::debug!(self.log, "connecting"; "context" => "connect", "peer" => %address);

        self.state = ClientState::Connecting {
            stream: Some(stream),
            args,
        };
        self.handshake_since = Some(Instant::now());

        Ok(())
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        match &self.state {
            ClientState::Live(connection) => connection.is_open(),
            _ => false,
        }
    }

    /// Serializes and transmits one message. Requires an open channel.
    pub fn send(&mut self, message: &M) -> NetResult<()> {
        let connection = match &mut self.state {
            ClientState::Live(connection) => connection,
            _ => return Err(NetError::NotConnected),
        };

        let mut scratch = [0u8; PROTOCOL_BUFFER_SIZE];
        let body = &mut scratch[..M::SIZE];
        message.serialize(body);

        match connection.send(body) {
            Err(NetError::Closed) => {
                self.state = ClientState::Idle;
                self.handshake_since = None;
                Err(NetError::Closed)
            }
            other => other,
        }
    }

    /// Runs one readiness cycle, dispatching single-connection events.
    pub fn poll<FO, FM, FC>(
        &mut self,
        mut on_open: FO,
        mut on_message: FM,
        mut on_close: FC,
        wait: Option<Duration>,
        handshake_timeout: Duration,
    ) -> NetResult<()>
    where
        FO: FnMut(P::Output),
        FM: FnMut(M),
        FC: FnMut(),
    {
        self.poll.poll(&mut self.events, wait)?;

        let mut readable = false;
        let mut writable = false;

        for event in self.events.iter() {
            if event.token() == CLIENT_TOKEN {
                readable |= event.readiness().is_readable();
                writable |= event.readiness().is_writable();
            }
        }

        if writable {
            self.finish_connect(&mut on_open)?;
        }

        if readable {
            self.dispatch(&mut on_open, &mut on_message, &mut on_close);
        }

        self.sweep_timeout(handshake_timeout);

        Ok(())
    }

    /// Closes whatever the client currently holds.
    pub fn close(&mut self) {
        if let ClientState::Live(connection) = &mut self.state {
            connection.close();
        }

        self.state = ClientState::Idle;
        self.handshake_since = None;
    }

    fn finish_connect<FO: FnMut(P::Output)>(&mut self, on_open: &mut FO) -> NetResult<()> {
        let (stream, args) = match &mut self.state {
            ClientState::Connecting { stream, args } => match stream.take() {
                Some(stream) => (stream, args.clone()),
                None => return Ok(()),
            },
            _ => return Ok(()),
        };

        if let Some(error) = stream.take_error()? {
            logging::warn!(self.log, "connect failed"; "context" => "connect", "error" => ?error);
            self.state = ClientState::Idle;
            self.handshake_since = None;
            return Err(error.into());
        }

        self.poll.reregister(
            &stream,
            CLIENT_TOKEN,
            mio::Ready::readable(),
            mio::PollOpt::level(),
        )?;

        match Connection::connect(stream, &args, M::SIZE, &self.log) {
            Ok(connection) => {
                if connection.is_open() {
                    self.handshake_since = None;
                    on_open(connection.output());
                }

                self.state = ClientState::Live(connection);
                Ok(())
            }
            Err(error) => {
                self.state = ClientState::Idle;
                self.handshake_since = None;
                Err(error)
            }
        }
    }

    fn dispatch<FO, FM, FC>(&mut self, on_open: &mut FO, on_message: &mut FM, on_close: &mut FC)
    where
        FO: FnMut(P::Output),
        FM: FnMut(M),
        FC: FnMut(),
    {
        let routed = {
            let connection = match &mut self.state {
                ClientState::Live(connection) => connection,
                _ => return,
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
                self.handshake_since = None;
                on_open(output);
            }
            Routed::Message(message) => on_message(message),
            Routed::BadMessage(error) => {
                logging::warn!(self.log, "message discarded"; "context" => "dispatch", "error" => ?error);
            }
            Routed::CloseNotify => {
                self.state = ClientState::Idle;
                on_close();
            }
            Routed::Discard => {
                self.state = ClientState::Idle;
                self.handshake_since = None;
            }
        }
    }

    fn sweep_timeout(&mut self, timeout: Duration) {
        let since = match self.handshake_since {
            Some(since) => since,
            None => return,
        };

        if Instant::now().duration_since(since) < timeout {
            return;
        }

        logging::debug!(self.log, "handshake timed out"; "context" => "sweep");

        self.handshake_since = None;

        match &mut self.state {
            ClientState::Live(connection) => connection.close(),
            _ => {}
        }

        self.state = ClientState::Idle;
    }
}
