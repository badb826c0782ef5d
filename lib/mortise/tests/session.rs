//! End-to-end sessions over loopback TCP: real sockets, a polling server,
//! and either the bundled client or a scripted raw peer on a thread.

use mortise::codec::ae::DATA_HEADER_SIZE;
use mortise::{
    Ae, Client, ClientConfig, Coded, Handle, NetError, Payload, PayloadError, Protocol, Server,
    ServerConfig, Websockify,
};
use std::io::{Read, Write};
use std::net;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;
use tenon::crypto::SignKeyPair;

const CODE: [u8; 16] = [
    0x0f, 0x00, 0x0d, 0xbe, 0xef, 0x0f, 0x00, 0x0d, 0xbe, 0xef, 0x0f, 0x00, 0x0d, 0xbe, 0xef,
    0x0f,
];

const WAIT: Option<Duration> = Some(Duration::from_millis(5));
const TIMEOUT: Duration = Duration::from_secs(5);
const MAX_POLLS: usize = 1000;

/// Fixed 32-byte chat line: one length byte plus up to 31 bytes of text.
#[derive(Debug, Clone, Eq, PartialEq)]
struct Note {
    len: u8,
    bytes: [u8; 31],
}

impl Note {
    fn new(text: &str) -> Note {
        assert!(text.len() <= 31);

        let mut bytes = [0u8; 31];
        bytes[..text.len()].copy_from_slice(text.as_bytes());

        Note {
            len: text.len() as u8,
            bytes,
        }
    }

    fn text(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap()
    }
}

impl Payload for Note {
    const SIZE: usize = 32;

    fn serialize(&self, stream: &mut [u8]) {
        stream[0] = self.len;
        stream[1..32].copy_from_slice(&self.bytes);
    }

    fn deserialize(stream: &[u8]) -> Result<Note, PayloadError> {
        let len = stream[0];

        if len > 31 {
            return Err(PayloadError::UnexpectedData);
        }

        let mut bytes = [0u8; 31];
        bytes.copy_from_slice(&stream[1..32]);

        Ok(Note { len, bytes })
    }
}

fn server_config(max_active_handshakes: usize) -> ServerConfig {
    ServerConfig {
        max_active_handshakes,
        ..ServerConfig::default()
    }
}

fn listen<P: Protocol>(server: &mut Server<P, Note>, args: P::Args) -> SocketAddr {
    server.listen(0, 16, args).unwrap();
    server.local_addr().unwrap()
}

fn loopback(address: SocketAddr) -> SocketAddr {
    SocketAddr::new("127.0.0.1".parse().unwrap(), address.port())
}

fn mask_payload(mask: [u8; 4], payload: &mut [u8]) {
    for (index, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[index % 4];
    }
}

fn write_masked_frame(stream: &mut net::TcpStream, payload: &[u8]) {
    assert!(payload.len() <= 125);

    let mask = [0x21, 0x43, 0x65, 0x87];
    let mut frame = vec![0x82, 0x80 | payload.len() as u8];
    frame.extend_from_slice(&mask);
    frame.extend_from_slice(payload);
    mask_payload(mask, &mut frame[6..]);

    stream.write_all(&frame).unwrap();
}

fn read_unmasked_frame(stream: &mut net::TcpStream, payload_len: usize) -> Vec<u8> {
    assert!(payload_len <= 125);

    let mut head = [0u8; 2];
    stream.read_exact(&mut head).unwrap();
    assert_eq!(head[0], 0x82);
    assert_eq!(head[1] as usize, payload_len);

    let mut payload = vec![0u8; payload_len];
    stream.read_exact(&mut payload).unwrap();
    payload
}

#[test]
fn coded_echo_roundtrip() {
    let mut server: Server<Coded, Note> = Server::new(&server_config(32), None).unwrap();
    let address = loopback(listen(&mut server, CODE));

    let mut client: Client<Coded, Note> = Client::new(&ClientConfig::default(), None).unwrap();
    client.connect(address, CODE).unwrap();

    let mut server_handle: Option<Handle> = None;
    let mut client_open = false;
    let mut echoed: Option<Note> = None;
    let mut sent = false;

    for _ in 0..MAX_POLLS {
        let mut inbound: Vec<(Handle, Note)> = Vec::new();

        server
            .poll(
                |handle, ()| server_handle = Some(handle),
                |handle, message| inbound.push((handle, message)),
                |_| panic!("Server connection should stay open"),
                WAIT,
                TIMEOUT,
            )
            .unwrap();

        // Echo everything back on the same handle.
        for (handle, message) in &inbound {
            assert_eq!(message.text(), "Hello from the client!");
            server.send(*handle, message).unwrap();
        }

        client
            .poll(
                |()| client_open = true,
                |message| echoed = Some(message),
                || panic!("Client connection should stay open"),
                WAIT,
                TIMEOUT,
            )
            .unwrap();

        if client_open && !sent {
            client.send(&Note::new("Hello from the client!")).unwrap();
            sent = true;
        }

        if echoed.is_some() {
            break;
        }
    }

    assert!(server_handle.is_some());
    assert_eq!(echoed.unwrap().text(), "Hello from the client!");
}

#[test]
fn ae_mutual_authentication() {
    let server_identity = SignKeyPair::generate();
    let client_identity = SignKeyPair::generate();

    let mut server: Server<Ae, Note> = Server::new(&server_config(32), None).unwrap();
    let address = loopback(listen(&mut server, server_identity.clone()));

    let mut client: Client<Ae, Note> = Client::new(&ClientConfig::default(), None).unwrap();
    client.connect(address, client_identity.clone()).unwrap();

    let mut seen_by_server: Option<[u8; 32]> = None;
    let mut seen_by_client: Option<[u8; 32]> = None;

    for _ in 0..MAX_POLLS {
        server
            .poll(
                |_, output| seen_by_server = Some(output),
                |_, _| {},
                |_| {},
                WAIT,
                TIMEOUT,
            )
            .unwrap();

        client
            .poll(|output| seen_by_client = Some(output), |_| {}, || {}, WAIT, TIMEOUT)
            .unwrap();

        if seen_by_server.is_some() && seen_by_client.is_some() {
            break;
        }
    }

    assert_eq!(seen_by_server, Some(client_identity.public));
    assert_eq!(seen_by_client, Some(server_identity.public));
}

/// Drives an initiating codec over a blocking socket until it opens.
fn manual_connect<P: Protocol>(stream: &mut net::TcpStream, args: &P::Args) -> P {
    let mut out = [0u8; 1024];
    let (mut codec, event) = P::connect(args, &mut out);

    stream.write_all(&out[..event.out_len]).unwrap();

    let mut next_len = event.next_len;
    while next_len > 0 {
        let mut chunk = vec![0u8; next_len];
        stream.read_exact(&mut chunk).unwrap();

        let mut out = [0u8; 1024];
        let event = codec
            .handshake(&mut out, &mut chunk)
            .unwrap()
            .expect("Exact chunks always produce an event");

        if event.out_len > 0 {
            stream.write_all(&out[..event.out_len]).unwrap();
        }

        next_len = event.next_len;
    }

    codec
}

#[test]
fn ae_corrupted_frame_closes_connection() {
    let server_identity = SignKeyPair::generate();
    let client_identity = SignKeyPair::generate();

    let mut server: Server<Ae, Note> = Server::new(&server_config(32), None).unwrap();
    let address = loopback(listen(&mut server, server_identity.clone()));

    let expected_server_key = server_identity.public;
    let expected_client_key = client_identity.public;
    let peer = thread::spawn(move || {
        let mut stream = net::TcpStream::connect(address).unwrap();

        let mut codec = manual_connect::<Ae>(&mut stream, &client_identity);
        assert_eq!(codec.output(), expected_server_key);

        // One honest frame would be fine; this one has a flipped bit in the
        // ciphertext.
        let mut header = [0u8; DATA_HEADER_SIZE];
        let mut body = [0u8; Note::SIZE];
        Note::new("tampered in transit").serialize(&mut body);

        codec.encode(&mut header, &mut body);
        body[3] ^= 0x10;

        stream.write_all(&header).unwrap();
        stream.write_all(&body).unwrap();
    });

    let mut opened: Option<[u8; 32]> = None;
    let mut closes = 0;
    let mut messages = 0;

    for _ in 0..MAX_POLLS {
        server
            .poll(
                |_, output| opened = Some(output),
                |_, _| messages += 1,
                |_| closes += 1,
                WAIT,
                TIMEOUT,
            )
            .unwrap();

        if closes > 0 {
            break;
        }
    }

    peer.join().unwrap();

    assert_eq!(opened, Some(expected_client_key));
    assert_eq!(messages, 0);
    assert_eq!(closes, 1);
    assert_eq!(server.connection_count(), 0);
}

#[test]
fn websockified_coded_session() {
    let mut server: Server<Websockify<Coded>, Note> =
        Server::new(&server_config(32), None).unwrap();
    let address = loopback(listen(&mut server, CODE));

    let peer = thread::spawn(move || {
        let mut stream = net::TcpStream::connect(address).unwrap();

        stream
            .write_all(
                b"GET /game HTTP/1.1\r\n\
Host: example.com\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Sec-WebSocket-Version: 13\r\n\
\r\n",
            )
            .unwrap();

        // Read the upgrade response through the closing blank line.
        let mut response = Vec::new();
        let mut byte = [0u8; 1];
        while !response.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).unwrap();
            response.push(byte[0]);
        }

        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

        // The shared code rides in one masked binary frame; the reply is one
        // unmasked frame holding the same code.
        write_masked_frame(&mut stream, &CODE);
        assert_eq!(read_unmasked_frame(&mut stream, CODE.len()), &CODE);

        // Message traffic is one websocket frame per message.
        let mut body = [0u8; Note::SIZE];
        Note::new("browser says hi").serialize(&mut body);
        write_masked_frame(&mut stream, &body);

        let reply = read_unmasked_frame(&mut stream, Note::SIZE);
        let reply = Note::deserialize(&reply).unwrap();
        assert_eq!(reply.text(), "echo: browser says hi");
    });

    let mut opened: Option<Handle> = None;
    let mut done = false;

    for _ in 0..MAX_POLLS {
        let mut inbound: Vec<(Handle, Note)> = Vec::new();

        server
            .poll(
                |handle, ()| opened = Some(handle),
                |handle, message| inbound.push((handle, message)),
                |_| {},
                WAIT,
                TIMEOUT,
            )
            .unwrap();

        for (handle, message) in &inbound {
            let reply = Note::new(&format!("echo: {}", message.text()));
            server.send(*handle, &reply).unwrap();
            done = true;
        }

        if done {
            break;
        }
    }

    peer.join().unwrap();
    assert!(opened.is_some());
}

#[test]
fn handshake_timeout_reaps_silent_peer() {
    let mut server: Server<Coded, Note> = Server::new(&server_config(32), None).unwrap();
    let address = loopback(listen(&mut server, CODE));

    // Connect and never send a byte.
    let silent = net::TcpStream::connect(address).unwrap();

    let timeout = Duration::from_millis(200);
    let mut closes = 0;
    let mut admitted = false;

    for _ in 0..200 {
        server
            .poll(|_, _| {}, |_, _| {}, |_| closes += 1, WAIT, timeout)
            .unwrap();

        if server.connection_count() == 1 {
            admitted = true;
        }

        if admitted && server.connection_count() == 0 {
            break;
        }
    }

    assert!(admitted, "The silent peer was never admitted");
    assert_eq!(server.connection_count(), 0);
    // Timeouts reap without a close callback.
    assert_eq!(closes, 0);

    // The reaped socket is gone; the peer sees EOF.
    silent.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut silent = silent;
    let mut buffer = [0u8; 1];
    assert_eq!(silent.read(&mut buffer).unwrap(), 0);

    // Later polls run fine with the dead handle gone.
    server.poll(|_, _| {}, |_, _| {}, |_| {}, WAIT, timeout).unwrap();
}

#[test]
fn admission_overflow_rejects_third_handshake() {
    let mut server: Server<Coded, Note> = Server::new(&server_config(2), None).unwrap();
    let address = loopback(listen(&mut server, CODE));

    let first = net::TcpStream::connect(address).unwrap();
    let second = net::TcpStream::connect(address).unwrap();
    let third = net::TcpStream::connect(address).unwrap();

    // Drain the accept queue; only two handshake slots exist.
    for _ in 0..50 {
        server.poll(|_, _| {}, |_, _| {}, |_| {}, WAIT, TIMEOUT).unwrap();

        if server.connection_count() == 2 {
            break;
        }
    }
    assert_eq!(server.connection_count(), 2);

    // Keep polling until the queued third connect has been pulled off the
    // listener and rejected.
    for _ in 0..10 {
        server.poll(|_, _| {}, |_, _| {}, |_| {}, WAIT, TIMEOUT).unwrap();
    }
    assert_eq!(server.connection_count(), 2);

    // The rejected socket reads EOF without disturbing the others.
    third.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut third = third;
    let mut buffer = [0u8; 1];
    assert_eq!(third.read(&mut buffer).unwrap(), 0);

    // Both admitted peers still complete their handshakes.
    let exchange = |stream: net::TcpStream| {
        thread::spawn(move || {
            let mut stream = stream;
            stream.write_all(&CODE).unwrap();

            let mut reply = [0u8; 16];
            stream.read_exact(&mut reply).unwrap();
            assert_eq!(reply, CODE);
        })
    };

    let first = exchange(first);
    let second = exchange(second);

    let mut opens = 0;
    for _ in 0..MAX_POLLS {
        server.poll(|_, _| opens += 1, |_, _| {}, |_| {}, WAIT, TIMEOUT).unwrap();

        if opens == 2 {
            break;
        }
    }

    first.join().unwrap();
    second.join().unwrap();
    assert_eq!(opens, 2);
}

#[test]
fn admission_errors() {
    let mut server: Server<Coded, Note> = Server::new(&server_config(32), None).unwrap();

    listen(&mut server, CODE);
    assert_eq!(server.listen(0, 16, CODE), Err(NetError::AlreadyListening));

    assert_eq!(
        server.send(7, &Note::new("nobody home")),
        Err(NetError::InvalidHandle)
    );

    server.halt();
    assert!(!server.is_listening());
    assert_eq!(server.connection_count(), 0);
}
