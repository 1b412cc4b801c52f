//! Reference I/O adapters.
//!
//! The core never touches sockets; these adapters implement the sealed
//! surfaces ([`ServerLink`], [`DatagramLink`], [`StreamLink`],
//! [`TapDevice`]) on top of tokio and deliver completions into the reactor
//! inbox. Peer links here carry frames in the clear with a `u16` length
//! prefix on TCP; the SPProto cipher suite belongs to a hardened transport
//! behind the same traits and the key/seed calls are accepted and ignored.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::node::{Ev, LinkFactory};
use crate::reactor::{Inbox, SourceId};
use crate::server::ServerLink;
use crate::transport::{DatagramLink, DeviceEvent, LinkEvent, StreamLink, TapDevice};
use crate::types::PeerId;

/// Receive buffer for stream reads.
const READ_CHUNK: usize = 16 * 1024;

/// Largest peer frame accepted on a TCP link.
const MAX_TCP_FRAME: usize = 65535;

// =============================================================================
// SERVER LINK
// =============================================================================

pub struct TokioServerLink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ServerLink for TokioServerLink {
    fn send_packet(&mut self, packet: Vec<u8>) {
        // A dropped pump surfaces as a ServerError event; nothing to do here.
        let _ = self.tx.send(packet);
    }
}

fn load_identity(config: &Config) -> anyhow::Result<native_tls::Identity> {
    let path = config.identity.as_ref().expect("checked by config validation");
    let der = std::fs::read(path)?;
    Ok(native_tls::Identity::from_pkcs12(&der, &config.identity_password)?)
}

/// Connect to the rendezvous server (TLS when configured) and start the
/// read/write pump. Completions and failures arrive as `ServerData`,
/// `ServerWriteDone` and `ServerError` events.
pub fn connect_server(
    handle: &Handle,
    config: &Config,
    inbox: Inbox<Ev>,
    source: SourceId,
) -> anyhow::Result<TokioServerLink> {
    let addr = config.server_addr;
    let (tx, rx) = mpsc::unbounded_channel();

    let tls = if config.ssl {
        let identity = load_identity(config)?;
        Some(native_tls::TlsConnector::builder().identity(identity).build()?)
    } else {
        None
    };
    let server_name = config
        .server_name
        .clone()
        .unwrap_or_else(|| addr.ip().to_string());

    let pump_inbox = inbox.clone();
    handle.spawn(async move {
        let result = async {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            match tls {
                Some(connector) => {
                    let connector = tokio_native_tls::TlsConnector::from(connector);
                    let stream = connector
                        .connect(&server_name, stream)
                        .await
                        .map_err(std::io::Error::other)?;
                    server_pump(stream, rx, &pump_inbox, source).await
                }
                None => server_pump(stream, rx, &pump_inbox, source).await,
            }
        }
        .await;
        if let Err(e) = result {
            warn!("server link: {}", e);
            pump_inbox.send(source, Ev::ServerError);
        }
    });

    Ok(TokioServerLink { tx })
}

async fn server_pump<S>(
    stream: S,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    inbox: &Inbox<Ev>,
    source: SourceId,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    return Err(std::io::ErrorKind::UnexpectedEof.into());
                }
                inbox.send(source, Ev::ServerData(buf[..n].to_vec()));
            }
            packet = rx.recv() => {
                match packet {
                    Some(packet) => {
                        writer.write_all(&packet).await?;
                        writer.flush().await?;
                        inbox.send(source, Ev::ServerWriteDone);
                    }
                    // Link dropped by the node; shut down quietly.
                    None => return Ok(()),
                }
            }
        }
    }
}

// =============================================================================
// UDP PEER LINK
// =============================================================================

struct UdpLink {
    handle: Handle,
    inbox: Inbox<Ev>,
    source: SourceId,
    peer: PeerId,
    socket: Option<Arc<UdpSocket>>,
    remote: Arc<Mutex<Option<SocketAddr>>>,
    reader: Option<JoinHandle<()>>,
}

impl UdpLink {
    fn install_socket(&mut self, std_socket: std::net::UdpSocket) -> std::io::Result<()> {
        std_socket.set_nonblocking(true)?;
        let socket = {
            let _guard = self.handle.enter();
            Arc::new(UdpSocket::from_std(std_socket)?)
        };
        self.socket = Some(socket.clone());

        let inbox = self.inbox.clone();
        let source = self.source;
        let peer = self.peer;
        let remote = self.remote.clone();
        self.reader = Some(self.handle.spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, from)) => {
                        // The bound side learns its remote from the first
                        // datagram.
                        let mut slot = remote.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(from);
                        }
                        drop(slot);
                        inbox.send(source, Ev::Link(peer, LinkEvent::Frame(buf[..n].to_vec())));
                    }
                    Err(e) => {
                        debug!("udp link: {}", e);
                        inbox.send(source, Ev::Link(peer, LinkEvent::Error));
                        return;
                    }
                }
            }
        }));
        Ok(())
    }
}

impl DatagramLink for UdpLink {
    fn bind(&mut self, addr: SocketAddr) -> bool {
        match std::net::UdpSocket::bind(addr) {
            Ok(socket) => self.install_socket(socket).is_ok(),
            Err(_) => false,
        }
    }

    fn connect(&mut self, addr: SocketAddr) -> bool {
        if self.socket.is_none() {
            let wildcard: SocketAddr = if addr.is_ipv4() {
                "0.0.0.0:0".parse().unwrap()
            } else {
                "[::]:0".parse().unwrap()
            };
            match std::net::UdpSocket::bind(wildcard) {
                Ok(socket) => {
                    if self.install_socket(socket).is_err() {
                        return false;
                    }
                }
                Err(_) => return false,
            }
        }
        *self.remote.lock().unwrap() = Some(addr);
        true
    }

    fn set_encryption_key(&mut self, _key: &[u8]) {
        debug!("udp link: encryption key installed (plaintext adapter)");
    }

    fn set_otp_send_seed(&mut self, seed_id: u16, _key: &[u8], _iv: &[u8]) {
        debug!("udp link: send seed {} staged (plaintext adapter)", seed_id);
    }

    fn activate_otp_send_seed(&mut self) {}

    fn add_otp_recv_seed(&mut self, seed_id: u16, _key: &[u8], _iv: &[u8]) {
        // Nothing to provision; report the seed usable right away.
        self.inbox.send(self.source, Ev::Link(self.peer, LinkEvent::SeedReady(seed_id)));
    }

    fn send_frame(&mut self, frame: &[u8]) {
        let Some(socket) = self.socket.as_ref() else { return };
        let Some(remote) = *self.remote.lock().unwrap() else { return };
        // Datagrams are lossy by contract; a full send buffer drops.
        let _ = socket.try_send_to(frame, remote);
    }
}

impl Drop for UdpLink {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

// =============================================================================
// TCP PEER LINK WITH PASSWORD LISTENER
// =============================================================================

type AcceptMap = Arc<Mutex<HashMap<u64, mpsc::Sender<TcpStream>>>>;

/// Shared state of the password-gated listeners: a connection is handed to
/// whichever link reserved the password it presents.
#[derive(Clone, Default)]
pub struct PasswordAcceptors {
    map: AcceptMap,
}

impl PasswordAcceptors {
    /// Accept loop for one bind address.
    pub fn start_listener(&self, handle: &Handle, addr: SocketAddr) -> anyhow::Result<()> {
        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let map = self.map.clone();
        let listener = {
            let _guard = handle.enter();
            TcpListener::from_std(std_listener)?
        };
        info!("listening for peers on {}", addr);
        handle.spawn(async move {
            loop {
                let Ok((mut stream, from)) = listener.accept().await else { return };
                let map = map.clone();
                tokio::spawn(async move {
                    let mut password = [0u8; 8];
                    if stream.read_exact(&mut password).await.is_err() {
                        return;
                    }
                    let password = u64::from_le_bytes(password);
                    let slot = map.lock().unwrap().remove(&password);
                    match slot {
                        Some(tx) => {
                            let _ = tx.send(stream).await;
                        }
                        None => debug!("connection from {} with unknown password", from),
                    }
                });
            }
        });
        Ok(())
    }

    fn reserve(&self, password: u64, tx: mpsc::Sender<TcpStream>) {
        self.map.lock().unwrap().insert(password, tx);
    }
}

struct TcpLink {
    handle: Handle,
    inbox: Inbox<Ev>,
    source: SourceId,
    peer: PeerId,
    acceptors: PasswordAcceptors,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    pump: Option<JoinHandle<()>>,
}

impl StreamLink for TcpLink {
    fn listen(&mut self, _bind_index: usize) -> Option<u64> {
        let rx = self.rx.take()?;
        let password = rand::thread_rng().next_u64();
        let (stream_tx, mut stream_rx) = mpsc::channel(1);
        self.acceptors.reserve(password, stream_tx);

        let inbox = self.inbox.clone();
        let source = self.source;
        let peer = self.peer;
        self.pump = Some(self.handle.spawn(async move {
            let Some(stream) = stream_rx.recv().await else { return };
            if let Err(e) = peer_stream_pump(stream, rx, &inbox, source, peer).await {
                debug!("tcp link: {}", e);
                inbox.send(source, Ev::Link(peer, LinkEvent::Error));
            }
        }));
        Some(password)
    }

    fn connect(&mut self, addr: SocketAddr, password: u64) -> bool {
        let Some(rx) = self.rx.take() else { return false };
        let inbox = self.inbox.clone();
        let source = self.source;
        let peer = self.peer;
        self.pump = Some(self.handle.spawn(async move {
            let result = async {
                let mut stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                stream.write_all(&password.to_le_bytes()).await?;
                peer_stream_pump(stream, rx, &inbox, source, peer).await
            }
            .await;
            if let Err(e) = result {
                debug!("tcp link: {}", e);
                inbox.send(source, Ev::Link(peer, LinkEvent::Error));
            }
        }));
        true
    }

    fn send_frame(&mut self, frame: &[u8]) {
        debug_assert!(frame.len() <= MAX_TCP_FRAME);
        let mut wire = Vec::with_capacity(2 + frame.len());
        wire.extend_from_slice(&(frame.len() as u16).to_le_bytes());
        wire.extend_from_slice(frame);
        let _ = self.tx.send(wire);
    }
}

impl Drop for TcpLink {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Length-prefixed frame exchange on an established peer stream.
async fn peer_stream_pump<S>(
    stream: S,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    inbox: &Inbox<Ev>,
    source: SourceId,
    peer: PeerId,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    return Err(std::io::ErrorKind::UnexpectedEof.into());
                }
                pending.extend_from_slice(&buf[..n]);
                loop {
                    if pending.len() < 2 {
                        break;
                    }
                    let len = u16::from_le_bytes([pending[0], pending[1]]) as usize;
                    if pending.len() < 2 + len {
                        break;
                    }
                    let frame = pending[2..2 + len].to_vec();
                    pending.drain(..2 + len);
                    inbox.send(source, Ev::Link(peer, LinkEvent::Frame(frame)));
                }
            }
            wire = rx.recv() => {
                match wire {
                    Some(wire) => {
                        writer.write_all(&wire).await?;
                        writer.flush().await?;
                    }
                    None => return Ok(()),
                }
            }
        }
    }
}

// =============================================================================
// LINK FACTORY
// =============================================================================

pub struct NetFactory {
    handle: Handle,
    acceptors: PasswordAcceptors,
}

impl NetFactory {
    pub fn new(handle: Handle, acceptors: PasswordAcceptors) -> Self {
        Self { handle, acceptors }
    }
}

impl LinkFactory for NetFactory {
    fn datagram(
        &mut self,
        peer: PeerId,
        source: SourceId,
        inbox: Inbox<Ev>,
    ) -> Box<dyn DatagramLink> {
        Box::new(UdpLink {
            handle: self.handle.clone(),
            inbox,
            source,
            peer,
            socket: None,
            remote: Arc::new(Mutex::new(None)),
            reader: None,
        })
    }

    fn stream(&mut self, peer: PeerId, source: SourceId, inbox: Inbox<Ev>) -> Box<dyn StreamLink> {
        let (tx, rx) = mpsc::unbounded_channel();
        Box::new(TcpLink {
            handle: self.handle.clone(),
            inbox,
            source,
            peer,
            acceptors: self.acceptors.clone(),
            tx,
            rx: Some(rx),
            pump: None,
        })
    }
}

// =============================================================================
// TAP DEVICE (Linux)
// =============================================================================

#[cfg(target_os = "linux")]
mod tap {
    use std::io::{Read, Write};

    use super::*;

    const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
    const IFF_TAP: i16 = 0x0002;
    const IFF_NO_PI: i16 = 0x1000;

    #[repr(C)]
    struct IfReq {
        name: [u8; libc::IFNAMSIZ],
        flags: i16,
        pad: [u8; 22],
    }

    pub struct LinuxTap {
        file: std::fs::File,
        mtu: usize,
    }

    impl TapDevice for LinuxTap {
        fn mtu(&self) -> usize {
            self.mtu
        }

        fn write_frame(&mut self, frame: &[u8]) {
            if let Err(e) = self.file.write_all(frame) {
                warn!("tap write: {}", e);
            }
        }
    }

    /// Open the tap device and start a reader thread feeding the inbox.
    pub fn open_tap(
        name: &str,
        mtu: usize,
        inbox: Inbox<Ev>,
        source: SourceId,
    ) -> anyhow::Result<LinuxTap> {
        use std::os::fd::AsRawFd;

        let file = std::fs::OpenOptions::new().read(true).write(true).open("/dev/net/tun")?;
        let mut req = IfReq { name: [0; libc::IFNAMSIZ], flags: IFF_TAP | IFF_NO_PI, pad: [0; 22] };
        let name_bytes = name.as_bytes();
        anyhow::ensure!(name_bytes.len() < libc::IFNAMSIZ, "tap device name too long");
        req.name[..name_bytes.len()].copy_from_slice(name_bytes);

        let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &req) };
        anyhow::ensure!(rc >= 0, "TUNSETIFF failed: {}", std::io::Error::last_os_error());
        info!("opened tap device {}", name);

        let mut read_half = file.try_clone()?;
        std::thread::Builder::new().name("tap-reader".into()).spawn(move || {
            let mut buf = vec![0u8; mtu + 64];
            loop {
                match read_half.read(&mut buf) {
                    Ok(n) if n > 0 => {
                        inbox.send(source, Ev::Device(DeviceEvent::Frame(buf[..n].to_vec())));
                    }
                    _ => {
                        inbox.send(source, Ev::Device(DeviceEvent::Error));
                        return;
                    }
                }
            }
        })?;

        Ok(LinuxTap { file, mtu })
    }
}

#[cfg(target_os = "linux")]
pub use tap::{LinuxTap, open_tap};
