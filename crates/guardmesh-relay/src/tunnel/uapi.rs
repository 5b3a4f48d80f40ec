//! Userspace WireGuard over the cross-platform UAPI.
//!
//! The userspace implementation (`wireguard-go` by default) is spawned in
//! the foreground and exposes a unix socket at `<uapi_dir>/<iface>.sock`.
//! Requests are `set=1` or `get=1` followed by `key=value` lines and a blank
//! line; replies end with `errno=N` and a blank line. Keys are hex on the
//! wire.
//!
//! A socket left behind by a killed process is removed before spawning, and
//! readiness means the socket accepts a connection. Closing sends SIGTERM so
//! the implementation can unlink its socket, and kills it after
//! [`STOP_TIMEOUT`].

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use guardmesh_crypto::WgKey;
use ipnet::IpNet;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::device::{DeviceConfig, DeviceProvider, DeviceState, PeerConfig, TunnelDevice};
use super::error::TunnelError;

/// How long to wait for a freshly spawned device to open its socket.
pub const SPAWN_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a device gets to exit after SIGTERM before it is killed.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(3);
const SOCKET_POLL: Duration = Duration::from_millis(50);

/// Render a configuration update as a `set=1` request.
pub fn encode_set(config: &DeviceConfig) -> String {
    let mut out = String::from("set=1\n");
    if let Some(key) = &config.private_key {
        let _ = writeln!(out, "private_key={}", key.to_hex());
    }
    if let Some(port) = config.listen_port {
        let _ = writeln!(out, "listen_port={port}");
    }
    if let Some(mark) = config.fwmark {
        let _ = writeln!(out, "fwmark={mark}");
    }
    if config.replace_peers {
        out.push_str("replace_peers=true\n");
    }
    for peer in &config.peers {
        let _ = writeln!(out, "public_key={}", peer.public_key.to_hex());
        if let Some(psk) = &peer.preshared_key {
            let _ = writeln!(out, "preshared_key={}", psk.to_hex());
        }
        if let Some(endpoint) = peer.endpoint {
            let _ = writeln!(out, "endpoint={endpoint}");
        }
        if let Some(keepalive) = peer.persistent_keepalive {
            let _ = writeln!(out, "persistent_keepalive_interval={}", keepalive.as_secs());
        }
        if peer.replace_allowed_ips {
            out.push_str("replace_allowed_ips=true\n");
        }
        for net in &peer.allowed_ips {
            let _ = writeln!(out, "allowed_ip={net}");
        }
    }
    out.push('\n');
    out
}

fn bad_reply(key: &str, value: &str) -> TunnelError {
    TunnelError::Device(format!("malformed UAPI reply line '{key}={value}'"))
}

fn parse_key(key: &str, value: &str) -> Result<WgKey, TunnelError> {
    WgKey::from_hex(value).map_err(|_| bad_reply(key, value))
}

/// Fail on a non-zero `errno=` line.
fn check_errno(key: &str, value: &str) -> Result<(), TunnelError> {
    match value.parse::<i64>() {
        Ok(0) => Ok(()),
        Ok(code) => Err(TunnelError::Device(format!("UAPI request failed: errno={code}"))),
        Err(_) => Err(bad_reply(key, value)),
    }
}

/// Parse the reply to a `get=1` request.
pub fn parse_get(reply: &str) -> Result<DeviceState, TunnelError> {
    let mut state = DeviceState::default();
    let mut saw_errno = false;

    for line in reply.lines() {
        if line.is_empty() {
            break;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(TunnelError::Device(format!("malformed UAPI reply line '{line}'")));
        };
        match key {
            "errno" => {
                check_errno(key, value)?;
                saw_errno = true;
            }
            "private_key" => state.private_key = Some(parse_key(key, value)?),
            "listen_port" => state.listen_port = value.parse().map_err(|_| bad_reply(key, value))?,
            "fwmark" => state.fwmark = value.parse().map_err(|_| bad_reply(key, value))?,
            "public_key" => state.peers.push(PeerConfig {
                public_key: parse_key(key, value)?,
                preshared_key: None,
                endpoint: None,
                allowed_ips: Vec::new(),
                persistent_keepalive: None,
                replace_allowed_ips: false,
            }),
            _ => {
                let Some(peer) = state.peers.last_mut() else {
                    continue;
                };
                match key {
                    "preshared_key" => {
                        let psk = parse_key(key, value)?;
                        peer.preshared_key = (psk.as_bytes() != &[0u8; 32]).then_some(psk);
                    }
                    "endpoint" => {
                        peer.endpoint =
                            Some(value.parse::<SocketAddr>().map_err(|_| bad_reply(key, value))?);
                    }
                    "allowed_ip" => peer
                        .allowed_ips
                        .push(value.parse::<IpNet>().map_err(|_| bad_reply(key, value))?),
                    "persistent_keepalive_interval" => {
                        let secs: u64 = value.parse().map_err(|_| bad_reply(key, value))?;
                        peer.persistent_keepalive = (secs > 0).then(|| Duration::from_secs(secs));
                    }
                    // Counters and handshake timestamps.
                    _ => {}
                }
            }
        }
    }

    if saw_errno {
        Ok(state)
    } else {
        Err(TunnelError::Device("UAPI reply is missing errno".to_string()))
    }
}

/// Parse the reply to a `set=1` request.
pub fn parse_set_reply(reply: &str) -> Result<(), TunnelError> {
    for line in reply.lines() {
        if let Some(("errno", value)) = line.split_once('=') {
            return check_errno("errno", value);
        }
    }
    Err(TunnelError::Device("UAPI reply is missing errno".to_string()))
}

/// A device driven through its UAPI socket.
pub struct UapiDevice {
    name: String,
    socket: PathBuf,
    child: Mutex<Option<Child>>,
}

impl UapiDevice {
    /// Attach to a device whose socket already exists.
    pub fn connect(name: impl Into<String>, socket: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            socket: socket.into(),
            child: Mutex::new(None),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket
    }

    async fn request(&self, body: &str) -> Result<String, TunnelError> {
        let stream = UnixStream::connect(&self.socket).await.map_err(|e| {
            TunnelError::Device(format!("connect {}: {e}", self.socket.display()))
        })?;
        let (reader, mut writer) = stream.into_split();

        writer.write_all(body.as_bytes()).await?;
        writer.flush().await?;

        let mut reader = BufReader::new(reader);
        let mut reply = String::new();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                break;
            }
            if line == "\n" {
                break;
            }
            reply.push_str(&line);
        }
        Ok(reply)
    }
}

#[async_trait]
impl TunnelDevice for UapiDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure(&self, config: &DeviceConfig) -> Result<(), TunnelError> {
        debug!(iface = %self.name, peers = config.peers.len(), "UAPI set");
        let reply = self.request(&encode_set(config)).await?;
        parse_set_reply(&reply)
    }

    async fn state(&self) -> Result<DeviceState, TunnelError> {
        let reply = self.request("get=1\n\n").await?;
        parse_get(&reply)
    }

    async fn close(&self) -> Result<(), TunnelError> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        stop_child(&self.name, &mut child).await?;
        remove_socket(&self.socket).await?;
        info!(iface = %self.name, "Userspace tunnel stopped");
        Ok(())
    }
}

/// SIGTERM, then SIGKILL if the process outlives [`STOP_TIMEOUT`].
async fn stop_child(name: &str, child: &mut Child) -> Result<(), TunnelError> {
    if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            warn!(iface = name, pid, error = %e, "SIGTERM failed");
        }
    }
    match tokio::time::timeout(STOP_TIMEOUT, child.wait()).await {
        Ok(status) => {
            let status = status?;
            debug!(iface = name, %status, "Userspace tunnel exited");
        }
        Err(_) => {
            warn!(
                iface = name,
                stop_secs = STOP_TIMEOUT.as_secs(),
                "Userspace tunnel ignored SIGTERM, killing"
            );
            child.kill().await?;
        }
    }
    Ok(())
}

async fn remove_socket(socket: &Path) -> Result<(), TunnelError> {
    match tokio::fs::remove_file(socket).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(TunnelError::Device(format!(
            "cannot remove {}: {e}",
            socket.display()
        ))),
    }
}

/// Clear a socket file nobody is listening on. A live socket means another
/// instance already owns the interface.
async fn clear_stale_socket(name: &str, socket: &Path) -> Result<(), TunnelError> {
    if !tokio::fs::try_exists(socket).await.unwrap_or(false) {
        return Ok(());
    }
    if UnixStream::connect(socket).await.is_ok() {
        return Err(TunnelError::Device(format!(
            "interface {name} is already served on {}",
            socket.display()
        )));
    }
    warn!(iface = name, socket = %socket.display(), "Removing stale UAPI socket");
    remove_socket(socket).await
}

/// Spawns a userspace WireGuard implementation per interface.
#[derive(Debug, Clone)]
pub struct UapiProvider {
    binary: PathBuf,
    uapi_dir: PathBuf,
    spawn_timeout: Duration,
}

impl UapiProvider {
    pub fn new(binary: impl Into<PathBuf>, uapi_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            uapi_dir: uapi_dir.into(),
            spawn_timeout: SPAWN_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_spawn_timeout(mut self, timeout: Duration) -> Self {
        self.spawn_timeout = timeout;
        self
    }

    pub fn socket_path(&self, name: &str) -> PathBuf {
        self.uapi_dir.join(format!("{name}.sock"))
    }
}

#[async_trait]
impl DeviceProvider for UapiProvider {
    async fn create(&self, name: &str) -> Result<Box<dyn TunnelDevice>, TunnelError> {
        let socket = self.socket_path(name);
        clear_stale_socket(name, &socket).await?;

        let mut child = Command::new(&self.binary)
            .arg("-f")
            .arg(name)
            // Older wireguard-go builds refuse to start on Linux without it.
            .env("WG_I_PREFER_BUGGY_USERSPACE_TO_POLISHED_KMOD", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TunnelError::Device(format!("failed to spawn {}: {e}", self.binary.display()))
            })?;

        let waited = tokio::time::timeout(self.spawn_timeout, async {
            loop {
                if let Some(status) = child.try_wait()? {
                    return Err(TunnelError::Device(format!(
                        "{} exited during startup: {status}",
                        self.binary.display()
                    )));
                }
                if UnixStream::connect(&socket).await.is_ok() {
                    return Ok(());
                }
                tokio::time::sleep(SOCKET_POLL).await;
            }
        })
        .await;

        match waited {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!(iface = name, socket = %socket.display(), "UAPI socket never became ready");
                let _ = child.kill().await;
                return Err(TunnelError::Timeout {
                    op: "create_interface",
                    deadline: self.spawn_timeout,
                });
            }
        }

        info!(iface = name, binary = %self.binary.display(), "Userspace tunnel started");
        Ok(Box::new(UapiDevice {
            name: name.to_string(),
            socket,
            child: Mutex::new(Some(child)),
        }))
    }
}
