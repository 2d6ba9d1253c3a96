//! Worker-side push operations and data listeners.
//!
//! A worker owns two things: the applied configuration entries for the
//! professions it serves, and the data listeners on its assigned ports.
//! Both converge toward what the master pushes. `check` calls validate
//! without touching state so the master can abort a bad change before
//! any worker commits it; the committing calls re-run the same
//! validation rather than trusting that nothing moved in between.
//!
//! Data listeners bind with `SO_REUSEPORT`: during a succession the
//! predecessor's and successor's workers are briefly alive on the same
//! ports, and the kernel splits new connections between them until the
//! old generation drains.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::PoisonError;

use bytes::Bytes;
use prost::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use gatehouse_core::profession::{CheckResult, Profession, ProfessionRegistry};
use gatehouse_core::push::{
    DeleteRequest, DeleteResponse, HelloRequest, HelloResponse, MessageKind, PushError,
    RefreshRequest, RefreshResponse, SetRequest, SetResponse,
};

struct AppliedEntry {
    profession: String,
    name: String,
}

struct DataListener {
    stop: watch::Sender<bool>,
}

/// One worker's state: professions, applied entries, data listeners.
pub struct WorkerService {
    id: u32,
    professions: ProfessionRegistry,
    bind_host: IpAddr,
    entries: tokio::sync::Mutex<HashMap<String, AppliedEntry>>,
    listeners: std::sync::Mutex<HashMap<u16, DataListener>>,
}

impl WorkerService {
    /// Builds the service with the professions this worker owns.
    #[must_use]
    pub fn new(id: u32, professions: &[Profession], bind_host: IpAddr) -> Self {
        Self {
            id,
            professions: ProfessionRegistry::from_seeds(professions),
            bind_host,
            entries: tokio::sync::Mutex::new(HashMap::new()),
            listeners: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Executes one decoded push request and encodes its response.
    pub async fn dispatch(&self, kind: MessageKind, payload: Bytes) -> Result<Bytes, PushError> {
        match kind {
            MessageKind::Ping => {
                let request = HelloRequest::decode(payload)?;
                debug!(worker = self.id, hello = %request.hello, "ping");
                Ok(encode(&HelloResponse::echo(&request, self.owned_ports())))
            },
            MessageKind::SetCheck => {
                let request = SetRequest::decode(payload)?;
                Ok(encode(&self.set_check(request).await))
            },
            MessageKind::Set => {
                let request = SetRequest::decode(payload)?;
                Ok(encode(&self.set(request).await))
            },
            MessageKind::DeleteCheck => {
                let request = DeleteRequest::decode(payload)?;
                Ok(encode(&self.delete_check(request).await))
            },
            MessageKind::Delete => {
                let request = DeleteRequest::decode(payload)?;
                Ok(encode(&self.delete(request).await))
            },
            MessageKind::Refresh => {
                let request = RefreshRequest::decode(payload)?;
                Ok(encode(&self.refresh(request).await))
            },
        }
    }

    async fn set_check(&self, request: SetRequest) -> SetResponse {
        let entries = self.entries.lock().await;
        match self.validate_set(&request, &entries) {
            Some(response) => response,
            None => SetResponse::success(self.owned_ports()),
        }
    }

    async fn set(&self, request: SetRequest) -> SetResponse {
        let mut entries = self.entries.lock().await;
        if let Some(response) = self.validate_set(&request, &entries) {
            return response;
        }
        let replaced = entries
            .insert(
                request.id.clone(),
                AppliedEntry {
                    profession: request.profession.clone(),
                    name: request.name.clone(),
                },
            )
            .is_some();
        info!(
            worker = self.id,
            id = %request.id,
            profession = %request.profession,
            driver = %request.driver,
            replaced,
            "entry applied"
        );
        SetResponse::success(self.owned_ports())
    }

    /// Validation shared by `set_check` and `set`. Returns the refusal
    /// to send back, or `None` when the request is applicable.
    fn validate_set(
        &self,
        request: &SetRequest,
        entries: &HashMap<String, AppliedEntry>,
    ) -> Option<SetResponse> {
        if request.id.is_empty()
            || request.profession.is_empty()
            || request.name.is_empty()
            || request.driver.is_empty()
        {
            return Some(SetResponse::fail(
                "id, profession, name and driver must all be set",
            ));
        }
        match self
            .professions
            .check(&request.profession, &request.driver, &request.body)
        {
            CheckResult::Accepted => {},
            CheckResult::Unowned(reason) => return Some(SetResponse::skill(reason)),
            CheckResult::Rejected(reason) => return Some(SetResponse::fail(reason)),
        }
        if let Some((owner, _)) = entries.iter().find(|(id, entry)| {
            entry.profession == request.profession && entry.name == request.name && **id != request.id
        }) {
            return Some(SetResponse::fail(format!(
                "entry {}/{} is already owned by {owner}",
                request.profession, request.name
            )));
        }
        None
    }

    async fn delete_check(&self, request: DeleteRequest) -> DeleteResponse {
        if request.id.is_empty() {
            return DeleteResponse::fail("id must be set");
        }
        let entries = self.entries.lock().await;
        if entries.contains_key(&request.id) {
            DeleteResponse::success(self.owned_ports())
        } else {
            DeleteResponse::fail(format!("no entry {}", request.id))
        }
    }

    async fn delete(&self, request: DeleteRequest) -> DeleteResponse {
        let mut entries = self.entries.lock().await;
        match entries.remove(&request.id) {
            Some(entry) => {
                info!(
                    worker = self.id,
                    id = %request.id,
                    profession = %entry.profession,
                    name = %entry.name,
                    "entry removed"
                );
                DeleteResponse::success(self.owned_ports())
            },
            None => DeleteResponse::fail(format!("no entry {}", request.id)),
        }
    }

    async fn refresh(&self, request: RefreshRequest) -> RefreshResponse {
        let mut desired = Vec::with_capacity(request.ports.len());
        for port in request.ports {
            match u16::try_from(port) {
                Ok(port) if port != 0 => desired.push(port),
                _ => return RefreshResponse::fail(format!("port {port} is out of range")),
            }
        }
        desired.sort_unstable();
        desired.dedup();
        match self.apply_ports(&desired).await {
            Ok(()) => RefreshResponse::success(),
            Err(err) => RefreshResponse::fail(err.to_string()),
        }
    }

    /// Converges the data listener set to exactly `desired`. Missing
    /// ports are opened before extras are closed, so the worker never
    /// serves fewer ports than both sets agree on.
    pub async fn apply_ports(&self, desired: &[u16]) -> std::io::Result<()> {
        let current: HashSet<u16> = self.lock_listeners().keys().copied().collect();

        for &port in desired.iter().filter(|port| !current.contains(port)) {
            let listener = bind_reuseport(SocketAddr::new(self.bind_host, port))?;
            let (stop_tx, stop_rx) = watch::channel(false);
            tokio::spawn(serve_data(self.id, listener, stop_rx));
            self.lock_listeners()
                .insert(port, DataListener { stop: stop_tx });
            info!(worker = self.id, port, "data listener open");
        }

        let extras: Vec<u16> = current
            .into_iter()
            .filter(|port| !desired.contains(port))
            .collect();
        for port in extras {
            if let Some(listener) = self.lock_listeners().remove(&port) {
                let _ = listener.stop.send(true);
                info!(worker = self.id, port, "data listener closed");
            }
        }
        Ok(())
    }

    /// Ports with a live data listener, sorted.
    #[must_use]
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.lock_listeners().keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Stops accepting on every data listener. Established connections
    /// finish on their own tasks.
    pub fn close(&self) {
        for (port, listener) in self.lock_listeners().drain() {
            let _ = listener.stop.send(true);
            debug!(worker = self.id, port, "data listener closed");
        }
    }

    fn owned_ports(&self) -> Vec<u32> {
        self.ports().into_iter().map(u32::from).collect()
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, HashMap<u16, DataListener>> {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn encode<M: Message>(message: &M) -> Bytes {
    Bytes::from(message.encode_to_vec())
}

/// Binds a listener that tolerates another process generation holding
/// the same port.
fn bind_reuseport(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    socket.listen(1024)
}

async fn serve_data(id: u32, listener: TcpListener, mut stop: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(answer_placeholder(id, stream));
                    },
                    Err(err) => {
                        warn!(worker = id, error = %err, "data accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    },
                }
            },
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            },
        }
    }
}

/// Fixed data plane answer. Drivers configure what the worker owns;
/// the traffic they will eventually terminate is out of scope here, so
/// every connection gets a plain identification response.
async fn answer_placeholder(id: u32, mut stream: TcpStream) {
    let mut buf = [0u8; 1024];
    let _ = stream.read(&mut buf).await;
    let body = format!("gatehouse worker {id}\n");
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}
