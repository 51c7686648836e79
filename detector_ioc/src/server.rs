/*!
Poll loop and text access protocol.

One request per UDP datagram:

```text
GET <pv>                    -> OK <pv> <value> <severity>
GET <pv> <offset> <count>   -> OK <pv> <elements> <severity>
PUT <pv> <value>            -> OK <pv> <value> <severity>
MONITOR <pv>                -> OK <pv> <value> <severity>, then UPDATE datagrams
CLEAR <pv>                  -> OK <pv> <value> <severity>
```

Failures are answered with `ERR <reason>`. Every poll interval the table
is flushed and updates for monitored names are sent to their clients.

A full frame does not fit in one datagram. Clients read `ArrayData` in
slices with the ranged `GET`, using `ArraySize_RBV` for the total and
monitoring `ArrayCounter_RBV` to learn when a new frame is available.
Writes run on the blocking pool since they may touch the filesystem.
*/

use crossbeam_channel::Receiver;
use shared::{Severity, SharedError, Update, Value};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{CommandDispatcher, WriteError};
use crate::shutdown::ShutdownListener;

/// Largest UDP payload over IPv4
pub const MAX_DATAGRAM: usize = 65_507;

/// Socket receive buffer requested from the OS
const RECV_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("{0} is not a known process variable")]
    UnknownPv(String),

    #[error("{0}")]
    Write(#[from] WriteError),

    #[error("cannot encode {name}: {source}")]
    Encode { name: String, source: SharedError },

    #[error("value of {0} does not fit in a datagram")]
    TooLarge(String),

    #[error("{0} is not an array")]
    NotAnArray(String),

    #[error("offset {offset} is past the {len} elements of {name}")]
    OutOfRange { name: String, offset: usize, len: usize },

    #[error("write task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request<'a> {
    Get(&'a str),
    /// Up to `count` array elements starting at `offset`
    GetRange { pv: &'a str, offset: usize, count: usize },
    Put(&'a str, &'a str),
    Monitor(&'a str),
    Clear(&'a str),
}

impl<'a> Request<'a> {
    pub fn parse(text: &'a str) -> Result<Self, RequestError> {
        let text = text.trim_end_matches(['\r', '\n']);
        let (verb, rest) = text.split_once(' ').unwrap_or((text, ""));

        let single = |rest: &'a str| -> Result<&'a str, RequestError> {
            let pv = rest.trim();
            if pv.is_empty() || pv.contains(char::is_whitespace) {
                return Err(RequestError::Malformed(format!("{} takes one name", verb)));
            }
            Ok(pv)
        };

        let index = |text: &str| {
            text.parse::<usize>()
                .map_err(|_| RequestError::Malformed(format!("{} is not an element index", text)))
        };

        match verb.to_ascii_uppercase().as_str() {
            "GET" => match rest.split_whitespace().collect::<Vec<_>>()[..] {
                [pv, offset, count] => Ok(Request::GetRange {
                    pv,
                    offset: index(offset)?,
                    count: index(count)?,
                }),
                _ => Ok(Request::Get(single(rest)?)),
            },
            "MONITOR" => Ok(Request::Monitor(single(rest)?)),
            "CLEAR" => Ok(Request::Clear(single(rest)?)),
            "PUT" => {
                // The value is everything after the name, spaces included
                let (pv, value) = rest
                    .split_once(' ')
                    .ok_or_else(|| RequestError::Malformed("PUT takes a name and a value".into()))?;
                if pv.is_empty() {
                    return Err(RequestError::Malformed("PUT takes a name and a value".into()));
                }
                Ok(Request::Put(pv, value))
            }
            "" => Err(RequestError::Malformed("empty request".into())),
            other => Err(RequestError::Malformed(format!("unknown command {}", other))),
        }
    }
}

/// Serves the value table to remote clients
pub struct PollServer {
    dispatcher: Arc<CommandDispatcher>,
    prefix: String,
    poll_interval: Duration,
    updates: Receiver<Update>,
    monitors: HashMap<&'static str, HashSet<SocketAddr>>,
}

impl PollServer {
    pub fn new(dispatcher: Arc<CommandDispatcher>, prefix: impl Into<String>, poll_interval: Duration) -> Self {
        let updates = dispatcher.table().subscribe();
        Self {
            dispatcher,
            prefix: prefix.into(),
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            updates,
            monitors: HashMap::new(),
        }
    }

    /// Bind the UDP socket and serve until shutdown
    pub async fn run(self, bind_addr: &str, port: u16, shutdown: ShutdownListener) -> anyhow::Result<()> {
        let socket_addr = format!("{}:{}", bind_addr, port);
        info!("🔌 Binding UDP socket to {}", socket_addr);
        let socket = UdpSocket::bind(&socket_addr).await?;

        let sock_ref = socket2::SockRef::from(&socket);
        sock_ref.set_recv_buffer_size(RECV_BUFFER_SIZE)?;
        info!("✅ Serving {} process variables on {}", self.dispatcher.table().names().len(), socket.local_addr()?);

        self.serve(socket, shutdown).await
    }

    /// Serve requests on an already bound socket until shutdown
    pub async fn serve(mut self, socket: UdpSocket, mut shutdown: ShutdownListener) -> anyhow::Result<()> {
        let mut buffer = vec![0u8; MAX_DATAGRAM];
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut requests = 0u64;

        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    info!("Poll loop stopping after {} requests", requests);
                    break;
                }
                received = socket.recv_from(&mut buffer) => match received {
                    Ok((len, peer)) => {
                        requests += 1;
                        let reply = match std::str::from_utf8(&buffer[..len]) {
                            Ok(text) => self.handle_datagram(text, peer).await,
                            Err(_) => format!("ERR {}", RequestError::Malformed("request is not UTF-8".into())),
                        };
                        if let Err(e) = socket.send_to(reply.as_bytes(), peer).await {
                            warn!("Failed to reply to {}: {}", peer, e);
                        }
                    }
                    Err(e) => error!("UDP receive error: {}", e),
                },
                _ = ticker.tick() => self.publish(&socket).await,
            }
        }

        // Last chance for monitors to see the final state
        self.publish(&socket).await;
        Ok(())
    }

    /// Handle one request and build the reply text
    pub async fn handle_datagram(&mut self, text: &str, peer: SocketAddr) -> String {
        let reply = match Request::parse(text) {
            Ok(request) => self.respond(request, peer).await,
            Err(e) => Err(e),
        };
        match reply {
            Ok(reply) => reply,
            Err(e) => {
                debug!("Request from {} failed: {}", peer, e);
                format!("ERR {}", e)
            }
        }
    }

    async fn respond(&mut self, request: Request<'_>, peer: SocketAddr) -> Result<String, RequestError> {
        match request {
            Request::Get(pv) => self.message("OK", self.local_name(pv)?),
            Request::GetRange { pv, offset, count } => self.slice(self.local_name(pv)?, offset, count),
            Request::Put(pv, text) => {
                let name = self.local_name(pv)?;
                let dispatcher = Arc::clone(&self.dispatcher);
                let text = text.to_string();
                tokio::task::spawn_blocking(move || dispatcher.handle_text_write(name, &text)).await??;
                self.message("OK", name)
            }
            Request::Monitor(pv) => {
                let name = self.local_name(pv)?;
                self.monitors.entry(name).or_default().insert(peer);
                debug!("{} monitors {}", peer, name);
                self.message("OK", name)
            }
            Request::Clear(pv) => {
                let name = self.local_name(pv)?;
                if let Some(peers) = self.monitors.get_mut(name) {
                    peers.remove(&peer);
                    if peers.is_empty() {
                        self.monitors.remove(name);
                    }
                }
                self.message("OK", name)
            }
        }
    }

    /// Strip the prefix and resolve to the table's own name
    fn local_name(&self, pv: &str) -> Result<&'static str, RequestError> {
        pv.strip_prefix(&self.prefix)
            .and_then(|name| self.dispatcher.table().definition(name))
            .map(|def| def.name)
            .ok_or_else(|| RequestError::UnknownPv(pv.to_string()))
    }

    fn message(&self, verb: &str, name: &str) -> Result<String, RequestError> {
        let reading = self
            .dispatcher
            .table()
            .read(name)
            .ok_or_else(|| RequestError::UnknownPv(name.to_string()))?;
        self.format(verb, name, &reading.value, reading.severity)
    }

    /// Reply with elements `offset..offset + count` of an array value
    fn slice(&self, name: &str, offset: usize, count: usize) -> Result<String, RequestError> {
        let reading = self
            .dispatcher
            .table()
            .read(name)
            .ok_or_else(|| RequestError::UnknownPv(name.to_string()))?;
        let elements = reading
            .value
            .as_array()
            .ok_or_else(|| RequestError::NotAnArray(format!("{}{}", self.prefix, name)))?;
        if offset > elements.len() {
            return Err(RequestError::OutOfRange {
                name: format!("{}{}", self.prefix, name),
                offset,
                len: elements.len(),
            });
        }
        let end = offset.saturating_add(count).min(elements.len());
        let part = Value::int_array(&elements[offset..end]);
        self.format("OK", name, &part, reading.severity)
    }

    fn format(
        &self,
        verb: &str,
        name: &str,
        value: &Value,
        severity: Severity,
    ) -> Result<String, RequestError> {
        let wire = value.to_wire_string().map_err(|source| RequestError::Encode {
            name: name.to_string(),
            source,
        })?;
        let text = format!("{} {}{} {} {}", verb, self.prefix, name, wire, severity);
        if text.len() > MAX_DATAGRAM {
            return Err(RequestError::TooLarge(format!("{}{}", self.prefix, name)));
        }
        Ok(text)
    }

    /// Flush the table and forward updates to monitoring clients
    async fn publish(&self, socket: &UdpSocket) {
        self.dispatcher.table().flush();

        let updates: Vec<Update> = self.updates.try_iter().collect();
        for update in updates {
            let Some(peers) = self.monitors.get(update.name) else {
                continue;
            };
            let text = match self.format("UPDATE", update.name, &update.value, update.severity) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Not forwarding update: {}", e);
                    continue;
                }
            };
            for peer in peers {
                if let Err(e) = socket.send_to(text.as_bytes(), peer).await {
                    warn!("Failed to send update to {}: {}", peer, e);
                }
            }
        }
    }
}
