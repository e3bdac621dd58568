//! Synchronous request/response plumbing between nodes. Callers hold plain
//! `Address` values and open a fresh connection per call; servers accept
//! connections on a `TcpListener` and dispatch requests to a `Service`
//! implementation, one thread per connection.

use crate::encoding::Value as _;
use crate::error::{Error, Result};
use crate::message::Address;

use log::{debug, error};
use std::io::Write as _;
use std::net::{TcpListener, TcpStream, ToSocketAddrs as _};
use std::sync::Arc;
use std::time::Duration;

/// How long a liveness probe waits for a connection before declaring the
/// peer dead.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Calls a remote surface: connects, sends the request, and decodes the
/// `Result` response. Transport failures surface as `Error::IO`, which
/// callers treat as the peer being unreachable.
pub fn call<Req, Resp>(addr: &Address, request: &Req) -> Result<Resp>
where
    Req: serde::Serialize + serde::de::DeserializeOwned,
    Resp: serde::Serialize + serde::de::DeserializeOwned,
{
    let socket = TcpStream::connect((addr.host.as_str(), addr.port))
        .map_err(|e| Error::IO(format!("can't reach {addr}: {e}")))?;
    let mut writer = std::io::BufWriter::new(socket.try_clone()?);
    request.encode_into(&mut writer)?;
    writer.flush()?;
    let mut reader = std::io::BufReader::new(socket);
    Result::<Resp>::decode_from(&mut reader)?
}

/// Probes an address for liveness with a bounded connection attempt. Used by
/// the coordinator's roster sweep.
pub fn probe(addr: &Address) -> bool {
    let Ok(mut resolved) = (addr.host.as_str(), addr.port).to_socket_addrs() else {
        return false;
    };
    resolved.any(|a| TcpStream::connect_timeout(&a, PROBE_TIMEOUT).is_ok())
}

/// Probes the coordinator's clock via the registration surface and logs the
/// offset from the local clock (Cristian's algorithm). Purely
/// informational: the offset plays no role in any ordering decision.
pub fn log_clock_offset(registry: &Address) {
    use crate::message::{RegistryRequest, RegistryResponse};

    let now = || -> Result<i64> {
        let since_epoch = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH)?;
        Ok(since_epoch.as_millis() as i64)
    };
    let result = (|| -> Result<i64> {
        let before = now()?;
        let response: RegistryResponse = call(registry, &RegistryRequest::ServerTime)?;
        let after = now()?;
        let RegistryResponse::ServerTime(server) = response else {
            return crate::errdata!("unexpected server time response");
        };
        Ok(server as i64 - (before + (after - before) / 2))
    })();
    match result {
        Ok(offset) => log::info!("Clock offset from coordinator: {offset}ms"),
        Err(err) => log::warn!("Unable to probe coordinator clock: {err}"),
    }
}

/// A remote surface handler. One service serves one request/response enum
/// pair; a node exposing several surfaces runs one listener per surface.
pub trait Service: Send + Sync + 'static {
    type Request: serde::Serialize + serde::de::DeserializeOwned + std::fmt::Debug + Send;
    type Response: serde::Serialize + serde::de::DeserializeOwned + Send;

    fn handle(&self, request: Self::Request) -> Result<Self::Response>;
}

/// Accepts connections and serves requests until the process exits. Each
/// connection gets its own thread and may issue any number of requests;
/// per-call stubs send one and disconnect.
pub fn serve<S: Service>(listener: TcpListener, service: Arc<S>) -> Result<()> {
    std::thread::scope(|scope| loop {
        let (socket, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) => {
                error!("Connection failed: {err}");
                continue;
            }
        };
        let service = service.clone();
        scope.spawn(move || {
            debug!("Peer {peer} connected");
            match session(socket, service.as_ref()) {
                Ok(()) => debug!("Peer {peer} disconnected"),
                Err(err) => error!("Peer {peer} error: {err}"),
            }
        });
    })
}

/// Serves one connection: decodes requests until the peer disconnects,
/// replying with the handler's `Result`. Handler errors are returned to the
/// caller, not propagated here, so a failed request doesn't tear down the
/// connection.
fn session<S: Service>(socket: TcpStream, service: &S) -> Result<()> {
    let mut reader = std::io::BufReader::new(socket.try_clone()?);
    let mut writer = std::io::BufWriter::new(socket);
    while let Some(request) = S::Request::maybe_decode_from(&mut reader)? {
        debug!("Received request {request:?}");
        let response = service.handle(request);
        response.encode_into(&mut writer)?;
        writer.flush()?;
    }
    Ok(())
}
