use async_trait::async_trait;
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Marker for boxed bidirectional streams flowing through outbounds.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedConn = Box<dyn AsyncStream>;

/// Opaque fixed-width node identity derived from the node's configuration
/// bytes. Nodes are immutable while referenced; a changed configuration is a
/// new hash, so the hash doubles as the transport-pool key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeHash(u128);

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(seed: u64, bytes: &[u8]) -> u64 {
    let mut h = seed;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

impl NodeHash {
    /// Hash raw node configuration bytes into a stable identity.
    pub fn from_config_bytes(bytes: &[u8]) -> Self {
        let hi = fnv1a(FNV_OFFSET, bytes);
        // Second lane re-seeds with the first digest so the two halves differ
        // even for short inputs.
        let lo = fnv1a(hi ^ FNV_OFFSET, bytes);
        NodeHash(((hi as u128) << 64) | lo as u128)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }
}

impl fmt::Display for NodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// The capability a node exposes for dialing upstream connections on its
/// behalf. Implementations own whatever protocol machinery sits between the
/// proxy and the wire; the core only ever dials and closes.
///
/// Cancellation follows Rust convention: dropping the dial future aborts it.
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Open a TCP-semantics connection to `addr` (`host:port`).
    async fn dial(&self, addr: &str) -> io::Result<BoxedConn>;

    /// Release resources. Called once when the owning node entry is evicted.
    fn close(&self) {}
}

/// Plain direct-dial outbound. Used by the static router and as the baseline
/// transport when a node has no tunneling protocol configured.
#[derive(Debug, Default)]
pub struct DirectOutbound;

#[async_trait]
impl Outbound for DirectOutbound {
    async fn dial(&self, addr: &str) -> io::Result<BoxedConn> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_hash_stable() {
        let a = NodeHash::from_config_bytes(b"vmess://node-1");
        let b = NodeHash::from_config_bytes(b"vmess://node-1");
        let c = NodeHash::from_config_bytes(b"vmess://node-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string().len(), 32);
    }

    #[test]
    fn test_node_hash_short_inputs_differ() {
        assert_ne!(
            NodeHash::from_config_bytes(b""),
            NodeHash::from_config_bytes(b"\0")
        );
    }
}
