//! Configuration records consumed by the engine.
//!
//! These are plain structs with `Default` impls, the way the rest of the
//! ambient stack in this crate avoids pulling in a config-file parser: the
//! core only ever receives an in-process record built by its embedder (see
//! spec section 6 and `SPEC_FULL.md` section 2).

/// Default SCOPY segment size: 512 KiB, per spec.
pub const DEFAULT_SEG_SIZE: usize = 512 * 1024;

/// Default maximum IOV element count.
pub const DEFAULT_MAX_IOV: usize = 16;

/// System ceiling on IOV element count (mirrors `IOV_MAX` on Linux).
pub const SYSTEM_IOV_MAX: usize = 1024;

#[derive(Debug, Clone, Copy)]
pub struct TxPoolConfig {
    pub initial: usize,
    pub max: usize,
}

impl Default for TxPoolConfig {
    fn default() -> Self {
        TxPoolConfig {
            initial: 64,
            max: 4096,
        }
    }
}

/// Configuration for a `ScopyInterface`.
#[derive(Debug, Clone, Copy)]
pub struct ScopyConfig {
    /// Maximum number of IOV elements accepted in a single zcopy request.
    /// Clamped to [`SYSTEM_IOV_MAX`].
    pub max_iov: usize,
    /// Maximum bytes moved by a single copy-primitive invocation.
    pub seg_size: usize,
    /// Informational; not enforced anywhere in the engine.
    pub bandwidth: u64,
    pub tx_pool: TxPoolConfig,
}

impl Default for ScopyConfig {
    fn default() -> Self {
        ScopyConfig {
            max_iov: DEFAULT_MAX_IOV,
            seg_size: DEFAULT_SEG_SIZE,
            bandwidth: 0,
            tx_pool: TxPoolConfig::default(),
        }
    }
}

impl ScopyConfig {
    /// Returns a copy with `max_iov` clamped to the system ceiling.
    pub fn clamped(mut self) -> Self {
        self.max_iov = self.max_iov.min(SYSTEM_IOV_MAX);
        self
    }
}

/// Configuration for a `TcpIface`.
#[derive(Debug, Clone, Copy)]
pub struct TcpConfig {
    /// Number of socket-level error retries tolerated on a `Connecting` or
    /// `WaitingAck` endpoint before it is failed permanently.
    pub max_conn_retries: u32,
    /// Whether the connected socket remains nonblocking after the
    /// handshake completes (it always does in this engine; kept as a
    /// config knob for parity with the original, which allowed disabling
    /// it for debugging).
    pub conn_nb: bool,
    /// Initial capacity of each endpoint's TX/RX buffers, in bytes.
    pub buffer_size: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            max_conn_retries: 3,
            conn_nb: true,
            buffer_size: 64 * 1024,
        }
    }
}
