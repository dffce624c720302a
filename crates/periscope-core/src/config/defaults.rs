/// Port serving the monitor UI and the live event stream
pub const DEFAULT_MONITOR_PORT: u16 = 8888;

/// Port accepting traffic to be proxied
pub const DEFAULT_PROXY_PORT: u16 = 7777;

/// Backend base URL traffic is forwarded to
pub const DEFAULT_TARGET: &str = "http://localhost:8080";

/// Interface both listeners bind to
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1";

/// Directory holding the prebuilt monitor UI
pub const DEFAULT_STATIC_DIR: &str = "./dist";

/// Upper bound on one proxied exchange (seconds)
pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 3600;

/// Bytes of each body leg kept in a snapshot
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Events queued per subscriber before the oldest are dropped
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// WebSocket subprotocol spoken by the bundled monitor UI
pub const MONITOR_SUBPROTOCOL: &str = "echo-protocol";
