/// mDNS service type every pingpong node advertises and browses for
pub const SERVICE_TYPE: &str = "_pingpong._tcp.local.";

/// TXT record key carrying the free-text payload of a record
pub const TXT_PAYLOAD: &str = "payload";

/// Payload advertised when none is configured
pub const DEFAULT_PAYLOAD: &str = "ping pong";

/// Identity prefix used when the caller does not provide one
pub const DEFAULT_ID_PREFIX: &str = "annon-";

/// Request sent to every newly resolved peer
pub const REQUEST_MESSAGE: &str = "Ping ";

/// Appended to the request by the default response policy
pub const RESPONSE_SUFFIX: &str = " Pong";

/// Largest payload a frame can carry (2-byte length prefix)
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Default bound on connect, read and write for a single peer request
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5000;
