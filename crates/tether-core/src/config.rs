//! Centralized configuration for the tether transport and resolver.
//!
//! Wire constants are shared by both ends of a connection and must not
//! change without bumping `WIRE_FORMAT_VERSION`.

/// Wire protocol constants.
pub struct WireConfig;

impl WireConfig {
    pub const WIRE_FORMAT_VERSION: u32 = 1;

    // Control transaction codes
    pub const SETUP_TRANSPORT: u32 = 1;
    pub const SHUTDOWN_TRANSPORT: u32 = 2;
    pub const PING: u32 = 3;
    pub const PING_RESPONSE: u32 = 4;

    /// Stream frames use `FIRST_CALL_ID + call_id` as their transaction code.
    pub const FIRST_CALL_ID: u32 = 1001;

    /// Size of an encoded handle reference inside a parcel.
    pub const HANDLE_REF_SIZE: usize = 8;
    /// `[u32 version][handle ref]`
    pub const SETUP_MIN_PAYLOAD: usize = 4 + Self::HANDLE_REF_SIZE;

    /// Flags payload of a SHUTDOWN_TRANSPORT reply.
    pub const SHUTDOWN_FLAGS: u32 = 0;

    pub const MAX_FRAME_PAYLOAD: usize = 1_048_576; // 1MB
}

/// Server transport limits.
pub struct TransportConfig;

impl TransportConfig {
    /// Transports an acceptor keeps open before refusing new clients.
    pub const DEFAULT_MAX_TRANSPORTS: usize = 64;
    /// Streams a single transport accepts.
    pub const MAX_STREAMS_PER_TRANSPORT: usize = 256;
}

/// Resolver defaults.
pub struct ResolverConfig;

impl ResolverConfig {
    /// Target URI scheme served by the intent resolver.
    pub const INTENT_SCHEME: &'static str = "intent";
    pub const SERVICE_AUTHORITY: &'static str = "localhost";
    pub const DEFAULT_PRIORITY: i32 = 5;
    /// Policy used when the service config does not name one.
    pub const DEFAULT_LB_POLICY: &'static str = "pick_first";
}

/// Service directory storage settings.
pub struct DirectoryConfig;

impl DirectoryConfig {
    pub const APP_CONFIG_DIR_NAME: &'static str = "tether";
    pub const DB_FILENAME: &'static str = "directory.db";
    pub const BUSY_TIMEOUT_MS: u32 = 5_000;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_ids_do_not_collide_with_control_codes() {
        for code in [
            WireConfig::SETUP_TRANSPORT,
            WireConfig::SHUTDOWN_TRANSPORT,
            WireConfig::PING,
            WireConfig::PING_RESPONSE,
        ] {
            assert!(code < WireConfig::FIRST_CALL_ID);
        }
    }
}
