pub mod row;
pub mod schema;
pub mod stats;
pub mod wire;

pub use row::{decode_row, encode_row, Field, Row, Value};
pub use schema::{IndexDescriptor, KeyTypeName, SchemaDocument, TableDescriptor};
pub use stats::{ArenaStats, ConfigEcho, HashStats, HostInfo, SoftwareInfo, StatsDocument, TableStats};
pub use wire::{encode_length_prefix, parse_header, Action, RequestHeader, HEADER_SIZE, PROTOCOL_VERSION};

/// Literal QUIT acknowledgement body (spec §6.3): sent once, then the
/// connection is closed after the grace window described in `SPEC_FULL.md`.
pub const QUIT_ACK: &[u8] = br#"{"BYE":true}"#;
