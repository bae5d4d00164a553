//! Binary envelope for identifiers, factories and build data.
//!
//! Layout: the magic bytes `KMK`, one format version byte, one kind tag byte
//! and a CBOR body. The tag of a value is fixed per kind in [`WireKind`]
//! implementations, and a decoded body must carry the tag of its header.

use camino::Utf8Path;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::bootstrap::TargetConfiguration;
use crate::engine::{BuildState, Factory};
use crate::error::{ScriptError, WireError};
use crate::identifier::{TaskId, TaskIdKind};

pub const MAGIC: &[u8; 3] = b"KMK";
pub const WIRE_VERSION: u8 = 1;

/// A value with a fixed kind tag in the envelope.
pub trait WireKind: Serialize + DeserializeOwned {
    /// Tag of this particular value.
    fn tag(&self) -> u8;

    /// Whether `tag` belongs to this type's table.
    fn accepts(tag: u8) -> bool;
}

impl WireKind for TaskId {
    fn tag(&self) -> u8 {
        match self.kind() {
            TaskIdKind::Named(_) => 0x01,
            TaskIdKind::Script { .. } => 0x02,
            TaskIdKind::Literal { .. } => 0x03,
            TaskIdKind::LocalVariable { .. } => 0x04,
            TaskIdKind::IterableIndex { .. } => 0x05,
            TaskIdKind::MapEntryField { .. } => 0x06,
            TaskIdKind::Assign { .. } => 0x07,
            TaskIdKind::TaskDefaults { .. } => 0x08,
            TaskIdKind::DefaultsLoader { .. } => 0x09,
            TaskIdKind::GlobalScope { .. } => 0x0A,
            TaskIdKind::BuildTargetParameter { .. } => 0x0B,
            TaskIdKind::BuildFileTarget { .. } => 0x0C,
            TaskIdKind::BuildTargetBootstrapper(_) => 0x0D,
            TaskIdKind::InvocationBootstrapper(_) => 0x0E,
            TaskIdKind::InvocationRunner(_) => 0x0F,
            TaskIdKind::BuildScope => 0x10,
        }
    }

    fn accepts(tag: u8) -> bool {
        (0x01..=0x10).contains(&tag)
    }
}

impl WireKind for Factory {
    fn tag(&self) -> u8 {
        match self {
            Factory::Script(_) => 0x20,
            Factory::InvocationBootstrapper(_) => 0x21,
            Factory::InvocationRunner(_) => 0x22,
            Factory::BuildTargetBootstrapper(_) => 0x23,
            Factory::BuildTargetRunner(_) => 0x24,
        }
    }

    fn accepts(tag: u8) -> bool {
        (0x20..=0x24).contains(&tag)
    }
}

impl WireKind for TargetConfiguration {
    fn tag(&self) -> u8 {
        0x30
    }

    fn accepts(tag: u8) -> bool {
        tag == 0x30
    }
}

impl WireKind for BuildState {
    fn tag(&self) -> u8 {
        0x31
    }

    fn accepts(tag: u8) -> bool {
        tag == 0x31
    }
}

pub fn encode<T: WireKind>(value: &T) -> Result<Vec<u8>, WireError> {
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(MAGIC);
    buffer.push(WIRE_VERSION);
    buffer.push(value.tag());

    ciborium::into_writer(value, &mut buffer).map_err(|e| WireError::Encode(e.to_string()))?;
    Ok(buffer)
}

pub fn decode<T: WireKind>(bytes: &[u8]) -> Result<T, WireError> {
    let Some(rest) = bytes.strip_prefix(MAGIC.as_slice()) else {
        return Err(if MAGIC.starts_with(bytes) {
            WireError::Truncated
        } else {
            WireError::Magic
        });
    };

    let [version, tag, body @ ..] = rest else {
        return Err(WireError::Truncated);
    };
    if *version != WIRE_VERSION {
        return Err(WireError::Version {
            found: *version,
            expected: WIRE_VERSION,
        });
    }
    if !T::accepts(*tag) {
        return Err(WireError::UnknownTag(*tag));
    }

    let value: T = ciborium::from_reader(body).map_err(|e| WireError::Decode(e.to_string()))?;
    if value.tag() != *tag {
        return Err(WireError::TagMismatch {
            header: *tag,
            body: value.tag(),
        });
    }

    Ok(value)
}

pub fn encode_configuration(configuration: &TargetConfiguration) -> Result<Vec<u8>, WireError> {
    encode(configuration)
}

pub fn decode_configuration(bytes: &[u8]) -> Result<TargetConfiguration, WireError> {
    decode(bytes)
}

/// Writes `state` to `path` for the next incremental build.
pub fn save_state(path: &Utf8Path, state: &BuildState) -> Result<(), ScriptError> {
    let bytes = encode(state)?;
    std::fs::write(path, bytes).map_err(|e| ScriptError::io(path, e))
}

/// Reads a state saved by [`save_state`]. A missing file is an empty state.
pub fn load_state(path: &Utf8Path) -> Result<BuildState, ScriptError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(decode(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BuildState::default()),
        Err(e) => Err(ScriptError::io(path, e)),
    }
}
