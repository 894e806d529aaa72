use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::FleetError;

/// 32-byte snapshot content hash, rendered as base58 on the wire and in
/// snapshot file names.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotHash(pub [u8; 32]);

impl SnapshotHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for SnapshotHash {
    fn from(bytes: [u8; 32]) -> Self {
        SnapshotHash(bytes)
    }
}

impl fmt::Display for SnapshotHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(&self.0).into_string())
    }
}

impl fmt::Debug for SnapshotHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SnapshotHash({self})")
    }
}

impl FromStr for SnapshotHash {
    type Err = FleetError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        let written = bs58::decode(value)
            .onto(&mut bytes)
            .map_err(|err| FleetError::Parse(format!("invalid base58 hash: {err}")))?;
        if written != 32 {
            return Err(FleetError::Parse(format!(
                "hash must decode to 32 bytes, got {written}"
            )));
        }
        Ok(SnapshotHash(bytes))
    }
}

impl Serialize for SnapshotHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SnapshotHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_base58() {
        let encoded = "AvFf9oS8A8U78HdjT9YG2sTTThLHJZmhaMn2g8vkWYnr";
        let hash: SnapshotHash = encoded.parse().expect("valid hash");
        assert_eq!(hash.to_string(), encoded);
    }

    #[test]
    fn rejects_bad_input() {
        assert!("bad!hash".parse::<SnapshotHash>().is_err());
        assert!("".parse::<SnapshotHash>().is_err());
        // Valid base58 but too short.
        assert!("abc".parse::<SnapshotHash>().is_err());
    }
}
