//! The public identity key of a channel.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use snafu::Snafu;

/// Public key naming a followed channel.
///
/// The engine never signs or verifies anything with this key; resolving it
/// to the channel's latest published root is the job of the network layer.
/// Here it is only an identity: comparable, hashable, printable.
#[derive(PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash)]
pub struct ChannelKey([u8; 32]);

impl ChannelKey {
    /// Bytes of the key.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create a `ChannelKey` from its raw bytes representation.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The first eight characters of the base32 form, for log lines.
    pub fn fmt_short(&self) -> String {
        let mut text = data_encoding::BASE32_NOPAD.encode(&self.0[..5]);
        text.make_ascii_lowercase();
        text
    }
}

impl AsRef<[u8]> for ChannelKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for ChannelKey {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut text = data_encoding::BASE32_NOPAD.encode(&self.0);
        text.make_ascii_lowercase();
        f.write_str(&text)
    }
}

impl fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelKey({})", self.fmt_short())
    }
}

/// Error when parsing a [`ChannelKey`] from its text form.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ParseChannelKeyError {
    #[snafu(display("invalid channel key encoding"))]
    InvalidEncoding {},
}

impl FromStr for ChannelKey {
    type Err = ParseChannelKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        let bytes = data_encoding::BASE32_NOPAD
            .decode(upper.as_bytes())
            .map_err(|_| InvalidEncodingSnafu.build())?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| InvalidEncodingSnafu.build())?;
        Ok(Self(arr))
    }
}

impl Serialize for ChannelKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(self.to_string().as_str())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for ChannelKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(de::Error::custom)
        } else {
            let bytes = <[u8; 32]>::deserialize(deserializer)?;
            Ok(Self(bytes))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_parse_roundtrip() {
        let key = ChannelKey::from([42; 32]);
        let text = key.to_string();
        assert_eq!(text.parse::<ChannelKey>().unwrap(), key);
    }

    #[test]
    fn test_fmt_short() {
        let key = ChannelKey::from([0; 32]);
        assert_eq!(key.fmt_short().len(), 8);
    }

    #[test]
    fn test_json_map_key() {
        use std::collections::HashMap;
        let key = ChannelKey::from([9; 32]);
        let mut map = HashMap::new();
        map.insert(key, 1u32);
        let ser = serde_json::to_string(&map).unwrap();
        let de: HashMap<ChannelKey, u32> = serde_json::from_str(&ser).unwrap();
        assert_eq!(de.get(&key), Some(&1));
    }
}
