//! The content address type used throughout warren.

use std::fmt;
use std::str::FromStr;

use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{self, SeqAccess},
    ser::SerializeTuple,
};
use snafu::Snafu;

/// Address of an immutable blob in the content-addressed store.
///
/// A [`ContentId`] is a fixed 32 bytes.  It carries no information about
/// what it addresses; a changed document always has a new [`ContentId`],
/// which is what the tree-diffing in the engine relies on.
#[derive(PartialEq, Eq, Copy, Clone, Hash)]
pub struct ContentId([u8; 32]);

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({self})")
    }
}

impl ContentId {
    /// Bytes of the content id.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create a `ContentId` from its raw bytes representation.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Convert the content id to a hex string.
    pub fn to_hex(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0)
    }

    /// The first eight characters of the base32 form, for log lines.
    pub fn fmt_short(&self) -> String {
        let mut text = data_encoding::BASE32_NOPAD.encode(&self.0[..5]);
        text.make_ascii_lowercase();
        text
    }
}

impl AsRef<[u8]> for ContentId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for ContentId {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl From<ContentId> for [u8; 32] {
    fn from(value: ContentId) -> Self {
        value.0
    }
}

impl PartialOrd for ContentId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ContentId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // result will be 52 bytes
        let mut res = [b'b'; 52];
        data_encoding::BASE32_NOPAD.encode_mut(self.as_bytes(), &mut res);
        // convert to string, this is guaranteed to succeed
        let t = std::str::from_utf8_mut(res.as_mut()).expect("valid utf8");
        // data_encoding doesn't have BASE32LOWER_NOPAD as a const
        t.make_ascii_lowercase();
        f.write_str(t)
    }
}

/// Error when parsing a [`ContentId`] from its text form.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ParseContentIdError {
    #[snafu(display("invalid length {len}, expected 52 base32 or 64 hex characters"))]
    InvalidLength { len: usize },
    #[snafu(display("invalid encoding"))]
    InvalidEncoding {},
}

impl FromStr for ContentId {
    type Err = ParseContentIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let sb = s.as_bytes();
        if sb.len() == 64 {
            // this is most likely a hex encoded id
            let mut bytes = [0u8; 32];
            data_encoding::HEXLOWER_PERMISSIVE
                .decode_mut(sb, &mut bytes)
                .map_err(|_| InvalidEncodingSnafu.build())?;
            return Ok(Self(bytes));
        }
        if sb.len() != 52 {
            return Err(InvalidLengthSnafu { len: sb.len() }.build());
        }
        // base32 encoded id, decode it directly
        let mut t = [0u8; 52];
        t.copy_from_slice(sb);
        // data_encoding doesn't have BASE32LOWER_NOPAD as a const
        std::str::from_utf8_mut(t.as_mut())
            .map_err(|_| InvalidEncodingSnafu.build())?
            .make_ascii_uppercase();
        let mut res = [0u8; 32];
        data_encoding::BASE32_NOPAD
            .decode_mut(&t, &mut res)
            .map_err(|_| InvalidEncodingSnafu.build())?;
        Ok(Self(res))
    }
}

impl Serialize for ContentId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(self.to_string().as_str())
        } else {
            // Fixed-length structures, including arrays, are supported in Serde as tuples
            let mut s = serializer.serialize_tuple(32)?;
            for item in &self.0 {
                s.serialize_element(item)?;
            }
            s.end()
        }
    }
}

impl<'de> Deserialize<'de> for ContentId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(de::Error::custom)
        } else {
            deserializer.deserialize_tuple(32, ContentIdVisitor)
        }
    }
}

struct ContentIdVisitor;

impl<'de> de::Visitor<'de> for ContentIdVisitor {
    type Value = ContentId;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "an array of 32 bytes containing content id data")
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut arr = [0u8; 32];
        let mut i = 0;
        while let Some(val) = seq.next_element()? {
            if i >= 32 {
                return Err(de::Error::invalid_length(i + 1, &self));
            }
            arr[i] = val;
            i += 1;
        }
        if i != 32 {
            return Err(de::Error::invalid_length(i, &self));
        }
        Ok(ContentId::from(arr))
    }
}
