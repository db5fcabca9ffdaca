//! Checksum types for package archives.
//!
//! `repodata.json` carries hashes as lowercase hex, while the sharded msgpack
//! layout carries them as raw bytes. Both [`Md5Bytes`] and [`Sha256Bytes`]
//! pick the representation from the serializer: hex for human readable
//! formats, raw bytes otherwise.

use std::fmt::{self, Display, Formatter};
use std::io::{self, Read};
use std::str::FromStr;

use digest::Digest;
use md5::Md5;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;

macro_rules! checksum_type {
    ($name:ident, $len:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub [u8; $len]);

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl FromStr for $name {
            type Err = hex::FromHexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mut bytes = [0u8; $len];
                hex::decode_to_slice(s, &mut bytes)?;
                Ok(Self(bytes))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                if serializer.is_human_readable() {
                    serializer.serialize_str(&hex::encode(self.0))
                } else {
                    serializer.serialize_bytes(&self.0)
                }
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                if deserializer.is_human_readable() {
                    let hex_str = String::deserialize(deserializer)?;
                    hex_str.parse().map_err(D::Error::custom)
                } else {
                    let bytes = serde_bytes_de(deserializer)?;
                    let mut out = [0u8; $len];
                    if bytes.len() != $len {
                        return Err(D::Error::custom(concat!(
                            "expected ",
                            $len,
                            " checksum bytes"
                        )));
                    }
                    out.copy_from_slice(&bytes);
                    Ok(Self(out))
                }
            }
        }
    };
}

checksum_type!(Md5Bytes, 16);
checksum_type!(Sha256Bytes, 32);

fn serde_bytes_de<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    struct BytesVisitor;

    impl serde::de::Visitor<'_> for BytesVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
            f.write_str("checksum bytes")
        }

        fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
            Ok(v)
        }
    }

    deserializer.deserialize_byte_buf(BytesVisitor)
}

/// Digest an entire stream, returning the md5, sha256 and the number of bytes
/// read in a single pass.
pub fn stream_digests(mut reader: impl Read) -> io::Result<(Md5Bytes, Sha256Bytes, u64)> {
    let mut md5 = Md5::new();
    let mut sha256 = Sha256::new();
    let mut size = 0u64;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        md5.update(&buf[..n]);
        sha256.update(&buf[..n]);
        size += n as u64;
    }
    Ok((
        Md5Bytes(md5.finalize().into()),
        Sha256Bytes(sha256.finalize().into()),
        size,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_digests() {
        let (md5, sha256, size) = stream_digests(&b"conda"[..]).unwrap();
        assert_eq!(size, 5);
        assert_eq!(md5.to_string(), "19d07b1f2eb7bd8f0c8e967b228f57d2");
        assert_eq!(
            sha256.to_string(),
            "d0edee15f91b406f3f99726e44eb990be6e34fd0345b52b910c568e0eef6a2a8"
        );
    }

    #[test]
    fn test_hex_round_trip() {
        let sha: Sha256Bytes = "d0edee15f91b406f3f99726e44eb990be6e34fd0345b52b910c568e0eef6a2a8"
            .parse()
            .unwrap();
        let json = serde_json::to_string(&sha).unwrap();
        assert_eq!(
            json,
            "\"d0edee15f91b406f3f99726e44eb990be6e34fd0345b52b910c568e0eef6a2a8\""
        );
        let back: Sha256Bytes = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sha);
    }

    #[test]
    fn test_msgpack_uses_raw_bytes() {
        let md5: Md5Bytes = "35b3af36171c394e345a1f1ba66dcffe".parse().unwrap();
        let packed = rmp_serde::to_vec(&md5).unwrap();
        // bin8 marker, 16 byte payload
        assert_eq!(packed.len(), 2 + 16);
        let back: Md5Bytes = rmp_serde::from_slice(&packed).unwrap();
        assert_eq!(back, md5);
    }
}
