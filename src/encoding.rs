//! Everything that crosses the network, surface requests and responses and
//! the `Result`s wrapping them, is encoded with Bincode. The encoding is
//! Rust-specific and tied to the stability of the types in `message`, which
//! is fine here: all peers are built from the same crate.
//!
//! All encoding goes through the `Value` trait below so the whole crate
//! agrees on one set of Bincode options. Variable-length integers are used
//! rather than Bincode's fixed-length default, since most values on the
//! wire (ports, counts, transaction indexes) are small.

use crate::error::Result;

use bincode::Options as _;

/// The Bincode options used for all encoding and decoding.
fn options() -> bincode::DefaultOptions {
    bincode::DefaultOptions::new()
}

/// Bincode encode/decode methods, blanket-implemented for every type that
/// implements the serde traits.
pub trait Value: serde::Serialize + serde::de::DeserializeOwned {
    /// Encodes the value to a byte vector.
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(options().serialize(self)?)
    }

    /// Encodes the value into a writer.
    fn encode_into<W: std::io::Write>(&self, writer: W) -> Result<()> {
        Ok(options().serialize_into(writer, self)?)
    }

    /// Decodes a value from a byte slice.
    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(options().deserialize(bytes)?)
    }

    /// Decodes a value from a reader.
    fn decode_from<R: std::io::Read>(reader: R) -> Result<Self> {
        Ok(options().deserialize_from(reader)?)
    }

    /// Decodes a value from a reader, or returns None if the peer has gone
    /// away (end of stream or connection reset). Server request loops use
    /// this to tell a finished connection apart from a decoding failure.
    fn maybe_decode_from<R: std::io::Read>(reader: R) -> Result<Option<Self>> {
        match options().deserialize_from(reader) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                if let bincode::ErrorKind::Io(io) = err.as_ref() {
                    let closed = matches!(
                        io.kind(),
                        std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset
                    );
                    if closed {
                        return Ok(None);
                    }
                }
                Err(err.into())
            }
        }
    }
}

impl<T: serde::Serialize + serde::de::DeserializeOwned> Value for T {}
