//! Fixed-header binary datagrams.
//!
//! Every frame on the wire is a 16-byte header followed by a variable body:
//!
//! ```text
//! +---------+------------------+------+---------------------+-------------+
//! | version | body length      | type | charset tag         | body        |
//! | 1 byte  | u32 big-endian   | 1 B  | 10 bytes, NUL-padded| length bytes|
//! +---------+------------------+------+---------------------+-------------+
//! ```
//!
//! The length field counts only the body. Type `0` is a heartbeat (empty body),
//! type `1` an application payload, and values `>= 2` are reserved.

/// Size of the fixed header in bytes.
pub const HEAD_LENGTH: usize = 16;
/// Offset of the big-endian body length field.
pub const LENGTH_FIELD_OFFSET: usize = 1;
/// Offset of the type byte.
pub const TYPE_OFFSET: usize = 5;
/// Offset of the charset tag.
pub const CHARSET_OFFSET: usize = 6;
/// Width of the charset tag.
pub const CHARSET_WIDTH: usize = 10;
/// Default maximum frame size, header included.
pub const MAX_FRAME_LENGTH: usize = i32::MAX as usize;
/// Version written by [`encode`] unless told otherwise.
pub const DEFAULT_VERSION: u8 = 1;
/// Charset tag written by [`encode`].
pub const DEFAULT_CHARSET: &str = "UTF-8";

/// The type byte of a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatagramType {
    /// Keepalive with an empty body.
    Heartbeat,
    /// Application payload handled by the dispatch engine.
    Application,
    /// Reserved for extensions (`>= 2`).
    Extension(u8),
}

impl From<u8> for DatagramType {
    fn from(value: u8) -> Self {
        match value {
            0 => DatagramType::Heartbeat,
            1 => DatagramType::Application,
            other => DatagramType::Extension(other),
        }
    }
}

impl From<DatagramType> for u8 {
    fn from(value: DatagramType) -> Self {
        match value {
            DatagramType::Heartbeat => 0,
            DatagramType::Application => 1,
            DatagramType::Extension(other) => other,
        }
    }
}

/// Errors produced while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The buffer does not hold the complete frame its header declares.
    #[error("malformed frame: header declares {declared} bytes but only {available} are available")]
    MalformedFrame {
        /// Total frame length implied by the header.
        declared: usize,
        /// Bytes actually present.
        available: usize,
    },

    /// The frame exceeds the configured maximum.
    #[error("frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Total frame size including the header.
        size: usize,
        /// The configured maximum.
        max: usize,
    },

    /// The peer closed the stream.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A decoded frame. Immutable once constructed.
///
/// Holds the complete wire bytes so the frame can be forwarded without
/// re-encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    frame: Vec<u8>,
    version: u8,
    kind: DatagramType,
    charset: String,
}

impl Datagram {
    /// Protocol version byte.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Frame type.
    pub fn kind(&self) -> DatagramType {
        self.kind
    }

    /// Charset tag with padding removed.
    pub fn charset(&self) -> &str {
        &self.charset
    }

    /// Body length as declared in the header.
    pub fn body_len(&self) -> usize {
        self.frame.len() - HEAD_LENGTH
    }

    /// Body bytes.
    pub fn body(&self) -> &[u8] {
        &self.frame[HEAD_LENGTH..]
    }

    /// Complete frame bytes, header included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.frame
    }

    /// Consume the datagram, returning the complete frame bytes.
    pub fn into_frame(self) -> Vec<u8> {
        self.frame
    }

    /// Whether this is a heartbeat frame.
    pub fn is_heartbeat(&self) -> bool {
        self.kind == DatagramType::Heartbeat
    }
}

/// Build a datagram with the default charset tag.
pub fn encode(body: &[u8], version: u8, kind: DatagramType) -> Result<Datagram, FrameError> {
    encode_with_charset(body, version, kind, DEFAULT_CHARSET)
}

/// Build a datagram with an explicit charset tag.
///
/// The tag is truncated or NUL-padded to [`CHARSET_WIDTH`] bytes.
pub fn encode_with_charset(
    body: &[u8],
    version: u8,
    kind: DatagramType,
    charset: &str,
) -> Result<Datagram, FrameError> {
    let size = HEAD_LENGTH + body.len();
    if size > MAX_FRAME_LENGTH {
        return Err(FrameError::FrameTooLarge {
            size,
            max: MAX_FRAME_LENGTH,
        });
    }

    let mut frame = Vec::with_capacity(size);
    frame.push(version);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.push(kind.into());

    let mut tag = [0u8; CHARSET_WIDTH];
    let raw = charset.as_bytes();
    let n = raw.len().min(CHARSET_WIDTH);
    tag[..n].copy_from_slice(&raw[..n]);
    frame.extend_from_slice(&tag);
    frame.extend_from_slice(body);

    Ok(Datagram {
        frame,
        version,
        kind,
        charset: trim_charset(&tag),
    })
}

/// Build an empty heartbeat frame.
pub fn heartbeat(version: u8) -> Datagram {
    // An empty body can never exceed the maximum.
    let mut frame = vec![0u8; HEAD_LENGTH];
    frame[0] = version;
    frame[CHARSET_OFFSET..CHARSET_OFFSET + DEFAULT_CHARSET.len()]
        .copy_from_slice(DEFAULT_CHARSET.as_bytes());
    Datagram {
        frame,
        version,
        kind: DatagramType::Heartbeat,
        charset: DEFAULT_CHARSET.to_string(),
    }
}

/// Read the declared body length from a header.
///
/// Returns `None` while fewer than [`HEAD_LENGTH`] bytes are available.
pub fn body_length(header: &[u8]) -> Option<usize> {
    if header.len() < HEAD_LENGTH {
        return None;
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&header[LENGTH_FIELD_OFFSET..LENGTH_FIELD_OFFSET + 4]);
    Some(u32::from_be_bytes(len) as usize)
}

/// Decode the first frame in `buf`.
///
/// The caller must only invoke this once the buffer is known to hold a full
/// frame; trailing bytes beyond the first frame are ignored.
pub fn decode(buf: &[u8]) -> Result<Datagram, FrameError> {
    let Some(body_len) = body_length(buf) else {
        return Err(FrameError::MalformedFrame {
            declared: HEAD_LENGTH,
            available: buf.len(),
        });
    };

    let declared = HEAD_LENGTH + body_len;
    if buf.len() < declared {
        return Err(FrameError::MalformedFrame {
            declared,
            available: buf.len(),
        });
    }

    Ok(Datagram {
        frame: buf[..declared].to_vec(),
        version: buf[0],
        kind: DatagramType::from(buf[TYPE_OFFSET]),
        charset: trim_charset(&buf[CHARSET_OFFSET..CHARSET_OFFSET + CHARSET_WIDTH]),
    })
}

fn trim_charset(tag: &[u8]) -> String {
    let end = tag.iter().position(|&b| b == 0).unwrap_or(tag.len());
    String::from_utf8_lossy(&tag[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_preserves_fields() {
        let cases: [(&[u8], u8, DatagramType); 4] = [
            (b"", 1, DatagramType::Heartbeat),
            (b"hello", 1, DatagramType::Application),
            (b"{\"id\":\"1\"}", 7, DatagramType::Application),
            (&[0xff; 300], 2, DatagramType::Extension(9)),
        ];

        for (body, version, kind) in cases {
            let encoded = encode(body, version, kind).unwrap();
            let decoded = decode(encoded.as_bytes()).unwrap();
            assert_eq!(decoded.body(), body);
            assert_eq!(decoded.version(), version);
            assert_eq!(decoded.kind(), kind);
            assert_eq!(decoded.charset(), DEFAULT_CHARSET);
        }
    }

    #[test]
    fn test_header_layout_is_bit_exact() {
        let frame = encode(b"abc", 3, DatagramType::Application).unwrap();
        let bytes = frame.as_bytes();
        assert_eq!(bytes.len(), HEAD_LENGTH + 3);
        assert_eq!(bytes[0], 3);
        assert_eq!(&bytes[1..5], &[0, 0, 0, 3], "length is big-endian");
        assert_eq!(bytes[5], 1);
        assert_eq!(&bytes[6..11], b"UTF-8");
        assert_eq!(&bytes[11..16], &[0; 5], "charset is NUL-padded");
        assert_eq!(&bytes[16..], b"abc");
    }

    #[test]
    fn test_long_charset_is_truncated() {
        let frame =
            encode_with_charset(b"x", 1, DatagramType::Application, "ISO-8859-15-EXTRA").unwrap();
        assert_eq!(frame.charset(), "ISO-8859-1");
        assert_eq!(frame.body(), b"x");
    }

    #[test]
    fn test_heartbeat_is_empty_type_zero() {
        let hb = heartbeat(1);
        assert!(hb.is_heartbeat());
        assert_eq!(hb.body_len(), 0);
        assert_eq!(hb.as_bytes().len(), HEAD_LENGTH);
        assert_eq!(decode(hb.as_bytes()).unwrap(), hb);
    }

    #[test]
    fn test_truncated_body_is_malformed() {
        let frame = encode(b"0123456789", 1, DatagramType::Application).unwrap();
        let short = &frame.as_bytes()[..HEAD_LENGTH + 4];
        let err = decode(short).unwrap_err();
        assert!(matches!(
            err,
            FrameError::MalformedFrame {
                declared: 26,
                available: 20
            }
        ));
    }

    #[test]
    fn test_short_header_is_malformed() {
        assert!(matches!(
            decode(&[1, 0, 0]),
            Err(FrameError::MalformedFrame { .. })
        ));
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let mut buf = encode(b"first", 1, DatagramType::Application)
            .unwrap()
            .into_frame();
        buf.extend_from_slice(&heartbeat(1).into_frame());
        let first = decode(&buf).unwrap();
        assert_eq!(first.body(), b"first");
    }

    #[test]
    fn test_body_length_needs_full_header() {
        let frame = encode(b"xyz", 1, DatagramType::Application).unwrap();
        assert_eq!(body_length(&frame.as_bytes()[..15]), None);
        assert_eq!(body_length(frame.as_bytes()), Some(3));
    }

    #[test]
    fn test_type_byte_mapping() {
        assert_eq!(DatagramType::from(0), DatagramType::Heartbeat);
        assert_eq!(DatagramType::from(1), DatagramType::Application);
        assert_eq!(DatagramType::from(42), DatagramType::Extension(42));
        assert_eq!(u8::from(DatagramType::Extension(42)), 42);
    }
}
