use bytes::{Bytes, BytesMut};
use rand::RngExt;

/// Wire framing applied to adapter output before it reaches HTTP clients.
///
/// Fixed for the lifetime of a stream, derived from the adapter kind:
///
/// - **Multipart** (`multipart/x-mixed-replace`): each adapter chunk is one
///   complete image, wrapped as a part so browsers replace the previous one.
///
///   ```text
///   --<boundary>\r\n
///   Content-Type: image/svg+xml\r\n
///   Content-Length: 1234\r\n
///   \r\n
///   <image bytes>\r\n
///   ```
///
/// - **Raw**: container/segment bytes passed through unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    Multipart {
        boundary: String,
        part_type: &'static str,
    },
    Raw {
        content_type: &'static str,
    },
}

impl Framing {
    /// Multipart framing with a random boundary token.
    pub fn multipart(part_type: &'static str) -> Self {
        let boundary = format!("rtspmux{:016x}", rand::rng().random::<u64>());
        Self::Multipart {
            boundary,
            part_type,
        }
    }

    pub fn raw(content_type: &'static str) -> Self {
        Self::Raw { content_type }
    }

    /// `Content-Type` of the HTTP response carrying this stream.
    pub fn content_type(&self) -> String {
        match self {
            Self::Multipart { boundary, .. } => {
                format!("multipart/x-mixed-replace; boundary={boundary}")
            }
            Self::Raw { content_type } => content_type.to_string(),
        }
    }

    /// Wrap one adapter chunk for the wire.
    pub fn frame(&self, chunk: &Bytes) -> Bytes {
        match self {
            Self::Multipart {
                boundary,
                part_type,
            } => {
                let header = format!(
                    "--{boundary}\r\nContent-Type: {part_type}\r\nContent-Length: {}\r\n\r\n",
                    chunk.len()
                );
                let mut part = BytesMut::with_capacity(header.len() + chunk.len() + 2);
                part.extend_from_slice(header.as_bytes());
                part.extend_from_slice(chunk);
                part.extend_from_slice(b"\r\n");
                part.freeze()
            }
            Self::Raw { .. } => chunk.clone(),
        }
    }
}
