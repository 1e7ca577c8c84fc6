use bytes::{BufMut, Bytes, BytesMut};

/// An opaque message: a (possibly empty) protocol header plus a body.
///
/// The engine never inspects either part; on the wire a message travels as
/// one frame whose length is `header.len() + body.len()`.
#[derive(Debug, Default)]
pub struct Message {
    header: BytesMut,
    body: BytesMut,
}

impl Message {
    /// Create an empty message.
    pub fn new() -> Message {
        Message::default()
    }

    /// Create a message with the given body and an empty header.
    pub fn from_body(body: BytesMut) -> Message {
        Message {
            header: BytesMut::new(),
            body,
        }
    }

    /// Total wire length: header plus body.
    pub fn len(&self) -> usize {
        self.header.len() + self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn header(&self) -> &[u8] {
        &self.header
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Append bytes to the header.
    pub fn push_header(&mut self, bytes: &[u8]) {
        self.header.put_slice(bytes);
    }

    /// Append bytes to the body.
    pub fn push_body(&mut self, bytes: &[u8]) {
        self.body.put_slice(bytes);
    }

    /// Freeze into `(header, body)` for zero-copy gather writes.
    pub fn into_parts(self) -> (Bytes, Bytes) {
        (self.header.freeze(), self.body.freeze())
    }
}

impl From<&[u8]> for Message {
    fn from(body: &[u8]) -> Message {
        Message::from_body(BytesMut::from(body))
    }
}
