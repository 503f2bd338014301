//! Fixed-capacity owned byte buffer.
//!
//! Every protocol value in this crate (channel values, writer ids, cron
//! strings) lives in one of these. Writes past capacity fail explicitly;
//! there is no silent truncation anywhere in the parsing path.

/// Owned byte buffer with a hard capacity fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedBuf {
    buf: Vec<u8>,
    cap: usize,
}

impl BoundedBuf {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
            cap,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Shorten to `len` bytes. No effect when already shorter.
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    /// Append one byte. Returns false (and leaves the buffer unchanged) when
    /// the buffer is already full.
    pub fn push(&mut self, b: u8) -> bool {
        if self.buf.len() >= self.cap {
            return false;
        }
        self.buf.push(b);
        true
    }

    /// Replace the contents. Fails when `s` exceeds capacity.
    pub fn set(&mut self, s: &str) -> Result<(), usize> {
        if s.len() > self.cap {
            return Err(self.cap);
        }
        self.buf.clear();
        self.buf.extend_from_slice(s.as_bytes());
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// View as UTF-8, if the accumulated bytes form valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.buf).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_respects_capacity() {
        let mut buf = BoundedBuf::new(2);
        assert!(buf.push(b'a'));
        assert!(buf.push(b'b'));
        assert!(!buf.push(b'c'));
        assert_eq!(buf.as_bytes(), b"ab");
    }

    #[test]
    fn test_set_rejects_oversized() {
        let mut buf = BoundedBuf::new(4);
        assert!(buf.set("1234").is_ok());
        assert_eq!(buf.set("12345"), Err(4));
        // Failed set leaves previous contents intact
        assert_eq!(buf.as_str(), Some("1234"));
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let mut buf = BoundedBuf::new(3);
        buf.set("abc").unwrap();
        buf.clear();
        assert!(buf.is_empty());
        assert!(buf.push(b'x'));
    }

    #[test]
    fn test_as_str_rejects_invalid_utf8() {
        let mut buf = BoundedBuf::new(2);
        buf.push(0xFF);
        assert_eq!(buf.as_str(), None);
    }
}
