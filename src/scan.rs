//! Incremental byte-scanning primitives.
//!
//! These are the only functions that touch raw transport bytes. They consume
//! one byte at a time from any `AsyncRead` source and never buffer more than
//! the caller's bounded output, so a live socket and an in-memory fixture
//! parse identically.
//!
//! Matching keeps a rolling prefix counter per terminator: a matching byte
//! advances the counter, a mismatching byte resets it to zero. When several
//! terminators are tracked at once each has an independent counter and the
//! first to reach full length wins (first-match, not longest-match).

use crate::bounded::BoundedBuf;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// How a bounded copy ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyEnd {
    /// Terminator reached; it was consumed but not copied.
    Terminator,
    /// Output buffer filled before the terminator appeared. The overflowing
    /// byte is consumed and dropped.
    Capacity,
    /// Source exhausted.
    Eof,
}

/// Read until one of `patterns` has been fully matched.
///
/// Returns the index of the first pattern to complete, or `None` when the
/// source is exhausted first. With `skip_whitespace`, a whitespace byte that
/// no pattern expects leaves all counters untouched instead of resetting
/// them (whitespace *inside* a pattern still matches normally). With
/// `case_insensitive`, input bytes are ASCII-lowercased before comparison;
/// patterns must already be lowercase.
pub async fn find_first<R: AsyncRead + Unpin>(
    r: &mut R,
    patterns: &[&str],
    skip_whitespace: bool,
    case_insensitive: bool,
) -> io::Result<Option<usize>> {
    let mut progress = vec![0usize; patterns.len()];

    loop {
        let b = match read_byte(r).await? {
            Some(b) => b,
            None => return Ok(None),
        };
        let c = if case_insensitive {
            b.to_ascii_lowercase()
        } else {
            b
        };

        for (i, pat) in patterns.iter().enumerate() {
            let bytes = pat.as_bytes();
            if c == bytes[progress[i]] {
                progress[i] += 1;
                if progress[i] == bytes.len() {
                    return Ok(Some(i));
                }
            } else if !(skip_whitespace && c.is_ascii_whitespace()) {
                progress[i] = 0;
            }
        }
    }
}

/// Single-pattern convenience wrapper around [`find_first`].
pub async fn find<R: AsyncRead + Unpin>(
    r: &mut R,
    pattern: &str,
    skip_whitespace: bool,
) -> io::Result<bool> {
    Ok(find_first(r, &[pattern], skip_whitespace, false)
        .await?
        .is_some())
}

/// Copy bytes verbatim into `out` until `terminator` is read. The terminator
/// is consumed but excluded from the output.
pub async fn copy_until<R: AsyncRead + Unpin>(
    r: &mut R,
    terminator: u8,
    out: &mut BoundedBuf,
) -> io::Result<CopyEnd> {
    loop {
        let b = match read_byte(r).await? {
            Some(b) => b,
            None => return Ok(CopyEnd::Eof),
        };
        if b == terminator {
            return Ok(CopyEnd::Terminator);
        }
        if !out.push(b) {
            return Ok(CopyEnd::Capacity);
        }
    }
}

/// Copy up to the next `\n` into `out`, dropping a trailing `\r`.
pub async fn read_line<R: AsyncRead + Unpin>(
    r: &mut R,
    out: &mut BoundedBuf,
) -> io::Result<CopyEnd> {
    let end = copy_until(r, b'\n', out).await?;
    if end == CopyEnd::Terminator && out.as_bytes().last() == Some(&b'\r') {
        out.truncate(out.len() - 1);
    }
    Ok(end)
}

/// Read one byte, mapping clean EOF to `None`.
pub(crate) async fn read_byte<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Option<u8>> {
    match r.read_u8().await {
        Ok(b) => Ok(Some(b)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_find_simple() {
        let mut src: &[u8] = b"xxx\"data\":\"42\"";
        assert!(find(&mut src, "\"data\":\"", false).await.unwrap());
        // Cursor is positioned right after the match
        let mut out = BoundedBuf::new(8);
        assert_eq!(
            copy_until(&mut src, b'"', &mut out).await.unwrap(),
            CopyEnd::Terminator
        );
        assert_eq!(out.as_str(), Some("42"));
    }

    #[tokio::test]
    async fn test_find_not_found_on_exhaustion() {
        let mut src: &[u8] = b"nothing here";
        assert!(!find(&mut src, "\"data\":\"", false).await.unwrap());
    }

    #[tokio::test]
    async fn test_find_first_returns_first_match() {
        let mut src: &[u8] = b"..\"w\":\"app\"";
        let found = find_first(&mut src, &["\"d\":\"", "\"w\":\"", "}"], false, false)
            .await
            .unwrap();
        assert_eq!(found, Some(1));
    }

    #[tokio::test]
    async fn test_skip_whitespace_preserves_progress() {
        // Space between tokens must not reset the rolling match.
        let mut src: &[u8] = b"\"path\": \"/CH0\"";
        assert!(find(&mut src, "\"path\":\"/", true).await.unwrap());
    }

    #[tokio::test]
    async fn test_whitespace_inside_pattern_matches() {
        let mut src: &[u8] = b"LOCATION: https://x\r\n";
        let found = find_first(&mut src, &["location: http", "\r\n\r\n"], true, true)
            .await
            .unwrap();
        assert_eq!(found, Some(0));
    }

    #[tokio::test]
    async fn test_mismatch_resets_counter() {
        // Rolling counters reset on mismatch without re-checking the
        // mismatching byte, so overlapping prefixes are not recovered.
        let mut src: &[u8] = b"aaab";
        assert!(!find(&mut src, "aab", false).await.unwrap());
    }

    #[tokio::test]
    async fn test_copy_until_capacity() {
        let mut src: &[u8] = b"0123456789\"";
        let mut out = BoundedBuf::new(4);
        assert_eq!(
            copy_until(&mut src, b'"', &mut out).await.unwrap(),
            CopyEnd::Capacity
        );
        assert_eq!(out.as_str(), Some("0123"));
    }

    #[tokio::test]
    async fn test_read_line_trims_cr() {
        let mut src: &[u8] = b"cancel\r\nrest";
        let mut out = BoundedBuf::new(16);
        assert_eq!(read_line(&mut src, &mut out).await.unwrap(), CopyEnd::Terminator);
        assert_eq!(out.as_str(), Some("cancel"));
    }

    #[tokio::test]
    async fn test_read_line_eof() {
        let mut src: &[u8] = b"partial";
        let mut out = BoundedBuf::new(16);
        assert_eq!(read_line(&mut src, &mut out).await.unwrap(), CopyEnd::Eof);
        assert_eq!(out.as_str(), Some("partial"));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // A pattern planted after filler that shares no bytes with it is
            // always found, and the cursor lands exactly past the match.
            #[test]
            fn find_locates_planted_pattern(
                filler in "[a-m]{0,64}",
                tail in "[a-z]{0,16}",
            ) {
                let pattern = "nopq";
                let input = format!("{filler}{pattern}{tail}");
                let rt = tokio::runtime::Builder::new_current_thread()
                    .build()
                    .unwrap();
                let (found, rest) = rt.block_on(async {
                    let mut src: &[u8] = input.as_bytes();
                    let found = find(&mut src, pattern, false).await.unwrap();
                    (found, src.to_vec())
                });
                prop_assert!(found);
                prop_assert_eq!(rest, tail.as_bytes());
            }
        }
    }
}
