use std::fmt;

/**
    A single `Range: bytes=start-[end]` request. `end == None` means
    "to the end of the file".
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    /**
        Parse a `Range` header value.

        Anything that is not `bytes=<start>-[<end>]` yields `None` and the
        request is served as if no range had been sent. An unparsable end
        is treated as open-ended.
    */
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let prefix = value.get(..6)?;
        if !prefix.eq_ignore_ascii_case("bytes=") {
            return None;
        }

        let (start, end) = value[6..].split_once('-')?;
        let start = start.trim().parse::<u64>().ok()?;
        let end = end.trim().parse::<u64>().ok();
        Some(Self { start, end })
    }

    /**
        Clamp against a file of `size` bytes. Returns the inclusive
        `(start, end)` to send, or `None` when the range is unsatisfiable.
    */
    pub fn resolve(&self, size: u64) -> Option<(u64, u64)> {
        let last = size.checked_sub(1)?;
        if self.start > last {
            return None;
        }
        let end = self.end.map_or(last, |e| e.min(last));
        if end < self.start {
            return None;
        }
        Some((self.start, end))
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "bytes {}-{}", self.start, end),
            None => write!(f, "bytes {}-", self.start),
        }
    }
}
