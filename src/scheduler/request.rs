//! Request records and control-line parsing.

/// Declared size of a request whose size is unknown.
pub const SIZE_UNKNOWN: i64 = -1;

/// One accepted request, from submission to completion accounting.
///
/// The name is the correlation key for completion notifications. The three
/// timestamps are millisecond epoch ticks: `arrival` orders requests across
/// the two queues, `started`/`completed` bound the service time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    name: String,
    size: i64,
    forced: bool,
    arrival: u64,
    started: Option<u64>,
    completed: Option<u64>,
}

impl Request {
    /// Parses a `"name,size"` submission line. Returns `None` for anything
    /// malformed; the caller drops such lines silently.
    pub fn parse(line: &str, arrival: u64) -> Option<Self> {
        let (name, size) = line.split_once(',')?;
        if name.is_empty() {
            return None;
        }
        let size = size.trim().parse::<i64>().ok()?;

        Some(Self {
            name: name.to_owned(),
            size,
            forced: false,
            arrival,
            started: None,
            completed: None,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared size; negative means unknown.
    #[inline]
    pub const fn size(&self) -> i64 {
        self.size
    }

    /// Whether the declared size is usable for size-aware decisions.
    #[inline]
    pub const fn is_sized(&self) -> bool {
        self.size > 0
    }

    #[inline]
    pub const fn arrival(&self) -> u64 {
        self.arrival
    }

    /// Set when the request is dispatched under timeout pressure rather
    /// than normal ordering.
    #[inline]
    pub const fn forced(&self) -> bool {
        self.forced
    }

    #[inline]
    pub(crate) fn mark_forced(&mut self) {
        self.forced = true;
    }

    #[inline]
    pub(crate) fn start(&mut self, now: u64) {
        self.started = Some(now);
    }

    #[inline]
    pub(crate) fn complete(&mut self, now: u64) {
        self.completed = Some(now);
    }

    /// Milliseconds between dispatch and completion; defined only once both
    /// stamps are set.
    #[inline]
    pub fn service_time(&self) -> Option<u64> {
        match (self.started, self.completed) {
            (Some(started), Some(completed)) => Some(completed.saturating_sub(started)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() {
        #[rustfmt::skip]
        let cases = [
            ("job1,100",  Some(("job1", 100))),
            ("a,0",       Some(("a", 0))),
            ("a,-1",      Some(("a", SIZE_UNKNOWN))),
            ("x.txt,42",  Some(("x.txt", 42))),

            ("",          None),
            ("name",      None),
            (",100",      None),
            ("a,",        None),
            ("a,big",     None),
        ];

        for (line, expected) in cases {
            let parsed = Request::parse(line, 7);

            match expected {
                Some((name, size)) => {
                    let request = parsed.unwrap();
                    assert_eq!(request.name(), name);
                    assert_eq!(request.size(), size);
                    assert_eq!(request.arrival(), 7);
                    assert!(!request.forced());
                }
                None => assert!(parsed.is_none()),
            }
        }
    }

    #[test]
    fn sized() {
        assert!(Request::parse("a,1", 0).unwrap().is_sized());
        assert!(!Request::parse("a,0", 0).unwrap().is_sized());
        assert!(!Request::parse("a,-1", 0).unwrap().is_sized());
    }

    #[test]
    fn service_time() {
        let mut request = Request::parse("a,10", 100).unwrap();

        assert_eq!(request.service_time(), None);
        request.start(150);
        assert_eq!(request.service_time(), None);
        request.complete(230);
        assert_eq!(request.service_time(), Some(80));
    }
}
