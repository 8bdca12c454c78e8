//! CheckStream
//!
//! The accounting sink every streamed body runs through: rolling MD5, byte
//! count, a hard byte budget, and an idle deadline. Uploads tee into one of
//! these alongside the storage-node streams; downloads verify through one
//! on the way out.
//!
//! Write-once discipline: after `finish` or `abandon` (or a terminal
//! error), further writes are silently dropped and the deadline never
//! rearms.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// MD5 of the empty byte sequence, base64
pub const ZERO_BYTE_MD5: &str = "1B2M2Y8AsgTpgAmY7PhCfg==";

/// Terminal failures a CheckStream can report
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CheckStreamError {
    /// The byte budget was crossed
    #[error("stream exceeded {0} bytes")]
    LengthExceeded(u64),
    /// No bytes arrived within the idle window
    #[error("stream idle past deadline")]
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Active,
    Abandoned,
    Errored,
}

/// Hashing, counting, capping, idle-timing byte sink
pub struct CheckStream {
    context: md5::Context,
    bytes: u64,
    max_bytes: u64,
    idle: Duration,
    deadline: Instant,
    state: State,
}

impl std::fmt::Debug for CheckStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckStream")
            .field("bytes", &self.bytes)
            .field("max_bytes", &self.max_bytes)
            .field("idle", &self.idle)
            .field("deadline", &self.deadline)
            .field("state", &self.state)
            .finish()
    }
}

impl CheckStream {
    /// The deadline arms immediately: a client that never sends a byte
    /// times out too.
    pub fn new(max_bytes: u64, idle: Duration) -> Self {
        Self {
            context: md5::Context::new(),
            bytes: 0,
            max_bytes,
            idle,
            deadline: Instant::now() + idle,
            state: State::Active,
        }
    }

    /// A verifying stream with no byte budget (downloads)
    pub fn verifier(idle: Duration) -> Self {
        Self::new(u64::MAX, idle)
    }

    /// Feed one chunk. Rearms the idle deadline on success. Writes after
    /// any terminal state are dropped without effect.
    pub fn write(&mut self, chunk: &[u8]) -> Result<(), CheckStreamError> {
        if self.state != State::Active {
            return Ok(());
        }
        let would_be = self.bytes.saturating_add(chunk.len() as u64);
        if would_be > self.max_bytes {
            self.state = State::Errored;
            return Err(CheckStreamError::LengthExceeded(self.max_bytes));
        }
        self.context.consume(chunk);
        self.bytes = would_be;
        self.deadline = Instant::now() + self.idle;
        Ok(())
    }

    /// The instant at which the stream goes idle-dead. Callers wrap their
    /// reads in `timeout_at(deadline())` and report back via
    /// [`CheckStream::mark_timed_out`].
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Record that the idle deadline fired
    pub fn mark_timed_out(&mut self) -> CheckStreamError {
        if self.state == State::Active {
            self.state = State::Errored;
        }
        CheckStreamError::TimedOut
    }

    /// Bytes accepted so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Finish and report `(md5 base64, bytes)`
    pub fn finish(self) -> (String, u64) {
        let digest = self.context.compute();
        (BASE64.encode(digest.0), self.bytes)
    }

    /// Drop all future input. Safe to call in any state, any number of
    /// times.
    pub fn abandon(&mut self) {
        if self.state == State::Active {
            self.state = State::Abandoned;
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == State::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_digest_and_count() {
        let mut check = CheckStream::new(u64::MAX, Duration::from_secs(45));
        check.write(b"hi").unwrap();
        check.write(b"\n").unwrap();
        let (md5, bytes) = check.finish();
        assert_eq!(bytes, 3);
        // md5 of "hi\n"
        assert_eq!(md5, BASE64.encode(md5::compute(b"hi\n").0));
    }

    #[test]
    fn test_zero_byte_constant() {
        let check = CheckStream::new(0, Duration::from_secs(1));
        let (md5, bytes) = check.finish();
        assert_eq!(bytes, 0);
        assert_eq!(md5, ZERO_BYTE_MD5);
    }

    #[test]
    fn test_cap_rejects_and_stops_counting() {
        let mut check = CheckStream::new(4, Duration::from_secs(45));
        check.write(b"ab").unwrap();
        let err = check.write(b"cde").unwrap_err();
        assert_eq!(err, CheckStreamError::LengthExceeded(4));
        // terminal: later writes silently dropped, count frozen
        check.write(b"x").unwrap();
        assert_eq!(check.bytes(), 2);
        assert!(!check.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_deadline() {
        let mut check = CheckStream::new(u64::MAX, Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(60)).await;
        check.write(b"x").unwrap();
        // the write rearmed the deadline
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(Instant::now() < check.deadline());

        tokio::time::sleep(Duration::from_millis(101)).await;
        assert!(Instant::now() >= check.deadline());
        assert_eq!(check.mark_timed_out(), CheckStreamError::TimedOut);

        // abandon after timeout is a no-op
        check.abandon();
        check.write(b"ignored").unwrap();
        assert_eq!(check.bytes(), 1);
    }

    #[test]
    fn test_abandon_is_idempotent() {
        let mut check = CheckStream::new(u64::MAX, Duration::from_secs(45));
        check.write(b"abc").unwrap();
        check.abandon();
        check.abandon();
        check.write(b"dropped").unwrap();
        assert_eq!(check.bytes(), 3);
    }

    proptest! {
        // P3: any byte sequence digests and counts exactly
        #[test]
        fn prop_digest_matches_md5(chunks in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..256), 0..16)) {
            let mut check = CheckStream::new(u64::MAX, Duration::from_secs(45));
            let mut all = Vec::new();
            for chunk in &chunks {
                check.write(chunk).unwrap();
                all.extend_from_slice(chunk);
            }
            let (md5, bytes) = check.finish();
            prop_assert_eq!(bytes, all.len() as u64);
            prop_assert_eq!(md5, BASE64.encode(md5::compute(&all).0));
        }
    }
}
