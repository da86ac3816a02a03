//! Reassembly of results fetched in fragments.
//!
//! Some commands return a long result piecewise: the host asks for the bytes
//! starting at an offset and the controller answers with one fragment plus
//! the number of bytes remaining, this fragment included (Read_Local_AMP_ASSOC
//! is the canonical case). [`FragmentAssembly`] validates and concatenates
//! the fragments; [`FragmentFetch`] drives the request loop lazily.

use core::iter::FusedIterator;

use crate::error::{HciError, ProtocolError};

/// One piece of a fragmented result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Offset of `data` within the full result.
    pub offset: usize,
    /// Bytes still to come, counting `data` itself.
    pub remaining: usize,
    /// Fragment payload.
    pub data: Vec<u8>,
}

/// Progress of one assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyState {
    /// More fragments are expected.
    Collecting,
    /// Every byte has arrived.
    Complete,
    /// A fragment was inconsistent; the buffer was cleared.
    Aborted,
}

/// Accumulates fragments into one buffer.
#[derive(Debug, Clone)]
pub struct FragmentAssembly {
    buffer: Vec<u8>,
    expected_total: Option<usize>,
    max_total: usize,
    state: AssemblyState,
}

impl FragmentAssembly {
    /// Empty assembly accepting results up to `max_total` bytes.
    #[must_use]
    pub fn new(max_total: usize) -> Self {
        Self {
            buffer: Vec::new(),
            expected_total: None,
            max_total,
            state: AssemblyState::Collecting,
        }
    }

    /// Where the assembly stands.
    #[must_use]
    pub fn state(&self) -> AssemblyState {
        self.state
    }

    /// Offset the next fragment must start at.
    #[must_use]
    pub fn next_offset(&self) -> usize {
        self.buffer.len()
    }

    /// Total announced by the first fragment.
    #[must_use]
    pub fn expected_total(&self) -> Option<usize> {
        self.expected_total
    }

    /// Append a fragment.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::FragmentOffsetMismatch`] when `fragment.offset` is
    ///   not [`next_offset`](Self::next_offset).
    /// - [`ProtocolError::FragmentLengthMismatch`] when the total implied by
    ///   the fragment differs from the first fragment's, or the payload is
    ///   longer than `remaining`.
    /// - [`ProtocolError::StalledFragment`] for an empty fragment while bytes
    ///   remain.
    /// - [`ProtocolError::AssemblyAborted`] after an earlier failure.
    /// - [`HciError::BufferTooSmall`] when the announced total exceeds the
    ///   assembly's bound.
    ///
    /// Every error except `AssemblyAborted` aborts the assembly and clears
    /// the buffer.
    pub fn accept(&mut self, fragment: Fragment) -> Result<AssemblyState, HciError> {
        match self.check(&fragment) {
            Ok(total) => {
                self.expected_total = Some(total);
                let done = fragment.data.len() == fragment.remaining;
                self.buffer.extend_from_slice(&fragment.data);
                if done {
                    self.state = AssemblyState::Complete;
                }
                Ok(self.state)
            }
            Err(HciError::Protocol(ProtocolError::AssemblyAborted)) => {
                Err(ProtocolError::AssemblyAborted.into())
            }
            Err(e) => {
                tracing::warn!(error = %e, offset = fragment.offset, "fragment assembly aborted");
                self.abort();
                Err(e)
            }
        }
    }

    /// Validate `fragment`, returning the total it implies.
    fn check(&self, fragment: &Fragment) -> Result<usize, HciError> {
        let expected = self.next_offset();
        let reported = fragment.offset.saturating_add(fragment.remaining);
        match self.state {
            AssemblyState::Aborted => return Err(ProtocolError::AssemblyAborted.into()),
            AssemblyState::Complete => {
                return Err(ProtocolError::FragmentLengthMismatch {
                    expected,
                    reported: reported.saturating_add(fragment.data.len()),
                }
                .into())
            }
            AssemblyState::Collecting => {}
        }
        if fragment.offset != expected {
            return Err(ProtocolError::FragmentOffsetMismatch {
                expected,
                got: fragment.offset,
            }
            .into());
        }
        if let Some(total) = self.expected_total {
            if reported != total {
                return Err(ProtocolError::FragmentLengthMismatch {
                    expected: total,
                    reported,
                }
                .into());
            }
        } else if reported > self.max_total {
            return Err(HciError::BufferTooSmall {
                needed: reported,
                capacity: self.max_total,
            });
        }
        if fragment.data.len() > fragment.remaining {
            return Err(ProtocolError::FragmentLengthMismatch {
                expected: reported,
                reported: fragment.offset.saturating_add(fragment.data.len()),
            }
            .into());
        }
        if fragment.data.is_empty() && fragment.remaining > 0 {
            return Err(ProtocolError::StalledFragment {
                offset: fragment.offset,
            }
            .into());
        }
        Ok(reported)
    }

    /// Clear the buffer and mark the assembly failed.
    pub fn abort(&mut self) {
        self.buffer.clear();
        self.expected_total = None;
        self.state = AssemblyState::Aborted;
    }

    /// Back to an empty, collecting assembly.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.expected_total = None;
        self.state = AssemblyState::Collecting;
    }

    /// Bytes collected so far.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Take the assembled bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

/// Something that can produce the fragment starting at an offset.
pub trait FragmentSource {
    /// Fetch the fragment at `offset`.
    ///
    /// # Errors
    ///
    /// Whatever the underlying request fails with.
    fn fetch(&mut self, offset: usize) -> Result<Fragment, HciError>;
}

impl<F> FragmentSource for F
where
    F: FnMut(usize) -> Result<Fragment, HciError>,
{
    fn fetch(&mut self, offset: usize) -> Result<Fragment, HciError> {
        self(offset)
    }
}

/// Lazy fetch-and-append loop.
///
/// Each `next()` issues one request at the current offset and yields the
/// number of bytes appended. The sequence ends after the final fragment or
/// the first error. [`restart`](Self::restart) begins again from offset 0.
pub struct FragmentFetch<S> {
    source: S,
    assembly: FragmentAssembly,
    finished: bool,
}

impl<S: FragmentSource> FragmentFetch<S> {
    /// Fetch loop over `source`; nothing is requested until the first `next()`.
    #[must_use]
    pub fn new(source: S, max_total: usize) -> Self {
        Self {
            source,
            assembly: FragmentAssembly::new(max_total),
            finished: false,
        }
    }

    /// Progress so far.
    #[must_use]
    pub fn assembly(&self) -> &FragmentAssembly {
        &self.assembly
    }

    /// Discard progress and start over at offset 0.
    pub fn restart(&mut self) {
        self.assembly.reset();
        self.finished = false;
    }

    /// Drive the sequence to completion and return the assembled bytes.
    ///
    /// # Errors
    ///
    /// The first fetch or validation error.
    pub fn collect_all(mut self) -> Result<Vec<u8>, HciError> {
        for step in &mut self {
            step?;
        }
        Ok(self.assembly.into_bytes())
    }
}

impl<S: FragmentSource> Iterator for FragmentFetch<S> {
    type Item = Result<usize, HciError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let offset = self.assembly.next_offset();
        let fragment = match self.source.fetch(offset) {
            Ok(fragment) => fragment,
            Err(e) => {
                self.assembly.abort();
                self.finished = true;
                return Some(Err(e));
            }
        };
        let appended = fragment.data.len();
        match self.assembly.accept(fragment) {
            Ok(AssemblyState::Collecting) => Some(Ok(appended)),
            Ok(_) => {
                self.finished = true;
                Some(Ok(appended))
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

impl<S: FragmentSource> FusedIterator for FragmentFetch<S> {}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    clippy::cast_possible_truncation
)] // Tests use expect() and fixed-size test vectors
mod tests {
    use super::*;

    fn payload() -> Vec<u8> {
        (0..600u32).map(|i| (i % 251) as u8).collect()
    }

    fn fragment(full: &[u8], offset: usize, len: usize) -> Fragment {
        Fragment {
            offset,
            remaining: full.len() - offset,
            data: full[offset..offset + len].to_vec(),
        }
    }

    #[test]
    fn three_fragments_reassemble_exactly() {
        let full = payload();
        let mut assembly = FragmentAssembly::new(672);
        assert_eq!(assembly.accept(fragment(&full, 0, 248)), Ok(AssemblyState::Collecting));
        assert_eq!(assembly.accept(fragment(&full, 248, 248)), Ok(AssemblyState::Collecting));
        assert_eq!(assembly.accept(fragment(&full, 496, 104)), Ok(AssemblyState::Complete));
        assert_eq!(assembly.bytes(), &full[..]);
    }

    #[test]
    fn out_of_order_fragment_aborts() {
        let full = payload();
        let mut assembly = FragmentAssembly::new(672);
        assembly.accept(fragment(&full, 0, 248)).expect("first");
        let err = assembly.accept(fragment(&full, 496, 104)).expect_err("skips 248..496");
        assert_eq!(
            err,
            HciError::Protocol(ProtocolError::FragmentOffsetMismatch { expected: 248, got: 496 })
        );
        assert_eq!(assembly.state(), AssemblyState::Aborted);
        assert!(assembly.bytes().is_empty());
        assert_eq!(
            assembly.accept(fragment(&full, 0, 248)),
            Err(ProtocolError::AssemblyAborted.into())
        );
    }

    #[test]
    fn inconsistent_remaining_aborts() {
        let full = payload();
        let mut assembly = FragmentAssembly::new(672);
        assembly.accept(fragment(&full, 0, 248)).expect("first");
        let mut second = fragment(&full, 248, 248);
        second.remaining = 400;
        assert!(matches!(
            assembly.accept(second),
            Err(HciError::Protocol(ProtocolError::FragmentLengthMismatch {
                expected: 600,
                reported: 648
            }))
        ));
    }

    #[test]
    fn oversized_total_is_buffer_too_small() {
        let mut assembly = FragmentAssembly::new(100);
        let err = assembly
            .accept(Fragment { offset: 0, remaining: 600, data: vec![0; 10] })
            .expect_err("bound is 100");
        assert_eq!(err, HciError::BufferTooSmall { needed: 600, capacity: 100 });
    }

    #[test]
    fn fetch_is_lazy_and_restartable() {
        let full = payload();
        let mut requests = Vec::new();
        let source = |offset: usize| -> Result<Fragment, HciError> {
            requests.push(offset);
            let len = (full.len() - offset).min(248);
            Ok(fragment(&full, offset, len))
        };
        let mut fetch = FragmentFetch::new(source, 672);
        assert_eq!(fetch.next(), Some(Ok(248)));
        assert_eq!(fetch.assembly().next_offset(), 248);
        fetch.restart();
        let bytes = fetch.collect_all().expect("complete");
        assert_eq!(bytes, full);
        assert_eq!(requests, vec![0, 0, 248, 496]);
    }

    #[test]
    fn fetch_stops_after_error() {
        let mut fetch = FragmentFetch::new(
            |_offset: usize| -> Result<Fragment, HciError> {
                Err(HciError::Timeout {
                    opcode: crate::opcode::Opcode::READ_LOCAL_AMP_ASSOC,
                })
            },
            672,
        );
        assert!(matches!(fetch.next(), Some(Err(HciError::Timeout { .. }))));
        assert_eq!(fetch.next(), None);
    }
}
