//! Push/flush/reset processing nodes.
//!
//! Every demuxer, muxer and adapter in this crate is a [`Node`]: it accepts
//! input through [`Node::push`], returns whatever output that input completed,
//! and hands back everything still buffered on [`Node::flush`]. Nodes compose
//! with [`pipe`], and [`Emitter`] turns any node back into a listener-style
//! interface for embedders that want callbacks.

mod emitter;
mod filter;
mod leftover;

pub use emitter::Emitter;
pub use filter::TrackFilter;
pub use leftover::Leftover;

use crate::error::Result;
use bytes::Bytes;
use std::marker::PhantomData;
use streammux_common::{ContainerInfo, Frame, Track};

/// A synchronous processing stage.
///
/// Outputs of one `push` are returned in the order they were produced.
/// `reset` must leave the node as if freshly constructed.
pub trait Node {
    type Input;
    type Output;

    fn push(&mut self, input: Self::Input) -> Result<Vec<Self::Output>>;

    /// Signal end of input and return everything still buffered.
    fn flush(&mut self) -> Result<Vec<Self::Output>>;

    fn reset(&mut self);
}

impl<N: Node + ?Sized> Node for Box<N> {
    type Input = N::Input;
    type Output = N::Output;

    fn push(&mut self, input: Self::Input) -> Result<Vec<Self::Output>> {
        (**self).push(input)
    }

    fn flush(&mut self) -> Result<Vec<Self::Output>> {
        (**self).flush()
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}

/// What a demuxer produces: container info and tracks once, then frames.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DemuxData {
    pub info: Option<ContainerInfo>,
    pub tracks: Option<Vec<Track>>,
    pub frames: Vec<Frame>,
}

impl DemuxData {
    pub fn init(info: ContainerInfo, tracks: Vec<Track>) -> Self {
        Self {
            info: Some(info),
            tracks: Some(tracks),
            frames: Vec::new(),
        }
    }

    pub fn frames(frames: Vec<Frame>) -> Self {
        Self {
            info: None,
            tracks: None,
            frames,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.info.is_none() && self.tracks.is_none() && self.frames.is_empty()
    }
}

/// Bytes in, [`DemuxData`] out.
pub trait Demuxer: Node<Input = Bytes, Output = DemuxData> {}

impl<T: Node<Input = Bytes, Output = DemuxData>> Demuxer for T {}

/// [`DemuxData`] in, encoded segments out.
pub trait Muxer: Node<Input = DemuxData, Output = Bytes> {}

impl<T: Node<Input = DemuxData, Output = Bytes>> Muxer for T {}

/// Result of a stateless probe over a stream prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub info: ContainerInfo,
    pub tracks: Vec<Track>,
}

/// Static, stateless inspection of a stream prefix.
pub trait Probe {
    /// Tracks and container info if `data` holds enough of the stream to
    /// know them, `None` otherwise.
    fn probe(data: &[u8]) -> Option<ProbeResult>;

    /// Like `probe`, but `data` is all of the input there will be, so
    /// streams still missing their configuration may be left out.
    fn probe_complete(data: &[u8]) -> Option<ProbeResult> {
        Self::probe(data)
    }
}

/// Two nodes chained: everything `upstream` emits is pushed into `downstream`.
#[derive(Debug)]
pub struct Pipe<A, B> {
    pub upstream: A,
    pub downstream: B,
}

/// Chain two nodes.
pub fn pipe<A, B>(upstream: A, downstream: B) -> Pipe<A, B>
where
    A: Node,
    B: Node<Input = A::Output>,
{
    Pipe {
        upstream,
        downstream,
    }
}

impl<A, B> Node for Pipe<A, B>
where
    A: Node,
    B: Node<Input = A::Output>,
{
    type Input = A::Input;
    type Output = B::Output;

    fn push(&mut self, input: Self::Input) -> Result<Vec<Self::Output>> {
        let mut out = Vec::new();
        for item in self.upstream.push(input)? {
            out.extend(self.downstream.push(item)?);
        }
        Ok(out)
    }

    fn flush(&mut self) -> Result<Vec<Self::Output>> {
        let mut out = Vec::new();
        for item in self.upstream.flush()? {
            out.extend(self.downstream.push(item)?);
        }
        out.extend(self.downstream.flush()?);
        Ok(out)
    }

    fn reset(&mut self) {
        self.upstream.reset();
        self.downstream.reset();
    }
}

/// Identity node.
#[derive(Debug)]
pub struct Passthrough<T> {
    _marker: PhantomData<fn(T) -> T>,
}

impl<T> Passthrough<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for Passthrough<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Node for Passthrough<T> {
    type Input = T;
    type Output = T;

    fn push(&mut self, input: T) -> Result<Vec<T>> {
        Ok(vec![input])
    }

    fn flush(&mut self) -> Result<Vec<T>> {
        Ok(Vec::new())
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Splits input strings into words, holding back the last partial word.
    struct Words {
        pending: String,
    }

    impl Node for Words {
        type Input = String;
        type Output = String;

        fn push(&mut self, input: String) -> Result<Vec<String>> {
            self.pending.push_str(&input);
            let mut out: Vec<String> = self.pending.split(' ').map(str::to_string).collect();
            self.pending = out.pop().unwrap_or_default();
            Ok(out.into_iter().filter(|w| !w.is_empty()).collect())
        }

        fn flush(&mut self) -> Result<Vec<String>> {
            let last = std::mem::take(&mut self.pending);
            Ok(if last.is_empty() { vec![] } else { vec![last] })
        }

        fn reset(&mut self) {
            self.pending.clear();
        }
    }

    struct Upper;

    impl Node for Upper {
        type Input = String;
        type Output = String;

        fn push(&mut self, input: String) -> Result<Vec<String>> {
            Ok(vec![input.to_uppercase()])
        }

        fn flush(&mut self) -> Result<Vec<String>> {
            Ok(vec!["!".to_string()])
        }

        fn reset(&mut self) {}
    }

    #[test]
    fn test_pipe_forwards_push_and_flush() {
        let mut p = pipe(
            Words {
                pending: String::new(),
            },
            Upper,
        );
        assert_eq!(p.push("ab c".into()).unwrap(), vec!["AB"]);
        assert_eq!(p.push("d e".into()).unwrap(), vec!["CD"]);
        assert_eq!(p.flush().unwrap(), vec!["E", "!"]);
    }

    #[test]
    fn test_pipe_reset_clears_upstream() {
        let mut p = pipe(
            Words {
                pending: String::new(),
            },
            Upper,
        );
        p.push("abc".into()).unwrap();
        p.reset();
        assert_eq!(p.flush().unwrap(), vec!["!"]);
    }

    #[test]
    fn test_passthrough() {
        let mut p = Passthrough::<u8>::new();
        assert_eq!(p.push(3).unwrap(), vec![3]);
        assert!(p.flush().unwrap().is_empty());
    }

    #[test]
    fn test_boxed_node_is_node() {
        let mut boxed: Box<dyn Node<Input = String, Output = String>> = Box::new(Upper);
        assert_eq!(boxed.push("x".into()).unwrap(), vec!["X"]);
    }
}
