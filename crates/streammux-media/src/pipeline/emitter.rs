//! Listener-style adapter over a [`Node`].

use super::Node;
use crate::error::Result;

type DataListener<T> = Box<dyn FnMut(&T)>;
type Listener = Box<dyn FnMut()>;

/// Wraps a node and dispatches its outputs to registered callbacks.
///
/// `data` listeners see every output in order, `done` listeners fire exactly
/// once per [`Emitter::flush`] after the flushed outputs, and `reset`
/// listeners fire on [`Emitter::reset`].
pub struct Emitter<N: Node> {
    node: N,
    on_data: Vec<DataListener<N::Output>>,
    on_done: Vec<Listener>,
    on_reset: Vec<Listener>,
}

impl<N: Node> Emitter<N> {
    pub fn new(node: N) -> Self {
        Self {
            node,
            on_data: Vec::new(),
            on_done: Vec::new(),
            on_reset: Vec::new(),
        }
    }

    pub fn on_data(&mut self, f: impl FnMut(&N::Output) + 'static) -> &mut Self {
        self.on_data.push(Box::new(f));
        self
    }

    pub fn on_done(&mut self, f: impl FnMut() + 'static) -> &mut Self {
        self.on_done.push(Box::new(f));
        self
    }

    pub fn on_reset(&mut self, f: impl FnMut() + 'static) -> &mut Self {
        self.on_reset.push(Box::new(f));
        self
    }

    pub fn push(&mut self, input: N::Input) -> Result<()> {
        let out = self.node.push(input)?;
        self.dispatch(&out);
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        let out = self.node.flush()?;
        self.dispatch(&out);
        for f in &mut self.on_done {
            f();
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.node.reset();
        for f in &mut self.on_reset {
            f();
        }
    }

    fn dispatch(&mut self, out: &[N::Output]) {
        for item in out {
            for f in &mut self.on_data {
                f(item);
            }
        }
    }
}
