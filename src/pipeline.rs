use crate::codec::Argument;

/// An ordered batch of commands sent as one write and paired with a
/// contiguous run of replies. Carries no I/O of its own: hand it to
/// `Client::call_pipeline` to execute it.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    stacked: Vec<Vec<Argument>>,
}

impl Pipeline {
    pub fn new() -> Pipeline {
        Pipeline { stacked: Vec::new() }
    }

    /// Stacks one command at the end of the batch.
    pub fn stack_call(&mut self, args: Vec<Argument>) {
        self.stacked.push(args);
    }

    pub fn stacked_count(&self) -> usize {
        self.stacked.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vec<Argument>> {
        self.stacked.iter()
    }

    pub(crate) fn into_args(self) -> Vec<Vec<Argument>> {
        self.stacked
    }
}
