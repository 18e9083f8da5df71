//! Real vs. predicted display state.
//!
//! `Uninitialized -> Real -> Optimistic -> Real -> ...`. An optimistic value
//! is always provisional: the next server-confirmed value replaces it, and a
//! failed request discards it.

#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticState<T> {
    real: Option<T>,
    optimistic: Option<T>,
}

impl<T> Default for OptimisticState<T> {
    fn default() -> Self {
        Self {
            real: None,
            optimistic: None,
        }
    }
}

impl<T> OptimisticState<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Server truth wins on arrival, discarding any prediction.
    pub fn set_real(&mut self, value: T) {
        self.real = Some(value);
        self.optimistic = None;
    }

    /// Installs a prediction. Refused (returns `false`) while another
    /// prediction is still displayed.
    pub fn set_optimistic(&mut self, value: T) -> bool {
        if self.optimistic.is_some() {
            return false;
        }
        self.optimistic = Some(value);
        true
    }

    /// Drops the prediction, if any. Returns whether one was dropped.
    pub fn reset_to_real(&mut self) -> bool {
        self.optimistic.take().is_some()
    }

    /// What a renderer should show: prediction, else real, else nothing.
    pub fn value(&self) -> Option<&T> {
        self.optimistic.as_ref().or(self.real.as_ref())
    }

    pub fn real(&self) -> Option<&T> {
        self.real.as_ref()
    }

    pub fn is_optimistic(&self) -> bool {
        self.optimistic.is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.real.is_some()
    }
}
