/// Presentation sink for the active unit of a [`Controller`](crate::Controller).
///
/// The controller calls [`present`](PresentationSink::present) after every swap,
/// once the previous unit has been retired, and [`clear`](PresentationSink::clear)
/// when no unit is active.
pub trait PresentationSink<K, T>: Send {
    /// Display `unit`, the newly installed variant for `key`.
    fn present(&mut self, key: &K, unit: &T);

    /// Remove the displayed unit.
    fn clear(&mut self);
}

impl<K, T> PresentationSink<K, T> for () {
    fn present(&mut self, key: &K, unit: &T) {
        let _ = key;
        let _ = unit;
    }

    fn clear(&mut self) {}
}

impl<K, T, S: PresentationSink<K, T> + ?Sized> PresentationSink<K, T> for Box<S> {
    fn present(&mut self, key: &K, unit: &T) {
        (**self).present(key, unit)
    }

    fn clear(&mut self) {
        (**self).clear()
    }
}
