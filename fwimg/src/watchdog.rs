//! Watchdog refresh hook used inside long-running flash loops.

/// Independent watchdog that must be refreshed before its window expires.
pub trait Watchdog {
    fn refresh(&mut self);
}

impl<T: Watchdog + ?Sized> Watchdog for &mut T {
    fn refresh(&mut self) {
        (**self).refresh()
    }
}

/// For targets running without a watchdog.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWatchdog;

impl Watchdog for NoWatchdog {
    fn refresh(&mut self) {}
}

/// Counts refreshes. Handy when a host tool wants to show progress.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshCounter(pub usize);

impl Watchdog for RefreshCounter {
    fn refresh(&mut self) {
        self.0 += 1;
    }
}
