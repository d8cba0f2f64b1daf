//! Generic observer callback traits and implementations.
//!
//! Transfer engines report three observer streams: coarse progress, byte
//! accounting, and structural events. All observers are synchronous sinks
//! invoked from the worker that triggered them; implementations that need
//! to do asynchronous work must queue internally and return promptly.

use std::marker::PhantomData;

/// Callback for coarse progress updates.
///
/// Type parameter `C` is the checkpoint document type, so download and
/// upload report their own checkpoint shape through the same trait.
pub trait ProgressCallback<C>: Send + Sync {
    /// Called with the completion fraction (`0.0..=1.0`) and a snapshot of
    /// the current checkpoint document.
    fn on_progress(&self, percent: f64, checkpoint: &C);
}

/// Callback for a stream of event values.
///
/// Type parameter `T` is the event type, allowing byte-accounting and
/// structural event streams to share the same callback pattern.
pub trait EventCallback<T>: Send + Sync {
    /// Called with each event as it occurs.
    fn on_event(&self, event: &T);
}

/// A no-op observer usable for either trait.
pub struct NoOpObserver;

impl<C> ProgressCallback<C> for NoOpObserver {
    fn on_progress(&self, _percent: f64, _checkpoint: &C) {}
}

impl<T> EventCallback<T> for NoOpObserver {
    fn on_event(&self, _event: &T) {}
}

/// A progress callback that wraps a closure.
pub struct FnProgress<F, C> {
    callback: F,
    _marker: PhantomData<fn(&C)>,
}

impl<F, C> FnProgress<F, C>
where
    F: Fn(f64, &C) + Send + Sync,
{
    /// Create a new closure-based progress callback.
    pub fn new(callback: F) -> Self {
        Self {
            callback,
            _marker: PhantomData,
        }
    }
}

impl<F, C> ProgressCallback<C> for FnProgress<F, C>
where
    F: Fn(f64, &C) + Send + Sync,
{
    fn on_progress(&self, percent: f64, checkpoint: &C) {
        (self.callback)(percent, checkpoint)
    }
}

/// An event callback that wraps a closure.
pub struct FnEvent<F, T> {
    callback: F,
    _marker: PhantomData<fn(&T)>,
}

impl<F, T> FnEvent<F, T>
where
    F: Fn(&T) + Send + Sync,
{
    /// Create a new closure-based event callback.
    pub fn new(callback: F) -> Self {
        Self {
            callback,
            _marker: PhantomData,
        }
    }
}

impl<F, T> EventCallback<T> for FnEvent<F, T>
where
    F: Fn(&T) + Send + Sync,
{
    fn on_event(&self, event: &T) {
        (self.callback)(event)
    }
}

/// Create a progress callback from a closure.
pub fn progress_fn<F, C>(f: F) -> FnProgress<F, C>
where
    F: Fn(f64, &C) + Send + Sync,
{
    FnProgress::new(f)
}

/// Create an event callback from a closure.
pub fn event_fn<F, T>(f: F) -> FnEvent<F, T>
where
    F: Fn(&T) + Send + Sync,
{
    FnEvent::new(f)
}
