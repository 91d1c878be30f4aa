/// User-visible channel for unrecoverable load and inference failures
pub trait Notifier: Send {
    fn alert(&mut self, message: &str);
}

/// Surfaces failures as error events
#[derive(Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn alert(&mut self, message: &str) {
        tracing::error!("{}", message);
    }
}
