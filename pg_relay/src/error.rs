/// How a stage failure should be handled by the caller.
///
/// Every stage classifies errors from the stage below it and re-emits them
/// with its own classification. Retries happen at the lowest level that can
/// correct the fault; anything surfacing as [`ErrorKind::Fatal`] stops the
/// pipeline before the checkpointer advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry with backoff from the last acknowledged position.
    Transient,
    /// Stop the pipeline.
    Fatal,
    /// The input is malformed and must be rejected.
    Validation,
    /// A lookup missed; the caller decides what that means.
    NotFound,
}

pub trait Classify {
    fn kind(&self) -> ErrorKind;

    fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}
