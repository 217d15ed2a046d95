/// Aborts the wrapped tokio task when dropped. Used to tie background work,
/// eg reverse-forward listeners or stdin pumps, to the lifetime of whatever
/// owns the handle.
pub struct AbortOnDrop {
  inner: tokio::task::AbortHandle,
}

impl AbortOnDrop {
  pub fn new<T>(inner: tokio::task::JoinHandle<T>) -> Self {
    Self {
      inner: inner.abort_handle(),
    }
  }
}

impl Drop for AbortOnDrop {
  fn drop(&mut self) {
    self.inner.abort();
  }
}
