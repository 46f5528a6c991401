//! Helpers for failures that are logged and then ignored.

/// Turns a `Result` into an `Option`, logging the error.
///
/// Used where a single failed kernel table write or lookup must not stop
/// the processing of other containers or tracers.
pub trait ResultOkLogExt<T> {
    /// Logs the error at `error` level.
    fn ok_log(self) -> Option<T>;

    /// Logs the error at `level`, prefixed with `context`.
    fn ok_log_at(self, level: log::Level, context: &str) -> Option<T>;
}

impl<T, E> ResultOkLogExt<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn ok_log(self) -> Option<T> {
        match self {
            Ok(ok) => Some(ok),
            Err(err) => {
                log::error!("{err}");
                None
            }
        }
    }

    fn ok_log_at(self, level: log::Level, context: &str) -> Option<T> {
        self.map_err(|err| log::log!(level, "{context}: {err}")).ok()
    }
}
