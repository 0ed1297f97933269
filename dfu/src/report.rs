use log::Level;

/// Receiver for user-facing log lines and transfer progress.
///
/// Passed in when a session is created; nothing the sink returns
/// influences the transfer.
pub trait Reporter {
    fn log(&self, level: Level, message: &str);

    /// `total` is `None` when the amount of data is not known up front.
    fn progress(&self, done: usize, total: Option<usize>);

    /// Called at most once per session, when the device leaves the bus.
    fn disconnected(&self) {}

    fn debug(&self, message: &str) {
        self.log(Level::Debug, message)
    }

    fn info(&self, message: &str) {
        self.log(Level::Info, message)
    }

    fn warn(&self, message: &str) {
        self.log(Level::Warn, message)
    }

    fn error(&self, message: &str) {
        self.log(Level::Error, message)
    }
}

/// Forwards everything to the [`log`] facade.
#[derive(Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn log(&self, level: Level, message: &str) {
        log::log!(level, "{message}");
    }

    fn progress(&self, done: usize, total: Option<usize>) {
        match total {
            Some(total) => log::debug!("Progress: {done}/{total}"),
            None => log::debug!("Progress: {done}"),
        }
    }

    fn disconnected(&self) {
        log::info!("Device disconnected");
    }
}
