use std::{
    cell::Cell,
    io::{self, Write},
};

use dfu_host::Reporter;
use log::Level;

const BAR_WIDTH: usize = 60;

/// Prints user-facing lines and a progress bar to the terminal.
pub(crate) struct ConsoleReporter {
    label: &'static str,
    last_done: Cell<Option<usize>>,
}

impl ConsoleReporter {
    pub(crate) fn new(label: &'static str) -> Self {
        ConsoleReporter {
            label,
            last_done: Cell::new(None),
        }
    }

    fn end_progress(&self) {
        if self.last_done.take().is_some() {
            println!();
        }
    }
}

impl Reporter for ConsoleReporter {
    fn log(&self, level: Level, message: &str) {
        match level {
            Level::Error | Level::Warn => {
                self.end_progress();
                eprintln!("{level}: {message}");
            }
            Level::Info => {
                self.end_progress();
                println!("{message}");
            }
            _ => log::log!(level, "{message}"),
        }
    }

    fn progress(&self, done: usize, total: Option<usize>) {
        // a new transfer phase started
        if self.last_done.get().is_some_and(|last| done < last) {
            println!();
        }
        self.last_done.set(Some(done));

        match total {
            Some(total) if total > 0 => {
                let done = done.min(total);
                let filled = (BAR_WIDTH * done) / total;
                print!(
                    "\r  {} {:3}% [{}]",
                    self.label,
                    (100 * done) / total,
                    "#".repeat(filled) + &" ".repeat(BAR_WIDTH - filled)
                );
            }
            _ => print!("\r  {} {done} bytes", self.label),
        }
        let _ = io::stdout().flush();
    }

    fn disconnected(&self) {
        self.end_progress();
    }
}

impl Drop for ConsoleReporter {
    fn drop(&mut self) {
        self.end_progress();
    }
}
