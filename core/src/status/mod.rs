// Status module: bounded waits on status reports

pub mod window;

pub use window::{
    CompletionPolicy, PendingWindow, StatusWindows, WindowEnd, WindowOutcome, WindowRequest,
};
