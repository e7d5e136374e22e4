//! Operator control channel.
//!
//! The session never reads the terminal.  Whoever drives it (the CLI's stdin
//! reader, a Ctrl-C handler, a test) holds a [`ControlSender`] and sends
//! [`ControlCommand`]s; the session polls the matching [`ControlReceiver`].
//!
//! `Quit` also raises a shared flag so the streaming loop can check for it
//! with a single atomic load per tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::time::Duration;

use mtwlink_types::BridgeError;

/// Commands an operator can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Leave the connection wait and start measuring.
    Start,
    /// Stop whatever phase is running and shut down.
    Quit,
}

/// How the streaming loop idles when no queue has data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Spin with a zero-duration yield.  Lowest latency, one core at 100%.
    BusyYield,
    /// Sleep until a producer signals new data or `timeout` elapses.
    Park { timeout: Duration },
}

impl Default for WaitStrategy {
    fn default() -> Self {
        WaitStrategy::Park {
            timeout: Duration::from_millis(1),
        }
    }
}

/// Create a connected sender/receiver pair.
pub fn control_channel() -> (ControlSender, ControlReceiver) {
    let (tx, rx) = mpsc::channel();
    let quit = Arc::new(AtomicBool::new(false));
    (
        ControlSender {
            tx,
            quit: Arc::clone(&quit),
        },
        ControlReceiver { rx, quit },
    )
}

/// Sending half.  Clone it for every input source.
#[derive(Debug, Clone)]
pub struct ControlSender {
    tx: mpsc::Sender<ControlCommand>,
    quit: Arc<AtomicBool>,
}

impl ControlSender {
    /// Send `command`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Channel`] when the session has already gone.
    pub fn send(&self, command: ControlCommand) -> Result<(), BridgeError> {
        if command == ControlCommand::Quit {
            self.quit.store(true, Ordering::SeqCst);
        }
        self.tx
            .send(command)
            .map_err(|e| BridgeError::Channel(format!("control send error: {e}")))
    }

    /// Raise the quit flag without going through the queue.  Safe to call
    /// from a signal handler thread after the receiver is gone.
    pub fn request_quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
    }
}

/// Receiving half, owned by the session.
#[derive(Debug)]
pub struct ControlReceiver {
    rx: mpsc::Receiver<ControlCommand>,
    quit: Arc<AtomicBool>,
}

impl ControlReceiver {
    /// `true` once any sender has asked to quit.
    pub fn quit_requested(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    /// Next pending command without blocking.
    ///
    /// Once every sender is gone nobody can ever stop the session, so a
    /// disconnected channel reads as [`ControlCommand::Quit`].
    pub fn try_recv(&self) -> Option<ControlCommand> {
        if self.quit_requested() {
            return Some(ControlCommand::Quit);
        }
        match self.rx.try_recv() {
            Ok(command) => Some(command),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(ControlCommand::Quit),
        }
    }

    /// Wait up to `timeout` for the next command.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ControlCommand> {
        if self.quit_requested() {
            return Some(ControlCommand::Quit);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(command) => Some(command),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(ControlCommand::Quit),
        }
    }
}
