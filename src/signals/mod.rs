//! Signal and cancellation routing
//!
//! One listener owns SIGINT, SIGTERM, SIGQUIT, SIGHUP and SIGUSR1 for the
//! whole command. While an attach session holds a [`ForwardGuard`] the
//! signals are handed to it; otherwise they cancel the root token.

pub mod names;

pub use names::{parse_signal, signal_name};

use crate::error::Result;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const SIGHUP: i32 = libc::SIGHUP;
pub const SIGINT: i32 = libc::SIGINT;
pub const SIGQUIT: i32 = libc::SIGQUIT;
pub const SIGKILL: i32 = libc::SIGKILL;
pub const SIGUSR1: i32 = libc::SIGUSR1;
pub const SIGTERM: i32 = libc::SIGTERM;

/// Two interrupts closer together than this detach an attach session
pub const DOUBLE_INTERRUPT_WINDOW: Duration = Duration::from_secs(2);

#[derive(Default)]
struct RouterState {
    session: Option<mpsc::UnboundedSender<i32>>,
    inflight: BTreeMap<u64, String>,
    next_op: u64,
}

/// Root cancellation token plus the signal dispatch table
#[derive(Clone)]
pub struct SignalRouter {
    root: CancellationToken,
    state: Arc<Mutex<RouterState>>,
}

impl Default for SignalRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalRouter {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            state: Arc::new(Mutex::new(RouterState::default())),
        }
    }

    /// Token cancelled by user interrupts
    pub fn root(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Spawn the listener task
    pub fn install(&self) -> Result<JoinHandle<()>> {
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut quit = signal(SignalKind::quit())?;
        let mut hangup = signal(SignalKind::hangup())?;
        let mut usr1 = signal(SignalKind::user_defined1())?;
        let router = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                let sig = tokio::select! {
                    Some(()) = interrupt.recv() => SIGINT,
                    Some(()) = terminate.recv() => SIGTERM,
                    Some(()) = quit.recv() => SIGQUIT,
                    Some(()) = hangup.recv() => SIGHUP,
                    Some(()) = usr1.recv() => SIGUSR1,
                    else => break,
                };
                router.route(sig);
            }
        }))
    }

    /// Dispatch one received signal
    pub fn route(&self, sig: i32) {
        if sig == SIGUSR1 {
            eprintln!("{}", self.dump());
            return;
        }
        let session = self
            .state
            .lock()
            .ok()
            .and_then(|s| s.session.clone());
        if let Some(tx) = session {
            if tx.send(sig).is_ok() {
                return;
            }
        }
        match sig {
            SIGINT | SIGTERM | SIGHUP => {
                debug!("{} received, cancelling", signal_name(sig));
                self.root.cancel();
            }
            _ => debug!("ignoring {}", signal_name(sig)),
        }
    }

    /// Route signals to the caller until the guard is dropped
    pub fn forward(&self) -> ForwardGuard {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut state) = self.state.lock() {
            state.session = Some(tx);
        }
        ForwardGuard {
            router: self.clone(),
            rx,
        }
    }

    /// Register an in-flight operation for the SIGUSR1 dump
    pub fn track(&self, operation: impl Into<String>) -> OperationGuard {
        let mut id = 0;
        if let Ok(mut state) = self.state.lock() {
            id = state.next_op;
            state.next_op += 1;
            state.inflight.insert(id, operation.into());
        }
        OperationGuard {
            router: self.clone(),
            id,
        }
    }

    /// Backtrace and in-flight operations
    pub fn dump(&self) -> String {
        let mut out = String::from("=== runectl debug dump ===\nin-flight operations:\n");
        if let Ok(state) = self.state.lock() {
            for op in state.inflight.values() {
                out.push_str(&format!("  {}\n", op));
            }
            if state.session.is_some() {
                out.push_str("  (attach session holds signal forwarding)\n");
            }
        }
        out.push_str("backtrace:\n");
        out.push_str(&std::backtrace::Backtrace::force_capture().to_string());
        out
    }
}

/// Receives signals while an attach session is active
pub struct ForwardGuard {
    router: SignalRouter,
    rx: mpsc::UnboundedReceiver<i32>,
}

impl ForwardGuard {
    pub async fn recv(&mut self) -> Option<i32> {
        self.rx.recv().await
    }
}

impl Drop for ForwardGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.router.state.lock() {
            state.session = None;
        }
    }
}

pub struct OperationGuard {
    router: SignalRouter,
    id: u64,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.router.state.lock() {
            state.inflight.remove(&self.id);
        }
    }
}

/// What an attach session does with a received signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    Forward(i32),
    Detach,
}

/// Signal policy of one attach session
#[derive(Debug)]
pub struct SessionSignals {
    stop_signal: i32,
    last_interrupt: Option<Instant>,
}

impl SessionSignals {
    pub fn new(stop_signal: i32) -> Self {
        Self {
            stop_signal,
            last_interrupt: None,
        }
    }

    /// SIGTERM becomes the stop signal; a second SIGINT inside the window
    /// detaches
    pub fn handle(&mut self, sig: i32, now: Instant) -> SessionAction {
        match sig {
            SIGINT => {
                let repeated = self
                    .last_interrupt
                    .map(|last| now.duration_since(last) < DOUBLE_INTERRUPT_WINDOW)
                    .unwrap_or(false);
                self.last_interrupt = Some(now);
                if repeated {
                    SessionAction::Detach
                } else {
                    SessionAction::Forward(SIGINT)
                }
            }
            SIGTERM => SessionAction::Forward(self.stop_signal),
            other => SessionAction::Forward(other),
        }
    }
}
