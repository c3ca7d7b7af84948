// File: src/runtime/async_bridge.rs
//
// Bridge between asynchronous natives and the single-threaded VM loop.
// An async native receives a `Completion` handle, usually moves it into a
// future spawned on the shared tokio runtime, and completes it with a
// `HostValue`. Results travel back over a tokio mpsc channel and are only
// turned into runtime values on the VM thread.
//
// This module provides:
// - The lazily built tokio runtime (AsyncBridge::runtime)
// - Completion tickets (Completion)
// - Thread-safe result values (HostValue)
// - Task spawning (spawn_task)
// - Marshaling results back to the waiting fiber (AsyncBridge::wait)

use crate::errors::VmFault;
use crate::runtime::context::{ErrorKind, RuntimeContext};
use crate::value::Value;
use ahash::AHashMap;
use once_cell::sync::Lazy;
use std::future::Future;
use std::rc::Rc;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Shared tokio runtime, built on first use. A build failure is kept so
/// every later async call can report it instead of panicking.
static RUNTIME: Lazy<Result<Runtime, String>> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .thread_name("strand-async")
        .enable_all()
        .build()
        .map_err(|err| err.to_string())
});

/// A result produced off the VM thread; converted to a `Value` on arrival
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Nil,
    Int(i64),
    Double(f64),
    Str(String),
    Error { kind: ErrorKind, message: String },
}

impl HostValue {
    pub fn into_value(self, ctx: &RuntimeContext) -> Value {
        match self {
            HostValue::Nil => Value::Nil,
            HostValue::Int(n) => Value::Int(n),
            HostValue::Double(d) => Value::Double(d),
            HostValue::Str(s) => Value::Str(Rc::from(s)),
            HostValue::Error { kind, message } => ctx.error(kind, message),
        }
    }
}

/// One-shot completion handle for an async native call
pub struct Completion {
    ticket: u64,
    sender: Option<UnboundedSender<(u64, HostValue)>>,
}

impl Completion {
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Delivers the result; callable from any thread or task
    pub fn complete(mut self, value: HostValue) {
        if let Some(sender) = self.sender.take() {
            // The VM may already be gone; nothing is waiting then
            let _ = sender.send((self.ticket, value));
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send((
                self.ticket,
                HostValue::Error {
                    kind: ErrorKind::IllegalArgument,
                    message: "async native finished without completing".to_string(),
                },
            ));
        }
    }
}

/// Spawns `future` on the shared runtime and completes `completion` with
/// its output. Without a runtime the completion carries the build error.
pub fn spawn_task<F>(completion: Completion, future: F)
where
    F: Future<Output = HostValue> + Send + 'static,
{
    match AsyncBridge::runtime() {
        Ok(runtime) => {
            runtime.spawn(async move { completion.complete(future.await) });
        }
        Err(reason) => {
            tracing::warn!(ticket = completion.ticket(), %reason, "async runtime unavailable");
            completion.complete(HostValue::Error {
                kind: ErrorKind::Io,
                message: format!("async runtime unavailable: {}", reason),
            });
        }
    }
}

/// VM-side end of the completion channel
pub struct AsyncBridge {
    sender: UnboundedSender<(u64, HostValue)>,
    receiver: UnboundedReceiver<(u64, HostValue)>,
    next_ticket: u64,
    /// Results that arrived while waiting for a different ticket
    ready: AHashMap<u64, HostValue>,
}

impl AsyncBridge {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self { sender, receiver, next_ticket: 0, ready: AHashMap::new() }
    }

    /// The global runtime, or the reason it could not be built
    pub fn runtime() -> Result<&'static Runtime, &'static str> {
        RUNTIME.as_ref().map_err(|err| err.as_str())
    }

    pub fn completion(&mut self) -> Completion {
        self.next_ticket += 1;
        Completion { ticket: self.next_ticket, sender: Some(self.sender.clone()) }
    }

    /// Blocks the VM thread until the result for `ticket` arrives
    pub fn wait(&mut self, ticket: u64) -> Result<HostValue, VmFault> {
        if let Some(value) = self.ready.remove(&ticket) {
            return Ok(value);
        }
        loop {
            let (arrived, value) = match self.receiver.try_recv() {
                Ok(message) => message,
                Err(mpsc::error::TryRecvError::Disconnected) => return Err(VmFault::CompletionLost),
                Err(mpsc::error::TryRecvError::Empty) => {
                    let runtime = Self::runtime().map_err(|_| VmFault::CompletionLost)?;
                    runtime.block_on(self.receiver.recv()).ok_or(VmFault::CompletionLost)?
                }
            };
            tracing::debug!(ticket = arrived, "async completion received");
            if arrived == ticket {
                return Ok(value);
            }
            self.ready.insert(arrived, value);
        }
    }
}

impl Default for AsyncBridge {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_completion_from_runtime_task() {
        let mut bridge = AsyncBridge::new();
        let completion = bridge.completion();
        let ticket = completion.ticket();
        spawn_task(completion, async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            HostValue::Int(42)
        });
        assert_eq!(bridge.wait(ticket).unwrap(), HostValue::Int(42));
    }

    #[test]
    fn test_out_of_order_results_are_kept() {
        let mut bridge = AsyncBridge::new();
        let first = bridge.completion();
        let second = bridge.completion();
        let (t1, t2) = (first.ticket(), second.ticket());
        second.complete(HostValue::Str("second".into()));
        first.complete(HostValue::Nil);
        assert_eq!(bridge.wait(t1).unwrap(), HostValue::Nil);
        assert_eq!(bridge.wait(t2).unwrap(), HostValue::Str("second".into()));
    }

    #[test]
    fn test_many_tasks_share_the_runtime() {
        let mut bridge = AsyncBridge::new();
        let tickets: Vec<u64> = (0..8)
            .map(|n| {
                let completion = bridge.completion();
                let ticket = completion.ticket();
                spawn_task(completion, async move {
                    tokio::time::sleep(Duration::from_millis(8 - n)).await;
                    HostValue::Int(n as i64)
                });
                ticket
            })
            .collect();
        let results: Vec<HostValue> = tickets.iter().map(|t| bridge.wait(*t).unwrap()).collect();
        assert_eq!(results, (0..8).map(HostValue::Int).collect::<Vec<_>>());
    }

    #[test]
    fn test_dropped_completion_reports_error() {
        let mut bridge = AsyncBridge::new();
        let completion = bridge.completion();
        let ticket = completion.ticket();
        drop(completion);
        assert!(matches!(bridge.wait(ticket).unwrap(), HostValue::Error { .. }));
    }
}
