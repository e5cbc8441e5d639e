//! Function-call bookkeeping for one session.
//!
//! Each upstream "arguments done" event becomes at most one capability
//! invocation. Invocations run on their own tasks and report back through a
//! channel drained by the event router, so a slow capability never stalls the
//! session.

use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, warn};
use voicebot_core::{CapabilityResult, CapabilitySet};

const OUTCOME_CAPACITY: usize = 32;
/// How many relayed call ids are kept for duplicate detection.
const REMEMBERED_CALLS: usize = 64;

/// A call accepted for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCall {
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
    parse_error: Option<String>,
}

#[derive(Debug)]
pub struct CallOutcome {
    pub call_id: String,
    pub name: String,
    pub result: CapabilityResult,
}

#[derive(Debug)]
struct InFlight {
    name: String,
    started: Instant,
}

#[derive(Debug)]
pub struct Dispatcher {
    capabilities: CapabilitySet,
    in_flight: HashMap<String, InFlight>,
    /// Most recently relayed call ids, oldest first.
    finished: VecDeque<String>,
    /// Function names announced by `output_item.added`, keyed by call id.
    announced: HashMap<String, String>,
    outcome_tx: mpsc::Sender<CallOutcome>,
    dispatched: usize,
}

impl Dispatcher {
    pub fn new(capabilities: CapabilitySet) -> (Self, mpsc::Receiver<CallOutcome>) {
        let (outcome_tx, outcome_rx) = mpsc::channel(OUTCOME_CAPACITY);
        let dispatcher = Self {
            capabilities,
            in_flight: HashMap::new(),
            finished: VecDeque::with_capacity(REMEMBERED_CALLS),
            announced: HashMap::new(),
            outcome_tx,
            dispatched: 0,
        };
        (dispatcher, outcome_rx)
    }

    pub fn announce(&mut self, call_id: &str, name: &str) {
        self.announced.insert(call_id.to_string(), name.to_string());
    }

    /// Accepts a completed function call. Returns `None` for a call id that
    /// is already running or finished.
    pub fn begin(
        &mut self,
        call_id: &str,
        name: Option<&str>,
        arguments: &str,
    ) -> Option<PendingCall> {
        if self.in_flight.contains_key(call_id) || self.finished.iter().any(|id| id == call_id) {
            debug!(%call_id, "Ignoring duplicate function call");
            return None;
        }

        let announced = self.announced.remove(call_id);
        let name = name
            .map(str::to_owned)
            .or(announced)
            .unwrap_or_else(|| "unknown".to_string());

        let (arguments, parse_error) = if arguments.trim().is_empty() {
            (Value::Object(Map::new()), None)
        } else {
            match serde_json::from_str::<Value>(arguments) {
                Ok(value) => (value, None),
                Err(e) => {
                    warn!(%call_id, %name, error = %e, "Function call arguments are not valid JSON");
                    (Value::String(arguments.to_string()), Some(e.to_string()))
                }
            }
        };

        self.in_flight.insert(
            call_id.to_string(),
            InFlight {
                name: name.clone(),
                started: Instant::now(),
            },
        );
        Some(PendingCall {
            call_id: call_id.to_string(),
            name,
            arguments,
            parse_error,
        })
    }

    /// Runs the call on its own task. The outcome is dropped if the session
    /// has gone away by the time it completes.
    pub fn launch(&mut self, call: PendingCall) {
        self.dispatched += 1;
        let capabilities = self.capabilities.clone();
        let outcome_tx = self.outcome_tx.clone();

        tokio::spawn(
            async move {
                let result = match call.parse_error {
                    Some(reason) => CapabilityResult::Failure(format!("Invalid arguments: {reason}")),
                    None => capabilities.invoke(&call.name, call.arguments).await,
                };
                let outcome = CallOutcome {
                    call_id: call.call_id,
                    name: call.name,
                    result,
                };
                if let Err(e) = outcome_tx.send(outcome).await {
                    info!(call_id = %e.0.call_id, "Session closed, discarding function result");
                }
            }
            .in_current_span(),
        );
    }

    /// Marks a call finished once its output has been relayed.
    pub fn finish(&mut self, call_id: &str) -> bool {
        match self.in_flight.remove(call_id) {
            Some(call) => {
                debug!(
                    %call_id,
                    name = %call.name,
                    elapsed_ms = call.started.elapsed().as_millis() as u64,
                    "Function call relayed"
                );
                if self.finished.len() == REMEMBERED_CALLS {
                    self.finished.pop_front();
                }
                self.finished.push_back(call_id.to_string());
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn dispatched(&self) -> usize {
        self.dispatched
    }

    /// Forgets every running call. Their tasks keep running but their
    /// outcomes will be discarded. Returns how many were abandoned.
    pub fn abandon_all(&mut self) -> usize {
        let abandoned = self.in_flight.len();
        for (call_id, call) in self.in_flight.drain() {
            info!(%call_id, name = %call.name, "Abandoning in-flight function call");
        }
        abandoned
    }
}
