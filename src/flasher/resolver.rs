//! Port resolution with bounded retry.
//!
//! A board may enumerate as several serial ports and its bootloader greeting
//! can fail on the first one. The resolver walks the matching ports as an
//! explicit state machine:
//!
//! ```text
//! Enumerating -> CandidateSelected -> LivenessChecked -> Handshaking
//!                       ^                                  |
//!                       +------------- Retry <-------------+--> Succeeded / Failed
//! ```
//!
//! Every attempt is gated by a liveness probe, a dead port ends the session,
//! and no more than [`MAX_PORT_ATTEMPTS`] handshakes are made.

use std::vec::IntoIter;

use log::{debug, trace, warn};

use super::port::{CandidatePort, PortEnumerator, PortProbe};
use super::programmer::ProgressEvent;
use crate::config::{format_usb_filter, MAX_PORT_ATTEMPTS};
use crate::error::{ProvisionError, ProvisionResult};

/// Resolver states. `attempt` counts handshakes, starting at 1.
#[derive(Debug)]
enum State {
    Enumerating,
    CandidateSelected {
        port: CandidatePort,
        attempt: usize,
    },
    LivenessChecked {
        port: CandidatePort,
        attempt: usize,
    },
    Handshaking {
        port: CandidatePort,
        attempt: usize,
    },
    Retry {
        failed: CandidatePort,
        message: String,
        attempt: usize,
    },
    Succeeded(CandidatePort),
    Failed(ProvisionError),
}

/// Picks a working port and runs the programmer against it.
pub struct PortResolver<'a> {
    enumerator: &'a dyn PortEnumerator,
    probe: &'a dyn PortProbe,
}

impl<'a> PortResolver<'a> {
    pub fn new(enumerator: &'a dyn PortEnumerator, probe: &'a dyn PortProbe) -> Self {
        Self { enumerator, probe }
    }

    /// Run `attempt` against the ports matching `usb_id` until one succeeds
    /// or the bounded retry gives up.
    ///
    /// Returns the port the attempt succeeded on. Resolver messages go both
    /// to the log and to `on_progress` as [`ProgressEvent::Log`].
    ///
    /// Only [`ProvisionError::Transport`] failures are retried; the last one
    /// escalates to [`ProvisionError::Device`]. Any other error from
    /// `attempt` ends the session as is.
    pub fn resolve<A>(
        &self,
        usb_id: u16,
        on_progress: &mut dyn FnMut(ProgressEvent),
        mut attempt: A,
    ) -> ProvisionResult<CandidatePort>
    where
        A: FnMut(&CandidatePort, &mut dyn FnMut(ProgressEvent)) -> ProvisionResult<()>,
    {
        let mut candidates: Option<IntoIter<CandidatePort>> = None;
        let mut state = State::Enumerating;

        loop {
            trace!(target: "port_resolver", "{:?}", state);

            state = match state {
                State::Enumerating => {
                    let ports = self.enumerator.list(usb_id)?;
                    debug!(
                        target: "port_resolver",
                        "Found {} candidate port(s) for {}",
                        ports.len(),
                        format_usb_filter(usb_id)
                    );
                    let mut iter = ports.into_iter();
                    let next = iter.next();
                    candidates = Some(iter);

                    match next {
                        Some(port) => State::CandidateSelected { port, attempt: 1 },
                        None => State::Failed(ProvisionError::device(
                            None,
                            format!("No matching port for {}", format_usb_filter(usb_id)),
                        )),
                    }
                }

                State::CandidateSelected { port, attempt } => {
                    if self.probe.is_port_working(&port.device) {
                        State::LivenessChecked { port, attempt }
                    } else {
                        let message = format!("Port {} not working", port.device);
                        report(on_progress, &message);
                        State::Failed(ProvisionError::device(Some(&port.device), message))
                    }
                }

                State::LivenessChecked { port, attempt } => {
                    debug!(
                        target: "port_resolver",
                        "Attempt {} on {}",
                        attempt,
                        port.device
                    );
                    State::Handshaking { port, attempt }
                }

                State::Handshaking { port, attempt: n } => match attempt(&port, on_progress) {
                    Ok(()) => State::Succeeded(port),
                    Err(e) if !e.is_retriable() => State::Failed(e),
                    Err(e) => {
                        let message = e.to_string();
                        report(on_progress, &message);
                        if n < MAX_PORT_ATTEMPTS {
                            report(on_progress, "");
                            State::Retry {
                                failed: port,
                                message,
                                attempt: n,
                            }
                        } else {
                            State::Failed(ProvisionError::device(Some(&port.device), message))
                        }
                    }
                },

                State::Retry {
                    failed,
                    message,
                    attempt,
                } => match candidates.as_mut().and_then(Iterator::next) {
                    Some(port) => State::CandidateSelected {
                        port,
                        attempt: attempt + 1,
                    },
                    None => {
                        report(on_progress, "");
                        State::Failed(ProvisionError::device(Some(&failed.device), message))
                    }
                },

                State::Succeeded(port) => {
                    debug!(target: "port_resolver", "Session succeeded on {}", port.device);
                    return Ok(port);
                }

                State::Failed(error) => return Err(error),
            };
        }
    }
}

/// Emit a resolver message to the log and the caller.
fn report(on_progress: &mut dyn FnMut(ProgressEvent), message: &str) {
    if !message.is_empty() {
        warn!(target: "port_resolver", "{}", message);
    }
    on_progress(ProgressEvent::Log(message.to_string()));
}
