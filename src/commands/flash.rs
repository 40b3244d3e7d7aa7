//! Background flash and wipe sessions.
//!
//! Each session runs on one blocking task. The progress callback is invoked
//! from that task; callers that need it elsewhere marshal it themselves. A
//! session that fails, panics included, is reported to the installed failure
//! hook as well as through the task's [`SessionOutcome`].

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock, RwLock};

use log::error;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::error::{Failure, ProvisionError, ProvisionResult};
use crate::flasher::{CandidatePort, FlashDriver, WipeDriver};

/// How a background session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionOutcome {
    Succeeded { port: CandidatePort },
    Failed { failure: Failure },
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SessionOutcome::Succeeded { .. })
    }
}

type FailureHook = Arc<dyn Fn(&Failure) + Send + Sync>;

static FAILURE_HOOK: OnceLock<RwLock<Option<FailureHook>>> = OnceLock::new();

fn hook_slot() -> &'static RwLock<Option<FailureHook>> {
    FAILURE_HOOK.get_or_init(|| RwLock::new(None))
}

/// Install the process-wide hook receiving failures from background sessions.
/// Replaces any previous hook.
pub fn set_failure_hook<F>(hook: F)
where
    F: Fn(&Failure) + Send + Sync + 'static,
{
    let mut slot = match hook_slot().write() {
        Ok(slot) => slot,
        Err(poisoned) => poisoned.into_inner(),
    };
    *slot = Some(Arc::new(hook));
}

pub fn clear_failure_hook() {
    let mut slot = match hook_slot().write() {
        Ok(slot) => slot,
        Err(poisoned) => poisoned.into_inner(),
    };
    *slot = None;
}

/// Hand a failure to the hook, or log it when none is installed.
pub(crate) fn report_failure(failure: &Failure) {
    let hook = match hook_slot().read() {
        Ok(slot) => slot.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };

    match hook {
        Some(hook) => hook(failure),
        None => error!(target: "flasher", "Unhandled session failure: {}", failure),
    }
}

fn outcome(result: ProvisionResult<CandidatePort>) -> SessionOutcome {
    match result {
        Ok(port) => SessionOutcome::Succeeded { port },
        Err(e) => {
            let failure = Failure::from(&e);
            report_failure(&failure);
            SessionOutcome::Failed { failure }
        }
    }
}

/// Run `session`, turning a panic (in the driver or the caller's progress
/// callback) into a device failure.
fn guarded<F>(session: F) -> SessionOutcome
where
    F: FnOnce() -> ProvisionResult<CandidatePort>,
{
    let result = panic::catch_unwind(AssertUnwindSafe(session)).unwrap_or_else(|payload| {
        Err(ProvisionError::device(
            None,
            format!("Session panicked: {}", panic_message(payload.as_ref())),
        ))
    });
    outcome(result)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Run a flash on a dedicated blocking task. Must be called from within a
/// Tokio runtime.
pub fn spawn_flash(driver: FlashDriver) -> JoinHandle<SessionOutcome> {
    tokio::task::spawn_blocking(move || guarded(|| driver.run()))
}

/// Run a wipe on a dedicated blocking task. Must be called from within a
/// Tokio runtime.
pub fn spawn_wipe(driver: WipeDriver) -> JoinHandle<SessionOutcome> {
    tokio::task::spawn_blocking(move || guarded(|| driver.run()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Device;
    use crate::error::ErrorKind;
    use crate::flasher::port::{MockPortEnumerator, MockPortProbe};
    use crate::flasher::{FlasherBackend, ProgressEvent};
    use crate::test_helpers::fixtures::{CandidatePortBuilder, ScriptedProgrammer};
    use crate::test_helpers::TestContext;
    use std::sync::Mutex;

    // The failure hook is process-wide.
    static HOOK_LOCK: Mutex<()> = Mutex::new(());

    fn backend(live: bool, programmer: ScriptedProgrammer) -> FlasherBackend {
        let mut enumerator = MockPortEnumerator::new();
        enumerator.expect_list().returning(|_| {
            Ok(vec![
                CandidatePortBuilder::new("/dev/ttyUSB0").ftdi().build(),
                CandidatePortBuilder::new("/dev/ttyUSB1").ftdi().build(),
            ])
        });
        let mut probe = MockPortProbe::new();
        probe.expect_is_port_working().return_const(live);
        FlasherBackend::new(Box::new(enumerator), Box::new(probe), Box::new(programmer))
    }

    #[tokio::test]
    async fn test_spawn_flash_streams_progress_from_task() {
        let _guard = HOOK_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        let ctx = TestContext::new();
        let firmware = ctx.touch("maixpy_amigo/kboot.kfpkg");

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let driver = FlashDriver::new(
            backend(true, ScriptedProgrammer::new().succeed_with_output(&["Rebooting..."])),
            &firmware,
            Device::Amigo,
            1_500_000,
            Box::new(move |e| sink.lock().unwrap().push(e)),
        )
        .unwrap();

        let outcome = spawn_flash(driver).await.unwrap();

        assert!(outcome.is_success());
        assert_eq!(
            *events.lock().unwrap(),
            vec![ProgressEvent::Output("Rebooting...".into())]
        );
    }

    #[tokio::test]
    async fn test_failed_wipe_reaches_failure_hook() {
        let _guard = HOOK_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hook_seen = Arc::clone(&seen);
        set_failure_hook(move |failure| hook_seen.lock().unwrap().push(failure.clone()));

        let driver = WipeDriver::new(
            backend(false, ScriptedProgrammer::new()),
            Device::Amigo,
            Box::new(|_| {}),
        );
        let outcome = spawn_wipe(driver).await.unwrap();
        clear_failure_hook();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, ErrorKind::Device);
        assert_eq!(seen[0].port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(
            outcome,
            SessionOutcome::Failed {
                failure: seen[0].clone()
            }
        );
    }

    #[tokio::test]
    async fn test_panicking_callback_reaches_failure_hook() {
        let _guard = HOOK_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hook_seen = Arc::clone(&seen);
        set_failure_hook(move |failure| hook_seen.lock().unwrap().push(failure.clone()));

        let ctx = TestContext::new();
        let firmware = ctx.touch("maixpy_amigo/kboot.kfpkg");
        let driver = FlashDriver::new(
            backend(true, ScriptedProgrammer::new().succeed_with_output(&["Programming"])),
            &firmware,
            Device::Amigo,
            1_500_000,
            Box::new(|_: ProgressEvent| panic!("display went away")),
        )
        .unwrap();

        let outcome = spawn_flash(driver).await.unwrap();
        clear_failure_hook();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, ErrorKind::Device);
        assert_eq!(seen[0].detail, "Session panicked: display went away");
        assert!(!outcome.is_success());
    }

    #[test]
    fn test_failure_without_hook_is_logged_only() {
        let _guard = HOOK_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        clear_failure_hook();

        let result = outcome(Err(crate::error::ProvisionError::device(
            None,
            "No matching port for 0403",
        )));
        assert!(!result.is_success());
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let outcome = SessionOutcome::Succeeded {
            port: CandidatePortBuilder::new("/dev/ttyUSB0").build(),
        };
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.starts_with("{\"status\":\"succeeded\""));
    }
}
