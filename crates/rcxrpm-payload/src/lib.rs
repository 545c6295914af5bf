//! Resident agent loaded into target processes.
//!
//! On load the agent creates the session channel (shared region + request/
//! response signals) named from its own PID and the session token, then
//! serves memory commands from a dedicated thread until a SHUTDOWN command
//! or module unload. The token arrives through the bootstrap region the
//! injector published; without one the agent falls back to token-less names.
//!
//! The agent is a singleton per process: all handles live in one module
//! cell with explicit [`init`] and [`teardown`] entry points, called by the
//! dynamic-loader hooks (or directly by a hosting test binary).

mod memory;
mod modules;
mod serve;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use rcxrpm_shared::{boot, Channel, Error, Result, PROTOCOL_VERSION};

/// Lifecycle of the process-wide agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uninitialized,
    Initializing,
    Ready,
    Draining,
    TornDown,
}

struct AgentState {
    channel: Arc<Channel>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

struct AgentCell {
    phase: Phase,
    state: Option<AgentState>,
}

static AGENT: Mutex<AgentCell> = Mutex::new(AgentCell {
    phase: Phase::Uninitialized,
    state: None,
});

/// Initialize the agent: consume the bootstrap token, create the channel,
/// stamp the header, start the serve thread. The serve thread publishes
/// `payload_ready` once it runs; until then clients keep polling.
///
/// Failure leaves the module loaded but the channel absent; clients time
/// out on connect. A torn-down agent may be initialized again.
pub fn init() -> Result<()> {
    let mut cell = AGENT.lock().unwrap();
    match cell.phase {
        Phase::Uninitialized | Phase::TornDown => {}
        _ => return Err(Error::ProtocolError("agent already initialized".into())),
    }
    cell.phase = Phase::Initializing;
    match start() {
        Ok(state) => {
            cell.state = Some(state);
            cell.phase = Phase::Ready;
            Ok(())
        }
        Err(err) => {
            cell.phase = Phase::Uninitialized;
            Err(err)
        }
    }
}

fn start() -> Result<AgentState> {
    let pid = std::process::id();
    let token = boot::consume_token(pid);
    let mem = memory::MemAccess::open()?;
    let channel = Arc::new(Channel::create(pid, token.as_deref())?);

    let header = channel.header();
    header.zero();
    header.set_version(PROTOCOL_VERSION);
    header.set_image_base(modules::image_base());

    let shutdown = Arc::new(AtomicBool::new(false));
    let server = serve::Server::new(Arc::clone(&channel), mem, Arc::clone(&shutdown));
    let thread = std::thread::Builder::new()
        .name("rcx-rpm-serve".into())
        .spawn(move || server.run())?;

    Ok(AgentState {
        channel,
        shutdown,
        thread: Some(thread),
    })
}

/// Stop serving, clear readiness, and release the channel. POSIX names are
/// unlinked here. Idempotent.
pub fn teardown() {
    let mut cell = AGENT.lock().unwrap();
    if let Some(mut state) = cell.state.take() {
        cell.phase = Phase::Draining;
        state.shutdown.store(true, Ordering::Release);
        // Wake the serve thread if it is parked on the request signal.
        state.channel.signal_request();
        if let Some(thread) = state.thread.take() {
            let _ = thread.join();
        }
    }
    cell.phase = Phase::TornDown;
}

/// Whether the agent is currently serving. A SHUTDOWN command stops the
/// serve thread without tearing the cell down, so the channel's readiness
/// flag is consulted too.
pub fn is_ready() -> bool {
    let cell = AGENT.lock().unwrap();
    cell.phase == Phase::Ready
        && cell
            .state
            .as_ref()
            .is_some_and(|s| s.channel.header().payload_ready())
}

/// Explicit C entry point for hosts that load the payload manually.
#[no_mangle]
pub extern "C" fn rcx_payload_init() -> bool {
    init().is_ok()
}

/// Explicit C teardown counterpart of [`rcx_payload_init`].
#[no_mangle]
pub extern "C" fn rcx_payload_shutdown() {
    teardown();
}

// Loader hooks. Only wired up with the `autoload` feature so that hosting
// the agent in-process (tests) does not race a constructor-driven instance.
#[cfg(all(unix, feature = "autoload", not(test)))]
mod loader_hooks {
    extern "C" fn payload_ctor() {
        let _ = crate::init();
    }

    extern "C" fn payload_dtor() {
        crate::teardown();
    }

    #[used]
    #[link_section = ".init_array"]
    static INIT: extern "C" fn() = payload_ctor;

    #[used]
    #[link_section = ".fini_array"]
    static FINI: extern "C" fn() = payload_dtor;
}

#[cfg(all(windows, feature = "autoload", not(test)))]
mod loader_hooks {
    use std::ffi::c_void;

    const DLL_PROCESS_ATTACH: u32 = 1;
    const DLL_PROCESS_DETACH: u32 = 0;

    /// DLL entry point. Init runs on a fresh thread to stay off the loader
    /// lock; channel creation and readiness publishing happen there.
    #[no_mangle]
    pub unsafe extern "system" fn DllMain(
        _hinst_dll: *mut c_void,
        fdw_reason: u32,
        _lpv_reserved: *mut c_void,
    ) -> i32 {
        match fdw_reason {
            DLL_PROCESS_ATTACH => {
                std::thread::spawn(|| {
                    if let Err(err) = crate::init() {
                        eprintln!("[rcxrpm] agent init failed: {err}");
                    }
                });
            }
            DLL_PROCESS_DETACH => crate::teardown(),
            _ => {}
        }
        1
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn wait_ready() {
        // Readiness is published from the serve thread, not from init.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while !is_ready() {
            assert!(std::time::Instant::now() < deadline, "agent never ready");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }

    #[test]
    fn init_is_exclusive_and_teardown_reopens() {
        init().expect("first init");
        wait_ready();
        assert!(init().is_err());
        teardown();
        assert!(!is_ready());
        // TornDown permits a fresh session.
        init().expect("re-init after teardown");
        wait_ready();
        teardown();
    }
}
