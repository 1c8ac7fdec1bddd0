//! Cooperative cancellation.
//!
//! Lives in its own integration-test binary because the shutdown flag is
//! process-global and would race the other suites; the tests here serialize
//! on a local mutex for the same reason.

mod support;

use std::sync::Mutex;
use std::time::{Duration, Instant};

use envy::core::EnvyError;
use envy::script::{Hook, RunOptions};
use support::*;

static SERIAL: Mutex<()> = Mutex::new(());

fn cancelled(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|c| matches!(c.downcast_ref(), Some(EnvyError::Cancelled)))
}

#[test]
fn shutdown_cancels_a_run_with_exit_code_130() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    envy::shutdown::reset();
    envy::shutdown::request();

    let h = harness();
    let err = h.engine.run_full(&[inline("local.a@r0")]).unwrap_err();
    assert!(cancelled(&err));
    assert_eq!(envy::core::errors::exit_code(&err), 130);

    envy::shutdown::reset();

    // After reset, a fresh engine over the same cache works normally, and no
    // half-written completion marker was left behind.
    let h2 = harness_sharing_cache(&h);
    let outputs = h2.engine.run_full(&[inline("local.a@r0")]).unwrap();
    let output = outputs.values().next().unwrap();
    let entry_root = output.asset_path.parent().unwrap();
    assert!(entry_root.join("install.done").is_file());
    assert!(!entry_root.join("install.done.tmp").exists());
}

#[test]
fn shutdown_interrupts_a_running_shell_command() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    envy::shutdown::reset();

    let h = harness();
    h.host.register(
        "local.slow@r0",
        Behavior::new().hook(Hook::Build, |ctx| {
            ctx.run(
                "sleep 600",
                RunOptions {
                    quiet: true,
                    ..Default::default()
                },
            )
            .map(|_| ())
        }),
    );

    let trigger = std::thread::spawn(|| {
        std::thread::sleep(Duration::from_millis(500));
        envy::shutdown::request();
    });

    let started = Instant::now();
    let err = h.engine.run_full(&[inline("local.slow@r0")]).unwrap_err();
    trigger.join().unwrap();

    // The shell runner observed the flag mid-wait, signalled the child, and
    // failed the phase long before the command's own duration.
    assert!(cancelled(&err), "expected cancellation, got: {err:#}");
    assert_eq!(envy::core::errors::exit_code(&err), 130);
    assert!(
        started.elapsed() < Duration::from_secs(60),
        "cancellation took {:?}",
        started.elapsed()
    );

    envy::shutdown::reset();
}
