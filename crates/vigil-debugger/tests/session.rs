#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(missing_docs)]

mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use test_log::test;
use vigil_debugger::{
    BreakpointHandler, CompletionToken, Debugger, Error, MismatchPolicy, Monitor, MonitorOptions,
    RetryPolicy, SavedContext, SyscallRequest,
};
use vigil_kernel::KernelMemory;

const BP: u64 = 0xFFFF_FFF0_0750_0000;

fn fast_retry(attempts: usize) -> MonitorOptions {
    MonitorOptions {
        retry: RetryPolicy {
            max_attempts: attempts,
            backoff: Duration::from_millis(1),
        },
        ..Default::default()
    }
}

#[test]
fn monitor_patches_trap_and_outer_capture() {
    let kernel = common::mock_kernel();
    let (thread, _object) = common::prepare_current_thread(&kernel);

    let mut trap = SavedContext::new();
    trap.pc = BP;
    trap.x[0] = 7;
    let staged = common::stage_stuck_thread(&kernel, &trap);

    let token = CompletionToken::new();
    let release = token.clone();

    let handlers: Vec<(u64, BreakpointHandler)> = vec![(
        BP,
        Box::new(move |ctx: &mut SavedContext| {
            ctx.advance_pc();
            ctx.x[8] = 0x5555;
            release.complete();
        }),
    )];

    let hits = Monitor::new(kernel.clone(), thread, handlers, token, fast_retry(5))
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(hits, 1);

    // The trap image must reflect exactly the handler's two changes.
    let mut expected = trap;
    expected.pc = BP + 4;
    expected.x[8] = 0x5555;

    let patched = SavedContext::read_from(&kernel, staged.trap).unwrap();
    assert_eq!(patched, Some(expected));

    // The spinner was released through the handler epilogue.
    let outer = SavedContext::read_from(&kernel, staged.outer).unwrap().unwrap();
    assert_eq!(outer.pc, common::SYNC_HANDLER_EPILOGUE);
}

#[test]
fn completed_token_short_circuits_polling() {
    let kernel = common::mock_kernel();
    let (thread, _object) = common::prepare_current_thread(&kernel);

    let token = CompletionToken::new();
    token.complete();

    // One attempt and an unstaged stack: a scan before the token check
    // would end in SpinStateNotFound instead of a clean release.
    let handlers: Vec<(u64, BreakpointHandler)> = vec![(BP, Box::new(|_| {}))];
    let hits = Monitor::new(kernel, thread, handlers, token, fast_retry(1))
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(hits, 0);
}

#[test]
fn spin_search_exhaustion_returns_typed_error() {
    let kernel = common::mock_kernel();
    let (thread, _object) = common::prepare_current_thread(&kernel);

    let handlers: Vec<(u64, BreakpointHandler)> = vec![(BP, Box::new(|_| {}))];
    let err = Monitor::new(kernel, thread, handlers, CompletionToken::new(), fast_retry(3))
        .unwrap()
        .run()
        .unwrap_err();

    assert!(matches!(err, Error::SpinStateNotFound { attempts: 3 }));
}

#[test]
fn strict_policy_rejects_unexpected_trap_pc() {
    let kernel = common::mock_kernel();
    let (thread, _object) = common::prepare_current_thread(&kernel);

    let mut trap = SavedContext::new();
    trap.pc = BP + 0x100;
    common::stage_stuck_thread(&kernel, &trap);

    let handlers: Vec<(u64, BreakpointHandler)> = vec![(BP, Box::new(|_| {}))];
    let err = Monitor::new(kernel, thread, handlers, CompletionToken::new(), fast_retry(5))
        .unwrap()
        .run()
        .unwrap_err();

    assert!(matches!(err, Error::UnexpectedBreakpoint { pc } if pc == BP + 0x100));
}

#[test]
fn lenient_policy_dispatches_best_effort() {
    let kernel = common::mock_kernel();
    let (thread, _object) = common::prepare_current_thread(&kernel);

    let mut trap = SavedContext::new();
    trap.pc = BP + 0x100;
    common::stage_stuck_thread(&kernel, &trap);

    let token = CompletionToken::new();
    let release = token.clone();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();

    let handlers: Vec<(u64, BreakpointHandler)> = vec![(
        BP,
        Box::new(move |ctx: &mut SavedContext| {
            record.lock().unwrap().push(ctx.pc);
            ctx.advance_pc();
            release.complete();
        }),
    )];

    let options = MonitorOptions {
        mismatch: MismatchPolicy::Lenient,
        ..fast_retry(5)
    };

    let hits = Monitor::new(kernel, thread, handlers, token, options)
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(hits, 1);
    assert_eq!(seen.lock().unwrap().as_slice(), &[BP + 0x100]);
}

#[test]
fn session_without_breakpoints_is_rejected() {
    let kernel = common::mock_kernel();

    let result = Debugger::new(kernel).session().invoke(SyscallRequest::new(1, &[]));

    assert!(matches!(result, Err(Error::NoHandlers)));
}

#[test]
fn raw_call_pins_and_proxies() {
    let kernel = common::mock_kernel();
    let (_thread, object) = common::prepare_current_thread(&kernel);

    kernel.set_call_hook(|_, _, _| 0x77);

    let value = Debugger::new(kernel.clone())
        .raw_call(1, SyscallRequest::new(3, &[9]))
        .unwrap();

    assert_eq!(value, 0x77);

    // Pinned to core 1, proxied through the register-load trampoline.
    assert_eq!(
        kernel.read64(object + common::FIELD_BOUND_PROCESSOR).unwrap(),
        common::PROCESSOR1
    );
    assert_eq!(kernel.calls()[0].0, common::REGISTER_LOAD_GADGET);
}

/// Full protocol over the scripted kernel: a write-style call traps at the
/// breakpoint, the handler rewrites the buffer registers, and the data the
/// "kernel" ends up writing is the handler's, not the caller's.
#[test]
fn end_to_end_write_call_reflects_handler_rewrites() {
    const ORIG_BUF: u64 = 0xFFFF_FFE0_0020_0000;
    const REPL_BUF: u64 = 0xFFFF_FFE0_0021_0000;
    const REPL_TEXT: &[u8] = b"a different string!\n";

    let kernel = common::mock_kernel();
    let (_thread, _object) = common::prepare_current_thread(&kernel);

    kernel.write_bytes(ORIG_BUF, b"hellowrld!\n");
    kernel.write_bytes(REPL_BUF, REPL_TEXT);

    let written: Arc<Mutex<Vec<u8>>> = Arc::default();

    {
        let written = written.clone();
        kernel.set_call_hook(move |k, _entry, args| {
            let ctx = SavedContext::read_from(k, args[0]).unwrap().unwrap();

            // One-shot control-register write; nothing observable here.
            if ctx.pc == common::DEBUG_ENABLE_GADGET {
                return 0;
            }

            assert_eq!(ctx.pc, common::SYNC_HANDLER_ENTRY);
            let entry = SavedContext::read_from(k, ctx.x[0]).unwrap().unwrap();
            assert_eq!(entry.x[16], 4);

            // The operation runs up to the breakpoint; the capture holds
            // the argument registers as the trapped instruction saw them.
            let mut trap = SavedContext::new();
            trap.pc = BP;
            trap.x[..3].copy_from_slice(&entry.x[..3]);
            let staged = common::stage_stuck_thread(k, &trap);

            // Stuck in the spin loop until the monitor patches us out.
            let deadline = Instant::now() + Duration::from_secs(10);
            loop {
                let pc = k.read64(staged.outer + SavedContext::PC_OFFSET).unwrap();
                if pc == common::SYNC_HANDLER_EPILOGUE {
                    break;
                }
                assert!(Instant::now() < deadline, "monitor never released the spinner");
                std::thread::sleep(Duration::from_millis(1));
            }

            // Resume with whatever state the monitor wrote back.
            let trap = SavedContext::read_from(k, staged.trap).unwrap().unwrap();
            let bytes = k.read_bytes(trap.x[1], trap.x[2] as usize);
            written.lock().unwrap().extend_from_slice(&bytes);
            trap.x[2]
        });
    }

    let report = Debugger::new(kernel.clone())
        .session()
        .on_core(0)
        .retry_policy(RetryPolicy {
            max_attempts: 5000,
            backoff: Duration::from_millis(1),
        })
        .breakpoint(BP, |ctx: &mut SavedContext| {
            ctx.advance_pc();
            ctx.x[1] = REPL_BUF;
            ctx.x[2] = REPL_TEXT.len() as u64;
        })
        .invoke(SyscallRequest::new(4, &[1, ORIG_BUF, 11]))
        .unwrap();

    assert_eq!(report.hits, 1);
    assert_eq!(report.value, REPL_TEXT.len() as u64);
    assert_eq!(written.lock().unwrap().as_slice(), REPL_TEXT);
}
