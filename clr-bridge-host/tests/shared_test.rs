//! Integration tests for sharing one module instance between workers

mod common;

use clr_bridge_api::{Hook, Outcome, RequestContext};
use clr_bridge_host::{ModuleInstance, SharedModule};
use common::{config, greet_hook, FakeHost};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);
static MAX_IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);
static SLOW_CALLS: AtomicUsize = AtomicUsize::new(0);

/// Records how many calls overlap, holding each one open for a moment
unsafe extern "C" fn slow_hook(
    _request: *const u8,
    _request_len: i32,
    _reply: *mut u8,
    _reply_cap: i32,
    reply_len: *mut i32,
) -> i32 {
    let current = IN_FLIGHT.fetch_add(1, Ordering::SeqCst) + 1;
    MAX_IN_FLIGHT.fetch_max(current, Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(5));
    IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
    SLOW_CALLS.fetch_add(1, Ordering::SeqCst);
    *reply_len = 0;
    Outcome::Ok.code()
}

fn shared() -> SharedModule<FakeHost> {
    let host = FakeHost::new().function("Greet", greet_hook);
    let module = ModuleInstance::with_host(&config(&[("post_auth", "Greet")]), host).unwrap();
    SharedModule::new(module)
}

#[tokio::test]
async fn test_shared_dispatch() {
    let module = shared();
    let mut ctx = RequestContext::new(1).with_request("User-Name", "erin");

    let outcome = module.dispatch(Hook::PostAuth, &mut ctx).await;
    assert_eq!(outcome, Outcome::Updated);
    assert_eq!(ctx.reply_value("Reply-Message"), Some("Hello, erin (post_auth)"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_workers_get_their_own_replies() {
    let module = shared();

    let mut handles = Vec::new();
    for i in 0..16u64 {
        let module = module.clone();
        handles.push(tokio::spawn(async move {
            let user = format!("user{i}");
            let mut ctx = RequestContext::new(i).with_request("User-Name", user.clone());
            let outcome = module.dispatch(Hook::PostAuth, &mut ctx).await;
            (user, outcome, ctx)
        }));
    }

    for handle in handles {
        let (user, outcome, ctx) = handle.await.unwrap();
        assert_eq!(outcome, Outcome::Updated);
        assert_eq!(
            ctx.reply_value("Reply-Message"),
            Some(format!("Hello, {user} (post_auth)").as_str())
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delegate_calls_never_overlap() {
    let host = FakeHost::new().function("Slow", slow_hook);
    let module = ModuleInstance::with_host(&config(&[("accounting", "Slow")]), host).unwrap();
    let module = SharedModule::new(module);

    let mut handles = Vec::new();
    for i in 0..16u64 {
        let module = module.clone();
        handles.push(tokio::spawn(async move {
            let mut ctx = RequestContext::new(i);
            module.dispatch(Hook::Accounting, &mut ctx).await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), Outcome::Ok);
    }

    assert_eq!(SLOW_CALLS.load(Ordering::SeqCst), 16);
    assert_eq!(MAX_IN_FLIGHT.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_shared_detach() {
    let module = shared();
    let other = module.clone();

    assert_eq!(module.detach().await, Some(0));
    assert!(other.is_detached().await);
    assert_eq!(other.detach().await, None);

    let mut ctx = RequestContext::new(2).with_request("User-Name", "frank");
    assert_eq!(other.dispatch(Hook::PostAuth, &mut ctx).await, Outcome::Noop);
    assert!(ctx.reply.is_empty());
}
