//! Exception bridge tests against the simulated VM

use super::*;
use crate::foreign::sim::SimVm;
use crate::foreign::{EnvRef, ForeignVm, MemberKind};
use std::io;

fn setup(describe: bool) -> (SimVm, EnvRef, ExceptionBridge) {
    let vm = SimVm::new();
    let env = vm.attach_current_thread(Some("exception-test"), false).unwrap();
    (vm, env, ExceptionBridge::new(BridgeId::next(), describe))
}

fn carrier(env: &EnvRef) -> (RawRef, MethodId) {
    let class = env.find_class("java/lang/RuntimeException").unwrap();
    let ctor = env
        .method_id(class, "<init>", "(Ljava/lang/String;)V", MemberKind::Instance)
        .unwrap();
    (class, ctor)
}

fn host_error(message: &str) -> HostError {
    HostError::new(io::Error::new(io::ErrorKind::Other, message.to_string())).with_name("ValueError")
}

#[test]
fn test_handler_depth() {
    let depth = HandlerDepth::new();
    assert_eq!(depth.enter(), 1);
    assert_eq!(depth.enter(), 2);
    depth.exit();
    assert_eq!(depth.current(), 1);
    depth.exit();
    assert_eq!(depth.current(), 0);
}

#[test]
fn test_clear_when_nothing_pending() {
    let (vm, env, bridge) = setup(true);
    let before = vm.stats().contacts;

    assert!(matches!(bridge.check(env.as_ref()), Outcome::Clear));
    assert_eq!(vm.stats().contacts, before + 1);
    assert_eq!(vm.stats().describes, 0);
}

#[test]
fn test_foreign_exception_is_described_and_cleared() {
    let (vm, env, bridge) = setup(true);
    let thread = std::thread::current().id();
    assert!(env.find_class("no/such/Class").is_none());

    let throwable = match bridge.check(env.as_ref()) {
        Outcome::Foreign(throwable) => throwable,
        other => panic!("expected a foreign throwable, got {other:?}"),
    };

    assert!(!vm.has_pending_exception(thread));
    assert_eq!(vm.stats().describes, 1);

    // The throwable survives the clear and the next call goes through cleanly
    let class = env.find_class("java/lang/NoClassDefFoundError").unwrap();
    assert!(env.is_instance_of(throwable, class));
    assert_eq!(vm.stats().calls_with_pending, 0);
}

#[test]
fn test_active_handler_suppresses_describe() {
    let (vm, env, bridge) = setup(true);
    bridge.handlers().enter();
    env.find_class("no/such/Class");

    assert!(matches!(bridge.check(env.as_ref()), Outcome::Foreign(_)));
    assert_eq!(vm.stats().describes, 0);
    bridge.handlers().exit();
}

#[test]
fn test_describe_can_be_disabled() {
    let (vm, env, bridge) = setup(false);
    env.find_class("no/such/Class");

    assert!(matches!(bridge.check(env.as_ref()), Outcome::Foreign(_)));
    assert_eq!(vm.stats().describes, 0);
}

#[test]
fn test_host_error_round_trip() {
    let (vm, env, bridge) = setup(true);
    let (class, ctor) = carrier(&env);
    let original = host_error("bad value");

    assert!(bridge.raise_host_error(env.as_ref(), class, ctor, original.clone()));
    assert!(vm.has_pending_exception(std::thread::current().id()));

    let info = bridge.pending_host_error_info().unwrap();
    assert_eq!(info.name, "ValueError");
    assert_eq!(info.message, "bad value");

    match bridge.check(env.as_ref()) {
        Outcome::HostError(restored) => assert!(restored.same_as(&original)),
        other => panic!("expected the host error back, got {other:?}"),
    }
    assert!(bridge.pending_host_error_info().is_none());
    assert_eq!(vm.live_weaks(), 0);
}

#[test]
fn test_same_class_is_not_enough() {
    let (_vm, env, bridge) = setup(false);
    let (class, ctor) = carrier(&env);
    bridge.raise_host_error(env.as_ref(), class, ctor, host_error("in flight"));
    env.exception_clear();

    // A different throwable of the carrier class is a plain foreign exception
    env.throw_new(class, "unrelated");
    assert!(matches!(bridge.check(env.as_ref()), Outcome::Foreign(_)));
    assert!(bridge.pending_host_error_info().is_some());

    assert!(bridge.clear_pending_host_error(env.as_ref()));
    assert!(!bridge.clear_pending_host_error(env.as_ref()));
}

#[test]
fn test_stale_carrier_is_dropped() {
    let (vm, env, bridge) = setup(false);
    let (class, ctor) = carrier(&env);
    bridge.raise_host_error(env.as_ref(), class, ctor, host_error("lost"));
    env.exception_clear();
    vm.collect();

    env.throw_new(class, "later");
    assert!(matches!(bridge.check(env.as_ref()), Outcome::Foreign(_)));
    assert!(bridge.pending_host_error_info().is_none());
}

#[test]
fn test_carrier_slot_is_per_bridge() {
    let (_vm, env, bridge) = setup(false);
    let other = ExceptionBridge::new(BridgeId::next(), false);
    let (class, ctor) = carrier(&env);
    bridge.raise_host_error(env.as_ref(), class, ctor, host_error("mine"));

    assert!(other.pending_host_error_info().is_none());
    assert!(matches!(other.check(env.as_ref()), Outcome::Foreign(_)));
}
