//! Tests for classes and protocols defined at run time.
//!
//! These tests exercise the builders end to end through message sends:
//! - Name conflicts and auto-rename
//! - Host methods, custom initializers and superclass calls
//! - Strong and weak properties, ivars and host attributes
//! - Teardown order and failure reporting
//!
//! Run with: `cargo test --test builder_test`

mod common;

use common::{DropCounter, callable_holding, int_arg, new_instance, ns_object, unique_name};
use oxbridge::bridge::{ClassBuilder, ObjCClass, ObjCProtocol, ProtocolBuilder, Value, objc_instance};
use oxbridge::runtime::{Imp, object};
use oxbridge::Error;
use std::sync::{Arc, Mutex};

// ============================================================================
// Registration
// ============================================================================

#[test]
fn test_duplicate_name_and_auto_rename() {
    let first = ClassBuilder::new("Foo", &ns_object()).auto_rename(false).register().unwrap();
    assert_eq!(first.name(), "Foo");

    let err = ClassBuilder::new("Foo", &ns_object())
        .auto_rename(false)
        .register()
        .unwrap_err();
    assert_eq!(err, Error::ClassAlreadyExists("Foo".to_string()));

    let second = ClassBuilder::new("Foo", &ns_object()).auto_rename(true).register().unwrap();
    assert_eq!(second.name(), "Foo_2");
    let third = ClassBuilder::new("Foo", &ns_object()).auto_rename(true).register().unwrap();
    assert_eq!(third.name(), "Foo_3");
    assert_eq!(ObjCClass::named("Foo_2").unwrap(), second);
}

#[test]
fn test_subclass_of_defined_class() {
    let base = ClassBuilder::new(&unique_name("BuilderBase"), &ns_object())
        .method("level", "q@:", |_, _| Ok(Value::Int(1)))
        .register()
        .unwrap();
    let sub = ClassBuilder::new(&unique_name("BuilderSub"), &base)
        .method("level", "q@:", move |this, _| {
            let inherited = base.instance_method("level")?.call_super(&base, this, &[])?;
            Ok(Value::Int(int_arg(&inherited) + 1))
        })
        .register()
        .unwrap();

    assert!(sub.is_subclass_of(&base));
    assert_eq!(sub.superclass(), Some(base));
    let obj = new_instance(&sub);
    assert!(obj.is_kind_of(&base));
    assert_eq!(obj.call("level", &[]).unwrap(), Value::Int(2));
}

// ============================================================================
// Methods
// ============================================================================

#[test]
fn test_custom_initializer() {
    let class = ClassBuilder::new(&unique_name("BuilderInit"), &ns_object())
        .property("value", "q")
        .method("initWithValue:", "@@:q", |this, args| {
            objc_instance(this)?.set("value", args[0].clone())?;
            Ok(this.clone())
        })
        .register()
        .unwrap();

    let allocated = objc_instance(&class.call("alloc", &[]).unwrap()).unwrap();
    let ptr = allocated.ptr();
    let obj = objc_instance(&allocated.call("initWithValue:", &[7.into()]).unwrap()).unwrap();

    assert_eq!(obj.ptr(), ptr);
    assert_eq!(obj.retain_count(), 1);
    assert_eq!(obj.value("value").unwrap(), Value::Int(7));

    let made = objc_instance(
        &objc_instance(&class.call("alloc", &[]).unwrap())
            .unwrap()
            .partial("initWithValue")
            .unwrap()
            .call(Some(9.into()), &[])
            .unwrap(),
    )
    .unwrap();
    assert_eq!(made.value("value").unwrap(), Value::Int(9));
    assert_eq!(made.retain_count(), 1);
}

#[test]
fn test_failing_initializer_keeps_receiver_balanced() {
    let class = ClassBuilder::new(&unique_name("BuilderInitFails"), &ns_object())
        .method("initWithValue:", "@@:q", |this, args| match int_arg(&args[0]) {
            0 => panic!("zero is not a value"),
            v if v < 0 => Err(Error::ArgumentType {
                expected: "positive value".to_string(),
                got: v.to_string(),
            }),
            _ => Ok(this.clone()),
        })
        .register()
        .unwrap();

    let allocated = objc_instance(&class.call("alloc", &[]).unwrap()).unwrap();
    assert_eq!(allocated.retain_count(), 1);

    let err = allocated.call("initWithValue:", &[(-1).into()]).unwrap_err();
    assert!(matches!(err, Error::Callback { .. }), "{err}");
    assert_eq!(allocated.retain_count(), 1);

    let err = allocated.call("initWithValue:", &[0.into()]).unwrap_err();
    assert!(matches!(err, Error::Callback { .. }), "{err}");
    assert_eq!(allocated.retain_count(), 1);

    let obj = objc_instance(&allocated.call("initWithValue:", &[1.into()]).unwrap()).unwrap();
    assert_eq!(obj, allocated);
    assert_eq!(obj.retain_count(), 1);
}

#[test]
fn test_host_method_failure_is_reported() {
    let class = ClassBuilder::new(&unique_name("BuilderFails"), &ns_object())
        .method("explode", "q@:", |_, _| {
            Err(Error::ArgumentType {
                expected: "nothing".to_string(),
                got: "call".to_string(),
            })
        })
        .method("panics", "v@:", |_, _| panic!("host panic"))
        .register()
        .unwrap();
    let obj = new_instance(&class);

    let err = obj.call("explode", &[]).unwrap_err();
    let Error::Callback { selector, message } = &err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(selector, "explode");
    assert!(message.contains("expected nothing"));

    assert!(matches!(obj.call("panics", &[]).unwrap_err(), Error::Callback { .. }));
    // The object is still usable.
    assert_eq!(obj.retain_count(), 1);
}

#[test]
fn test_raw_method() {
    let class = ClassBuilder::new(&unique_name("BuilderRaw"), &ns_object())
        .raw_method(
            "seven",
            "i@:",
            Imp::from_fn(|_, _, _, ret| {
                if !ret.is_null() {
                    // SAFETY: ret is sized for the declared int return
                    unsafe { ret.cast::<i32>().write(7) };
                }
            }),
        )
        .register()
        .unwrap();
    assert_eq!(new_instance(&class).call("seven", &[]).unwrap(), Value::Int(7));
}

#[test]
fn test_class_method_returns_new_instance() {
    let class = ClassBuilder::new(&unique_name("BuilderFactory"), &ns_object())
        .class_method("make", "@@:", |this, _| {
            let Value::Class(class) = this else {
                return Ok(Value::None);
            };
            class.call("new", &[])
        })
        .register()
        .unwrap();

    let made = objc_instance(&class.call("make", &[]).unwrap()).unwrap();
    assert_eq!(made.class().unwrap(), class);
    assert_eq!(made.retain_count(), 1);
}

// ============================================================================
// Properties and Ivars
// ============================================================================

#[test]
fn test_counter_property() {
    let class = ClassBuilder::new(&unique_name("BuilderCounter"), &ns_object())
        .property("counter", "q")
        .method("increment", "v@:", |this, _| {
            let obj = objc_instance(this)?;
            let current = int_arg(&obj.value("counter")?);
            obj.set("counter", current + 1)
                .map(|()| Value::None)
        })
        .register()
        .unwrap();
    let obj = new_instance(&class);

    assert!(class.is_property("counter").unwrap());
    assert_eq!(obj.value("counter").unwrap(), Value::Int(0));
    for _ in 0..3 {
        obj.call("increment", &[]).unwrap();
    }
    assert_eq!(obj.value("counter").unwrap(), Value::Int(3));
    assert_eq!(obj.call("setCounter:", &[10.into()]).unwrap(), Value::None);
    assert_eq!(obj.call("counter", &[]).unwrap(), Value::Int(10));
}

#[test]
fn test_strong_property_keeps_value_alive() {
    let class = ClassBuilder::new(&unique_name("BuilderStrong"), &ns_object())
        .property("child", "@")
        .register()
        .unwrap();
    let parent = new_instance(&class);
    let child = new_instance(&ns_object());
    let child_ptr = child.ptr();

    parent.set("child", child.clone()).unwrap();
    assert_eq!(child.retain_count(), 2);
    drop(child);

    assert_eq!(object::retain_count(child_ptr), 1);
    let again = parent.value("child").unwrap();
    assert_eq!(again.object_ptr(), child_ptr);

    parent.set("child", Value::None).unwrap();
    assert_eq!(parent.value("child").unwrap(), Value::None);
}

#[test]
fn test_weak_property_cleared_on_dealloc() {
    let class = ClassBuilder::new(&unique_name("BuilderWeak"), &ns_object())
        .weak_property("delegate", "@")
        .register()
        .unwrap();
    let owner = new_instance(&class);
    let delegate = new_instance(&ns_object());

    owner.set("delegate", delegate.clone()).unwrap();
    assert_eq!(delegate.retain_count(), 1);
    assert_eq!(owner.value("delegate").unwrap().object_ptr(), delegate.ptr());

    drop(delegate);
    assert_eq!(owner.value("delegate").unwrap(), Value::None);
}

#[test]
fn test_object_ivar() {
    let class = ClassBuilder::new(&unique_name("BuilderIvar"), &ns_object())
        .ivar("_cache", "@")
        .ivar("_hits", "i")
        .register()
        .unwrap();
    let obj = new_instance(&class);

    assert_eq!(obj.ivar("_hits").unwrap(), Value::Int(0));
    obj.set_ivar("_hits", 5).unwrap();
    assert_eq!(obj.ivar("_hits").unwrap(), Value::Int(5));

    let cached = new_instance(&ns_object());
    obj.set_ivar("_cache", cached.clone()).unwrap();
    assert_eq!(cached.retain_count(), 2);
    drop(obj);
    assert_eq!(cached.retain_count(), 1);
}

#[test]
fn test_host_attributes_released_with_object() {
    let counter = DropCounter::new();
    let obj = new_instance(&ns_object());

    obj.set("payload", callable_holding(counter.token())).unwrap();
    assert!(matches!(obj.value("payload").unwrap(), Value::Callable(_)));
    assert_eq!(counter.count(), 0);

    drop(obj);
    assert_eq!(counter.count(), 1);
}

// ============================================================================
// Teardown
// ============================================================================

#[test]
fn test_dealloc_order() {
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::default();

    let record = |entry: &'static str| {
        let log = Arc::clone(&log);
        move |_: &oxbridge::ObjCInstance| {
            log.lock().unwrap().push(entry);
            Ok::<(), Error>(())
        }
    };

    let base = ClassBuilder::new(&unique_name("BuilderOrderBase"), &ns_object())
        .dealloc(record("super"))
        .register()
        .unwrap();
    let child_class = ClassBuilder::new(&unique_name("BuilderOrderChild"), &ns_object())
        .dealloc(record("child"))
        .register()
        .unwrap();
    let parent_class = ClassBuilder::new(&unique_name("BuilderOrderParent"), &base)
        .property("child", "@")
        .dealloc(record("user"))
        .register()
        .unwrap();

    let parent = new_instance(&parent_class);
    parent.set("child", new_instance(&child_class)).unwrap();
    drop(parent);

    assert_eq!(*log.lock().unwrap(), ["user", "child", "super"]);
}

#[test]
fn test_dealloc_hook_sees_live_state() {
    let seen: Arc<Mutex<Option<Value>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let class = ClassBuilder::new(&unique_name("BuilderHookState"), &ns_object())
        .property("count", "q")
        .dealloc(move |obj| {
            *sink.lock().unwrap() = Some(obj.value("count")?);
            Ok(())
        })
        .register()
        .unwrap();

    let obj = new_instance(&class);
    obj.set("count", 4).unwrap();
    drop(obj);
    assert_eq!(*seen.lock().unwrap(), Some(Value::Int(4)));
}

#[test]
fn test_failing_dealloc_hook_still_frees() {
    let counter = DropCounter::new();
    let class = ClassBuilder::new(&unique_name("BuilderHookFails"), &ns_object())
        .dealloc(|_| {
            Err(Error::ArgumentType {
                expected: "teardown".to_string(),
                got: "failure".to_string(),
            })
        })
        .register()
        .unwrap();

    let obj = new_instance(&class);
    obj.set("payload", callable_holding(counter.token())).unwrap();
    drop(obj);
    assert_eq!(counter.count(), 1);
}

#[test]
fn test_dealloc_method_rejected() {
    let err = ClassBuilder::new(&unique_name("BuilderPlainDealloc"), &ns_object())
        .method("dealloc", "v@:", |_, _| Ok(Value::None))
        .register()
        .unwrap_err();
    assert!(matches!(err, Error::InvalidDefinition { .. }));
}

// ============================================================================
// Protocols
// ============================================================================

#[test]
fn test_protocol_adoption() {
    let base = ProtocolBuilder::new(&unique_name("BuilderPinging"))
        .method("ping", "v@:")
        .register()
        .unwrap();
    let proto = ProtocolBuilder::new(&unique_name("BuilderPonging"))
        .extends(&base)
        .optional_method("pong:", "q@:q")
        .property("name", "@")
        .register()
        .unwrap();
    assert!(proto.conforms_to(&base));
    assert_eq!(ObjCProtocol::named(proto.name()).unwrap().name(), proto.name());

    let class = ClassBuilder::new(&unique_name("BuilderAdopter"), &ns_object())
        .protocol(&proto)
        .method("ping", "v@:", |_, _| Ok(Value::None))
        .register()
        .unwrap();
    assert!(class.conforms_to(&proto));
    assert!(class.conforms_to(&base));
    assert!(new_instance(&class).conforms_to(&base));
    assert_eq!(class.protocols(), vec![proto]);
}

#[test]
fn test_protocol_name_conflict() {
    let name = unique_name("BuilderProtoDup");
    ProtocolBuilder::new(&name).auto_rename(false).register().unwrap();
    let err = ProtocolBuilder::new(&name).auto_rename(false).register().unwrap_err();
    assert_eq!(err, Error::ProtocolAlreadyExists(name.clone()));

    let renamed = ProtocolBuilder::new(&name).auto_rename(true).register().unwrap();
    assert_eq!(renamed.name(), format!("{name}_2"));
}
