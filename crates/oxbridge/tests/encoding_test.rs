//! Type encoding tests.
//!
//! Property tests check that decoding is total over well-formed encodings and
//! that `decode(encode(t))` is structurally equal to `t`. The remaining tests
//! cover aggregate shapes, layout and the return conventions they select.
//!
//! Run with: `cargo test --test encoding_test`

mod common;

use common::{new_instance, ns_object, unique_name};
use oxbridge::bridge::convention;
use oxbridge::bridge::encoding::{self, TypeKind, decode, encode, same_shape};
use oxbridge::bridge::{ClassBuilder, Value};
use oxbridge::runtime::{Arch, Convention};
use oxbridge::Error;
use proptest::prelude::*;

// ============================================================================
// Strategies
// ============================================================================

fn leaf() -> impl Strategy<Value = String> {
    prop::sample::select(vec![
        "c", "C", "s", "S", "i", "I", "l", "L", "q", "Q", "f", "d", "B", "*", "#", ":", "@", "@?",
        "^v",
    ])
    .prop_map(str::to_string)
}

fn type_encoding() -> impl Strategy<Value = String> {
    leaf().prop_recursive(4, 32, 4, |inner| {
        prop_oneof![
            inner.clone().prop_map(|t| format!("^{t}")),
            (1usize..5, inner.clone()).prop_map(|(n, t)| format!("[{n}{t}]")),
            (
                prop::option::of(prop::sample::select(vec!["PropA", "PropB", "PropC"])),
                prop::collection::vec(inner.clone(), 1..4),
            )
                .prop_map(|(name, fields)| format!("{{{}={}}}", name.unwrap_or("?"), fields.concat())),
            prop::collection::vec(inner, 1..3).prop_map(|fields| format!("(PropU={})", fields.concat())),
        ]
    })
}

proptest! {
    #[test]
    fn prop_decode_encode_round_trip(text in type_encoding()) {
        let ty = decode(&text).unwrap();
        let again = decode(&encode(&ty)).unwrap();
        prop_assert_eq!(&*again, &*ty);
        prop_assert!(same_shape(&again, &ty));
    }

    #[test]
    fn prop_layout_is_consistent(text in type_encoding()) {
        let ty = decode(&text).unwrap();
        prop_assert!(ty.align().is_power_of_two());
        prop_assert_eq!(ty.size() % ty.align(), 0);
        if let Some(st) = ty.struct_type() {
            for field in &st.fields {
                prop_assert_eq!(field.offset % field.ty.align(), 0);
                prop_assert!(field.offset + field.ty.size() <= ty.size());
            }
        }
    }

    #[test]
    fn prop_garbage_never_panics(text in "[a-zA-Z0-9@#:*^?{}()\\[\\]=\"<>]{0,12}") {
        let _ = decode(&text);
    }
}

// ============================================================================
// Aggregates
// ============================================================================

#[test]
fn test_anonymous_struct_matches_named() {
    let named = decode("{EncPoint=dd}").unwrap();
    let anonymous = decode("{?=dd}").unwrap();
    let renamed = decode("{EncOther=dd}").unwrap();
    let different = decode("{?=di}").unwrap();

    assert!(same_shape(&anonymous, &named));
    assert!(same_shape(&named, &anonymous));
    assert!(!same_shape(&named, &renamed));
    assert!(!same_shape(&different, &named));
}

#[test]
fn test_named_struct_is_cached() {
    let full = decode("{EncCached=iq}").unwrap();
    let bare = decode("{EncCached}").unwrap();
    assert_eq!(bare.size(), full.size());
    assert!(matches!(bare.kind(), TypeKind::Struct(_)));
    assert!(encoding::cache_len() >= 2);
}

#[test]
fn test_unknown_bare_struct_is_opaque_behind_pointer() {
    let ptr = decode("^{EncNeverDefined}").unwrap();
    assert_eq!(ptr.size(), std::mem::size_of::<usize>());
    assert!(decode("{EncNeverDefined}").is_err());
}

#[test]
fn test_quoted_field_names_survive() {
    let ty = decode("{EncNamed=\"x\"d\"y\"d}").unwrap();
    let st = ty.struct_type().unwrap();
    let names: Vec<_> = st.fields.iter().map(|f| f.name.as_deref()).collect();
    assert_eq!(names, [Some("x"), Some("y")]);
    assert_eq!(encode(&ty), "{EncNamed=\"x\"d\"y\"d}");
}

#[test]
fn test_method_encoding_with_offsets() {
    let parts = encoding::split_method_encoding("{EncRect={?=dd}{?=dd}}16@0:8").unwrap();
    assert_eq!(parts.len(), 3);
    assert_eq!(decode(&parts[0]).unwrap().size(), 32);
}

#[test]
fn test_unsupported_codes_name_the_code() {
    for code in ["T", "t", "j", "A"] {
        let err = decode(code).unwrap_err();
        assert!(matches!(err, Error::UnsupportedEncoding { .. }), "{code}: {err}");
    }
}

// ============================================================================
// Return Conventions
// ============================================================================

#[test]
fn test_struct_return_threshold_on_x86_64() {
    let big = decode("{EncTriple=qqq}").unwrap();
    let pair = decode("{EncPair=qq}").unwrap();
    assert_eq!(big.size(), 24);
    assert_eq!(convention::select(&big, Arch::X86_64), Convention::StructReturn);
    assert_eq!(convention::select(&pair, Arch::X86_64), Convention::Standard);
    assert_eq!(convention::select(&big, Arch::Arm64), Convention::Standard);
}

#[test]
fn test_float_return_on_i386() {
    let double = decode("d").unwrap();
    assert_eq!(convention::select(&double, Arch::I386), Convention::FloatReturn);
    assert_eq!(convention::select(&double, Arch::X86_64), Convention::Standard);

    let extended = decode("D").unwrap();
    assert_eq!(convention::select(&extended, Arch::X86_64), Convention::FloatReturn);
}

#[test]
fn test_large_struct_result_through_a_call() {
    let class = ClassBuilder::new(&unique_name("EncodingTriple"), &ns_object())
        .method("triple", "{EncTriple=qqq}@:", |_, _| {
            Ok(Value::List(vec![1.into(), 2.into(), 3.into()]))
        })
        .register()
        .unwrap();
    let obj = new_instance(&class);

    let method = class.instance_method("triple").unwrap();
    let ret = decode("{EncTriple=qqq}").unwrap();
    assert_eq!(method.convention(), convention::select(&ret, Arch::current()));

    let Value::Struct(result) = obj.call("triple", &[]).unwrap() else {
        panic!("expected a struct");
    };
    assert_eq!(result.fields(), &[Value::Int(1), Value::Int(2), Value::Int(3)]);
}
