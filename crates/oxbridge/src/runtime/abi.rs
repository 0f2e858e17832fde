//! Return-value calling conventions and native type sizes.
//!
//! A message send has three entry points, mirroring `objc_msgSend`,
//! `objc_msgSend_stret` and `objc_msgSend_fpret`. Which one a method needs
//! depends only on the shape of its return type and the target
//! architecture:
//!
//! | Arch    | Aggregate via stret      | Float via fpret   |
//! |---------|--------------------------|-------------------|
//! | i386    | size not 1, 2, 4 or 8    | every float type  |
//! | x86_64  | size > 16                | `long double`     |
//! | arm32   | always                   | never             |
//! | arm64   | never                    | never             |
//!
//! Return types are sized by the bridge's type-encoding decoder; this
//! module only applies the per-architecture rules.

use crate::bridge::encoding;
use crate::error::Result;
use std::fmt;

/// Target architecture class for ABI decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    /// 32-bit x86.
    I386,
    /// 64-bit x86.
    X86_64,
    /// 32-bit ARM.
    Arm32,
    /// 64-bit ARM.
    Arm64,
    /// Anything else; treated like arm64.
    Other,
}

impl Arch {
    /// The architecture this crate was compiled for.
    #[must_use]
    pub const fn current() -> Arch {
        if cfg!(target_arch = "x86") {
            Arch::I386
        } else if cfg!(target_arch = "x86_64") {
            Arch::X86_64
        } else if cfg!(target_arch = "arm") {
            Arch::Arm32
        } else if cfg!(target_arch = "aarch64") {
            Arch::Arm64
        } else {
            Arch::Other
        }
    }

    /// Pointer width in bytes.
    #[must_use]
    pub const fn pointer_size(self) -> usize {
        match self {
            Arch::I386 | Arch::Arm32 => 4,
            Arch::X86_64 | Arch::Arm64 | Arch::Other => 8,
        }
    }

    /// Size and alignment of `long double`.
    #[must_use]
    pub const fn long_double_layout(self) -> (usize, usize) {
        match self {
            Arch::X86_64 => (16, 16),
            Arch::I386 => (12, 4),
            Arch::Arm32 | Arch::Arm64 | Arch::Other => (8, 8),
        }
    }
}

/// Message-send entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Convention {
    /// `objc_msgSend`: return value in registers.
    Standard,
    /// `objc_msgSend_stret`: caller-provided return buffer.
    StructReturn,
    /// `objc_msgSend_fpret`: return value on the x87 stack.
    FloatReturn,
}

impl fmt::Display for Convention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Convention::Standard => "objc_msgSend",
            Convention::StructReturn => "objc_msgSend_stret",
            Convention::FloatReturn => "objc_msgSend_fpret",
        })
    }
}

/// Floating-point return kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatKind {
    /// `float`
    Single,
    /// `double`
    Double,
    /// `long double`
    Extended,
}

/// What the ABI needs to know about a return type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnShape {
    /// Struct, union or array returned by value.
    Aggregate {
        /// Size in bytes.
        size: usize,
    },
    /// Floating-point scalar.
    Float(FloatKind),
    /// Integers, pointers, objects and void.
    Scalar,
}

/// Picks the entry point for a return shape on `arch`.
#[must_use]
pub fn classify(shape: ReturnShape, arch: Arch) -> Convention {
    match shape {
        ReturnShape::Aggregate { size } => {
            let stret = match arch {
                Arch::I386 => !matches!(size, 1 | 2 | 4 | 8),
                Arch::X86_64 => size > 16,
                Arch::Arm32 => true,
                Arch::Arm64 | Arch::Other => false,
            };
            if stret {
                Convention::StructReturn
            } else {
                Convention::Standard
            }
        }
        ReturnShape::Float(kind) => {
            let fpret = match arch {
                Arch::X86_64 => kind == FloatKind::Extended,
                Arch::I386 => true,
                Arch::Arm32 | Arch::Arm64 | Arch::Other => false,
            };
            if fpret {
                Convention::FloatReturn
            } else {
                Convention::Standard
            }
        }
        ReturnShape::Scalar => Convention::Standard,
    }
}

/// Entry point required by a method with the given full type encoding.
///
/// The return type is decoded by [`encoding`](crate::bridge::encoding), so
/// aggregate sizes are the host target's.
///
/// # Errors
///
/// Returns the decoder's error if the return type cannot be decoded.
pub fn return_convention(method_types: &str, arch: Arch) -> Result<Convention> {
    let ret = encoding::decode_return(method_types)?;
    Ok(classify(ret.return_shape(), arch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_x86_64_struct_threshold() {
        assert_eq!(
            classify(ReturnShape::Aggregate { size: 24 }, Arch::X86_64),
            Convention::StructReturn
        );
        assert_eq!(
            classify(ReturnShape::Aggregate { size: 8 }, Arch::X86_64),
            Convention::Standard
        );
        assert_eq!(
            classify(ReturnShape::Aggregate { size: 16 }, Arch::X86_64),
            Convention::Standard
        );
    }

    #[test]
    fn test_i386_rules() {
        for size in [1, 2, 4, 8] {
            assert_eq!(
                classify(ReturnShape::Aggregate { size }, Arch::I386),
                Convention::Standard
            );
        }
        for size in [3, 12, 16] {
            assert_eq!(
                classify(ReturnShape::Aggregate { size }, Arch::I386),
                Convention::StructReturn
            );
        }
        assert_eq!(
            classify(ReturnShape::Float(FloatKind::Single), Arch::I386),
            Convention::FloatReturn
        );
    }

    #[test]
    fn test_arm_rules() {
        let agg = ReturnShape::Aggregate { size: 4 };
        assert_eq!(classify(agg, Arch::Arm32), Convention::StructReturn);
        assert_eq!(classify(agg, Arch::Arm64), Convention::Standard);
        assert_eq!(
            classify(ReturnShape::Float(FloatKind::Extended), Arch::Arm64),
            Convention::Standard
        );
    }

    #[test]
    fn test_x86_64_only_long_double_uses_fpret() {
        assert_eq!(
            classify(ReturnShape::Float(FloatKind::Double), Arch::X86_64),
            Convention::Standard
        );
        assert_eq!(
            classify(ReturnShape::Float(FloatKind::Extended), Arch::X86_64),
            Convention::FloatReturn
        );
    }

    #[test]
    fn test_return_convention_from_method_types() {
        assert_eq!(
            return_convention("{big=qqq}24@0:8", Arch::X86_64).unwrap(),
            Convention::StructReturn
        );
        assert_eq!(
            return_convention("{small=ii}@:", Arch::X86_64).unwrap(),
            Convention::Standard
        );
        assert_eq!(
            return_convention("D@:", Arch::X86_64).unwrap(),
            Convention::FloatReturn
        );
        assert_eq!(
            return_convention("r*@:", Arch::I386).unwrap(),
            Convention::Standard
        );
    }

    #[test]
    fn test_return_convention_rejects_bad_return_types() {
        assert!(return_convention("", Arch::X86_64).is_err());
        assert!(matches!(
            return_convention("{p=iZ}@:", Arch::X86_64),
            Err(Error::UnsupportedEncoding { .. })
        ));
    }
}
