//! Call signatures and argument frames.
//!
//! A [`CallSignature`] is the decoded form of a method or block encoding.
//! An [`ArgumentFrame`] holds one aligned native buffer per argument plus
//! the pointer array the runtime's entry points expect, and keeps every
//! temporary the conversion produced (C strings, by-reference structs,
//! blocks) alive until the frame is dropped.

use crate::bridge::encoding::{self, TypeDescriptor};
use crate::bridge::value::{self, Temporaries, Value};
use crate::error::{Error, Result};
use std::sync::Arc;

/// A 16-byte aligned, zeroed byte buffer.
#[derive(Debug, Clone)]
pub struct NativeBuffer {
    chunks: Vec<u128>,
    len: usize,
}

impl NativeBuffer {
    /// Allocates `len` zeroed bytes.
    #[must_use]
    pub fn new(len: usize) -> Self {
        NativeBuffer {
            chunks: vec![0u128; len.div_ceil(16).max(1)],
            len,
        }
    }

    /// Requested length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` for a zero-length buffer.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read pointer.
    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.chunks.as_ptr().cast()
    }

    /// Write pointer.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.chunks.as_mut_ptr().cast()
    }
}

/// Decoded method or block signature.
#[derive(Debug, Clone)]
pub struct CallSignature {
    ret: Arc<TypeDescriptor>,
    /// Receiver and selector for methods, the block itself for blocks.
    hidden: Vec<Arc<TypeDescriptor>>,
    args: Vec<Arc<TypeDescriptor>>,
    encoding: String,
}

impl CallSignature {
    /// Decodes a method encoding: return type, `self`, `_cmd`, arguments.
    ///
    /// # Errors
    ///
    /// Encoding errors name `context`. A signature without `self` and
    /// `_cmd` is an [`Error::InvalidEncoding`].
    pub fn for_method(encoding: &str, context: &str) -> Result<CallSignature> {
        Self::with_hidden(encoding, context, 2)
    }

    /// Decodes a block encoding: return type, the block, arguments.
    ///
    /// # Errors
    ///
    /// See [`CallSignature::for_method`].
    pub fn for_block(encoding: &str) -> Result<CallSignature> {
        Self::with_hidden(encoding, encoding, 1)
    }

    fn with_hidden(encoding: &str, context: &str, hidden: usize) -> Result<CallSignature> {
        let mut parts = encoding::decode_method(encoding, context)?;
        if parts.len() < hidden + 1 {
            return Err(Error::InvalidEncoding {
                encoding: encoding.to_string(),
                position: encoding.len(),
                reason: format!("expected a return type and {hidden} implicit arguments"),
            });
        }
        let args = parts.split_off(hidden + 1);
        let ret = parts.remove(0);
        Ok(CallSignature {
            ret,
            hidden: parts,
            args,
            encoding: encoding.to_string(),
        })
    }

    /// Return type.
    #[must_use]
    pub fn ret(&self) -> &Arc<TypeDescriptor> {
        &self.ret
    }

    /// Declared arguments, without the implicit ones.
    #[must_use]
    pub fn args(&self) -> &[Arc<TypeDescriptor>] {
        &self.args
    }

    /// Raw encoding.
    #[must_use]
    pub fn encoding(&self) -> &str {
        &self.encoding
    }

    /// Every argument type, implicit ones included, comma separated.
    #[must_use]
    pub fn argtypes_string(&self) -> String {
        self.hidden
            .iter()
            .chain(&self.args)
            .map(|ty| ty.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Allocates a zeroed buffer for the return value, `None` for void.
    #[must_use]
    pub fn return_buffer(&self) -> Option<NativeBuffer> {
        if self.ret.is_void() {
            None
        } else {
            Some(NativeBuffer::new(self.ret.size().max(8)))
        }
    }
}

/// Argument buffers for one native call.
#[derive(Default)]
pub struct ArgumentFrame {
    buffers: Vec<NativeBuffer>,
    pointers: Vec<*mut u8>,
    temporaries: Temporaries,
}

impl ArgumentFrame {
    /// Converts `values` to the signature's argument types.
    ///
    /// `context` turns a conversion error for argument `index` into the
    /// error the caller reports.
    ///
    /// # Errors
    ///
    /// Whatever `context` makes of the first conversion error.
    pub fn build(
        types: &[Arc<TypeDescriptor>],
        values: &[Value],
        context: impl Fn(usize, Error) -> Error,
    ) -> Result<ArgumentFrame> {
        let mut frame = ArgumentFrame::default();
        for (index, (ty, value)) in types.iter().zip(values).enumerate() {
            let mut buffer = NativeBuffer::new(ty.size().max(8));
            // SAFETY: the buffer holds at least ty.size() bytes
            unsafe { value::write_value(ty, value, buffer.as_mut_ptr(), &mut frame.temporaries) }
                .map_err(|err| context(index, err))?;
            frame.buffers.push(buffer);
        }
        // Buffers no longer move once collected.
        frame.pointers = frame.buffers.iter_mut().map(NativeBuffer::as_mut_ptr).collect();
        Ok(frame)
    }

    /// Pointer array for the runtime.
    #[must_use]
    pub fn as_ptr(&self) -> *const *mut u8 {
        self.pointers.as_ptr()
    }

    /// Number of arguments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pointers.len()
    }

    /// Returns `true` when there are no arguments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pointers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_alignment() {
        let buffer = NativeBuffer::new(3);
        assert_eq!(buffer.as_ptr() as usize % 16, 0);
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_method_signature() {
        let sig = CallSignature::for_method("v24@0:8{SigPoint=dd}16", "moveTo:").unwrap();
        assert!(sig.ret().is_void());
        assert_eq!(sig.args().len(), 1);
        assert_eq!(sig.argtypes_string(), "@, :, {SigPoint=dd}");
        assert!(sig.return_buffer().is_none());
    }

    #[test]
    fn test_block_signature() {
        let sig = CallSignature::for_block("i@?ii").unwrap();
        assert_eq!(sig.args().len(), 2);
        assert_eq!(sig.argtypes_string(), "@?, i, i");
    }

    #[test]
    fn test_missing_implicit_arguments() {
        let err = CallSignature::for_method("v@", "broken").unwrap_err();
        assert!(matches!(err, Error::InvalidEncoding { .. }));
    }

    #[test]
    fn test_frame_writes_values() {
        let types = vec![encoding::decode("i").unwrap(), encoding::decode("d").unwrap()];
        let frame = ArgumentFrame::build(&types, &[Value::Int(7), Value::Float(0.5)], |_, e| e)
            .unwrap();
        assert_eq!(frame.len(), 2);
        unsafe {
            assert_eq!((*frame.as_ptr()).cast::<i32>().read(), 7);
            assert_eq!((*frame.as_ptr().add(1)).cast::<f64>().read(), 0.5);
        }
    }

    #[test]
    fn test_frame_reports_index() {
        let types = vec![encoding::decode("i").unwrap(), encoding::decode("i").unwrap()];
        let err = ArgumentFrame::build(
            &types,
            &[Value::Int(1), Value::Str("two".into())],
            |index, err| Error::Callback {
                selector: index.to_string(),
                message: err.to_string(),
            },
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::Callback { selector, .. } if selector == "1"));
    }
}
