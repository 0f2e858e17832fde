//! Error types for `oxbridge`.
//!
//! Errors fall into the groups the bridge can actually observe: a name that
//! does not resolve, an encoding the translator cannot express, an identity or
//! registration conflict, an argument that does not fit the method signature,
//! and failures reported by the native side of a call. All of them propagate
//! to the immediate caller; nothing is retried.

use thiserror::Error;

/// Errors produced by the runtime and the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    // ------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------
    /// No class with this name is registered.
    #[error("no class named '{0}'")]
    ClassNotFound(String),

    /// No protocol with this name is registered.
    #[error("no protocol named '{0}'")]
    ProtocolNotFound(String),

    /// The class (or its superclasses) has no method with this selector.
    #[error("{class} has no method '{selector}'")]
    MethodNotFound {
        /// Name of the class searched.
        class: String,
        /// Selector name.
        selector: String,
    },

    /// Neither a property, a method nor a host attribute matched.
    #[error("{class} has no attribute '{name}'")]
    AttributeNotFound {
        /// Name of the receiver's class.
        class: String,
        /// Attribute name as requested.
        name: String,
    },

    /// The native runtime could not dispatch the message.
    #[error("-[{class} {selector}]: unrecognized selector sent to {receiver:#x}")]
    UnrecognizedSelector {
        /// Receiver class name.
        class: String,
        /// Selector name.
        selector: String,
        /// Receiver address.
        receiver: usize,
    },

    // ------------------------------------------------------------------
    // Type encodings
    // ------------------------------------------------------------------
    /// The encoding string is malformed.
    #[error("invalid type encoding '{encoding}' at offset {position}: {reason}")]
    InvalidEncoding {
        /// The full encoding being parsed.
        encoding: String,
        /// Byte offset of the failure.
        position: usize,
        /// What went wrong.
        reason: String,
    },

    /// The encoding is well formed but names a type the bridge cannot marshal.
    #[error("unsupported type encoding '{code}'{}", context_suffix(.context))]
    UnsupportedEncoding {
        /// The offending code or fragment.
        code: String,
        /// Where it was found, typically a selector.
        context: Option<String>,
    },

    // ------------------------------------------------------------------
    // Identity and registration
    // ------------------------------------------------------------------
    /// A class with this name already exists.
    #[error("class '{0}' already exists")]
    ClassAlreadyExists(String),

    /// A protocol with this name already exists.
    #[error("protocol '{0}' already exists")]
    ProtocolAlreadyExists(String),

    /// The class already adopts this protocol.
    #[error("{class} already adopts protocol {protocol}")]
    ProtocolAlreadyAdopted {
        /// Class name.
        class: String,
        /// Protocol name.
        protocol: String,
    },

    /// The class pair was already registered; it can no longer gain ivars.
    #[error("class '{0}' is already registered")]
    ClassAlreadyRegistered(String),

    /// An instance variable could not be added.
    #[error("cannot add ivar '{ivar}' to {class}: {reason}")]
    IvarLayout {
        /// Class name.
        class: String,
        /// Ivar name.
        ivar: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A pointer expected to be a class is something else.
    #[error("pointer {0:#x} is not a class")]
    NotAClass(usize),

    /// A pointer expected to be a metaclass is something else.
    #[error("pointer {0:#x} is not a metaclass")]
    NotAMetaclass(usize),

    /// A pointer expected to be a protocol is something else.
    #[error("pointer {0:#x} is not a protocol")]
    NotAProtocol(usize),

    /// A class or protocol definition is inconsistent.
    #[error("invalid definition of '{name}': {reason}")]
    InvalidDefinition {
        /// Name of the class or protocol being defined.
        name: String,
        /// What is wrong with it.
        reason: String,
    },

    // ------------------------------------------------------------------
    // Arguments
    // ------------------------------------------------------------------
    /// The number of arguments does not match the method.
    #[error("method {selector} takes {expected} arguments, but got {got} arguments")]
    ArgumentCount {
        /// Selector name.
        selector: String,
        /// Declared argument count (excluding self and _cmd).
        expected: usize,
        /// Supplied argument count.
        got: usize,
    },

    /// A value cannot be converted to the expected native type.
    #[error("expected {expected}, got {got}")]
    ArgumentType {
        /// Expected native type, as an encoding or description.
        expected: String,
        /// Description of the supplied value.
        got: String,
    },

    /// A sequence used for a struct or array has the wrong length.
    #[error("{type_name} needs {expected} values, but {got} were supplied")]
    SequenceLength {
        /// The aggregate type.
        type_name: String,
        /// Field or element count.
        expected: usize,
        /// Supplied length.
        got: usize,
    },

    /// A struct value has a different shape than the parameter.
    #[error("struct {got} is not compatible with {expected}")]
    StructShapeMismatch {
        /// Parameter struct encoding.
        expected: String,
        /// Supplied struct encoding.
        got: String,
    },

    /// An integer does not fit the native type.
    #[error("value {value} out of range for '{encoding}'")]
    ValueOutOfRange {
        /// The value as text.
        value: String,
        /// Target encoding.
        encoding: String,
    },

    /// A mapping key converted to a host value that cannot be hashed.
    #[error("unhashable key of type {0}")]
    UnhashableKey(String),

    /// A keyword-style call matched no selector.
    #[error(
        "no method was found starting with '{base}' and with keywords {keywords:?}\nKnown keywords are:\n{}",
        .known.join("\n")
    )]
    NoPartialMatch {
        /// The base name called.
        base: String,
        /// Keywords supplied.
        keywords: Vec<String>,
        /// Known keyword sets, one per line.
        known: Vec<String>,
    },

    // ------------------------------------------------------------------
    // Native calls
    // ------------------------------------------------------------------
    /// Argument conversion failed; carries the full signature for diagnosis.
    #[error("{selector} argument {index}: {source}; argtypes: {argtypes}; encoding: {encoding}")]
    Argument {
        /// Selector name.
        selector: String,
        /// Zero-based argument index.
        index: usize,
        /// Decoded argument types, comma separated.
        argtypes: String,
        /// Raw method encoding.
        encoding: String,
        /// The underlying conversion error.
        source: Box<Error>,
    },

    /// The message was sent through the wrong entry point for its return type.
    #[error("{selector} must be sent with {required}, not {used}")]
    ConventionMismatch {
        /// Selector name.
        selector: String,
        /// Entry point required by the ABI.
        required: String,
        /// Entry point that was used.
        used: String,
    },

    /// A host implementation failed while servicing a native call.
    #[error("callback for {selector} failed: {message}")]
    Callback {
        /// Selector (or block signature) being serviced.
        selector: String,
        /// The host error, rendered.
        message: String,
    },

    /// A native object was used after it was deallocated.
    #[error("object {0:#x} has been deallocated")]
    Deallocated(usize),

    /// Null was passed where an object is required.
    #[error("nil receiver for '{0}'")]
    NilReceiver(String),
}

fn context_suffix(context: &Option<String>) -> String {
    match context {
        Some(context) => format!(" in {context}"),
        None => String::new(),
    }
}

impl Error {
    /// Wraps a conversion error with the signature of the failing send.
    pub(crate) fn with_call_context(
        self,
        selector: &str,
        index: usize,
        argtypes: String,
        encoding: &str,
    ) -> Error {
        Error::Argument {
            selector: selector.to_string(),
            index,
            argtypes,
            encoding: encoding.to_string(),
            source: Box::new(self),
        }
    }

    /// Attaches a selector to an encoding failure that has none.
    pub(crate) fn in_context(self, context: &str) -> Error {
        match self {
            Error::UnsupportedEncoding {
                code,
                context: None,
            } => Error::UnsupportedEncoding {
                code,
                context: Some(context.to_string()),
            },
            other => other,
        }
    }
}

/// Result type for `oxbridge` operations.
pub type Result<T> = std::result::Result<T, Error>;
