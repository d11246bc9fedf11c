use thiserror::Error;

/// Error type for IR construction and mutation.
#[derive(Debug, Error)]
pub enum IrError {
    /// The function has no entry block (e.g., it is a declaration).
    #[error("function has no entry block")]
    NoEntryBlock,
    /// A global slot handle does not resolve to a live slot.
    #[error("unknown global slot {0}")]
    UnknownGlobal(u32),
}

/// Errors raised by the deterministic interpreter.
#[derive(Debug, Error)]
pub enum EvalError {
    /// An operand referenced a result that was never computed on this path.
    #[error("use of an undefined value")]
    UndefinedValue,
    /// An operation received a value of the wrong kind (e.g., arithmetic on
    /// a slot address).
    #[error("type mismatch in {0}")]
    TypeMismatch(&'static str),
    /// An indirect branch resolved to a block outside its declared
    /// destination set.
    #[error("indirect branch target is not a declared destination")]
    BadIndirectTarget,
    /// An element access fell outside the slot's initializer.
    #[error("element {index} is out of bounds for global slot {global}")]
    OutOfBounds { global: u32, index: usize },
    /// Execution reached an `unreachable` terminator.
    #[error("executed unreachable terminator")]
    Unreachable,
    /// The step limit was exhausted; the function is assumed not to
    /// terminate.
    #[error("step limit of {0} exceeded")]
    StepLimit(usize),
    /// The named function does not exist in the module.
    #[error("no function named `{0}`")]
    NoSuchFunction(String),
    /// Wrong number of call arguments.
    #[error("expected {expected} arguments, got {got}")]
    ArityMismatch { expected: u32, got: usize },
    #[error("ir error: {0}")]
    Ir(#[from] IrError),
}

/// Error type for obfuscation passes.
///
/// Everything here is a fatal abort of the run: continuing past any of
/// these would silently corrupt the output program. Recoverable conditions
/// (ineligible functions, out-of-range knobs) are logged and defaulted
/// instead of surfacing as errors.
#[derive(Debug, Error)]
pub enum PassError {
    /// A literal slot uses an element width with no encode/decode routine.
    #[error("unsupported literal element width: {0} bits")]
    UnsupportedWidth(u32),
    /// A placeholder predicate was not in the shape the injector left it in.
    #[error("malformed opaque-predicate placeholder in block {0}")]
    MalformedPlaceholder(usize),
    /// A structural assumption about already-validated IR did not hold.
    #[error("malformed ir: {0}")]
    MalformedIr(&'static str),
}

/// Errors surfaced by the `murk` command-line front end.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("could not read module file `{path}`: {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not write module file `{path}`: {source}")]
    FileWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("module serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
