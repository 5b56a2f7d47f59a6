use thiserror::Error;

/// Errors raised while decoding raw bytes into container structures.
#[derive(Debug, Error)]
pub enum ParseError {
	#[error("unexpected end of input at {offset:#07x}")]
	EndOfInput { offset: usize },

	#[error("malformed module at {offset:#07x}: {reason}")]
	MalformedModule { offset: usize, reason: String },

	#[error("unsupported module version {version}")]
	UnsupportedVersion { version: u16 },

	#[error("unsupported data section version {version}")]
	UnsupportedDataVersion { version: u16 },
}

impl ParseError {
	pub fn malformed(offset: usize, reason: impl Into<String>) -> Self {
		Self::MalformedModule { offset, reason: reason.into() }
	}
}

/// Errors raised by the loader and resolver.
#[derive(Debug, Error)]
pub enum LoadError {
	#[error("could not load module '{0}' from cache or search path")]
	NotFound(String),

	#[error("unable to load class '{class}' in sibling of module {base}")]
	ClassNotFound { base: String, class: String },

	#[error("could not locate class '{class}' from module dependencies of {module}")]
	ClassNotInDependencies { module: String, class: String },

	#[error("unresolved {kind} name: ({class}, {name})")]
	UnresolvedMember { kind: &'static str, class: String, name: String },

	#[error("invalid reference '{0}'")]
	BadReference(String),

	#[error("cache error at '{path}': {reason}")]
	Cache { path: String, reason: String },

	#[error("name database error: {0}")]
	NameDb(String),

	#[error(transparent)]
	Parse(#[from] ParseError),

	#[error(transparent)]
	Disasm(#[from] DisasmError),

	#[error(transparent)]
	Io(#[from] std::io::Error),
}

/// Errors raised while disassembling routine bytecode.
#[derive(Debug, Error)]
pub enum DisasmError {
	#[error("bad opcode {opcode:#04x} @ {offset:#06x}")]
	BadOpcode { opcode: u16, offset: u32 },

	#[error(transparent)]
	Parse(#[from] ParseError),
}

/// Errors raised by the heuristic instruction scanner. Recovered at the
/// block boundary first, then by whole-scan retries, then by marking the
/// routine unscannable.
#[derive(Debug, Error)]
pub enum ScanError {
	#[error("stack overflow while scanning instructions")]
	StackOverflow,

	#[error("stack underflow while scanning instructions")]
	StackUnderflow,

	#[error("field patch failed: {0}")]
	FieldPatchFailed(String),

	#[error("virtual patch failed: {0}")]
	VirtualPatchFailed(String),

	#[error("unknown type on top of stack: {0}")]
	UnknownTotos(String),

	#[error("maximum rescan count exceeded for basic block {block}")]
	MaxRescanExceeded { block: u32 },

	#[error("aborting scan: {0}")]
	Aborted(String),
}
